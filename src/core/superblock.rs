//! Atomically published superblock
//!
//! Two fixed 64-byte slots (A at offset 0, B at offset 64). A publish
//! writes the slot selected by `sequence % 2` and fsyncs; torn writes can
//! only hit the slot being replaced, so readers always find the other slot
//! intact and pick the CRC-valid one with the higher sequence.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use xxhash_rust::xxh64::xxh64;

use crate::constants::*;
use crate::error::{Result, StoreError};
use crate::types::{Epoch, NodeId};
use crate::util::crc::crc32c;
use crate::util::fs::sync_dir;

/// Hash of a checkpoint file name as stored in the superblock
pub fn path_hash(name: &str) -> u64 {
  xxh64(name.as_bytes(), 0)
}

/// The published pointer to the current root, epoch, checkpoint, and
/// active log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
  pub sequence: u64,
  pub root_id: u64,
  pub epoch: Epoch,
  /// xxh64 of the covering checkpoint's file name; 0 = no checkpoint
  pub checkpoint_path_hash: u64,
  pub active_log_seq: u64,
}

impl Superblock {
  pub fn root(&self) -> NodeId {
    NodeId::from_raw(self.root_id)
  }

  fn encode(&self) -> [u8; SUPERBLOCK_SLOT_SIZE] {
    let mut buf = [0u8; SUPERBLOCK_SLOT_SIZE];
    buf[0..4].copy_from_slice(&MAGIC_SUPERBLOCK.to_le_bytes());
    buf[4..8].copy_from_slice(&VERSION_SUPERBLOCK.to_le_bytes());
    buf[8..16].copy_from_slice(&self.sequence.to_le_bytes());
    buf[16..24].copy_from_slice(&self.root_id.to_le_bytes());
    buf[24..32].copy_from_slice(&self.epoch.to_le_bytes());
    buf[32..40].copy_from_slice(&self.checkpoint_path_hash.to_le_bytes());
    buf[40..48].copy_from_slice(&self.active_log_seq.to_le_bytes());
    let crc = crc32c(&buf[0..56]);
    buf[56..60].copy_from_slice(&crc.to_le_bytes());
    buf
  }

  fn decode(buf: &[u8]) -> Option<Superblock> {
    if buf.len() < SUPERBLOCK_SLOT_SIZE {
      return None;
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
    if magic != MAGIC_SUPERBLOCK {
      return None;
    }
    let version = u32::from_le_bytes(buf[4..8].try_into().ok()?);
    if version != VERSION_SUPERBLOCK {
      return None;
    }
    let stored_crc = u32::from_le_bytes(buf[56..60].try_into().ok()?);
    if crc32c(&buf[0..56]) != stored_crc {
      return None;
    }
    Some(Superblock {
      sequence: u64::from_le_bytes(buf[8..16].try_into().ok()?),
      root_id: u64::from_le_bytes(buf[16..24].try_into().ok()?),
      epoch: u64::from_le_bytes(buf[24..32].try_into().ok()?),
      checkpoint_path_hash: u64::from_le_bytes(buf[32..40].try_into().ok()?),
      active_log_seq: u64::from_le_bytes(buf[40..48].try_into().ok()?),
    })
  }
}

// ============================================================================
// Superblock file
// ============================================================================

pub struct SuperblockFile {
  file: File,
  path: PathBuf,
}

impl SuperblockFile {
  /// Open (or create) the superblock file and return the best slot, if any
  pub fn open_or_create(path: &Path) -> Result<(SuperblockFile, Option<Superblock>)> {
    let existed = path.exists();
    let file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(path)?;
    if !existed {
      file.set_len(2 * SUPERBLOCK_SLOT_SIZE as u64)?;
      file.sync_all()?;
      if let Some(parent) = path.parent() {
        sync_dir(parent)?;
      }
    }
    let sb = SuperblockFile {
      file,
      path: path.to_path_buf(),
    };
    let best = sb.read_best()?;
    Ok((sb, best))
  }

  /// The CRC-valid slot with the higher sequence
  pub fn read_best(&self) -> Result<Option<Superblock>> {
    let mut buf = [0u8; 2 * SUPERBLOCK_SLOT_SIZE];
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut read = 0;
    while read < buf.len() {
      match file.read(&mut buf[read..]) {
        Ok(0) => break,
        Ok(n) => read += n,
        Err(err) => return Err(err.into()),
      }
    }
    let a = Superblock::decode(&buf[0..SUPERBLOCK_SLOT_SIZE]);
    let b = Superblock::decode(&buf[SUPERBLOCK_SLOT_SIZE..]);
    Ok(match (a, b) {
      (Some(a), Some(b)) => Some(if a.sequence >= b.sequence { a } else { b }),
      (Some(a), None) => Some(a),
      (None, Some(b)) => Some(b),
      (None, None) => None,
    })
  }

  /// Write one slot and fsync. Slot choice alternates with the sequence.
  pub fn publish(&mut self, sb: &Superblock) -> Result<()> {
    if sb.sequence == 0 {
      return Err(StoreError::ContractViolation(
        "superblock sequence must start at 1".to_string(),
      ));
    }
    let slot = (sb.sequence % 2) as u64;
    let buf = sb.encode();
    self
      .file
      .seek(SeekFrom::Start(slot * SUPERBLOCK_SLOT_SIZE as u64))?;
    self.file.write_all(&buf)?;
    self.file.sync_data()?;
    Ok(())
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}
