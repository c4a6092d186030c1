//! Point-in-time object table snapshots
//!
//! A checkpoint bounds WAL replay: recovery loads the newest checkpoint and
//! replays only the delta logs that end after it. The file is written to a
//! `.tmp` sibling, fsynced, then renamed; a crash between those steps
//! leaves a stale `.tmp` that recovery ignores.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::constants::*;
use crate::error::{Result, StoreError};
use crate::types::Epoch;

/// One object table entry as captured in a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointEntry {
  pub handle_idx: u64,
  pub tag: u8,
  pub kind: u8,
  pub class_id: u8,
  pub file_id: u32,
  pub segment_id: u32,
  pub offset: u32,
  pub length: u32,
  pub birth_epoch: Epoch,
  pub retire_epoch: Epoch,
}

impl CheckpointEntry {
  fn encode_into(&self, buf: &mut [u8; CHECKPOINT_ENTRY_SIZE]) {
    buf[0..8].copy_from_slice(&self.handle_idx.to_le_bytes());
    buf[8] = self.tag;
    buf[9] = self.kind;
    buf[10] = self.class_id;
    buf[11] = 0;
    buf[12..16].copy_from_slice(&self.file_id.to_le_bytes());
    buf[16..20].copy_from_slice(&self.segment_id.to_le_bytes());
    buf[20..24].copy_from_slice(&self.offset.to_le_bytes());
    buf[24..28].copy_from_slice(&self.length.to_le_bytes());
    buf[28..36].copy_from_slice(&self.birth_epoch.to_le_bytes());
    buf[36..44].copy_from_slice(&self.retire_epoch.to_le_bytes());
  }

  fn decode(reader: &mut impl Read) -> Result<CheckpointEntry> {
    let handle_idx = reader.read_u64::<LittleEndian>()?;
    let tag = reader.read_u8()?;
    let kind = reader.read_u8()?;
    let class_id = reader.read_u8()?;
    let _pad = reader.read_u8()?;
    let file_id = reader.read_u32::<LittleEndian>()?;
    let segment_id = reader.read_u32::<LittleEndian>()?;
    let offset = reader.read_u32::<LittleEndian>()?;
    let length = reader.read_u32::<LittleEndian>()?;
    let birth_epoch = reader.read_u64::<LittleEndian>()?;
    let retire_epoch = reader.read_u64::<LittleEndian>()?;
    Ok(CheckpointEntry {
      handle_idx,
      tag,
      kind,
      class_id,
      file_id,
      segment_id,
      offset,
      length,
      birth_epoch,
      retire_epoch,
    })
  }
}

/// Write a checkpoint: tmp file, fsync, rename. The caller fsyncs the
/// containing directory as part of its publish sequence.
pub fn write_checkpoint(path: &Path, epoch: Epoch, entries: &[CheckpointEntry]) -> Result<()> {
  let tmp = path.with_extension("tmp");

  let mut body = Vec::with_capacity(entries.len() * CHECKPOINT_ENTRY_SIZE);
  let mut entry_buf = [0u8; CHECKPOINT_ENTRY_SIZE];
  for entry in entries {
    entry.encode_into(&mut entry_buf);
    body.extend_from_slice(&entry_buf);
  }
  let body_crc = crate::util::crc::crc32c(&body);

  {
    let file = OpenOptions::new()
      .create(true)
      .truncate(true)
      .write(true)
      .open(&tmp)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&MAGIC_CHECKPOINT.to_le_bytes())?;
    writer.write_all(&VERSION_CHECKPOINT.to_le_bytes())?;
    writer.write_all(&epoch.to_le_bytes())?;
    writer.write_all(&(entries.len() as u64).to_le_bytes())?;
    writer.write_all(&body_crc.to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
  }

  fs::rename(&tmp, path)?;
  Ok(())
}

/// Load and validate a checkpoint file
pub fn read_checkpoint(path: &Path) -> Result<(Epoch, Vec<CheckpointEntry>)> {
  let file = File::open(path)?;
  let mut reader = BufReader::new(file);

  let magic = reader.read_u32::<LittleEndian>()?;
  if magic != MAGIC_CHECKPOINT {
    return Err(StoreError::Corrupt(format!(
      "bad checkpoint magic {magic:#010x} in {}",
      path.display()
    )));
  }
  let version = reader.read_u32::<LittleEndian>()?;
  if version != VERSION_CHECKPOINT {
    return Err(StoreError::VersionMismatch {
      found: version,
      supported: VERSION_CHECKPOINT,
    });
  }
  let epoch = reader.read_u64::<LittleEndian>()?;
  let entry_count = reader.read_u64::<LittleEndian>()?;
  let stored_crc = reader.read_u32::<LittleEndian>()?;

  let mut body = Vec::new();
  reader.read_to_end(&mut body)?;
  let expected = entry_count as usize * CHECKPOINT_ENTRY_SIZE;
  if body.len() < expected {
    return Err(StoreError::Corrupt(format!(
      "checkpoint {} truncated: {} of {expected} body bytes",
      path.display(),
      body.len()
    )));
  }
  body.truncate(expected);

  let computed = crate::util::crc::crc32c(&body);
  if computed != stored_crc {
    return Err(StoreError::CrcMismatch {
      stored: stored_crc,
      computed,
    });
  }

  let mut entries = Vec::with_capacity(entry_count as usize);
  let mut cursor = &body[..];
  for _ in 0..entry_count {
    entries.push(CheckpointEntry::decode(&mut cursor)?);
  }
  Ok((epoch, entries))
}

/// Standard checkpoint file name for an epoch
pub fn checkpoint_file_name(epoch: Epoch) -> String {
  format!("ckpt_{epoch}.bin")
}
