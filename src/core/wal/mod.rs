//! Append-only delta log
//!
//! Length-prefixed, CRC32C-protected frames carrying object-table deltas
//! with optional in-line payloads:
//!
//! `[length:u32 | OtDeltaRec | payload[length - 48] | crc32c:u32]`
//!
//! `length` covers record plus payload; the CRC covers the same bytes. A
//! zero length, a short read, or a CRC mismatch ends the log at that
//! offset — a torn append is tolerated only at EOF. The log object is
//! shared by readers and writers through `Arc`; the coordinator swaps in a
//! new log on rotation and old references drain naturally.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::Mutex;

use crate::constants::OT_DELTA_REC_SIZE;
use crate::error::Result;
use crate::types::{Epoch, OtDeltaRec, DELTA_FLAG_PAYLOAD};
use crate::util::crc::crc32c;

/// Upper bound on a single frame body; anything larger is treated as a
/// torn or corrupt tail.
const MAX_FRAME_BODY: u32 = 16 * 1024 * 1024;

const FRAME_OVERHEAD: u64 = 8; // length + trailing crc

/// A delta plus its optional in-line payload
#[derive(Debug, Clone, Copy)]
pub struct DeltaWithPayload<'a> {
  pub rec: OtDeltaRec,
  pub payload: Option<&'a [u8]>,
}

/// What a replay pass observed
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayStats {
  pub records: u64,
  /// Offset just past the last valid frame
  pub valid_end: u64,
  pub max_epoch: Epoch,
}

// ============================================================================
// Delta log
// ============================================================================

pub struct DeltaLog {
  path: PathBuf,
  sequence: u64,
  start_epoch: Epoch,
  use_fdatasync: bool,
  writer: Mutex<File>,
  end_offset: AtomicU64,
  end_epoch: AtomicU64,
  sync_count: AtomicU64,
}

impl DeltaLog {
  /// Create a fresh log file
  pub fn create(
    path: &Path,
    sequence: u64,
    start_epoch: Epoch,
    use_fdatasync: bool,
  ) -> Result<DeltaLog> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
      .create(true)
      .truncate(true)
      .read(true)
      .write(true)
      .open(path)?;
    Ok(DeltaLog {
      path: path.to_path_buf(),
      sequence,
      start_epoch,
      use_fdatasync,
      writer: Mutex::new(file),
      end_offset: AtomicU64::new(0),
      end_epoch: AtomicU64::new(0),
      sync_count: AtomicU64::new(0),
    })
  }

  /// Reopen a surviving log for appending. The file is truncated to
  /// `valid_end` so a torn tail from a previous run cannot precede new
  /// appends.
  pub fn open_append(
    path: &Path,
    sequence: u64,
    start_epoch: Epoch,
    valid_end: u64,
    end_epoch: Epoch,
    use_fdatasync: bool,
  ) -> Result<DeltaLog> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.set_len(valid_end)?;
    file.seek(SeekFrom::End(0))?;
    Ok(DeltaLog {
      path: path.to_path_buf(),
      sequence,
      start_epoch,
      use_fdatasync,
      writer: Mutex::new(file),
      end_offset: AtomicU64::new(valid_end),
      end_epoch: AtomicU64::new(end_epoch),
      sync_count: AtomicU64::new(0),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn sequence(&self) -> u64 {
    self.sequence
  }

  pub fn start_epoch(&self) -> Epoch {
    self.start_epoch
  }

  pub fn end_offset(&self) -> u64 {
    self.end_offset.load(Ordering::Acquire)
  }

  /// Highest epoch appended so far (relaxed; advisory)
  pub fn end_epoch_relaxed(&self) -> Epoch {
    self.end_epoch.load(Ordering::Relaxed)
  }

  /// Number of durability syncs performed on this log
  pub fn sync_count(&self) -> u64 {
    self.sync_count.load(Ordering::Relaxed)
  }

  /// Append metadata-only records
  pub fn append(&self, records: &[OtDeltaRec]) -> Result<u64> {
    let items: Vec<DeltaWithPayload> = records
      .iter()
      .map(|rec| DeltaWithPayload {
        rec: *rec,
        payload: None,
      })
      .collect();
    self.append_with_payloads(&items)
  }

  /// Append records, embedding payloads where provided. Returns the number
  /// of bytes appended.
  pub fn append_with_payloads(&self, items: &[DeltaWithPayload]) -> Result<u64> {
    if items.is_empty() {
      return Ok(0);
    }

    let mut buf = Vec::with_capacity(
      items
        .iter()
        .map(|i| {
          OT_DELTA_REC_SIZE + FRAME_OVERHEAD as usize + i.payload.map_or(0, |p| p.len())
        })
        .sum(),
    );
    let mut max_epoch = 0u64;
    let mut rec_buf = [0u8; OT_DELTA_REC_SIZE];

    for item in items {
      let mut rec = item.rec;
      match item.payload {
        Some(_) => rec.flags |= DELTA_FLAG_PAYLOAD,
        None => rec.flags &= !DELTA_FLAG_PAYLOAD,
      }
      rec.encode_into(&mut rec_buf);

      let payload = item.payload.unwrap_or(&[]);
      let body_len = (OT_DELTA_REC_SIZE + payload.len()) as u32;

      let mut hasher = crc32fast::Hasher::new();
      hasher.update(&rec_buf);
      hasher.update(payload);

      buf.extend_from_slice(&body_len.to_le_bytes());
      buf.extend_from_slice(&rec_buf);
      buf.extend_from_slice(payload);
      buf.extend_from_slice(&hasher.finalize().to_le_bytes());

      max_epoch = max_epoch.max(rec.epoch());
    }

    let mut file = self.writer.lock();
    file.write_all(&buf)?;
    self.end_offset.fetch_add(buf.len() as u64, Ordering::AcqRel);
    self.end_epoch.fetch_max(max_epoch, Ordering::Relaxed);
    Ok(buf.len() as u64)
  }

  /// Request durability of all bytes written so far
  pub fn sync(&self) -> Result<()> {
    let file = self.writer.lock();
    if self.use_fdatasync {
      file.sync_data()?;
    } else {
      file.sync_all()?;
    }
    self.sync_count.fetch_add(1, Ordering::Relaxed);
    Ok(())
  }

  /// Iterate all valid records of a log file. Stops at the first torn or
  /// corrupt frame and reports the clean prefix.
  pub fn replay(
    path: &Path,
    mut cb: impl FnMut(&OtDeltaRec, Option<&[u8]>),
  ) -> Result<ReplayStats> {
    let file = match File::open(path) {
      Ok(file) => file,
      Err(err) if err.kind() == io::ErrorKind::NotFound => {
        return Ok(ReplayStats::default());
      }
      Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut stats = ReplayStats::default();
    let mut offset = 0u64;

    loop {
      let body_len = match reader.read_u32::<LittleEndian>() {
        Ok(len) => len,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
        Err(err) => return Err(err.into()),
      };
      if body_len == 0 || body_len < OT_DELTA_REC_SIZE as u32 || body_len > MAX_FRAME_BODY {
        break;
      }

      let mut body = vec![0u8; body_len as usize];
      if reader.read_exact(&mut body).is_err() {
        break;
      }
      let stored_crc = match reader.read_u32::<LittleEndian>() {
        Ok(crc) => crc,
        Err(_) => break,
      };
      let computed = crc32c(&body);
      if computed != stored_crc {
        log::warn!(
          "delta log {} ends at offset {offset} (crc mismatch)",
          path.display()
        );
        break;
      }

      let rec = OtDeltaRec::decode(&mut &body[..OT_DELTA_REC_SIZE])?;
      let payload = if rec.flags & DELTA_FLAG_PAYLOAD != 0 && body.len() > OT_DELTA_REC_SIZE {
        Some(&body[OT_DELTA_REC_SIZE..])
      } else {
        None
      };
      cb(&rec, payload);

      offset += FRAME_OVERHEAD + body_len as u64;
      stats.records += 1;
      stats.valid_end = offset;
      stats.max_epoch = stats.max_epoch.max(rec.epoch());
    }

    Ok(stats)
  }
}
