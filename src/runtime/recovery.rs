//! Crash-consistent recovery
//!
//! Superblock → checkpoint → log replay → state reconstruction. Tolerates
//! a torn trailing record in the newest log, a checkpoint `.tmp` that was
//! never renamed (it is simply not in the manifest), and a manifest entry
//! whose checkpoint file is missing or corrupt (fall back to the previous
//! checkpoint).

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::constants::{DIR_CHECKPOINTS, DIR_LOGS, FILE_MANIFEST, FILE_SUPERBLOCK};
use crate::coordinator::CoordinatorSeed;
use crate::core::checkpoint::{read_checkpoint, CheckpointEntry};
use crate::core::manifest::{Manifest, ManifestLog, RootRecord};
use crate::core::ot::ObjectTable;
use crate::core::segment::SegmentAllocator;
use crate::core::superblock::{path_hash, SuperblockFile};
use crate::core::wal::DeltaLog;
use crate::error::Result;
use crate::types::{Allocation, Epoch, NodeKind, OtDeltaRec};
use crate::util::crc::crc32c;

pub struct RecoveryOptions {
  pub read_only: bool,
  /// Rehydrate mapped regions from in-line WAL payloads
  pub payload_recovery: bool,
  pub validate_checksums: bool,
  pub use_fdatasync: bool,
}

pub struct RecoveredState {
  pub seed: CoordinatorSeed,
  /// Highest epoch observed anywhere on disk
  pub epoch: Epoch,
  pub roots: IndexMap<String, RootRecord>,
}

/// Rebuild in-memory state from the store directory
pub fn recover(
  root: &Path,
  ot: &ObjectTable,
  alloc: &SegmentAllocator,
  opts: &RecoveryOptions,
) -> Result<RecoveredState> {
  std::fs::create_dir_all(root.join(DIR_LOGS))?;
  std::fs::create_dir_all(root.join(DIR_CHECKPOINTS))?;

  // 1) Superblock: the CRC-valid slot with the higher sequence.
  let (superblock_file, superblock) =
    SuperblockFile::open_or_create(&root.join(FILE_SUPERBLOCK))?;

  let mut manifest = Manifest::load(&root.join(FILE_MANIFEST))?;

  // 2) Checkpoint: prefer the one the superblock references, fall back to
  // older ones if it is missing or corrupt.
  let mut candidates: Vec<_> = manifest.checkpoints.clone();
  candidates.sort_by_key(|c| std::cmp::Reverse(c.epoch));
  if let Some(sb) = superblock {
    if sb.checkpoint_path_hash != 0 {
      if let Some(pos) = candidates.iter().position(|c| {
        Path::new(&c.path)
          .file_name()
          .and_then(|n| n.to_str())
          .is_some_and(|name| path_hash(name) == sb.checkpoint_path_hash)
      }) {
        let preferred = candidates.remove(pos);
        candidates.insert(0, preferred);
      }
    }
  }

  let mut checkpoint_epoch = 0;
  for candidate in &candidates {
    let path = root.join(&candidate.path);
    match read_checkpoint(&path) {
      Ok((epoch, entries)) => {
        for entry in &entries {
          if let Err(err) = ot.restore_entry(entry) {
            log::warn!("skipping checkpoint entry {}: {err}", entry.handle_idx);
          }
        }
        checkpoint_epoch = epoch;
        log::debug!(
          "loaded checkpoint {} (epoch {epoch}, {} entries)",
          path.display(),
          entries.len()
        );
        break;
      }
      Err(err) => {
        log::warn!(
          "checkpoint {} unusable, falling back: {err}",
          path.display()
        );
      }
    }
  }

  // 3) Replay delta logs newer than the checkpoint, in sequence order.
  let mut max_epoch = checkpoint_epoch;
  let mut replay_bytes = 0u64;
  let mut open_log: Option<(ManifestLog, u64, Epoch)> = None;

  if !opts.read_only {
    let to_replay: Vec<ManifestLog> = manifest
      .logs_to_replay(checkpoint_epoch)
      .into_iter()
      .cloned()
      .collect();
    for log_entry in to_replay {
      let path = root.join(&log_entry.path);
      let stats = DeltaLog::replay(&path, |rec, payload| {
        apply_record(ot, alloc, rec, payload, opts);
      })?;
      replay_bytes += stats.valid_end;
      max_epoch = max_epoch.max(stats.max_epoch);
      if log_entry.end_epoch == 0 {
        open_log = Some((log_entry, stats.valid_end, stats.max_epoch));
      }
      log::debug!(
        "replayed {} records from {}",
        stats.records,
        path.display()
      );
    }
  } else if let Some(entry) = manifest.open_log() {
    // Checkpoint-only open still needs the open log handle; leave its
    // contents alone.
    let path = root.join(&entry.path);
    let len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    open_log = Some((entry.clone(), len, entry.start_epoch));
  }

  ot.finish_restore();

  // 4) Reattach segment files and rebuild per-class free lists from the
  // observed allocations.
  let used: Vec<(NodeKind, Allocation)> = ot
    .snapshot_entries(max_epoch.max(1))
    .iter()
    .map(|e| {
      (
        NodeKind::from_u8(e.kind).unwrap_or(NodeKind::Internal),
        Allocation {
          file_id: e.file_id,
          segment_id: e.segment_id,
          offset: e.offset,
          length: e.length,
          class_id: e.class_id,
        },
      )
    })
    .collect();
  if !opts.read_only {
    alloc.rebuild(&used)?;
  }

  // 5) Reopen the surviving open log truncated to its valid prefix, or
  // start a fresh one.
  let active_log = match open_log {
    Some((entry, valid_end, end_epoch)) => Arc::new(DeltaLog::open_append(
      &root.join(&entry.path),
      entry.sequence,
      entry.start_epoch,
      valid_end,
      end_epoch,
      opts.use_fdatasync,
    )?),
    None => {
      let sequence = manifest.next_log_sequence();
      let rel = format!("{DIR_LOGS}/delta_{sequence}.wal");
      let log = Arc::new(DeltaLog::create(
        &root.join(&rel),
        sequence,
        max_epoch,
        opts.use_fdatasync,
      )?);
      manifest.add_log(ManifestLog {
        path: rel,
        sequence,
        start_epoch: max_epoch,
        end_epoch: 0,
      });
      if !opts.read_only {
        manifest.store(&root.join(FILE_MANIFEST))?;
      }
      log
    }
  };

  // 6) Named roots from the manifest; the superblock's primary root wins
  // when it is newer than anything the manifest recorded.
  let mut roots = manifest.roots.clone();
  if let Some(sb) = superblock {
    if sb.root().is_valid() {
      if let Some(newest) = roots.values_mut().max_by_key(|r| r.epoch) {
        if sb.epoch >= newest.epoch && newest.node_id != sb.root_id {
          newest.node_id = sb.root_id;
          newest.epoch = sb.epoch;
        }
      }
    }
  }

  let epoch = max_epoch.max(superblock.map(|sb| sb.epoch).unwrap_or(0));

  Ok(RecoveredState {
    seed: CoordinatorSeed {
      active_log,
      manifest,
      superblock_file,
      superblock,
      last_checkpoint_epoch: checkpoint_epoch,
      replay_bytes,
    },
    epoch,
    roots,
  })
}

/// Apply one WAL record: allocation deltas publish an entry at its birth
/// epoch, retirement deltas stamp the retire epoch, and validated in-line
/// payloads rehydrate the mapped region.
fn apply_record(
  ot: &ObjectTable,
  alloc: &SegmentAllocator,
  rec: &OtDeltaRec,
  payload: Option<&[u8]>,
  opts: &RecoveryOptions,
) {
  let entry = CheckpointEntry {
    handle_idx: rec.handle_idx,
    tag: rec.tag,
    kind: rec.kind,
    class_id: rec.class_id,
    file_id: rec.file_id,
    segment_id: rec.segment_id,
    offset: rec.offset,
    length: rec.length,
    birth_epoch: rec.birth_epoch,
    retire_epoch: rec.retire_epoch,
  };
  let applied = if rec.is_retirement() {
    ot.restore_retirement(&entry)
  } else {
    ot.restore_entry(&entry)
  };
  if let Err(err) = applied {
    log::warn!("skipping delta for handle {}: {err}", rec.handle_idx);
    return;
  }

  let Some(payload) = payload else {
    return;
  };
  if !opts.payload_recovery || rec.is_retirement() {
    return;
  }
  if opts.validate_checksums && rec.data_crc32c != 0 {
    let computed = crc32c(payload);
    if computed != rec.data_crc32c {
      log::warn!(
        "payload CRC mismatch for handle {} (stored {:#010x}, computed {computed:#010x}); \
         keeping on-disk segment bytes",
        rec.handle_idx,
        rec.data_crc32c
      );
      return;
    }
  }

  let Some(kind) = NodeKind::from_u8(rec.kind) else {
    return;
  };
  let copy_len = payload.len().min(rec.length as usize);
  if let Some(ptr) = alloc.get_ptr_for_recovery(
    kind,
    rec.class_id,
    rec.file_id,
    rec.segment_id,
    rec.offset,
    rec.length,
  ) {
    unsafe {
      std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr, copy_len);
    }
  } else {
    log::warn!(
      "cannot rehydrate handle {}: segment {}:{} of class {} not reachable",
      rec.handle_idx,
      rec.file_id,
      rec.segment_id,
      rec.class_id
    );
  }
}
