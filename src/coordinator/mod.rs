//! Checkpoint coordinator
//!
//! Owns the active delta log and the store's published metadata. Drives
//! three independent policies:
//!
//! - checkpoint triggers (replay bytes, replay epochs, age) with a floor
//!   interval, and log rotation triggers (bytes, age)
//! - group commit: writers inside one window share a single WAL sync via a
//!   leader/follower condvar protocol
//! - superblock publishing: `try_publish` rotates the A/B slots with a
//!   monotonic sequence
//!
//! Commits take the active-log read guard for the append; rotation and
//! checkpointing take the write guard, so a writer never observes a closed
//! log and never sees `NoActiveLog`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};

use crate::constants::{DIR_CHECKPOINTS, DIR_LOGS};
use crate::core::checkpoint::{checkpoint_file_name, write_checkpoint};
use crate::core::manifest::{Manifest, ManifestCheckpoint, ManifestLog};
use crate::core::ot::ObjectTable;
use crate::core::segment::MappingManager;
use crate::core::superblock::{path_hash, Superblock, SuperblockFile};
use crate::core::wal::DeltaLog;
use crate::error::Result;
use crate::mvcc::MvccContext;
use crate::types::{Epoch, NodeId};

// ============================================================================
// Policy
// ============================================================================

/// Checkpoint, rotation, and GC triggers
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
  /// Checkpoint once this many log bytes would need replay
  pub max_replay_bytes: u64,
  /// Checkpoint once this many epochs passed since the last one
  pub max_replay_epochs: u64,
  /// Checkpoint at least this often
  pub max_age: Duration,
  /// Floor between two checkpoints
  pub min_interval: Duration,
  /// Rotate the active log past this size
  pub rotate_bytes: u64,
  /// Rotate the active log past this age
  pub rotate_age: Duration,
  pub gc_on_rotate: bool,
  pub gc_on_checkpoint: bool,
  /// Closed logs always kept, newest first
  pub gc_min_keep_logs: usize,
  /// Group commit window; 0 disables group commit
  pub group_commit_interval_ms: u64,
}

impl Default for CheckpointPolicy {
  fn default() -> Self {
    Self {
      max_replay_bytes: 64 * 1024 * 1024,
      max_replay_epochs: 100_000,
      max_age: Duration::from_secs(300),
      min_interval: Duration::from_secs(5),
      rotate_bytes: 128 * 1024 * 1024,
      rotate_age: Duration::from_secs(600),
      gc_on_rotate: false,
      gc_on_checkpoint: true,
      gc_min_keep_logs: 1,
      group_commit_interval_ms: 5,
    }
  }
}

/// Coordinator counters
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
  pub checkpoints_written: u64,
  pub rotations: u64,
  pub pruned_logs: u64,
  pub last_ckpt_ms: u64,
  pub last_replay_bytes: u64,
  pub last_checkpoint_epoch: Epoch,
  pub last_gc_epoch: Epoch,
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug, Default)]
struct GroupCommitState {
  next_seq: u64,
  flushed_seq: u64,
  flushing: bool,
  last_error_seq: u64,
  last_error: Option<String>,
}

struct SuperblockState {
  file: SuperblockFile,
  current: Option<Superblock>,
  checkpoint_hash: u64,
}

struct MaintenanceClock {
  last_checkpoint_at: Instant,
  log_opened_at: Instant,
}

/// State recovered (or freshly created) by the runtime open path
pub struct CoordinatorSeed {
  pub active_log: Arc<DeltaLog>,
  pub manifest: Manifest,
  pub superblock_file: SuperblockFile,
  pub superblock: Option<Superblock>,
  pub last_checkpoint_epoch: Epoch,
  pub replay_bytes: u64,
}

pub struct CheckpointCoordinator {
  root: PathBuf,
  manifest_path: PathBuf,
  policy: CheckpointPolicy,
  use_fdatasync: bool,

  ot: Arc<ObjectTable>,
  mvcc: Arc<MvccContext>,
  mapping: Arc<MappingManager>,

  active_log: RwLock<Arc<DeltaLog>>,
  manifest: Mutex<Manifest>,
  superblock: Mutex<SuperblockState>,

  group: Mutex<GroupCommitState>,
  group_cv: Condvar,

  clock: Mutex<MaintenanceClock>,
  /// Serializes checkpointing and rotation
  maintenance: Mutex<()>,

  last_checkpoint_epoch: AtomicU64,
  replay_bytes: AtomicU64,
  stats: Mutex<CoordinatorStats>,
}

impl CheckpointCoordinator {
  pub fn new(
    root: &Path,
    policy: CheckpointPolicy,
    use_fdatasync: bool,
    ot: Arc<ObjectTable>,
    mvcc: Arc<MvccContext>,
    mapping: Arc<MappingManager>,
    seed: CoordinatorSeed,
  ) -> CheckpointCoordinator {
    let ckpt_hash = seed
      .superblock
      .map(|sb| sb.checkpoint_path_hash)
      .unwrap_or(0);
    CheckpointCoordinator {
      root: root.to_path_buf(),
      manifest_path: root.join(crate::constants::FILE_MANIFEST),
      policy,
      use_fdatasync,
      ot,
      mvcc,
      mapping,
      active_log: RwLock::new(seed.active_log),
      manifest: Mutex::new(seed.manifest),
      superblock: Mutex::new(SuperblockState {
        file: seed.superblock_file,
        current: seed.superblock,
        checkpoint_hash: ckpt_hash,
      }),
      group: Mutex::new(GroupCommitState::default()),
      group_cv: Condvar::new(),
      clock: Mutex::new(MaintenanceClock {
        last_checkpoint_at: Instant::now(),
        log_opened_at: Instant::now(),
      }),
      maintenance: Mutex::new(()),
      last_checkpoint_epoch: AtomicU64::new(seed.last_checkpoint_epoch),
      replay_bytes: AtomicU64::new(seed.replay_bytes),
      stats: Mutex::new(CoordinatorStats::default()),
    }
  }

  pub fn policy(&self) -> &CheckpointPolicy {
    &self.policy
  }

  /// Shared reference to the active log
  pub fn active_log(&self) -> Arc<DeltaLog> {
    Arc::clone(&self.active_log.read())
  }

  /// Read guard over the active log. Commits hold this across their WAL
  /// append so rotation cannot close a log with an append in flight.
  pub fn active_log_guard(&self) -> RwLockReadGuard<'_, Arc<DeltaLog>> {
    self.active_log.read()
  }

  pub fn stats(&self) -> CoordinatorStats {
    self.stats.lock().clone()
  }

  pub fn last_checkpoint_epoch(&self) -> Epoch {
    self.last_checkpoint_epoch.load(Ordering::Acquire)
  }

  /// A named-root catalog flush updates the manifest through the
  /// coordinator so manifest writes stay serialized.
  pub fn update_manifest_roots(
    &self,
    roots: indexmap::IndexMap<String, crate::core::manifest::RootRecord>,
  ) -> Result<()> {
    let mut manifest = self.manifest.lock();
    manifest.roots = roots;
    manifest.store(&self.manifest_path)
  }

  pub fn manifest_snapshot(&self) -> Manifest {
    self.manifest.lock().clone()
  }

  // ==========================================================================
  // Commit-side hooks
  // ==========================================================================

  /// Account a committed batch and fire the cheap rotation trigger
  pub fn note_commit(&self, appended_bytes: u64) {
    self.replay_bytes.fetch_add(appended_bytes, Ordering::Relaxed);
    if self.rotation_due() {
      if let Err(err) = self.rotate_now() {
        log::warn!("log rotation failed (will retry): {err}");
      }
    }
  }

  fn rotation_due(&self) -> bool {
    let log = self.active_log();
    if log.end_offset() >= self.policy.rotate_bytes {
      return true;
    }
    let clock = self.clock.lock();
    log.end_offset() > 0 && clock.log_opened_at.elapsed() >= self.policy.rotate_age
  }

  /// One writer per window performs the WAL sync; the rest wait on the
  /// condvar for the covering flush. Returns once the caller's append is
  /// durable or the flush that covered it failed.
  pub fn group_sync(&self, appended_to: &Arc<DeltaLog>) -> Result<()> {
    let my_seq = {
      let mut state = self.group.lock();
      state.next_seq += 1;
      state.next_seq
    };

    {
      let mut state = self.group.lock();
      if state.flushing {
        while state.flushed_seq < my_seq && state.last_error_seq < my_seq {
          self.group_cv.wait(&mut state);
        }
        if state.last_error_seq >= my_seq {
          let message = state
            .last_error
            .as_deref()
            .unwrap_or("group commit flush failed");
          return Err(io::Error::other(message.to_string()).into());
        }
        return Ok(());
      }
      state.flushing = true;
    }

    if self.policy.group_commit_interval_ms > 0 {
      std::thread::sleep(Duration::from_millis(self.policy.group_commit_interval_ms));
    }

    // Sequences registered before this point appended before it too, so
    // the syncs below cover them.
    let cover = self.group.lock().next_seq;

    let flush_result = (|| -> Result<()> {
      appended_to.sync()?;
      let active = self.active_log();
      if active.sequence() != appended_to.sequence() {
        // A rotation happened inside the window; rotation synced the logs
        // in between, the new active log carries the rest.
        active.sync()?;
      }
      Ok(())
    })();

    let mut state = self.group.lock();
    state.flushing = false;
    match &flush_result {
      Ok(()) => {
        state.flushed_seq = state.flushed_seq.max(cover);
        state.last_error_seq = 0;
        state.last_error = None;
      }
      Err(err) => {
        state.last_error_seq = cover;
        state.last_error = Some(err.to_string());
      }
    }
    self.group_cv.notify_all();

    flush_result
  }

  // ==========================================================================
  // Publishing
  // ==========================================================================

  /// Publish `(root, epoch)` into the next superblock slot. Stale epochs
  /// are ignored so racing writers cannot move the store backwards.
  pub fn try_publish(&self, root: NodeId, epoch: Epoch) -> Result<()> {
    let mut state = self.superblock.lock();
    if let Some(current) = state.current {
      if epoch < current.epoch {
        return Ok(());
      }
    }
    let sequence = state.current.map(|c| c.sequence + 1).unwrap_or(1);
    let sb = Superblock {
      sequence,
      root_id: root.raw(),
      epoch,
      checkpoint_path_hash: state.checkpoint_hash,
      active_log_seq: self.active_log().sequence(),
    };
    state.file.publish(&sb)?;
    state.current = Some(sb);
    Ok(())
  }

  pub fn published(&self) -> Option<Superblock> {
    self.superblock.lock().current
  }

  // ==========================================================================
  // Checkpointing & rotation
  // ==========================================================================

  fn checkpoint_due(&self) -> bool {
    let clock = self.clock.lock();
    if clock.last_checkpoint_at.elapsed() < self.policy.min_interval {
      return false;
    }
    let bytes = self.replay_bytes.load(Ordering::Relaxed);
    if bytes >= self.policy.max_replay_bytes {
      return true;
    }
    let epochs = self
      .mvcc
      .global_epoch()
      .saturating_sub(self.last_checkpoint_epoch.load(Ordering::Acquire));
    if epochs >= self.policy.max_replay_epochs {
      return true;
    }
    bytes > 0 && clock.last_checkpoint_at.elapsed() >= self.policy.max_age
  }

  /// Run a checkpoint if the policy says one is due
  pub fn maybe_checkpoint(&self) -> Result<Option<Epoch>> {
    if !self.checkpoint_due() {
      return Ok(None);
    }
    self.checkpoint_now().map(Some)
  }

  /// Write a checkpoint, rotate the log, and prune covered logs.
  ///
  /// Every step is a crash point: the checkpoint file only becomes real at
  /// its rename, the manifest replace is atomic, and the superblock keeps
  /// referring to the previous checkpoint until the new one is durable.
  pub fn checkpoint_now(&self) -> Result<Epoch> {
    let _maintenance = self.maintenance.lock();
    let started = Instant::now();

    // 1) Snapshot the object table up to the current epoch.
    let checkpoint_epoch = self.mvcc.global_epoch();
    let entries = self.ot.snapshot_entries(checkpoint_epoch);

    // Segment data covered by the checkpoint must be durable: checkpointed
    // entries carry no payloads, so recovery reads the mapped files.
    self.mapping.flush_all()?;

    // 2) + 3) Write checkpoint.tmp, fsync, rename.
    let ckpt_dir = self.root.join(DIR_CHECKPOINTS);
    fs::create_dir_all(&ckpt_dir)?;
    let file_name = checkpoint_file_name(checkpoint_epoch);
    let ckpt_path = ckpt_dir.join(&file_name);
    write_checkpoint(&ckpt_path, checkpoint_epoch, &entries)?;

    let replay_before = self.replay_bytes.load(Ordering::Relaxed);

    {
      // 4) .. 7) Close the active log, open its successor, swap.
      let mut active = self.active_log.write();
      let old_log = Arc::clone(&active);
      old_log.sync()?;

      let mut manifest = self.manifest.lock();
      manifest.add_checkpoint(ManifestCheckpoint {
        path: format!("{DIR_CHECKPOINTS}/{file_name}"),
        epoch: checkpoint_epoch,
      });

      let new_log = self.open_next_log(&mut manifest, &old_log, checkpoint_epoch)?;

      // 5) Atomic manifest replace fsyncs the store directory; fsync the
      // checkpoints directory to cover the rename above.
      manifest.store(&self.manifest_path)?;
      crate::util::fs::sync_dir(&ckpt_dir)?;

      *active = new_log;
      // 7) The old handle closes when the last reader drops its Arc.
    }

    self.superblock.lock().checkpoint_hash = path_hash(&file_name);
    self
      .last_checkpoint_epoch
      .store(checkpoint_epoch, Ordering::Release);
    self.replay_bytes.store(0, Ordering::Relaxed);

    {
      let mut clock = self.clock.lock();
      clock.last_checkpoint_at = Instant::now();
      clock.log_opened_at = Instant::now();
    }
    {
      let mut stats = self.stats.lock();
      stats.checkpoints_written += 1;
      stats.rotations += 1;
      stats.last_ckpt_ms = started.elapsed().as_millis() as u64;
      stats.last_replay_bytes = replay_before;
      stats.last_checkpoint_epoch = checkpoint_epoch;
    }

    // 8) Prune logs the checkpoint made redundant.
    if self.policy.gc_on_checkpoint {
      if let Err(err) = self.gc_logs(checkpoint_epoch) {
        log::warn!("log GC after checkpoint failed (will retry): {err}");
      }
    }

    log::debug!(
      "checkpoint at epoch {checkpoint_epoch}: {} entries, {} replay bytes retired",
      entries.len(),
      replay_before
    );
    Ok(checkpoint_epoch)
  }

  /// Rotate the active log without writing a checkpoint
  pub fn rotate_now(&self) -> Result<()> {
    let _maintenance = self.maintenance.lock();

    {
      let mut active = self.active_log.write();
      let old_log = Arc::clone(&active);
      if old_log.end_offset() == 0 {
        return Ok(());
      }
      old_log.sync()?;

      let mut manifest = self.manifest.lock();
      let new_log = self.open_next_log(&mut manifest, &old_log, self.mvcc.global_epoch())?;
      manifest.store(&self.manifest_path)?;

      *active = new_log;
    }

    self.clock.lock().log_opened_at = Instant::now();
    self.stats.lock().rotations += 1;

    if self.policy.gc_on_rotate {
      let cover = self.last_checkpoint_epoch.load(Ordering::Acquire);
      if let Err(err) = self.gc_logs(cover) {
        log::warn!("log GC after rotation failed (will retry): {err}");
      }
    }
    Ok(())
  }

  /// Close `old_log` in the manifest and register its successor. Caller
  /// holds the active-log write guard and the manifest lock.
  fn open_next_log(
    &self,
    manifest: &mut Manifest,
    old_log: &DeltaLog,
    fallback_epoch: Epoch,
  ) -> Result<Arc<DeltaLog>> {
    let end_epoch = match old_log.end_epoch_relaxed() {
      0 => fallback_epoch.max(1),
      epoch => epoch,
    };
    manifest.close_log(old_log.sequence(), end_epoch);

    let next_seq = manifest.next_log_sequence();
    let path = self.root.join(DIR_LOGS).join(format!("delta_{next_seq}.wal"));
    let new_log = Arc::new(DeltaLog::create(
      &path,
      next_seq,
      end_epoch,
      self.use_fdatasync,
    )?);
    manifest.add_log(ManifestLog {
      path: format!("{DIR_LOGS}/delta_{next_seq}.wal"),
      sequence: next_seq,
      start_epoch: end_epoch,
      end_epoch: 0,
    });
    Ok(new_log)
  }

  /// Delete closed logs whose whole epoch range is covered by the
  /// checkpoint at `cover_epoch`, keeping the newest `gc_min_keep_logs`
  /// closed logs around.
  pub fn gc_logs(&self, cover_epoch: Epoch) -> Result<usize> {
    let mut manifest = self.manifest.lock();

    let mut closed: Vec<u64> = manifest
      .delta_logs
      .iter()
      .filter(|l| l.end_epoch != 0)
      .map(|l| l.sequence)
      .collect();
    closed.sort_unstable();
    let keep_from = closed.len().saturating_sub(self.policy.gc_min_keep_logs);
    let kept: std::collections::HashSet<u64> = closed[keep_from..].iter().copied().collect();

    let victims: Vec<ManifestLog> = manifest
      .covered_logs(cover_epoch)
      .into_iter()
      .filter(|l| !kept.contains(&l.sequence))
      .cloned()
      .collect();
    if victims.is_empty() {
      return Ok(0);
    }

    let mut pruned = 0;
    for victim in &victims {
      let path = self.root.join(&victim.path);
      if let Err(err) = fs::remove_file(&path) {
        if path.exists() {
          log::warn!("could not delete {}: {err}", path.display());
          continue;
        }
      }
      manifest.remove_log(victim.sequence);
      pruned += 1;
    }
    manifest.store(&self.manifest_path)?;

    let mut stats = self.stats.lock();
    stats.pruned_logs += pruned as u64;
    stats.last_gc_epoch = cover_epoch;
    Ok(pruned)
  }

  // ==========================================================================
  // Background loop
  // ==========================================================================

  /// Periodic tick: rotation and checkpoint triggers
  pub fn tick(&self) {
    if self.rotation_due() {
      if let Err(err) = self.rotate_now() {
        log::warn!("background rotation failed (will retry): {err}");
      }
    }
    match self.maybe_checkpoint() {
      Ok(_) => {}
      Err(err) => log::warn!("background checkpoint failed (will retry): {err}"),
    }
  }

  /// Run until the shutdown channel closes. Spawned by the runtime.
  pub fn run_background(self: Arc<Self>, shutdown: Receiver<()>) {
    let tick_every = Duration::from_millis(200);
    loop {
      match shutdown.recv_timeout(tick_every) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        Err(RecvTimeoutError::Timeout) => self.tick(),
      }
    }
    // Final sync so a clean shutdown leaves nothing buffered.
    if let Err(err) = self.active_log().sync() {
      log::warn!("final WAL sync on shutdown failed: {err}");
    }
  }
}
