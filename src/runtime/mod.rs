//! Store runtime
//!
//! Owns the object table, allocator, coordinator, and the named-root
//! catalog behind one handle with explicit lifetime. There is no global
//! state: every field/index opens its own runtime over its own directory,
//! and the directory is locked against other processes for the duration.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use fs2::FileExt;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::constants::FILE_LOCK;
use crate::coordinator::{CheckpointCoordinator, CheckpointPolicy};
use crate::core::manifest::RootRecord;
use crate::core::ot::ObjectTable;
use crate::core::segment::SegmentAllocator;
use crate::error::Result;
use crate::mvcc::MvccContext;
use crate::store::{DurabilityPolicy, DurableStore};
use crate::types::{Epoch, NodeId};

pub mod recovery;

use recovery::{recover, RecoveryOptions};

// ============================================================================
// Options
// ============================================================================

/// Options for opening a store runtime
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
  pub checkpoint_policy: CheckpointPolicy,
  /// Skip WAL replay and open in checkpoint-only mode; writes are refused
  pub read_only: bool,
  /// Rehydrate mapped regions from in-line WAL payloads during recovery
  pub payload_recovery: bool,
  pub validate_checksums_on_recovery: bool,
  pub use_fdatasync: bool,
}

impl Default for RuntimeOptions {
  fn default() -> Self {
    Self {
      checkpoint_policy: CheckpointPolicy::default(),
      read_only: false,
      payload_recovery: true,
      validate_checksums_on_recovery: true,
      use_fdatasync: true,
    }
  }
}

impl RuntimeOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
    self.checkpoint_policy = policy;
    self
  }

  pub fn read_only(mut self, value: bool) -> Self {
    self.read_only = value;
    self
  }

  pub fn payload_recovery(mut self, value: bool) -> Self {
    self.payload_recovery = value;
    self
  }
}

// ============================================================================
// Runtime
// ============================================================================

struct Background {
  shutdown: Sender<()>,
  thread: JoinHandle<()>,
}

pub struct StoreRuntime {
  root: PathBuf,
  read_only: bool,
  _lock: std::fs::File,

  mvcc: Arc<MvccContext>,
  ot: Arc<ObjectTable>,
  allocator: Arc<SegmentAllocator>,
  coordinator: Arc<CheckpointCoordinator>,

  catalog: Mutex<IndexMap<String, RootRecord>>,
  catalog_dirty: AtomicBool,

  background: Mutex<Option<Background>>,
}

impl StoreRuntime {
  /// Open a store directory, running recovery, and start the coordinator's
  /// background loop (write mode only).
  pub fn open(root: &Path, options: RuntimeOptions) -> Result<Arc<StoreRuntime>> {
    std::fs::create_dir_all(root)?;

    let lock = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(root.join(FILE_LOCK))?;
    if options.read_only {
      lock.lock_shared()?;
    } else {
      lock.try_lock_exclusive()?;
    }

    let ot = Arc::new(ObjectTable::new());
    let allocator = Arc::new(SegmentAllocator::new(root));
    let mvcc = Arc::new(MvccContext::new(0));

    let recovered = recover(
      root,
      &ot,
      &allocator,
      &RecoveryOptions {
        read_only: options.read_only,
        payload_recovery: options.payload_recovery,
        validate_checksums: options.validate_checksums_on_recovery,
        use_fdatasync: options.use_fdatasync,
      },
    )?;
    mvcc.restore(recovered.epoch);

    let coordinator = Arc::new(CheckpointCoordinator::new(
      root,
      options.checkpoint_policy.clone(),
      options.use_fdatasync,
      Arc::clone(&ot),
      Arc::clone(&mvcc),
      Arc::clone(allocator.mapping()),
      recovered.seed,
    ));

    let runtime = Arc::new(StoreRuntime {
      root: root.to_path_buf(),
      read_only: options.read_only,
      _lock: lock,
      mvcc,
      ot,
      allocator,
      coordinator,
      catalog: Mutex::new(recovered.roots),
      catalog_dirty: AtomicBool::new(false),
      background: Mutex::new(None),
    });

    if !options.read_only {
      let (shutdown, rx) = crossbeam_channel::bounded(1);
      let coordinator = Arc::clone(&runtime.coordinator);
      let thread = std::thread::Builder::new()
        .name("treestore-coordinator".to_string())
        .spawn(move || coordinator.run_background(rx))?;
      *runtime.background.lock() = Some(Background { shutdown, thread });
    }

    Ok(runtime)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn is_read_only(&self) -> bool {
    self.read_only
  }

  pub fn mvcc(&self) -> &MvccContext {
    &self.mvcc
  }

  pub fn ot(&self) -> &ObjectTable {
    &self.ot
  }

  pub fn allocator(&self) -> &SegmentAllocator {
    &self.allocator
  }

  pub fn coordinator(&self) -> &CheckpointCoordinator {
    &self.coordinator
  }

  /// Current reader epoch
  pub fn epoch(&self) -> Epoch {
    self.mvcc.global_epoch()
  }

  /// Build a writer over this runtime
  pub fn store(self: &Arc<Self>, name: &str, policy: DurabilityPolicy) -> DurableStore {
    DurableStore::new(Arc::clone(self), name, policy)
  }

  // ==========================================================================
  // Named-root catalog
  // ==========================================================================

  pub fn get_root(&self, name: &str) -> NodeId {
    self
      .catalog
      .lock()
      .get(name)
      .map(|r| NodeId::from_raw(r.node_id))
      .unwrap_or(NodeId::INVALID)
  }

  pub fn root_epoch(&self, name: &str) -> Option<Epoch> {
    self.catalog.lock().get(name).map(|r| r.epoch)
  }

  pub fn root_mbr(&self, name: &str) -> Option<Vec<f32>> {
    self.catalog.lock().get(name).and_then(|r| r.mbr.clone())
  }

  /// Update a named root in memory; `persist_catalog` makes it durable.
  /// Passing no MBR keeps any stored one.
  pub fn set_root(&self, name: &str, id: NodeId, epoch: Epoch, mbr: Option<&[f32]>) {
    let mut catalog = self.catalog.lock();
    let record = catalog.entry(name.to_string()).or_insert(RootRecord {
      node_id: 0,
      epoch: 0,
      mbr: None,
    });
    record.node_id = id.raw();
    record.epoch = epoch;
    if let Some(mbr) = mbr {
      record.mbr = Some(mbr.to_vec());
    }
    drop(catalog);
    self.catalog_dirty.store(true, Ordering::Release);
  }

  pub fn is_catalog_dirty(&self) -> bool {
    self.catalog_dirty.load(Ordering::Acquire)
  }

  /// Persist the catalog into the manifest (atomic replace)
  pub fn persist_catalog(&self) -> Result<()> {
    let snapshot = self.catalog.lock().clone();
    self.coordinator.update_manifest_roots(snapshot)?;
    self.catalog_dirty.store(false, Ordering::Release);
    Ok(())
  }

  // ==========================================================================
  // Reclamation
  // ==========================================================================

  /// Return quarantined handles no reader below `epoch` can observe, and
  /// hand their segment slots back to the allocator. Returns the number of
  /// handles reclaimed.
  pub fn reclaim_before_epoch(&self, epoch: Epoch) -> usize {
    let result = self.ot.reclaim_before_epoch(epoch);
    for (kind, alloc) in result.segments {
      self.allocator.free(kind, alloc);
    }
    result.handles
  }

  // ==========================================================================
  // Shutdown
  // ==========================================================================

  /// Stop the coordinator loop and sync outstanding state. Called from
  /// `Drop` as well; explicit calls surface errors.
  pub fn shutdown(&self) -> Result<()> {
    if let Some(background) = self.background.lock().take() {
      let _ = background.shutdown.send(());
      let _ = background.thread.join();
    }
    if self.read_only {
      return Ok(());
    }
    if self.is_catalog_dirty() {
      self.persist_catalog()?;
    }
    self.coordinator.active_log().sync()?;
    Ok(())
  }
}

impl Drop for StoreRuntime {
  fn drop(&mut self) {
    if let Err(err) = self.shutdown() {
      log::warn!("store shutdown left state unsynced: {err}");
    }
  }
}
