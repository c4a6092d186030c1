//! Log rotation under load, with GC after checkpoint

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use treestore::{
  CheckpointPolicy, DurabilityPolicy, NodeId, NodeKind, NodeStore, RuntimeOptions, StoreRuntime,
};

#[test]
fn test_rotation_under_load() {
  let dir = tempfile::tempdir().expect("tempdir");

  let policy = CheckpointPolicy {
    rotate_bytes: 256 * 1024,
    gc_on_checkpoint: true,
    gc_min_keep_logs: 1,
    ..Default::default()
  };
  let runtime = StoreRuntime::open(
    dir.path(),
    RuntimeOptions::default().checkpoint_policy(policy),
  )
  .expect("open");

  let committed: Arc<Mutex<Vec<NodeId>>> = Arc::new(Mutex::new(Vec::new()));
  let stop = Arc::new(AtomicBool::new(false));

  // A reader hammering committed nodes must never see them disappear,
  // and the active log sequence it observes must never move backwards.
  let reader = {
    let runtime = Arc::clone(&runtime);
    let committed = Arc::clone(&committed);
    let stop = Arc::clone(&stop);
    thread::spawn(move || {
      let store = runtime.store("reader", DurabilityPolicy::balanced());
      let mut last_seq = 0u64;
      let mut checked = 0u64;
      while !stop.load(Ordering::Relaxed) {
        let seq = runtime.coordinator().active_log().sequence();
        assert!(seq >= last_seq, "log sequence went backwards");
        last_seq = seq;

        let ids = committed.lock().expect("lock").clone();
        for id in ids.iter().rev().take(8) {
          store.read_node(*id).expect("committed node readable");
          checked += 1;
        }
      }
      (last_seq, checked)
    })
  };

  // Write ~600 KiB of 1 KiB nodes; the writer must never observe a
  // missing active log while rotations happen underneath it.
  let mut store_policy = DurabilityPolicy::balanced();
  store_policy.sync_on_commit = true;
  let store = runtime.store("writer", store_policy);
  let payload = vec![0x5A; 1024];
  for _ in 0..600 {
    let alloc = store.allocate_node(1024, NodeKind::Leaf).expect("allocate");
    store.publish_node(alloc.id, &payload).expect("publish");
    store.commit(0).expect("commit never sees NoActiveLog");
    committed.lock().expect("lock").push(alloc.id);
  }

  stop.store(true, Ordering::Relaxed);
  let (reader_seq, checked) = reader.join().expect("reader thread");
  assert!(checked > 0);

  // The log rotated at least once under load.
  let manifest = runtime.coordinator().manifest_snapshot();
  assert!(
    manifest.delta_logs.len() >= 2,
    "expected rotated logs, manifest has {}",
    manifest.delta_logs.len()
  );
  assert!(runtime.coordinator().stats().rotations >= 1);
  assert!(reader_seq >= 1);

  // Checkpoint, then GC prunes every covered log beyond the keep floor.
  let ckpt_epoch = runtime.coordinator().checkpoint_now().expect("checkpoint");
  let manifest = runtime.coordinator().manifest_snapshot();
  let closed_covered: Vec<_> = manifest
    .delta_logs
    .iter()
    .filter(|l| l.end_epoch != 0 && l.end_epoch <= ckpt_epoch)
    .collect();
  assert!(
    closed_covered.len() <= 1,
    "GC left {} covered logs",
    closed_covered.len()
  );
  for log in &manifest.delta_logs {
    assert!(dir.path().join(&log.path).exists());
  }
  assert!(
    !dir.path().join("logs/delta_1.wal").exists(),
    "first rotated log should be pruned"
  );
  assert!(runtime.coordinator().stats().pruned_logs >= 1);

  // Everything is still readable after rotation + checkpoint + GC.
  for id in committed.lock().expect("lock").iter() {
    store.read_node(*id).expect("readable after gc");
  }

  // And after recovery.
  drop(store);
  runtime.shutdown().expect("shutdown");
  let ids = committed.lock().expect("lock").clone();
  drop(runtime);

  let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("reopen");
  let store = runtime.store("writer", DurabilityPolicy::balanced());
  for id in ids {
    store.read_node(id).expect("readable after recovery");
  }
}
