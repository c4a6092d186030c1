//! Crash-consistency scenarios
//!
//! Crashes are simulated by dropping the runtime without clean shutdown
//! and by planting or mutilating on-disk artifacts between open cycles.

use std::fs;

use treestore::constants::SUPERBLOCK_SLOT_SIZE;
use treestore::{
  DurabilityPolicy, NodeKind, NodeStore, RuntimeOptions, StoreRuntime,
};

#[test]
fn test_wal_wins_over_unfinished_checkpoint() {
  let dir = tempfile::tempdir().expect("tempdir");

  let (first, second) = {
    let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("open");
    let store = runtime.store("field0", DurabilityPolicy::strict());

    // Batch 1.
    let a = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(a.id, b"batch one").expect("publish");
    store.set_root(a.id, 1, None, "").expect("set root");
    store.commit(1).expect("commit");

    // Batch 2, WAL synced by strict mode.
    let b = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(b.id, b"batch two").expect("publish");
    store.commit(2).expect("commit");

    // Simulated crash right after the WAL sync of batch 2: a checkpoint
    // got as far as its temp file but never renamed.
    fs::write(
      dir.path().join("checkpoints/ckpt_2.tmp"),
      b"partial checkpoint that never finished",
    )
    .expect("plant tmp");

    (a.id, b.id)
    // Runtime dropped here without shutdown.
  };

  let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("recover");
  let store = runtime.store("field0", DurabilityPolicy::strict());

  // Both batches are observable; the unfinished checkpoint is ignored.
  assert_eq!(store.get_root(""), first);
  assert_eq!(&store.read_node(first).expect("read").as_slice()[..9], b"batch one");
  assert_eq!(&store.read_node(second).expect("read").as_slice()[..9], b"batch two");
  assert!(dir.path().join("checkpoints/ckpt_2.tmp").exists());
}

#[test]
fn test_recovery_after_real_checkpoint() {
  let dir = tempfile::tempdir().expect("tempdir");

  let (before, after) = {
    let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("open");
    let store = runtime.store("field0", DurabilityPolicy::strict());

    let a = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(a.id, b"checkpointed").expect("publish");
    store.set_root(a.id, 1, None, "").expect("set root");
    store.commit(1).expect("commit");

    runtime.coordinator().checkpoint_now().expect("checkpoint");

    // A commit after the checkpoint lands in the fresh log.
    let b = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(b.id, b"post checkpoint").expect("publish");
    store.commit(2).expect("commit");

    (a.id, b.id)
  };

  let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("recover");
  let store = runtime.store("field0", DurabilityPolicy::strict());

  assert_eq!(
    &store.read_node(before).expect("read").as_slice()[..12],
    b"checkpointed"
  );
  assert_eq!(
    &store.read_node(after).expect("read").as_slice()[..15],
    b"post checkpoint"
  );
  // Replay only needed the post-checkpoint log.
  assert!(runtime.coordinator().last_checkpoint_epoch() >= 1);
}

#[test]
fn test_payload_rehydrates_lost_segment_bytes() {
  let dir = tempfile::tempdir().expect("tempdir");

  let id = {
    let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("open");
    let mut policy = DurabilityPolicy::balanced();
    policy.sync_on_commit = true;
    let store = runtime.store("field0", policy);

    let alloc = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store
      .publish_node(alloc.id, b"precious bytes riding in the WAL")
      .expect("publish");
    store.commit(1).expect("commit");
    runtime.shutdown().expect("shutdown");
    alloc.id
  };

  // Lose the segment contents (as if the page cache never reached disk);
  // the WAL payload must restore them on recovery.
  let segment = dir.path().join("c256/xtree_0.xi");
  let mut bytes = fs::read(&segment).expect("read segment");
  for byte in bytes.iter_mut().take(256) {
    *byte = 0;
  }
  fs::write(&segment, &bytes).expect("zero segment");

  let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("recover");
  let store = runtime.store("field0", DurabilityPolicy::balanced());
  let read = store.read_node(id).expect("read");
  assert_eq!(&read.as_slice()[..32], b"precious bytes riding in the WAL");
}

#[test]
fn test_torn_wal_tail_loses_only_last_batch() {
  let dir = tempfile::tempdir().expect("tempdir");

  let (kept, torn) = {
    let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("open");
    let mut policy = DurabilityPolicy::balanced();
    policy.sync_on_commit = true;
    let store = runtime.store("field0", policy);

    let a = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(a.id, b"durable batch").expect("publish");
    store.commit(1).expect("commit");

    let b = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(b.id, b"torn batch").expect("publish");
    store.commit(2).expect("commit");

    runtime.shutdown().expect("shutdown");
    (a.id, b.id)
  };

  // Tear the tail of the newest log mid-frame.
  let log_path = dir.path().join("logs/delta_1.wal");
  let mut bytes = fs::read(&log_path).expect("read log");
  bytes.truncate(bytes.len() - 10);
  fs::write(&log_path, &bytes).expect("tear log");

  let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("recover");
  let store = runtime.store("field0", DurabilityPolicy::balanced());

  assert_eq!(
    &store.read_node(kept).expect("read").as_slice()[..13],
    b"durable batch"
  );
  // The torn batch is gone, as if it never committed.
  assert!(store.read_node(torn).is_err());

  // The store keeps working after the truncated tail.
  let store_policy = DurabilityPolicy::strict();
  let store = runtime.store("field0", store_policy);
  let c = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
  store.publish_node(c.id, b"life goes on").expect("publish");
  store.commit(3).expect("commit");
  assert_eq!(
    &store.read_node(c.id).expect("read").as_slice()[..12],
    b"life goes on"
  );
}

#[test]
fn test_corrupt_superblock_slot_falls_back() {
  let dir = tempfile::tempdir().expect("tempdir");

  let id = {
    let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("open");
    let store = runtime.store("field0", DurabilityPolicy::strict());

    let a = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(a.id, b"epoch one root").expect("publish");
    store.set_root(a.id, 1, None, "").expect("set root");
    store.commit(1).expect("commit");
    store.publish_node(a.id, b"epoch two root").expect("publish");
    store.commit(2).expect("commit");

    runtime.shutdown().expect("shutdown");
    a.id
  };

  // Corrupt the newest superblock slot (sequence 2 lives in slot A).
  let sb_path = dir.path().join("superblock.bin");
  let mut bytes = fs::read(&sb_path).expect("read superblock");
  bytes[8] ^= 0xFF;
  fs::write(&sb_path, &bytes).expect("corrupt slot");

  // The other slot still names a valid root; recovery proceeds.
  let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("recover");
  let store = runtime.store("field0", DurabilityPolicy::strict());
  assert_eq!(store.get_root(""), id);
  store.read_node(id).expect("read");

  // Sanity: both slots corrupt still opens (WAL has everything) but the
  // published root history is gone.
  let mut bytes = fs::read(&sb_path).expect("read superblock");
  bytes[9] ^= 0xFF;
  bytes[SUPERBLOCK_SLOT_SIZE + 9] ^= 0xFF;
  drop(runtime);
  fs::write(&sb_path, &bytes).expect("corrupt both");
  let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("recover");
  let store = runtime.store("field0", DurabilityPolicy::strict());
  store.read_node(id).expect("read survives via manifest roots");
}

#[test]
fn test_unclean_drop_of_eventual_mode_recovers_synced_prefix() {
  let dir = tempfile::tempdir().expect("tempdir");

  let ids = {
    let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("open");
    let store = runtime.store("field0", DurabilityPolicy::eventual());

    let mut ids = Vec::new();
    for i in 0..10u32 {
      let alloc = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
      store
        .publish_node(alloc.id, format!("eventual {i}").as_bytes())
        .expect("publish");
      store.commit(0).expect("commit");
      ids.push(alloc.id);
    }
    // Force the WAL down before the "crash".
    runtime.coordinator().active_log().sync().expect("sync");
    ids
    // Dropped without shutdown.
  };

  let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("recover");
  let store = runtime.store("field0", DurabilityPolicy::eventual());
  for (i, id) in ids.iter().enumerate() {
    let bytes = store.read_node(*id).expect("read");
    assert_eq!(
      bytes.as_slice()[..10].to_vec(),
      format!("eventual {i}").as_bytes()[..10].to_vec()
    );
  }
}
