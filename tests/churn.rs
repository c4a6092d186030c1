//! Randomized allocate/publish/retire churn with recovery verification

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use treestore::{
  DurabilityPolicy, NodeId, NodeKind, NodeStore, RetireReason, RuntimeOptions, StoreRuntime,
};

#[test]
fn test_random_churn_then_recover() {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().expect("tempdir");
  let mut rng = StdRng::seed_from_u64(0x7EE5_70E5);

  // Expected live contents at the end of every committed batch.
  let mut live: HashMap<NodeId, Vec<u8>> = HashMap::new();
  let mut retired: Vec<NodeId> = Vec::new();

  {
    let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("open");
    let mut policy = DurabilityPolicy::balanced();
    policy.sync_on_commit = true;
    let store = runtime.store("field0", policy);

    for round in 0..40 {
      // A batch of allocations with varying sizes and kinds.
      let births = rng.gen_range(1..6);
      for _ in 0..births {
        let len = rng.gen_range(1..4096);
        let kind = if rng.gen_bool(0.7) {
          NodeKind::Leaf
        } else {
          NodeKind::DataRecord
        };
        let mut payload = vec![0u8; len];
        rng.fill(&mut payload[..]);

        let alloc = store.allocate_node(len, kind).expect("allocate");
        store.publish_node(alloc.id, &payload).expect("publish");
        live.insert(alloc.id, payload);
      }

      // Occasionally retire a random live node in the same batch.
      if round > 2 && rng.gen_bool(0.5) {
        let victim = *live
          .keys()
          .nth(rng.gen_range(0..live.len()))
          .expect("victim");
        // Nodes born in this same batch cannot be retired here.
        if store.node_kind(victim).is_some() {
          store
            .retire_node(victim, 0, RetireReason::MergeDelete)
            .expect("retire");
          live.remove(&victim);
          retired.push(victim);
        }
      }

      store.commit(0).expect("commit");

      // Periodically reclaim past the current horizon.
      if round % 10 == 9 {
        let horizon = runtime.mvcc().advance_epoch();
        runtime.reclaim_before_epoch(horizon);
      }
    }

    // In-process verification before the restart.
    for (id, payload) in &live {
      let bytes = store.read_node(*id).expect("read live");
      assert_eq!(&bytes.as_slice()[..payload.len()], &payload[..]);
    }
    runtime.shutdown().expect("shutdown");
  }

  // Everything still holds after recovery: live nodes byte-identical,
  // retired nodes gone.
  let runtime = StoreRuntime::open(dir.path(), RuntimeOptions::default()).expect("reopen");
  let store = runtime.store("field0", DurabilityPolicy::balanced());

  for (id, payload) in &live {
    let bytes = store.read_node(*id).expect("read live after recovery");
    assert_eq!(
      &bytes.as_slice()[..payload.len()],
      &payload[..],
      "node {id} changed across recovery"
    );
  }
  for id in &retired {
    assert!(
      store.read_node(*id).is_err(),
      "retired node {id} resurfaced after recovery"
    );
  }
}
