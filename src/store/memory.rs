//! In-memory node store
//!
//! The second `NodeStore` implementation: plain byte buffers keyed by raw
//! NodeId, no files, no epochs. Used by tests and by callers that want the
//! store contract without persistence. Retirement is a no-op; immediate
//! free erases the buffer.

use std::sync::Arc;

use hashbrown::HashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::types::{AllocResult, Epoch, NodeId, NodeKind, RetireReason};

use super::{NodeBytes, NodeStore, PinnedBytes};

struct Buf {
  bytes: Vec<u8>,
  alloc_len: usize,
}

#[derive(Default)]
struct MemoryInner {
  table: HashMap<u64, Buf>,
  roots: IndexMap<String, NodeId>,
  next_id: u64,
}

/// Byte buffers behind the node store contract
pub struct MemoryStore {
  inner: Mutex<MemoryInner>,
}

impl MemoryStore {
  pub fn new() -> MemoryStore {
    MemoryStore {
      inner: Mutex::new(MemoryInner {
        table: HashMap::new(),
        roots: IndexMap::new(),
        // Raw id 0 is the reserved invalid NodeId.
        next_id: 1,
      }),
    }
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl NodeStore for MemoryStore {
  fn allocate_node(&self, min_len: usize, _kind: NodeKind) -> Result<AllocResult> {
    let mut inner = self.inner.lock();
    let id = NodeId::from_raw(inner.next_id);
    inner.next_id += 1;
    inner.table.insert(
      id.raw(),
      Buf {
        bytes: vec![0; min_len],
        alloc_len: min_len,
      },
    );
    Ok(AllocResult {
      id,
      capacity: min_len,
    })
  }

  fn publish_node(&self, id: NodeId, data: &[u8]) -> Result<()> {
    let mut inner = self.inner.lock();
    let buf = inner.table.get_mut(&id.raw()).ok_or(StoreError::NotFound)?;
    buf.bytes.clear();
    buf.bytes.extend_from_slice(data);
    Ok(())
  }

  fn read_node(&self, id: NodeId) -> Result<NodeBytes> {
    let inner = self.inner.lock();
    let buf = inner.table.get(&id.raw()).ok_or(StoreError::NotFound)?;
    Ok(NodeBytes::Owned(Arc::from(buf.bytes.as_slice())))
  }

  fn read_node_pinned(&self, id: NodeId) -> Result<PinnedBytes> {
    let inner = self.inner.lock();
    let buf = inner.table.get(&id.raw()).ok_or(StoreError::NotFound)?;
    Ok(PinnedBytes::from_owned(Arc::from(buf.bytes.as_slice())))
  }

  fn retire_node(&self, id: NodeId, _hint_epoch: Epoch, _why: RetireReason) -> Result<()> {
    // No MVCC readers in memory mode; retirement keeps the buffer around
    // until an immediate free.
    let inner = self.inner.lock();
    if !inner.table.contains_key(&id.raw()) {
      return Err(StoreError::NotFound);
    }
    Ok(())
  }

  fn free_node_immediate(&self, id: NodeId, _why: RetireReason) -> Result<()> {
    self.inner.lock().table.remove(&id.raw());
    Ok(())
  }

  fn get_root(&self, name: &str) -> NodeId {
    self
      .inner
      .lock()
      .roots
      .get(name)
      .copied()
      .unwrap_or(NodeId::INVALID)
  }

  fn set_root(&self, id: NodeId, _epoch: Epoch, _mbr: Option<&[f32]>, name: &str) -> Result<()> {
    self.inner.lock().roots.insert(name.to_string(), id);
    Ok(())
  }

  fn commit(&self, _hint_epoch: Epoch) -> Result<()> {
    Ok(())
  }

  fn node_kind(&self, _id: NodeId) -> Option<NodeKind> {
    // Memory mode never tracks OT metadata.
    None
  }

  fn is_node_present_staged(&self, id: NodeId) -> (bool, bool) {
    (self.inner.lock().table.contains_key(&id.raw()), false)
  }

  fn capacity(&self, id: NodeId) -> usize {
    self
      .inner
      .lock()
      .table
      .get(&id.raw())
      .map(|buf| buf.alloc_len)
      .unwrap_or(0)
  }
}
