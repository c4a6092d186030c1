//! Node store interface
//!
//! Two implementations share the contract: [`DurableStore`] over the
//! persistence engine, and [`MemoryStore`] for tests and callers that want
//! the semantics without files.

use std::sync::Arc;

use crate::core::segment::{MapPin, SegmentUtilization};
use crate::error::Result;
use crate::types::{AllocResult, Epoch, NodeId, NodeKind, RetireReason};

pub mod durable;
pub mod memory;
pub mod policy;

pub use durable::DurableStore;
pub use memory::MemoryStore;
pub use policy::{DurabilityMode, DurabilityPolicy};

// ============================================================================
// Byte views
// ============================================================================

/// Bytes of a node, either borrowed straight from a mapped segment or
/// owned (memory store, staged reads).
#[derive(Debug, Clone)]
pub enum NodeBytes {
  Mapped { ptr: *const u8, len: usize },
  Owned(Arc<[u8]>),
}

impl NodeBytes {
  pub fn as_slice(&self) -> &[u8] {
    match self {
      // Mapped pointers come from segment regions owned by the runtime;
      // they stay valid until the runtime closes.
      NodeBytes::Mapped { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
      NodeBytes::Owned(bytes) => bytes,
    }
  }

  pub fn len(&self) -> usize {
    match self {
      NodeBytes::Mapped { len, .. } => *len,
      NodeBytes::Owned(bytes) => bytes.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn to_vec(&self) -> Vec<u8> {
    self.as_slice().to_vec()
  }
}

/// A zero-copy read that keeps its mapping alive for as long as the value
/// is held. Staged (uncommitted) and in-memory reads carry no pin.
#[derive(Debug, Clone)]
pub struct PinnedBytes {
  pin: Option<MapPin>,
  owned: Option<Arc<[u8]>>,
  ptr: *const u8,
  len: usize,
}

impl PinnedBytes {
  pub fn from_pin(pin: MapPin) -> PinnedBytes {
    let ptr = pin.as_ptr();
    let len = pin.len();
    PinnedBytes {
      pin: Some(pin),
      owned: None,
      ptr,
      len,
    }
  }

  /// Uncommitted mapped bytes; the writer's batch guarantees liveness
  pub fn from_raw(ptr: *const u8, len: usize) -> PinnedBytes {
    PinnedBytes {
      pin: None,
      owned: None,
      ptr,
      len,
    }
  }

  pub fn from_owned(bytes: Arc<[u8]>) -> PinnedBytes {
    let ptr = bytes.as_ptr();
    let len = bytes.len();
    PinnedBytes {
      pin: None,
      owned: Some(bytes),
      ptr,
      len,
    }
  }

  pub fn as_slice(&self) -> &[u8] {
    if let Some(owned) = &self.owned {
      return &owned[..self.len];
    }
    unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn is_pinned(&self) -> bool {
    self.pin.is_some()
  }
}

// ============================================================================
// Store interface
// ============================================================================

/// The node store contract used by the tree layer.
///
/// One writer per store instance; any number of readers may read LIVE
/// nodes concurrently. Mutations stage into the writer's batch and become
/// visible (and durable, per policy) at `commit`.
pub trait NodeStore {
  /// Allocate a zeroed node of at least `min_len` bytes. The node is
  /// invisible to readers until published and committed.
  fn allocate_node(&self, min_len: usize, kind: NodeKind) -> Result<AllocResult>;

  /// Stage node contents for the next commit. Duplicate publishes of the
  /// same NodeId in one batch coalesce, last one wins.
  fn publish_node(&self, id: NodeId, data: &[u8]) -> Result<()>;

  /// Publish contents the caller already serialized into the node's mapped
  /// region; no copy is performed.
  fn publish_node_in_place(&self, _id: NodeId, _len: usize) -> Result<()> {
    Err(crate::error::StoreError::ContractViolation(
      "store does not support in-place publish".to_string(),
    ))
  }

  fn supports_in_place_publish(&self) -> bool {
    false
  }

  /// Bytes of a visible node, or the writer's own staged bytes
  fn read_node(&self, id: NodeId) -> Result<NodeBytes>;

  /// Same visibility as `read_node`, returning a scoped pinned mapping
  fn read_node_pinned(&self, id: NodeId) -> Result<PinnedBytes>;

  /// Stage a retirement; the retire epoch is stamped at commit
  fn retire_node(&self, id: NodeId, hint_epoch: Epoch, why: RetireReason) -> Result<()>;

  /// Immediately free a node outside the batched retire path. RESERVED
  /// entries are cancelled; LIVE entries require a reason that justifies
  /// skipping quarantine ordering.
  fn free_node_immediate(&self, id: NodeId, why: RetireReason) -> Result<()>;

  /// Root for `name`; an empty name means the store's own primary root.
  /// A root staged by this writer's batch is visible to it before commit.
  fn get_root(&self, name: &str) -> NodeId;

  /// Defer a root update to the next commit so the catalog records the
  /// final (tag-confirmed) NodeId.
  fn set_root(&self, id: NodeId, epoch: Epoch, mbr: Option<&[f32]>, name: &str) -> Result<()>;

  /// Flush the batch per the store's durability policy. The commit epoch
  /// comes from the runtime's MVCC counter, not the hint.
  fn commit(&self, hint_epoch: Epoch) -> Result<()>;

  /// Kind of a visible (committed) node
  fn node_kind(&self, id: NodeId) -> Option<NodeKind>;

  /// True for RESERVED (same-writer) and visible LIVE nodes
  fn is_node_present(&self, id: NodeId) -> bool {
    self.is_node_present_staged(id).0
  }

  /// `(present, staged)`: staged means RESERVED, visible only to the writer
  fn is_node_present_staged(&self, id: NodeId) -> (bool, bool);

  /// Allocated capacity behind a NodeId (0 if unknown)
  fn capacity(&self, id: NodeId) -> usize;

  /// Allocator utilization for caller-side eviction decisions
  fn segment_utilization(&self) -> SegmentUtilization {
    SegmentUtilization::default()
  }
}
