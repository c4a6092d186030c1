//! Treestore - durable memory-mapped node store for spatial indexes
//!
//! The persistence engine that sits beneath an X-Tree family index. The
//! tree algorithm treats this crate as a black-box node store; the crate
//! provides the hard parts underneath:
//!
//! # Architecture
//!
//! - **Object table**: sharded handle table with 8-bit ABA tags, MVCC
//!   birth/retire epochs, and a reclamation quarantine
//! - **Segment allocator**: size-classed slots inside mmap'd 2 MiB
//!   segments, `.xi` files for tree nodes and `.xd` for data records
//! - **Delta log**: CRC-protected WAL records with optional in-line
//!   payloads for small nodes
//! - **Checkpoint coordinator**: group commit, checkpoint/rotation
//!   triggers, log GC, A/B superblock publishing
//! - **Durable store**: per-writer batching with strict / balanced /
//!   eventual durability modes
//! - **Recovery**: superblock, then checkpoint, then ordered log replay
//!
//! # Example
//!
//! ```no_run
//! use treestore::{DurabilityPolicy, NodeKind, NodeStore, RuntimeOptions, StoreRuntime};
//!
//! let runtime = StoreRuntime::open("data/field0".as_ref(), RuntimeOptions::default())?;
//! let store = runtime.store("field0", DurabilityPolicy::balanced());
//!
//! let node = store.allocate_node(512, NodeKind::Leaf)?;
//! store.publish_node(node.id, b"leaf bytes")?;
//! store.set_root(node.id, 1, None, "")?;
//! store.commit(1)?;
//! # Ok::<(), treestore::StoreError>(())
//! ```

#![deny(clippy::all)]

// Core modules
pub mod constants;
pub mod error;
pub mod types;
pub mod util;

// Storage layer
pub mod core;

// Coordination layer
pub mod coordinator;
pub mod mvcc;

// Store API
pub mod runtime;
pub mod store;

// Re-export commonly used items
pub use crate::core::segment::{ClassUtilization, MapPin, SegmentUtilization};
pub use coordinator::{CheckpointCoordinator, CheckpointPolicy, CoordinatorStats};
pub use error::{Result, StoreError};
pub use runtime::{RuntimeOptions, StoreRuntime};
pub use store::{
  DurabilityMode, DurabilityPolicy, DurableStore, MemoryStore, NodeBytes, NodeStore, PinnedBytes,
};
pub use types::{AllocResult, Epoch, NodeId, NodeKind, RetireReason};
