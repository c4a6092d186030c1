//! Error types for treestore
//!
//! One typed error enum for the whole crate. Contract violations are
//! additionally `debug_assert!`ed at the call sites; I/O and corruption
//! surface only through these variants.

use std::io;

use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// All errors that can occur at the store boundary
#[derive(Error, Debug)]
pub enum StoreError {
  /// Node does not exist, is retired, or is not yet visible
  #[error("node not found")]
  NotFound,

  /// NodeId tag does not match the current handle tag (stale reference)
  #[error("stale node tag")]
  StaleTag,

  /// Object table shards are full and cannot grow
  #[error("out of object table handles")]
  OutOfHandles,

  /// Segment allocator cannot satisfy the request
  #[error("out of segment space: requested {requested} bytes")]
  OutOfSpace { requested: usize },

  /// Publish exceeds the allocated capacity
  #[error("buffer overflow: {needed} bytes into a {capacity} byte allocation")]
  BufferOverflow { needed: usize, capacity: usize },

  /// On-disk state failed validation and no fallback remains
  #[error("corrupt store: {0}")]
  Corrupt(String),

  /// Write attempted on a read-only runtime
  #[error("store is read-only")]
  ReadOnly,

  /// No active delta log (store closed or mid-teardown)
  #[error("no active delta log")]
  NoActiveLog,

  /// Stored checksum does not match the computed one
  #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
  CrcMismatch { stored: u32, computed: u32 },

  /// On-disk format version is not supported by this build
  #[error("version mismatch: found {found}, supported {supported}")]
  VersionMismatch { found: u32, supported: u32 },

  /// API contract violated by the caller (hard error in release builds)
  #[error("contract violation: {0}")]
  ContractViolation(String),

  /// Underlying I/O failure
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),

  /// Manifest (de)serialization failure
  #[error("manifest error: {0}")]
  Json(#[from] serde_json::Error),
}

impl StoreError {
  /// True for errors a writer may retry after backing off
  pub fn is_transient(&self) -> bool {
    matches!(self, StoreError::Io(_))
  }
}
