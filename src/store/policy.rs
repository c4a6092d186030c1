//! Durability policies
//!
//! Three modes trade commit latency against the size of the window a crash
//! can lose:
//!
//! - **Strict**: segment data is msync'd before the WAL append, and the
//!   WAL is fsync'd on every commit. Nothing visible is ever lost.
//! - **Balanced** (default): small nodes ride inside the WAL, the sync is
//!   shared across a group-commit window, dirty segment ranges are flushed
//!   after the append.
//! - **Eventual**: WAL appends without syncing; durability arrives with
//!   the next group window, checkpoint, or clean shutdown.

use std::time::Duration;

use crate::constants::{DEFAULT_MAX_PAYLOAD_IN_WAL, EVENTUAL_MAX_PAYLOAD_IN_WAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
  Strict,
  Balanced,
  Eventual,
}

#[derive(Debug, Clone)]
pub struct DurabilityPolicy {
  pub mode: DurabilityMode,

  /// Max node size embedded in the WAL
  pub max_payload_in_wal: usize,

  /// Flush dirty segment ranges once this many bytes accumulate
  pub dirty_flush_bytes: usize,
  /// ... or once the oldest dirty range is this old
  pub dirty_flush_age: Duration,

  /// Merge contiguous dirty ranges before flushing
  pub coalesce_flushes: bool,
  /// fdatasync instead of fsync where possible
  pub use_fdatasync: bool,
  /// Group commit window in milliseconds; 0 syncs inline
  pub group_commit_interval_ms: u64,
  /// Force a WAL sync on every commit regardless of the window
  pub sync_on_commit: bool,

  pub validate_checksums_on_recovery: bool,
}

impl Default for DurabilityPolicy {
  fn default() -> Self {
    Self {
      mode: DurabilityMode::Balanced,
      max_payload_in_wal: DEFAULT_MAX_PAYLOAD_IN_WAL,
      dirty_flush_bytes: 128 * 1024 * 1024,
      dirty_flush_age: Duration::from_secs(3),
      coalesce_flushes: true,
      use_fdatasync: true,
      group_commit_interval_ms: 5,
      sync_on_commit: false,
      validate_checksums_on_recovery: true,
    }
  }
}

impl DurabilityPolicy {
  pub fn strict() -> Self {
    Self {
      mode: DurabilityMode::Strict,
      // No batching in strict mode.
      group_commit_interval_ms: 0,
      ..Default::default()
    }
  }

  pub fn balanced() -> Self {
    Self::default()
  }

  pub fn eventual() -> Self {
    Self {
      mode: DurabilityMode::Eventual,
      max_payload_in_wal: EVENTUAL_MAX_PAYLOAD_IN_WAL,
      ..Default::default()
    }
  }

  /// Named policy lookup; unknown names get the default
  pub fn named(name: &str) -> Self {
    match name {
      "strict" => Self::strict(),
      "eventual" => Self::eventual(),
      _ => Self::balanced(),
    }
  }
}
