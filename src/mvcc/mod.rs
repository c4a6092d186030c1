//! MVCC epoch source
//!
//! One monotonically increasing commit counter per runtime. Each commit
//! advances the epoch once; readers observe a node when
//! `birth_epoch <= epoch < retire_epoch`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Epoch;

/// Global epoch counter with release/acquire visibility
#[derive(Debug)]
pub struct MvccContext {
  global_epoch: AtomicU64,
}

impl MvccContext {
  pub fn new(start: Epoch) -> Self {
    Self {
      global_epoch: AtomicU64::new(start),
    }
  }

  /// Advance and return the new commit epoch
  pub fn advance_epoch(&self) -> Epoch {
    self.global_epoch.fetch_add(1, Ordering::SeqCst) + 1
  }

  /// The epoch readers currently observe
  pub fn global_epoch(&self) -> Epoch {
    self.global_epoch.load(Ordering::Acquire)
  }

  /// Restore the counter after recovery; keeps the maximum seen
  pub fn restore(&self, epoch: Epoch) {
    self.global_epoch.fetch_max(epoch, Ordering::SeqCst);
  }
}

impl Default for MvccContext {
  fn default() -> Self {
    Self::new(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_advance_is_monotonic() {
    let mvcc = MvccContext::new(0);
    assert_eq!(mvcc.global_epoch(), 0);
    assert_eq!(mvcc.advance_epoch(), 1);
    assert_eq!(mvcc.advance_epoch(), 2);
    assert_eq!(mvcc.global_epoch(), 2);
  }

  #[test]
  fn test_restore_keeps_max() {
    let mvcc = MvccContext::new(0);
    mvcc.restore(10);
    assert_eq!(mvcc.global_epoch(), 10);
    mvcc.restore(5);
    assert_eq!(mvcc.global_epoch(), 10);
    assert_eq!(mvcc.advance_epoch(), 11);
  }

  #[test]
  fn test_concurrent_advance_unique() {
    use std::sync::Arc;
    let mvcc = Arc::new(MvccContext::new(0));
    let mut handles = Vec::new();
    for _ in 0..4 {
      let mvcc = Arc::clone(&mvcc);
      handles.push(std::thread::spawn(move || {
        (0..1000).map(|_| mvcc.advance_epoch()).collect::<Vec<_>>()
      }));
    }
    let mut all: Vec<u64> = handles
      .into_iter()
      .flat_map(|h| h.join().expect("join"))
      .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 4000);
    assert_eq!(mvcc.global_epoch(), 4000);
  }
}
