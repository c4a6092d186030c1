//! On-disk catalog of delta logs, checkpoints, and named roots
//!
//! A single JSON document replaced atomically (write tmp, fsync, rename,
//! dir fsync). Paths are stored relative to the store directory.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::Epoch;
use crate::util::fs::atomic_replace;

/// One delta log in the inventory. An open log has `end_epoch == 0`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestLog {
  pub path: String,
  pub sequence: u64,
  pub start_epoch: Epoch,
  pub end_epoch: Epoch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestCheckpoint {
  pub path: String,
  pub epoch: Epoch,
}

/// A named root entry; the MBR is opaque caller data carried alongside
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RootRecord {
  pub node_id: u64,
  pub epoch: Epoch,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub mbr: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
  pub delta_logs: Vec<ManifestLog>,
  pub checkpoints: Vec<ManifestCheckpoint>,
  pub roots: IndexMap<String, RootRecord>,
}

impl Manifest {
  /// Load the manifest; a missing file is an empty catalog
  pub fn load(path: &Path) -> Result<Manifest> {
    if !path.exists() {
      return Ok(Manifest::default());
    }
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  /// Persist atomically
  pub fn store(&self, path: &Path) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(self)?;
    atomic_replace(path, &bytes)
  }

  pub fn add_log(&mut self, log: ManifestLog) {
    self.delta_logs.push(log);
    self.delta_logs.sort_by_key(|l| l.sequence);
  }

  /// Close the log with `sequence`, stamping its end epoch
  pub fn close_log(&mut self, sequence: u64, end_epoch: Epoch) {
    if let Some(log) = self.delta_logs.iter_mut().find(|l| l.sequence == sequence) {
      log.end_epoch = end_epoch;
    }
  }

  pub fn remove_log(&mut self, sequence: u64) -> Option<ManifestLog> {
    let idx = self.delta_logs.iter().position(|l| l.sequence == sequence)?;
    Some(self.delta_logs.remove(idx))
  }

  /// The open log with the highest sequence, if any
  pub fn open_log(&self) -> Option<&ManifestLog> {
    self
      .delta_logs
      .iter()
      .filter(|l| l.end_epoch == 0)
      .max_by_key(|l| l.sequence)
  }

  pub fn next_log_sequence(&self) -> u64 {
    self
      .delta_logs
      .iter()
      .map(|l| l.sequence)
      .max()
      .unwrap_or(0)
      + 1
  }

  pub fn add_checkpoint(&mut self, ckpt: ManifestCheckpoint) {
    self.checkpoints.push(ckpt);
    self.checkpoints.sort_by_key(|c| c.epoch);
  }

  /// Newest checkpoint at or below `max_epoch`
  pub fn newest_checkpoint(&self) -> Option<&ManifestCheckpoint> {
    self.checkpoints.iter().max_by_key(|c| c.epoch)
  }

  /// Logs that must be replayed on top of a checkpoint at `epoch`:
  /// open logs plus closed logs that end after it, in sequence order.
  pub fn logs_to_replay(&self, epoch: Epoch) -> Vec<&ManifestLog> {
    self
      .delta_logs
      .iter()
      .filter(|l| l.end_epoch == 0 || l.end_epoch > epoch)
      .collect()
  }

  /// Closed logs fully covered by a checkpoint at `epoch` (GC candidates)
  pub fn covered_logs(&self, epoch: Epoch) -> Vec<&ManifestLog> {
    self
      .delta_logs
      .iter()
      .filter(|l| l.end_epoch != 0 && l.end_epoch <= epoch)
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> Manifest {
    let mut m = Manifest::default();
    m.add_log(ManifestLog {
      path: "logs/delta_1.wal".to_string(),
      sequence: 1,
      start_epoch: 0,
      end_epoch: 10,
    });
    m.add_log(ManifestLog {
      path: "logs/delta_2.wal".to_string(),
      sequence: 2,
      start_epoch: 10,
      end_epoch: 0,
    });
    m.add_checkpoint(ManifestCheckpoint {
      path: "checkpoints/ckpt_10.bin".to_string(),
      epoch: 10,
    });
    m.roots.insert(
      "spatial".to_string(),
      RootRecord {
        node_id: 42,
        epoch: 10,
        mbr: Some(vec![0.0, 0.0, 1.0, 1.0]),
      },
    );
    m
  }

  #[test]
  fn test_store_load_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("manifest.json");

    let m = sample();
    m.store(&path).expect("store");
    let loaded = Manifest::load(&path).expect("load");

    assert_eq!(loaded.delta_logs, m.delta_logs);
    assert_eq!(loaded.checkpoints, m.checkpoints);
    assert_eq!(loaded.roots.get("spatial"), m.roots.get("spatial"));
  }

  #[test]
  fn test_missing_manifest_is_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let m = Manifest::load(&dir.path().join("manifest.json")).expect("load");
    assert!(m.delta_logs.is_empty());
    assert!(m.checkpoints.is_empty());
  }

  #[test]
  fn test_open_log_and_sequences() {
    let m = sample();
    assert_eq!(m.open_log().expect("open").sequence, 2);
    assert_eq!(m.next_log_sequence(), 3);
  }

  #[test]
  fn test_replay_and_gc_sets() {
    let mut m = sample();
    m.add_log(ManifestLog {
      path: "logs/delta_0.wal".to_string(),
      sequence: 0,
      start_epoch: 0,
      end_epoch: 5,
    });

    let replay: Vec<u64> = m.logs_to_replay(10).iter().map(|l| l.sequence).collect();
    assert_eq!(replay, vec![2]);

    let covered: Vec<u64> = m.covered_logs(10).iter().map(|l| l.sequence).collect();
    assert_eq!(covered, vec![0, 1]);
  }

  #[test]
  fn test_close_log_stamps_epoch() {
    let mut m = sample();
    m.close_log(2, 20);
    assert!(m.open_log().is_none());
    assert_eq!(m.delta_logs[1].end_epoch, 20);
  }
}
