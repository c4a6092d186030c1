//! Shared types for treestore
//!
//! NodeId layout, node kinds, allocator addresses, and the delta record
//! that flows through the WAL, the checkpoint, and recovery.

use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::constants::*;

/// Monotonic commit counter; defines visibility windows
pub type Epoch = u64;

// ============================================================================
// Node kinds
// ============================================================================

/// Logical kind of a stored node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeKind {
  /// Interior tree node
  Internal = 0,
  /// Leaf tree node
  Leaf = 1,
  /// Out-of-line data record
  DataRecord = 2,
  /// Out-of-line value vector
  ValueVec = 3,
}

impl NodeKind {
  pub fn from_u8(value: u8) -> Option<NodeKind> {
    match value {
      0 => Some(NodeKind::Internal),
      1 => Some(NodeKind::Leaf),
      2 => Some(NodeKind::DataRecord),
      3 => Some(NodeKind::ValueVec),
      _ => None,
    }
  }

  /// True if the kind lives in the data-record file family (`.xd`)
  pub fn is_data(self) -> bool {
    matches!(self, NodeKind::DataRecord | NodeKind::ValueVec)
  }
}

// ============================================================================
// Retire reasons
// ============================================================================

/// Why a node is being retired or freed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
  Unknown,
  SplitReplace,
  MergeDelete,
  Evict,
  AbortRollback,
  Reallocation,
  TreeDestroy,
}

impl RetireReason {
  pub fn as_str(self) -> &'static str {
    match self {
      RetireReason::Unknown => "Unknown",
      RetireReason::SplitReplace => "SplitReplace",
      RetireReason::MergeDelete => "MergeDelete",
      RetireReason::Evict => "Evict",
      RetireReason::AbortRollback => "AbortRollback",
      RetireReason::Reallocation => "Reallocation",
      RetireReason::TreeDestroy => "TreeDestroy",
    }
  }

  /// Reasons that allow an immediate free of a LIVE entry
  pub fn allows_live_free(self) -> bool {
    matches!(
      self,
      RetireReason::Reallocation
        | RetireReason::AbortRollback
        | RetireReason::Evict
        | RetireReason::TreeDestroy
    )
  }

  /// Reasons that allow cancelling a RESERVED entry
  pub fn allows_reserved_free(self) -> bool {
    matches!(self, RetireReason::AbortRollback | RetireReason::Reallocation)
  }
}

// ============================================================================
// NodeId
// ============================================================================

/// 64-bit handle + tag pair identifying a logical node.
///
/// Layout: `[unused:8 | tag:8 | shard:6 | index:42]`. The low 48 bits are
/// the handle index (stable across reuse); the tag is an 8-bit ABA counter
/// that skips 0 on increment. `raw() == 0` is the reserved invalid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
  /// The reserved invalid NodeId
  pub const INVALID: NodeId = NodeId(0);

  /// Build a NodeId from a 48-bit handle index and a tag
  pub fn new(handle_index: u64, tag: u8) -> NodeId {
    debug_assert!(handle_index <= HANDLE_MASK, "handle index out of range");
    NodeId(((tag as u64) << HANDLE_BITS) | (handle_index & HANDLE_MASK))
  }

  /// Reinterpret a raw u64 (e.g. from the manifest or a parent payload)
  pub fn from_raw(raw: u64) -> NodeId {
    NodeId(raw)
  }

  /// The raw 64-bit value
  pub fn raw(self) -> u64 {
    self.0
  }

  /// The 48-bit handle index (shard + in-shard slot)
  pub fn handle_index(self) -> u64 {
    self.0 & HANDLE_MASK
  }

  /// The 8-bit ABA tag
  pub fn tag(self) -> u8 {
    ((self.0 >> HANDLE_BITS) & 0xFF) as u8
  }

  /// The shard id encoded in the top 6 bits of the handle index
  pub fn shard(self) -> usize {
    ((self.handle_index() >> INDEX_BITS) & ((1 << SHARD_BITS) - 1)) as usize
  }

  /// The in-shard slot index
  pub fn slot(self) -> u64 {
    self.0 & INDEX_MASK
  }

  pub fn is_valid(self) -> bool {
    self.0 != 0
  }
}

impl std::fmt::Display for NodeId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}#{}", self.handle_index(), self.tag())
  }
}

/// Compose a handle index from shard and slot
pub fn handle_index(shard: usize, slot: u64) -> u64 {
  debug_assert!(shard < (1 << SHARD_BITS));
  debug_assert!(slot <= INDEX_MASK);
  ((shard as u64) << INDEX_BITS) | slot
}

/// Next tag in the skip-0 cycle (1..=255)
pub fn next_tag(tag: u8) -> u8 {
  if tag >= 255 {
    1
  } else {
    tag + 1
  }
}

/// Previous tag in the skip-0 cycle; used to rewind aborted reservations
pub fn prev_tag(tag: u8) -> u8 {
  if tag <= 1 {
    255
  } else {
    tag - 1
  }
}

// ============================================================================
// Allocator addresses
// ============================================================================

/// A slot handed out by the segment allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
  pub file_id: u32,
  /// File-local segment index
  pub segment_id: u32,
  /// Byte offset inside the segment
  pub offset: u32,
  /// Slot size (the size class), not the caller's requested length
  pub length: u32,
  pub class_id: u8,
}

impl Allocation {
  pub fn is_valid(&self) -> bool {
    self.length != 0
  }
}

/// Resolved address stored in an object table entry
#[derive(Debug, Clone, Copy)]
pub struct OtAddr {
  pub file_id: u32,
  pub segment_id: u32,
  pub offset: u32,
  pub length: u32,
  /// Resolved mapped pointer; null until (re)resolved
  pub vaddr: *mut u8,
}

// ============================================================================
// Delta records
// ============================================================================

/// Flag bit: an in-line payload follows this record in the WAL frame
pub const DELTA_FLAG_PAYLOAD: u8 = 0x01;

/// One object-table state transition, as written to the WAL and rebuilt
/// during recovery. Fixed 48-byte little-endian encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtDeltaRec {
  pub handle_idx: u64,
  pub tag: u8,
  pub kind: u8,
  pub class_id: u8,
  pub flags: u8,
  pub file_id: u32,
  pub segment_id: u32,
  pub offset: u32,
  pub length: u32,
  pub data_crc32c: u32,
  pub birth_epoch: u64,
  pub retire_epoch: u64,
}

impl OtDeltaRec {
  /// True if this record retires a node rather than publishing one
  pub fn is_retirement(&self) -> bool {
    self.retire_epoch != EPOCH_LIVE
  }

  /// The epoch this record became visible at
  pub fn epoch(&self) -> Epoch {
    if self.is_retirement() {
      self.retire_epoch
    } else {
      self.birth_epoch
    }
  }

  /// The NodeId this record describes
  pub fn node_id(&self) -> NodeId {
    NodeId::new(self.handle_idx, self.tag)
  }

  pub fn encode_into(&self, buf: &mut [u8; OT_DELTA_REC_SIZE]) {
    buf[0..8].copy_from_slice(&self.handle_idx.to_le_bytes());
    buf[8] = self.tag;
    buf[9] = self.kind;
    buf[10] = self.class_id;
    buf[11] = self.flags;
    buf[12..16].copy_from_slice(&self.file_id.to_le_bytes());
    buf[16..20].copy_from_slice(&self.segment_id.to_le_bytes());
    buf[20..24].copy_from_slice(&self.offset.to_le_bytes());
    buf[24..28].copy_from_slice(&self.length.to_le_bytes());
    buf[28..32].copy_from_slice(&self.data_crc32c.to_le_bytes());
    buf[32..40].copy_from_slice(&self.birth_epoch.to_le_bytes());
    buf[40..48].copy_from_slice(&self.retire_epoch.to_le_bytes());
  }

  pub fn decode(reader: &mut impl Read) -> io::Result<OtDeltaRec> {
    let handle_idx = reader.read_u64::<LittleEndian>()?;
    let tag = reader.read_u8()?;
    let kind = reader.read_u8()?;
    let class_id = reader.read_u8()?;
    let flags = reader.read_u8()?;
    let file_id = reader.read_u32::<LittleEndian>()?;
    let segment_id = reader.read_u32::<LittleEndian>()?;
    let offset = reader.read_u32::<LittleEndian>()?;
    let length = reader.read_u32::<LittleEndian>()?;
    let data_crc32c = reader.read_u32::<LittleEndian>()?;
    let birth_epoch = reader.read_u64::<LittleEndian>()?;
    let retire_epoch = reader.read_u64::<LittleEndian>()?;
    Ok(OtDeltaRec {
      handle_idx,
      tag,
      kind,
      class_id,
      flags,
      file_id,
      segment_id,
      offset,
      length,
      data_crc32c,
      birth_epoch,
      retire_epoch,
    })
  }
}

/// Result of a node allocation
#[derive(Debug, Clone, Copy)]
pub struct AllocResult {
  pub id: NodeId,
  /// Allocated slot capacity in bytes (>= the requested length)
  pub capacity: usize,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_node_id_roundtrip() {
    let id = NodeId::new(handle_index(3, 77), 9);
    assert_eq!(id.shard(), 3);
    assert_eq!(id.slot(), 77);
    assert_eq!(id.tag(), 9);
    assert_eq!(id.handle_index(), (3u64 << INDEX_BITS) | 77);
    assert!(id.is_valid());
  }

  #[test]
  fn test_invalid_node_id() {
    assert!(!NodeId::INVALID.is_valid());
    assert_eq!(NodeId::INVALID.raw(), 0);
    // Handle 0 with a real tag is a valid id
    assert!(NodeId::new(0, 1).is_valid());
  }

  #[test]
  fn test_tag_skip_zero() {
    assert_eq!(next_tag(0), 1);
    assert_eq!(next_tag(1), 2);
    assert_eq!(next_tag(254), 255);
    assert_eq!(next_tag(255), 1);

    assert_eq!(prev_tag(2), 1);
    assert_eq!(prev_tag(1), 255);

    // A full cycle visits 255 values and never 0
    let mut tag = 1u8;
    let mut seen = std::collections::HashSet::new();
    for _ in 0..255 {
      assert_ne!(tag, 0);
      seen.insert(tag);
      tag = next_tag(tag);
    }
    assert_eq!(seen.len(), 255);
    assert_eq!(tag, 1);
  }

  #[test]
  fn test_delta_rec_roundtrip() {
    let rec = OtDeltaRec {
      handle_idx: handle_index(5, 42),
      tag: 17,
      kind: NodeKind::Leaf as u8,
      class_id: 2,
      flags: DELTA_FLAG_PAYLOAD,
      file_id: 1,
      segment_id: 3,
      offset: 4096,
      length: 1024,
      data_crc32c: 0xABCD_EF01,
      birth_epoch: 12,
      retire_epoch: EPOCH_LIVE,
    };
    let mut buf = [0u8; OT_DELTA_REC_SIZE];
    rec.encode_into(&mut buf);
    let decoded = OtDeltaRec::decode(&mut &buf[..]).expect("decode");
    assert_eq!(decoded, rec);
    assert!(!decoded.is_retirement());
    assert_eq!(decoded.epoch(), 12);
  }

  #[test]
  fn test_retirement_epoch() {
    let rec = OtDeltaRec {
      handle_idx: 7,
      tag: 1,
      kind: NodeKind::Internal as u8,
      class_id: 0,
      flags: 0,
      file_id: 0,
      segment_id: 0,
      offset: 0,
      length: 256,
      data_crc32c: 0,
      birth_epoch: 3,
      retire_epoch: 9,
    };
    assert!(rec.is_retirement());
    assert_eq!(rec.epoch(), 9);
  }
}
