//! Magic numbers and constants for treestore

// ============================================================================
// Magic bytes (little-endian u32)
// ============================================================================

/// Superblock magic: "XSB1"
pub const MAGIC_SUPERBLOCK: u32 = 0x3142_5358;

/// Checkpoint magic: "XCK1"
pub const MAGIC_CHECKPOINT: u32 = 0x314B_4358;

// ============================================================================
// Current versions
// ============================================================================

pub const VERSION_SUPERBLOCK: u32 = 1;
pub const VERSION_CHECKPOINT: u32 = 1;

// ============================================================================
// NodeId layout
// ============================================================================

/// Bits of the in-shard slot index
pub const INDEX_BITS: u32 = 42;
/// Bits of the shard id (top of the 48-bit handle index)
pub const SHARD_BITS: u32 = 6;
/// Bits of the handle index (shard + in-shard index)
pub const HANDLE_BITS: u32 = INDEX_BITS + SHARD_BITS;

pub const INDEX_MASK: u64 = (1u64 << INDEX_BITS) - 1;
pub const HANDLE_MASK: u64 = (1u64 << HANDLE_BITS) - 1;

// ============================================================================
// Object table sizing
// ============================================================================

/// Shard count (policy; the handle layout allows up to 64)
pub const NUM_SHARDS: usize = 16;

/// Entries per slab; slabs are appended and never moved
pub const SLAB_ENTRIES: usize = 4096;

/// Maximum slabs a shard can grow to
pub const MAX_SLABS_PER_SHARD: usize = 1024;

/// Sentinel retire epoch of a live entry
pub const EPOCH_LIVE: u64 = u64::MAX;

// ============================================================================
// Segment allocator sizing
// ============================================================================

/// Fixed segment size (power of two, page aligned)
pub const SEGMENT_SIZE: usize = 2 * 1024 * 1024;

/// Smallest size class; smaller requests are rounded up
pub const MIN_CLASS_SIZE: usize = 256;
/// log2 of MIN_CLASS_SIZE
pub const MIN_CLASS_SHIFT: u32 = 8;

/// Largest size class a single node may occupy
pub const MAX_CLASS_SIZE: usize = 64 * 1024;

/// Number of size classes (256 B .. 64 KiB, powers of two)
pub const NUM_CLASSES: usize = 9;

/// Segments per backing file before a new file is started
pub const SEGMENTS_PER_FILE: u32 = 64;

// ============================================================================
// File layout
// ============================================================================

/// Tree node segment files (Internal/Leaf)
pub const EXT_INDEX: &str = "xi";
/// Data record segment files (DataRecord/ValueVec)
pub const EXT_DATA: &str = "xd";

pub const DIR_LOGS: &str = "logs";
pub const DIR_CHECKPOINTS: &str = "checkpoints";

pub const FILE_SUPERBLOCK: &str = "superblock.bin";
pub const FILE_MANIFEST: &str = "manifest.json";
pub const FILE_LOCK: &str = "store.lock";

// ============================================================================
// On-disk record sizes
// ============================================================================

/// Fixed encoded size of an OtDeltaRec
pub const OT_DELTA_REC_SIZE: usize = 48;

/// Fixed encoded size of a checkpoint entry
pub const CHECKPOINT_ENTRY_SIZE: usize = 44;

/// Checkpoint file header size
pub const CHECKPOINT_HEADER_SIZE: usize = 28;

/// One superblock slot (two slots per file, A then B)
pub const SUPERBLOCK_SLOT_SIZE: usize = 64;

// ============================================================================
// Durability defaults
// ============================================================================

/// Default max payload embedded in the WAL (BALANCED)
pub const DEFAULT_MAX_PAYLOAD_IN_WAL: usize = 8192;

/// Max payload embedded in the WAL for the "eventual" named policy
pub const EVENTUAL_MAX_PAYLOAD_IN_WAL: usize = 32768;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_class_count_matches_range() {
    let mut classes = 0;
    let mut size = MIN_CLASS_SIZE;
    while size <= MAX_CLASS_SIZE {
      classes += 1;
      size *= 2;
    }
    assert_eq!(classes, NUM_CLASSES);
  }

  #[test]
  fn test_segment_holds_whole_slots() {
    let mut size = MIN_CLASS_SIZE;
    while size <= MAX_CLASS_SIZE {
      assert_eq!(SEGMENT_SIZE % size, 0);
      size *= 2;
    }
  }

  #[test]
  fn test_shard_count_fits_layout() {
    assert!(NUM_SHARDS <= 1 << SHARD_BITS);
    assert!(NUM_SHARDS.is_power_of_two());
  }
}
