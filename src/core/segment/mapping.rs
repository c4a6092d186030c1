//! Mapped segment regions and scoped pins
//!
//! Every segment is mapped independently, so file growth never remaps or
//! moves an existing region and pointers handed out stay valid until the
//! runtime closes. Pins clone the region's Arc, keeping the mapping alive
//! for zero-copy readers without leaking raw pointers across the crate
//! boundary.

use std::fs::File;
use std::sync::Arc;

use hashbrown::HashMap;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;

use crate::error::Result;
use crate::types::NodeKind;

// ============================================================================
// File families
// ============================================================================

/// Which backing-file family a segment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFamily {
  /// Tree nodes (`.xi`)
  Index,
  /// Data records (`.xd`)
  Data,
}

impl FileFamily {
  pub fn for_kind(kind: NodeKind) -> FileFamily {
    if kind.is_data() {
      FileFamily::Data
    } else {
      FileFamily::Index
    }
  }

  pub fn extension(self) -> &'static str {
    match self {
      FileFamily::Index => crate::constants::EXT_INDEX,
      FileFamily::Data => crate::constants::EXT_DATA,
    }
  }
}

/// Identifies one mapped segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentKey {
  pub family: FileFamily,
  pub class_id: u8,
  pub file_id: u32,
  pub segment_id: u32,
}

// ============================================================================
// Mapped region
// ============================================================================

/// One mmap'd segment. The base pointer is captured at map time and never
/// changes; the region is only unmapped when the last Arc drops.
#[derive(Debug)]
pub struct MappedRegion {
  mmap: MmapMut,
  base: *mut u8,
  len: usize,
}

// The raw base pointer refers to memory owned by `mmap`, which lives as
// long as the region itself.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
  pub fn map(file: &File, offset: u64, len: usize) -> Result<Arc<MappedRegion>> {
    let mut mmap = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(file)? };
    let base = mmap.as_mut_ptr();
    Ok(Arc::new(MappedRegion { mmap, base, len }))
  }

  pub fn base(&self) -> *mut u8 {
    self.base
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Synchronously flush a byte range to disk (msync)
  pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
    let end = offset.saturating_add(len).min(self.len);
    let offset = offset.min(self.len);
    self.mmap.flush_range(offset, end - offset)?;
    Ok(())
  }

  /// Flush the whole segment
  pub fn flush(&self) -> Result<()> {
    self.mmap.flush()?;
    Ok(())
  }
}

// ============================================================================
// Pins
// ============================================================================

/// A scoped view into a mapped segment. Holding a pin keeps the mapping
/// alive; dropping it releases the reference.
#[derive(Debug, Clone)]
pub struct MapPin {
  region: Arc<MappedRegion>,
  offset: usize,
  len: usize,
}

impl MapPin {
  pub fn as_ptr(&self) -> *const u8 {
    // Offset is bounds-checked at pin time.
    unsafe { self.region.base().add(self.offset) }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn as_slice(&self) -> &[u8] {
    unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
  }
}

// ============================================================================
// Mapping manager
// ============================================================================

/// Segment-granular mapping table. Growth inserts new regions; existing
/// regions are never replaced, so readers holding pins are unaffected.
#[derive(Debug, Default)]
pub struct MappingManager {
  regions: RwLock<HashMap<SegmentKey, Arc<MappedRegion>>>,
}

impl MappingManager {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: SegmentKey) -> Option<Arc<MappedRegion>> {
    self.regions.read().get(&key).cloned()
  }

  /// Map a segment if it is not already mapped
  pub fn map_segment(
    &self,
    key: SegmentKey,
    file: &File,
    offset: u64,
    len: usize,
  ) -> Result<Arc<MappedRegion>> {
    if let Some(region) = self.get(key) {
      return Ok(region);
    }
    let region = MappedRegion::map(file, offset, len)?;
    let mut regions = self.regions.write();
    // Another thread may have raced us; keep the first mapping.
    Ok(Arc::clone(regions.entry(key).or_insert(region)))
  }

  /// Produce a scoped pin over `[offset, offset + len)` of a mapped segment
  pub fn pin(&self, key: SegmentKey, offset: usize, len: usize) -> Option<MapPin> {
    let region = self.get(key)?;
    if offset.saturating_add(len) > region.len() {
      return None;
    }
    Some(MapPin {
      region,
      offset,
      len,
    })
  }

  /// Flush every mapped region (checkpoint and eventual-mode backstop)
  pub fn flush_all(&self) -> Result<()> {
    let regions: Vec<Arc<MappedRegion>> = self.regions.read().values().cloned().collect();
    for region in regions {
      region.flush()?;
    }
    Ok(())
  }

  pub fn mapped_count(&self) -> usize {
    self.regions.read().len()
  }
}
