//! Size-classed segment allocator
//!
//! Serves node allocations out of fixed-size slots inside 2 MiB segments.
//! Segments live in append-only file families: `.xi` for tree nodes and
//! `.xd` for data records, one subdirectory per size class, files extended
//! a segment at a time. Each class keeps a bump cursor plus a free list
//! behind one mutex; fragmentation is bounded by class granularity.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::constants::*;
use crate::error::{Result, StoreError};
use crate::types::{Allocation, NodeKind};

pub mod mapping;

pub use mapping::{FileFamily, MapPin, MappedRegion, MappingManager, SegmentKey};

// ============================================================================
// Utilization
// ============================================================================

/// Per-class utilization counters
#[derive(Debug, Clone, Default)]
pub struct ClassUtilization {
  pub class_id: u8,
  pub slot_size: usize,
  pub segments: u64,
  pub capacity_bytes: u64,
  pub used_bytes: u64,
  pub wasted_bytes: u64,
}

/// Allocator-wide utilization snapshot, surfaced for caller-side eviction
/// decisions.
#[derive(Debug, Clone, Default)]
pub struct SegmentUtilization {
  pub classes: Vec<ClassUtilization>,
  pub total_capacity_bytes: u64,
  pub total_used_bytes: u64,
}

// ============================================================================
// Class state
// ============================================================================

struct ClassFile {
  file: File,
  segments: u32,
}

struct BumpCursor {
  file_id: u32,
  segment_id: u32,
  next_offset: u32,
}

#[derive(Default)]
struct ClassState {
  files: Vec<ClassFile>,
  cursor: Option<BumpCursor>,
  free: Vec<Allocation>,
  used_slots: u64,
}

struct Family {
  family: FileFamily,
  classes: Vec<Mutex<ClassState>>,
}

impl Family {
  fn new(family: FileFamily) -> Self {
    Self {
      family,
      classes: (0..NUM_CLASSES).map(|_| Mutex::new(ClassState::default())).collect(),
    }
  }
}

// ============================================================================
// Allocator
// ============================================================================

/// Size class for a requested length, rounding small requests up
pub fn class_for(min_len: usize) -> Result<u8> {
  if min_len > MAX_CLASS_SIZE {
    return Err(StoreError::OutOfSpace {
      requested: min_len,
    });
  }
  let size = min_len.max(MIN_CLASS_SIZE).next_power_of_two();
  Ok((size.trailing_zeros() - MIN_CLASS_SHIFT) as u8)
}

/// Slot size of a size class
pub fn class_size(class_id: u8) -> usize {
  MIN_CLASS_SIZE << class_id
}

pub struct SegmentAllocator {
  root: PathBuf,
  mapping: Arc<MappingManager>,
  families: [Family; 2],
}

impl SegmentAllocator {
  pub fn new(root: &Path) -> SegmentAllocator {
    SegmentAllocator {
      root: root.to_path_buf(),
      mapping: Arc::new(MappingManager::new()),
      families: [Family::new(FileFamily::Index), Family::new(FileFamily::Data)],
    }
  }

  pub fn mapping(&self) -> &Arc<MappingManager> {
    &self.mapping
  }

  fn family(&self, family: FileFamily) -> &Family {
    match family {
      FileFamily::Index => &self.families[0],
      FileFamily::Data => &self.families[1],
    }
  }

  fn class_dir(&self, class_id: u8) -> PathBuf {
    self.root.join(format!("c{}", class_size(class_id)))
  }

  fn file_path(&self, family: FileFamily, class_id: u8, file_id: u32) -> PathBuf {
    self
      .class_dir(class_id)
      .join(format!("xtree_{}.{}", file_id, family.extension()))
  }

  /// Allocate a slot of the smallest class that fits `min_len`
  pub fn allocate(&self, min_len: usize, kind: NodeKind) -> Result<Allocation> {
    let class_id = class_for(min_len)?;
    let family = FileFamily::for_kind(kind);
    let mut state = self.family(family).classes[class_id as usize].lock();

    if let Some(slot) = state.free.pop() {
      state.used_slots += 1;
      return Ok(slot);
    }

    let needs_segment = match &state.cursor {
      Some(cursor) => cursor.next_offset as usize + class_size(class_id) > SEGMENT_SIZE,
      None => true,
    };
    if needs_segment {
      self.add_segment(&mut state, family, class_id)?;
    }

    let cursor = state.cursor.as_mut().expect("cursor after add_segment");
    let alloc = Allocation {
      file_id: cursor.file_id,
      segment_id: cursor.segment_id,
      offset: cursor.next_offset,
      length: class_size(class_id) as u32,
      class_id,
    };
    cursor.next_offset += class_size(class_id) as u32;
    state.used_slots += 1;
    Ok(alloc)
  }

  /// Extend the youngest file by one segment, or start a new file
  fn add_segment(&self, state: &mut ClassState, family: FileFamily, class_id: u8) -> Result<()> {
    let can_extend = state
      .files
      .last()
      .is_some_and(|last| last.segments < SEGMENTS_PER_FILE);

    let (file_id, segment_id) = if can_extend {
      let file_id = (state.files.len() - 1) as u32;
      let class_file = &mut state.files[file_id as usize];
      let segment_id = class_file.segments;
      class_file
        .file
        .set_len((segment_id as u64 + 1) * SEGMENT_SIZE as u64)?;
      class_file.segments += 1;
      (file_id, segment_id)
    } else {
      let file_id = state.files.len() as u32;
      let dir = self.class_dir(class_id);
      fs::create_dir_all(&dir)?;
      let path = self.file_path(family, class_id, file_id);
      let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)?;
      file.set_len(SEGMENT_SIZE as u64)?;
      state.files.push(ClassFile { file, segments: 1 });
      (file_id, 0)
    };

    let key = SegmentKey {
      family,
      class_id,
      file_id,
      segment_id,
    };
    let file = &state.files[file_id as usize].file;
    self
      .mapping
      .map_segment(key, file, segment_id as u64 * SEGMENT_SIZE as u64, SEGMENT_SIZE)?;

    state.cursor = Some(BumpCursor {
      file_id,
      segment_id,
      next_offset: 0,
    });
    Ok(())
  }

  /// Return a slot to its class free list
  pub fn free(&self, kind: NodeKind, alloc: Allocation) {
    let family = FileFamily::for_kind(kind);
    let mut state = self.family(family).classes[alloc.class_id as usize].lock();
    state.used_slots = state.used_slots.saturating_sub(1);
    state.free.push(alloc);
  }

  /// Mapped pointer for an active allocation
  pub fn get_ptr(&self, kind: NodeKind, alloc: &Allocation) -> Option<*mut u8> {
    let key = SegmentKey {
      family: FileFamily::for_kind(kind),
      class_id: alloc.class_id,
      file_id: alloc.file_id,
      segment_id: alloc.segment_id,
    };
    let region = self.mapping.get(key)?;
    if alloc.offset as usize + alloc.length as usize > region.len() {
      return None;
    }
    // Offset is within the region; pointer arithmetic stays in bounds.
    Some(unsafe { region.base().add(alloc.offset as usize) })
  }

  /// Mapped pointer for a recovered address. Does not require allocator
  /// bookkeeping: the backing file is opened and the segment mapped on
  /// demand.
  pub fn get_ptr_for_recovery(
    &self,
    kind: NodeKind,
    class_id: u8,
    file_id: u32,
    segment_id: u32,
    offset: u32,
    length: u32,
  ) -> Option<*mut u8> {
    let family = FileFamily::for_kind(kind);
    let key = SegmentKey {
      family,
      class_id,
      file_id,
      segment_id,
    };
    if self.mapping.get(key).is_none() {
      let path = self.file_path(family, class_id, file_id);
      let file = OpenOptions::new().read(true).write(true).open(&path).ok()?;
      let needed = (segment_id as u64 + 1) * SEGMENT_SIZE as u64;
      if file.metadata().ok()?.len() < needed {
        return None;
      }
      self
        .mapping
        .map_segment(key, &file, segment_id as u64 * SEGMENT_SIZE as u64, SEGMENT_SIZE)
        .ok()?;
    }
    let region = self.mapping.get(key)?;
    if offset as usize + length as usize > region.len() {
      return None;
    }
    Some(unsafe { region.base().add(offset as usize) })
  }

  /// Region backing an allocation (dirty-range flush bookkeeping)
  pub fn region_for(&self, kind: NodeKind, alloc: &Allocation) -> Option<Arc<MappedRegion>> {
    self.mapping.get(SegmentKey {
      family: FileFamily::for_kind(kind),
      class_id: alloc.class_id,
      file_id: alloc.file_id,
      segment_id: alloc.segment_id,
    })
  }

  /// Scoped pinned view of an allocation for zero-copy reads
  pub fn pin(&self, kind: NodeKind, alloc: &Allocation) -> Result<MapPin> {
    let family = FileFamily::for_kind(kind);
    let key = SegmentKey {
      family,
      class_id: alloc.class_id,
      file_id: alloc.file_id,
      segment_id: alloc.segment_id,
    };
    if self.mapping.get(key).is_none() {
      // Cold segment after recovery: resolve through the mapping path.
      self
        .get_ptr_for_recovery(
          kind,
          alloc.class_id,
          alloc.file_id,
          alloc.segment_id,
          alloc.offset,
          alloc.length,
        )
        .ok_or(StoreError::NotFound)?;
    }
    self
      .mapping
      .pin(key, alloc.offset as usize, alloc.length as usize)
      .ok_or(StoreError::NotFound)
  }

  /// Per-class utilization counters
  pub fn utilization(&self) -> SegmentUtilization {
    let mut out = SegmentUtilization::default();
    for family in &self.families {
      for (class_idx, class) in family.classes.iter().enumerate() {
        let state = class.lock();
        if state.files.is_empty() {
          continue;
        }
        let segments: u64 = state.files.iter().map(|f| f.segments as u64).sum();
        let capacity = segments * SEGMENT_SIZE as u64;
        let used = state.used_slots * class_size(class_idx as u8) as u64;
        out.classes.push(ClassUtilization {
          class_id: class_idx as u8,
          slot_size: class_size(class_idx as u8),
          segments,
          capacity_bytes: capacity,
          used_bytes: used,
          wasted_bytes: capacity.saturating_sub(used),
        });
        out.total_capacity_bytes += capacity;
        out.total_used_bytes += used;
      }
    }
    out
  }

  // ==========================================================================
  // Recovery
  // ==========================================================================

  /// Reattach on-disk files and rebuild free lists by diffing the observed
  /// allocations against segment capacities. Everything not referenced goes
  /// back on the class free lists.
  pub fn rebuild(&self, used: &[(NodeKind, Allocation)]) -> Result<()> {
    // Index observed allocations per (family, class, file, segment).
    let mut used_map: HashMap<SegmentKey, HashSet<u32>> = HashMap::new();
    for (kind, alloc) in used {
      let key = SegmentKey {
        family: FileFamily::for_kind(*kind),
        class_id: alloc.class_id,
        file_id: alloc.file_id,
        segment_id: alloc.segment_id,
      };
      used_map.entry(key).or_default().insert(alloc.offset);
    }

    for family in &self.families {
      for class_idx in 0..NUM_CLASSES {
        let class_id = class_idx as u8;
        let slot = class_size(class_id) as u32;
        let mut state = family.classes[class_idx].lock();
        state.files.clear();
        state.free.clear();
        state.cursor = None;
        state.used_slots = 0;

        for file_id in 0u32.. {
          let path = self.file_path(family.family, class_id, file_id);
          if !path.exists() {
            break;
          }
          let file = OpenOptions::new().read(true).write(true).open(&path)?;
          let len = file.metadata()?.len();
          let segments = (len / SEGMENT_SIZE as u64) as u32;
          for segment_id in 0..segments {
            let key = SegmentKey {
              family: family.family,
              class_id,
              file_id,
              segment_id,
            };
            self.mapping.map_segment(
              key,
              &file,
              segment_id as u64 * SEGMENT_SIZE as u64,
              SEGMENT_SIZE,
            )?;
            let used_offsets = used_map.get(&key);
            let slots = (SEGMENT_SIZE as u32) / slot;
            for i in 0..slots {
              let offset = i * slot;
              if used_offsets.is_some_and(|set| set.contains(&offset)) {
                state.used_slots += 1;
              } else {
                state.free.push(Allocation {
                  file_id,
                  segment_id,
                  offset,
                  length: slot,
                  class_id,
                });
              }
            }
          }
          state.files.push(ClassFile { file, segments });
        }
      }
    }
    Ok(())
  }
}
