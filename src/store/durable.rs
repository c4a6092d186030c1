//! Durable node store
//!
//! The writer-side batching layer over the persistence runtime. Mutations
//! stage into a per-writer batch (one writer per store instance is the
//! contract); `commit` stamps a fresh epoch, appends the batch to the WAL,
//! flushes per the durability mode, and only then marks object table
//! entries LIVE — so readers can never observe a node that is not durable
//! under the chosen policy.

use std::sync::Arc;

use hashbrown::HashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::constants::EPOCH_LIVE;
use crate::core::ot::{OtEntry, STATE_RESERVED};
use crate::core::segment::{MappedRegion, SegmentUtilization};
use crate::core::wal::DeltaWithPayload;
use crate::error::{Result, StoreError};
use crate::runtime::StoreRuntime;
use crate::types::{
  AllocResult, Epoch, NodeId, NodeKind, OtAddr, OtDeltaRec, RetireReason,
};
use crate::util::crc::crc32c;

use super::policy::{DurabilityMode, DurabilityPolicy};
use super::{NodeBytes, NodeStore, PinnedBytes};

// ============================================================================
// Batch state
// ============================================================================

struct PendingWrite {
  id: NodeId,
  len: u32,
  delta: OtDeltaRec,
  dst_vaddr: *mut u8,
  include_payload: bool,
}

struct DirtyRange {
  region: Arc<MappedRegion>,
  offset: usize,
  len: usize,
}

#[derive(Clone, Copy)]
struct StagedNode {
  ptr: *const u8,
  len: usize,
}

#[derive(Default)]
struct WriteBatch {
  writes: Vec<PendingWrite>,
  /// Coalesces multiple publishes per NodeId; last write wins
  write_index_by_raw: HashMap<u64, usize>,
  retirements: Vec<OtDeltaRec>,
  dirty_ranges: Vec<DirtyRange>,
  /// Root updates deferred until the committed tags are known
  pending_roots: IndexMap<String, (NodeId, Option<Vec<f32>>)>,
  /// Tx-local staging so the writer reads back its own uncommitted nodes
  pending_nodes: HashMap<u64, StagedNode>,
}

// Raw pointers in the batch reference mapped segments owned by the
// runtime, which outlives every store built over it.
unsafe impl Send for WriteBatch {}

impl WriteBatch {
  fn stage_write(&mut self, write: PendingWrite) {
    let raw = write.id.raw();
    match self.write_index_by_raw.get(&raw) {
      None => {
        self.write_index_by_raw.insert(raw, self.writes.len());
        self.writes.push(write);
      }
      Some(&idx) => {
        // Coalesce: keep the most recent payload and delta for this id.
        let prev = &mut self.writes[idx];
        prev.len = write.len;
        prev.dst_vaddr = write.dst_vaddr;
        prev.include_payload = write.include_payload;
        prev.delta = write.delta;
      }
    }
  }

  fn cancel_write_by_raw(&mut self, raw: u64) -> bool {
    let Some(idx) = self.write_index_by_raw.remove(&raw) else {
      return false;
    };
    let last = self.writes.len() - 1;
    if idx != last {
      let moved_raw = self.writes[last].id.raw();
      self.writes.swap(idx, last);
      self.write_index_by_raw.insert(moved_raw, idx);
    }
    self.writes.pop();
    true
  }

  fn will_publish(&self, id: NodeId) -> bool {
    self.write_index_by_raw.contains_key(&id.raw())
  }

  fn is_empty(&self) -> bool {
    self.writes.is_empty() && self.retirements.is_empty()
  }

  fn clear(&mut self) {
    self.writes.clear();
    self.write_index_by_raw.clear();
    self.retirements.clear();
    self.dirty_ranges.clear();
    self.pending_roots.clear();
    self.pending_nodes.clear();
  }
}

// ============================================================================
// Durable store
// ============================================================================

pub struct DurableStore {
  runtime: Arc<StoreRuntime>,
  name: String,
  policy: DurabilityPolicy,
  batch: Mutex<WriteBatch>,
}

impl DurableStore {
  pub fn new(runtime: Arc<StoreRuntime>, name: &str, policy: DurabilityPolicy) -> DurableStore {
    DurableStore {
      runtime,
      name: name.to_string(),
      policy,
      batch: Mutex::new(WriteBatch::default()),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn policy(&self) -> &DurabilityPolicy {
    &self.policy
  }

  pub fn runtime(&self) -> &Arc<StoreRuntime> {
    &self.runtime
  }

  fn root_key<'a>(&'a self, name: &'a str) -> &'a str {
    if name.is_empty() {
      &self.name
    } else {
      name
    }
  }

  /// Build the allocation delta for a publish; epochs are stamped at commit
  fn make_alloc_delta(&self, id: NodeId, entry: &OtEntry) -> OtDeltaRec {
    let addr = entry.addr();
    OtDeltaRec {
      handle_idx: id.handle_index(),
      tag: id.tag(),
      kind: entry.kind() as u8,
      class_id: entry.class_id(),
      flags: 0,
      file_id: addr.file_id,
      segment_id: addr.segment_id,
      offset: addr.offset,
      length: addr.length,
      data_crc32c: 0,
      birth_epoch: 0,
      retire_epoch: EPOCH_LIVE,
    }
  }

  /// Resolve the entry for a NodeId, applying uncommitted/committed
  /// visibility rules. Returns the entry and whether it is uncommitted
  /// (RESERVED, visible only to this writer's batch).
  fn resolve_entry(&self, id: NodeId) -> Option<(&OtEntry, bool)> {
    let ot = self.runtime.ot();
    let entry = ot.try_get_by_handle(id.handle_index())?;
    if entry.tag() != id.tag() {
      return None;
    }

    let uncommitted = entry.birth_epoch() == 0;
    if !uncommitted {
      let epoch = self.runtime.mvcc().global_epoch();
      if !entry.visible_at(epoch) {
        return None;
      }
    }
    Some((entry, uncommitted))
  }

  /// Track a publish's mapped range for a later msync
  fn push_dirty(&self, batch: &mut WriteBatch, entry: &OtEntry, len: usize) {
    let alloc = entry.allocation();
    if let Some(region) = self.runtime.allocator().region_for(entry.kind(), &alloc) {
      batch.dirty_ranges.push(DirtyRange {
        region,
        offset: alloc.offset as usize,
        len,
      });
    }
  }

  /// msync the staged dirty ranges, merging adjacent ones when the policy
  /// asks for coalesced flushes.
  fn flush_dirty(&self, batch: &mut WriteBatch) -> Result<()> {
    if batch.dirty_ranges.is_empty() {
      return Ok(());
    }
    let mut ranges = std::mem::take(&mut batch.dirty_ranges);
    if self.policy.coalesce_flushes {
      ranges.sort_by_key(|r| (Arc::as_ptr(&r.region) as usize, r.offset));
      let mut merged: Vec<DirtyRange> = Vec::with_capacity(ranges.len());
      for range in ranges {
        match merged.last_mut() {
          Some(last)
            if Arc::ptr_eq(&last.region, &range.region)
              && range.offset <= last.offset + last.len =>
          {
            let end = (range.offset + range.len).max(last.offset + last.len);
            last.len = end - last.offset;
          }
          _ => merged.push(range),
        }
      }
      ranges = merged;
    }
    for range in &ranges {
      range.region.flush_range(range.offset, range.len)?;
    }
    Ok(())
  }

  /// Discard the pending batch: cancel every reservation it created and
  /// return their segment slots.
  pub fn abort(&self) {
    let mut batch = self.batch.lock();
    let ot = self.runtime.ot();
    let handles: Vec<u64> = batch.pending_nodes.keys().copied().collect();
    for handle in handles {
      let Some(entry) = ot.try_get_by_handle(handle) else {
        continue;
      };
      if entry.state() != STATE_RESERVED {
        continue;
      }
      let id = NodeId::new(handle, entry.tag());
      let kind = entry.kind();
      let alloc = entry.allocation();
      if ot.abort_reservation(id) {
        self.runtime.allocator().free(kind, alloc);
      }
    }
    batch.clear();
  }

  /// Mapped capacity behind a NodeId (in-place serialization support)
  pub fn mapped_capacity(&self, id: NodeId) -> usize {
    self
      .runtime
      .ot()
      .try_get_by_handle(id.handle_index())
      .map(|entry| entry.length() as usize)
      .unwrap_or(0)
  }

  /// Mapped destination pointer for an allocation owned by this writer
  pub fn mapped_ptr(&self, id: NodeId) -> Option<*mut u8> {
    let entry = self.runtime.ot().try_get_by_handle(id.handle_index())?;
    let ptr = entry.vaddr();
    if ptr.is_null() {
      None
    } else {
      Some(ptr)
    }
  }

  // ==========================================================================
  // Commit
  // ==========================================================================

  fn commit_batch(&self, batch: &mut WriteBatch, epoch: Epoch) -> Result<u64> {
    let ot = self.runtime.ot();
    let coordinator = self.runtime.coordinator();

    // Stamp the commit epoch into every staged delta.
    for write in &mut batch.writes {
      write.delta.birth_epoch = epoch;
      write.delta.retire_epoch = EPOCH_LIVE;
    }
    for retirement in &mut batch.retirements {
      if retirement.retire_epoch == 0 {
        retirement.retire_epoch = epoch;
      }
    }

    // 1) Confirm reserved identities. Tags were chosen at allocation;
    // duplicates cannot appear after batch coalescing.
    let mut reserved_ids = Vec::with_capacity(batch.writes.len());
    let mut reserved_by_raw: HashMap<u64, NodeId> = HashMap::with_capacity(batch.writes.len());
    for write in &batch.writes {
      let reserved = ot.mark_live_reserve(write.id, epoch)?;
      reserved_ids.push(reserved);
      let prev = reserved_by_raw.insert(write.id.raw(), reserved);
      debug_assert!(prev.is_none(), "duplicate NodeId in batch after coalescing");
    }

    // 2) Build the WAL batch carrying the reserved tags.
    let mut wal_batch: Vec<DeltaWithPayload> =
      Vec::with_capacity(batch.writes.len() + batch.retirements.len());
    for (i, write) in batch.writes.iter().enumerate() {
      let mut delta = write.delta;
      delta.tag = reserved_ids[i].tag();
      let payload = if write.include_payload && !write.dst_vaddr.is_null() && write.len > 0 {
        // The mapped region stays alive for the duration of the commit.
        Some(unsafe {
          std::slice::from_raw_parts(write.dst_vaddr as *const u8, write.len as usize)
        })
      } else {
        None
      };
      wal_batch.push(DeltaWithPayload { rec: delta, payload });
    }
    for retirement in &batch.retirements {
      wal_batch.push(DeltaWithPayload {
        rec: *retirement,
        payload: None,
      });
    }
    debug_assert_eq!(
      wal_batch.len(),
      batch.writes.len() + batch.retirements.len()
    );

    // 3) Mode-specific durability. STRICT flushes segment data before the
    // WAL append so the log never refers to bytes that could be lost.
    if self.policy.mode == DurabilityMode::Strict {
      self.flush_dirty(batch)?;
    }

    // Appends happen under the active-log read guard so rotation cannot
    // close a log with this append in flight.
    let (log, appended) = {
      let guard = coordinator.active_log_guard();
      let log = Arc::clone(&guard);
      let appended = log.append_with_payloads(&wal_batch)?;
      (log, appended)
    };

    match self.policy.mode {
      DurabilityMode::Strict => {
        log.sync()?;
      }
      DurabilityMode::Balanced => {
        if self.policy.group_commit_interval_ms == 0 || self.policy.sync_on_commit {
          log.sync()?;
        } else {
          coordinator.group_sync(&log)?;
        }
        // Updated in-place state must be durable too.
        self.flush_dirty(batch)?;
      }
      DurabilityMode::Eventual => {
        if self.policy.sync_on_commit {
          log.sync()?;
        }
        // Dirty ranges are best-effort; the coordinator's checkpoint
        // flushes mapped regions.
        batch.dirty_ranges.clear();
      }
    }

    // 4) The WAL is durable for this mode: advance object table state.
    for reserved in &reserved_ids {
      ot.mark_live_commit(*reserved, epoch);
    }

    #[cfg(debug_assertions)]
    {
      let committed: hashbrown::HashSet<u64> =
        reserved_ids.iter().map(|id| id.raw()).collect();
      for retirement in &batch.retirements {
        let id = retirement.node_id();
        debug_assert!(
          !committed.contains(&id.raw()),
          "retiring a just-committed NodeId {id}"
        );
        if retirement.birth_epoch == 0 {
          debug_assert!(
            batch.will_publish(id),
            "retiring reserved NodeId {id} that is not published in this batch"
          );
        }
      }
    }

    for retirement in &batch.retirements {
      ot.retire(retirement.node_id(), retirement.retire_epoch);
    }

    // 5) Apply deferred roots with their tag-confirmed ids.
    for (name, (id, mbr)) in &batch.pending_roots {
      let final_id = reserved_by_raw.get(&id.raw()).copied().unwrap_or(*id);
      self.runtime.set_root(name, final_id, epoch, mbr.as_deref());
    }

    // 6) Persist the catalog before the superblock refers to it.
    if self.runtime.is_catalog_dirty() {
      self.runtime.persist_catalog()?;
    }

    // 7) Publish the primary root + epoch.
    let mut root = self.runtime.get_root(&self.name);
    if let Some(reserved) = reserved_by_raw.get(&root.raw()) {
      root = *reserved;
    }
    if root.is_valid() {
      coordinator.try_publish(root, epoch)?;
    }

    Ok(appended)
  }
}

// ============================================================================
// NodeStore implementation
// ============================================================================

impl NodeStore for DurableStore {
  fn allocate_node(&self, min_len: usize, kind: NodeKind) -> Result<AllocResult> {
    if self.runtime.is_read_only() {
      return Err(StoreError::ReadOnly);
    }

    let allocator = self.runtime.allocator();
    let alloc = allocator.allocate(min_len, kind)?;
    let vaddr = allocator
      .get_ptr(kind, &alloc)
      .ok_or_else(|| StoreError::Corrupt("fresh allocation has no mapping".to_string()))?;

    // Zero the slot: reused slots carry a prior node's bytes, and padding
    // beyond the published length must read as zero.
    unsafe {
      std::ptr::write_bytes(vaddr, 0, alloc.length as usize);
    }

    let id = self.runtime.ot().allocate(
      kind,
      alloc.class_id,
      OtAddr {
        file_id: alloc.file_id,
        segment_id: alloc.segment_id,
        offset: alloc.offset,
        length: alloc.length,
        vaddr,
      },
    )?;

    self.batch.lock().pending_nodes.insert(
      id.handle_index(),
      StagedNode {
        ptr: vaddr,
        len: alloc.length as usize,
      },
    );

    Ok(AllocResult {
      id,
      capacity: alloc.length as usize,
    })
  }

  fn publish_node(&self, id: NodeId, data: &[u8]) -> Result<()> {
    debug_assert!(id.is_valid(), "publish_node with invalid NodeId");
    if !id.is_valid() {
      return Err(StoreError::ContractViolation(
        "publish_node with invalid NodeId".to_string(),
      ));
    }

    // The tag may not be committed yet, so resolve by handle only.
    let ot = self.runtime.ot();
    let entry = ot
      .try_get_by_handle(id.handle_index())
      .ok_or(StoreError::NotFound)?;
    let dst_vaddr = entry.vaddr();
    let capacity = entry.length() as usize;
    let len = data.len();

    if len > capacity {
      return Err(StoreError::BufferOverflow {
        needed: len,
        capacity,
      });
    }
    if dst_vaddr.is_null() || len == 0 {
      return Ok(());
    }

    let mut delta = self.make_alloc_delta(id, entry);
    let mut batch = self.batch.lock();

    // Copy into the mapped slot in every mode; the modes differ in what
    // else rides along (CRC, WAL payload, dirty-range flush).
    unsafe {
      std::ptr::copy_nonoverlapping(data.as_ptr(), dst_vaddr, len);
    }

    let include_payload = match self.policy.mode {
      DurabilityMode::Strict => {
        self.push_dirty(&mut batch, entry, len);
        false
      }
      DurabilityMode::Balanced => {
        delta.data_crc32c = crc32c(data);
        if len <= self.policy.max_payload_in_wal {
          true
        } else {
          self.push_dirty(&mut batch, entry, len);
          false
        }
      }
      DurabilityMode::Eventual => {
        if len <= self.policy.max_payload_in_wal {
          delta.data_crc32c = crc32c(data);
          true
        } else {
          self.push_dirty(&mut batch, entry, len);
          false
        }
      }
    };

    batch.stage_write(PendingWrite {
      id,
      len: len as u32,
      delta,
      dst_vaddr,
      include_payload,
    });
    batch.pending_nodes.insert(
      id.handle_index(),
      StagedNode {
        ptr: dst_vaddr,
        len,
      },
    );
    Ok(())
  }

  fn publish_node_in_place(&self, id: NodeId, len: usize) -> Result<()> {
    debug_assert!(id.is_valid(), "publish_node_in_place with invalid NodeId");
    if !id.is_valid() {
      return Err(StoreError::ContractViolation(
        "publish_node_in_place with invalid NodeId".to_string(),
      ));
    }

    let ot = self.runtime.ot();
    let entry = ot
      .try_get_by_handle(id.handle_index())
      .ok_or(StoreError::NotFound)?;
    let dst_vaddr = entry.vaddr();
    let capacity = entry.length() as usize;

    if dst_vaddr.is_null() || len == 0 {
      return Ok(());
    }
    if len > capacity {
      return Err(StoreError::BufferOverflow {
        needed: len,
        capacity,
      });
    }

    let written = unsafe { std::slice::from_raw_parts(dst_vaddr as *const u8, len) };
    let mut delta = self.make_alloc_delta(id, entry);
    let mut batch = self.batch.lock();

    let include_payload = match self.policy.mode {
      DurabilityMode::Strict => {
        self.push_dirty(&mut batch, entry, len);
        false
      }
      DurabilityMode::Balanced => {
        delta.data_crc32c = crc32c(written);
        if len <= self.policy.max_payload_in_wal {
          true
        } else {
          self.push_dirty(&mut batch, entry, len);
          false
        }
      }
      DurabilityMode::Eventual => {
        if len <= self.policy.max_payload_in_wal {
          delta.data_crc32c = crc32c(written);
          true
        } else {
          self.push_dirty(&mut batch, entry, len);
          false
        }
      }
    };

    batch.stage_write(PendingWrite {
      id,
      len: len as u32,
      delta,
      dst_vaddr,
      include_payload,
    });
    batch.pending_nodes.insert(
      id.handle_index(),
      StagedNode {
        ptr: dst_vaddr,
        len,
      },
    );
    Ok(())
  }

  fn supports_in_place_publish(&self) -> bool {
    true
  }

  fn read_node(&self, id: NodeId) -> Result<NodeBytes> {
    let (entry, uncommitted) = self.resolve_entry(id).ok_or(StoreError::NotFound)?;

    if uncommitted {
      let batch = self.batch.lock();
      return match batch.pending_nodes.get(&id.handle_index()) {
        Some(staged) => Ok(NodeBytes::Mapped {
          ptr: staged.ptr,
          len: staged.len,
        }),
        None => Err(StoreError::NotFound),
      };
    }

    let mut ptr = entry.vaddr();
    if ptr.is_null() {
      // Recovered entry: resolve the mapped pointer lazily.
      let alloc = entry.allocation();
      ptr = self
        .runtime
        .allocator()
        .get_ptr_for_recovery(
          entry.kind(),
          alloc.class_id,
          alloc.file_id,
          alloc.segment_id,
          alloc.offset,
          alloc.length,
        )
        .ok_or(StoreError::NotFound)?;
      entry.resolve_vaddr(ptr);
    }
    Ok(NodeBytes::Mapped {
      ptr,
      len: entry.length() as usize,
    })
  }

  fn read_node_pinned(&self, id: NodeId) -> Result<PinnedBytes> {
    let (entry, uncommitted) = self.resolve_entry(id).ok_or(StoreError::NotFound)?;

    if uncommitted {
      let batch = self.batch.lock();
      return match batch.pending_nodes.get(&id.handle_index()) {
        Some(staged) => Ok(PinnedBytes::from_raw(staged.ptr, staged.len)),
        None => Err(StoreError::NotFound),
      };
    }

    let pin = self
      .runtime
      .allocator()
      .pin(entry.kind(), &entry.allocation())?;
    Ok(PinnedBytes::from_pin(pin))
  }

  fn retire_node(&self, id: NodeId, _hint_epoch: Epoch, why: RetireReason) -> Result<()> {
    let ot = self.runtime.ot();
    let entry = ot.get(id).ok_or(StoreError::NotFound)?;
    if entry.tag() != id.tag() {
      return Err(StoreError::StaleTag);
    }

    let mut batch = self.batch.lock();
    if entry.birth_epoch() == 0 && !batch.will_publish(id) {
      debug_assert!(
        false,
        "retire of reserved NodeId {id} ({}) that this batch never publishes",
        why.as_str()
      );
      return Err(StoreError::ContractViolation(format!(
        "retire of reserved NodeId {id} that is not published in this batch"
      )));
    }

    let addr = entry.addr();
    batch.retirements.push(OtDeltaRec {
      handle_idx: id.handle_index(),
      tag: id.tag(),
      kind: entry.kind() as u8,
      class_id: entry.class_id(),
      flags: 0,
      file_id: addr.file_id,
      segment_id: addr.segment_id,
      offset: addr.offset,
      length: addr.length,
      data_crc32c: 0,
      // Preserve the original birth; the retire epoch is stamped at commit.
      birth_epoch: entry.birth_epoch(),
      retire_epoch: 0,
    });
    Ok(())
  }

  fn free_node_immediate(&self, id: NodeId, why: RetireReason) -> Result<()> {
    if !id.is_valid() {
      return Err(StoreError::ContractViolation(
        "free_node_immediate with invalid NodeId".to_string(),
      ));
    }

    let ot = self.runtime.ot();
    let entry = ot
      .try_get_by_handle(id.handle_index())
      .ok_or(StoreError::NotFound)?;
    if entry.tag() != id.tag() {
      debug_assert!(false, "free_node_immediate tag mismatch for {id}");
      return Err(StoreError::StaleTag);
    }

    let birth = entry.birth_epoch();
    let retire = entry.retire_epoch();
    let kind = entry.kind();
    let alloc = entry.allocation();

    if birth == 0 {
      // RESERVED path: cancel any staged write, abort the reservation,
      // then free the captured segment slot.
      if !why.allows_reserved_free() {
        return Err(StoreError::ContractViolation(format!(
          "immediate free of reserved {id} needs AbortRollback or Reallocation, got {}",
          why.as_str()
        )));
      }
      {
        let mut batch = self.batch.lock();
        batch.cancel_write_by_raw(id.raw());
        batch.pending_nodes.remove(&id.handle_index());
      }
      if !ot.abort_reservation(id) {
        return Err(StoreError::ContractViolation(format!(
          "abort_reservation failed for {id}"
        )));
      }
      self.runtime.allocator().free(kind, alloc);
      return Ok(());
    }

    if retire != EPOCH_LIVE {
      return Err(StoreError::ContractViolation(format!(
        "immediate free of already retired NodeId {id}"
      )));
    }
    if !why.allows_live_free() {
      return Err(StoreError::ContractViolation(format!(
        "immediate free of LIVE {id} requires an allowed reason, got {}",
        why.as_str()
      )));
    }

    // LIVE path: the slot goes back to the allocator now; the handle still
    // passes through quarantine before reuse.
    self.runtime.allocator().free(kind, alloc);
    ot.retire_detached(id, self.runtime.mvcc().global_epoch());
    Ok(())
  }

  fn get_root(&self, name: &str) -> NodeId {
    let key = self.root_key(name);
    // The writer sees its own staged root; everyone else sees the catalog.
    if let Some((id, _)) = self.batch.lock().pending_roots.get(key) {
      return *id;
    }
    self.runtime.get_root(key)
  }

  fn set_root(&self, id: NodeId, _epoch: Epoch, mbr: Option<&[f32]>, name: &str) -> Result<()> {
    let key = self.root_key(name).to_string();
    // Stage only: the runtime catalog is untouched until commit applies
    // the final (tag-confirmed) id, so an abort discards the update.
    self
      .batch
      .lock()
      .pending_roots
      .insert(key, (id, mbr.map(|m| m.to_vec())));
    Ok(())
  }

  fn commit(&self, _hint_epoch: Epoch) -> Result<()> {
    if self.runtime.is_read_only() {
      return Err(StoreError::ReadOnly);
    }

    let mut batch = self.batch.lock();
    if batch.is_empty() {
      return Ok(());
    }

    let epoch = self.runtime.mvcc().advance_epoch();
    let appended = self.commit_batch(&mut batch, epoch)?;
    batch.clear();
    drop(batch);

    self.runtime.coordinator().note_commit(appended);
    Ok(())
  }

  fn node_kind(&self, id: NodeId) -> Option<NodeKind> {
    let (entry, uncommitted) = self.resolve_entry(id)?;
    if uncommitted {
      return None;
    }
    Some(entry.kind())
  }

  fn is_node_present_staged(&self, id: NodeId) -> (bool, bool) {
    match self.resolve_entry(id) {
      Some((_, uncommitted)) => (true, uncommitted),
      None => (false, false),
    }
  }

  fn capacity(&self, id: NodeId) -> usize {
    self.mapped_capacity(id)
  }

  fn segment_utilization(&self) -> SegmentUtilization {
    self.runtime.allocator().utilization()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::runtime::RuntimeOptions;

  fn open_store(dir: &std::path::Path, policy: DurabilityPolicy) -> (Arc<StoreRuntime>, DurableStore) {
    let runtime = StoreRuntime::open(dir, RuntimeOptions::default()).expect("open runtime");
    let store = runtime.store("test", policy);
    (runtime, store)
  }

  #[test]
  fn test_allocate_publish_commit_read() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_runtime, store) = open_store(dir.path(), DurabilityPolicy::strict());

    let alloc = store.allocate_node(512, NodeKind::Leaf).expect("allocate");
    assert!(alloc.capacity >= 512);
    store.publish_node(alloc.id, b"hello node").expect("publish");
    store.commit(1).expect("commit");

    let bytes = store.read_node(alloc.id).expect("read");
    assert_eq!(&bytes.as_slice()[..10], b"hello node");
    assert_eq!(store.node_kind(alloc.id), Some(NodeKind::Leaf));
  }

  #[test]
  fn test_reader_cannot_see_uncommitted_node() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (runtime, store) = open_store(dir.path(), DurabilityPolicy::balanced());

    let alloc = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(alloc.id, b"staged").expect("publish");

    // The writer sees its own staged bytes.
    let staged = store.read_node(alloc.id).expect("read staged");
    assert_eq!(&staged.as_slice()[..6], b"staged");
    assert_eq!(store.is_node_present_staged(alloc.id), (true, true));

    // A second store over the same runtime has no batch staging for it.
    let other = runtime.store("other", DurabilityPolicy::balanced());
    assert!(matches!(
      other.read_node(alloc.id),
      Err(StoreError::NotFound)
    ));

    store.commit(1).expect("commit");
    assert_eq!(store.is_node_present_staged(alloc.id), (true, false));
    assert_eq!(&other.read_node(alloc.id).expect("read").as_slice()[..6], b"staged");
  }

  #[test]
  fn test_publish_overflow_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_runtime, store) = open_store(dir.path(), DurabilityPolicy::strict());

    let alloc = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    let oversize = vec![7u8; alloc.capacity + 1];
    assert!(matches!(
      store.publish_node(alloc.id, &oversize),
      Err(StoreError::BufferOverflow { .. })
    ));
  }

  #[test]
  fn test_duplicate_publish_coalesces() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_runtime, store) = open_store(dir.path(), DurabilityPolicy::balanced());

    let alloc = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(alloc.id, b"first").expect("publish");
    store.publish_node(alloc.id, b"second").expect("publish");
    assert_eq!(store.batch.lock().writes.len(), 1);

    store.commit(1).expect("commit");
    let bytes = store.read_node(alloc.id).expect("read");
    assert_eq!(&bytes.as_slice()[..6], b"second");
  }

  #[test]
  fn test_in_place_publish() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_runtime, store) = open_store(dir.path(), DurabilityPolicy::balanced());
    assert!(store.supports_in_place_publish());

    let alloc = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    let ptr = store.mapped_ptr(alloc.id).expect("mapped ptr");
    unsafe { std::ptr::copy_nonoverlapping(b"in place".as_ptr(), ptr, 8) };
    store.publish_node_in_place(alloc.id, 8).expect("publish");
    store.commit(1).expect("commit");

    let bytes = store.read_node(alloc.id).expect("read");
    assert_eq!(&bytes.as_slice()[..8], b"in place");
  }

  #[test]
  fn test_free_immediate_cancels_reservation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_runtime, store) = open_store(dir.path(), DurabilityPolicy::balanced());

    let alloc = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(alloc.id, b"doomed").expect("publish");
    store
      .free_node_immediate(alloc.id, RetireReason::AbortRollback)
      .expect("free");

    // Nothing left to commit; the id never becomes visible.
    store.commit(1).expect("commit");
    assert!(matches!(
      store.read_node(alloc.id),
      Err(StoreError::NotFound)
    ));

    // The handle is reusable with the same tag (bump was rewound).
    let again = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    assert_eq!(again.id, alloc.id);
  }

  #[test]
  fn test_free_immediate_live_requires_reason() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_runtime, store) = open_store(dir.path(), DurabilityPolicy::strict());

    let alloc = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(alloc.id, b"live").expect("publish");
    store.commit(1).expect("commit");

    assert!(matches!(
      store.free_node_immediate(alloc.id, RetireReason::MergeDelete),
      Err(StoreError::ContractViolation(_))
    ));
    store
      .free_node_immediate(alloc.id, RetireReason::Evict)
      .expect("free live");
    assert!(matches!(
      store.read_node(alloc.id),
      Err(StoreError::NotFound)
    ));
  }

  #[test]
  fn test_retire_hides_node_from_new_epochs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_runtime, store) = open_store(dir.path(), DurabilityPolicy::strict());

    let alloc = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(alloc.id, b"short lived").expect("publish");
    store.commit(1).expect("commit");

    store
      .retire_node(alloc.id, 0, RetireReason::MergeDelete)
      .expect("retire");
    store.commit(2).expect("commit");

    assert!(matches!(
      store.read_node(alloc.id),
      Err(StoreError::NotFound)
    ));
  }

  #[test]
  fn test_retire_reserved_without_publish_is_contract_violation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_runtime, store) = open_store(dir.path(), DurabilityPolicy::balanced());

    let alloc = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      store.retire_node(alloc.id, 0, RetireReason::MergeDelete)
    }));
    // Debug builds assert; release builds surface the typed error.
    match result {
      Ok(inner) => assert!(matches!(inner, Err(StoreError::ContractViolation(_)))),
      Err(_) => {}
    }
  }

  #[test]
  fn test_abort_discards_batch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (runtime, store) = open_store(dir.path(), DurabilityPolicy::balanced());

    let alloc = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(alloc.id, b"rollback me").expect("publish");
    store.set_root(alloc.id, 1, None, "").expect("set root");
    // Before the abort the writer sees its own staged root.
    assert_eq!(store.get_root(""), alloc.id);

    store.abort();

    store.commit(1).expect("commit");
    assert!(matches!(
      store.read_node(alloc.id),
      Err(StoreError::NotFound)
    ));
    // The cancelled root never reached the catalog, let alone the
    // manifest: nothing dangles and nothing is left to persist.
    assert_eq!(store.get_root(""), NodeId::INVALID);
    assert_eq!(runtime.get_root("test"), NodeId::INVALID);
    assert!(!runtime.is_catalog_dirty());
  }

  #[test]
  fn test_staged_root_invisible_to_other_writers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (runtime, store) = open_store(dir.path(), DurabilityPolicy::balanced());

    let alloc = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
    store.publish_node(alloc.id, b"root to be").expect("publish");
    store.set_root(alloc.id, 1, None, "").expect("set root");

    // Deferred: the shared catalog learns about the root at commit, not
    // at set_root time.
    assert_eq!(runtime.get_root("test"), NodeId::INVALID);
    store.commit(1).expect("commit");
    assert_eq!(runtime.get_root("test"), alloc.id);
    assert_eq!(store.get_root(""), alloc.id);
  }

  #[test]
  fn test_read_only_runtime_refuses_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
      let (runtime, store) = open_store(dir.path(), DurabilityPolicy::strict());
      let alloc = store.allocate_node(256, NodeKind::Leaf).expect("allocate");
      store.publish_node(alloc.id, b"persisted").expect("publish");
      store.set_root(alloc.id, 1, None, "").expect("set root");
      store.commit(1).expect("commit");
      runtime.shutdown().expect("shutdown");
    }

    let runtime =
      StoreRuntime::open(dir.path(), RuntimeOptions::default().read_only(true)).expect("open ro");
    let store = runtime.store("test", DurabilityPolicy::strict());
    assert!(matches!(
      store.allocate_node(256, NodeKind::Leaf),
      Err(StoreError::ReadOnly)
    ));
    assert!(matches!(store.commit(1), Err(StoreError::ReadOnly)));
  }
}
