use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::counters::CounterBlock;
use crate::error::{CbdError, Result};
use crate::format::ByteOrder;
use crate::store::BlockStore;

#[derive(Default)]
struct Slot {
    counters: CounterBlock,
    loaded: bool,
    dirty: bool,
}

/// Exclusive view of one resident counter block, handed out by
/// [`CounterCache::with_segment`] while the segment lock is held.
pub struct SegmentEntry<'a> {
    segment: u64,
    slot: &'a mut Slot,
    store: &'a dyn BlockStore,
    byte_order: ByteOrder,
}

impl SegmentEntry<'_> {
    pub fn segment(&self) -> u64 {
        self.segment
    }

    pub fn counters(&self) -> &CounterBlock {
        &self.slot.counters
    }

    /// Mutable counters. Call [`mark_dirty`](Self::mark_dirty) after changing
    /// them or the change never reaches the store.
    pub fn counters_mut(&mut self) -> &mut CounterBlock {
        &mut self.slot.counters
    }

    pub fn mark_dirty(&mut self) {
        self.slot.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.slot.dirty
    }

    /// Write the block back if dirty. Returns whether a write was issued.
    ///
    /// On failure the unpersisted counters are discarded and the next access
    /// re-reads the block from the store, so an increment that never reached
    /// the store cannot be written back later by another caller.
    pub fn flush(&mut self) -> Result<bool> {
        if !self.slot.dirty {
            return Ok(false);
        }
        if let Err(e) = self
            .slot
            .counters
            .write_to(self.store, self.byte_order, self.segment)
        {
            *self.slot = Slot::default();
            tracing::debug!(segment = self.segment, "discarded counter block after failed flush");
            return Err(e);
        }
        self.slot.dirty = false;
        tracing::debug!(segment = self.segment, "flushed counter block");
        Ok(true)
    }
}

/// Resident counter blocks keyed by segment id.
///
/// Each segment has its own mutex: writers to different segments never
/// contend, writers to the same segment serialize their
/// read-increment-write. The segment map itself is only locked briefly to
/// look up or insert a slot, never across store I/O.
///
/// Once more than `capacity` segments are resident, clean and unreferenced
/// ones are dropped least-recently-used first. Dirty blocks are never
/// dropped implicitly.
pub struct CounterCache {
    store: Arc<dyn BlockStore>,
    byte_order: ByteOrder,
    capacity: usize,
    slots: Mutex<LruCache<u64, Arc<Mutex<Slot>>>>,
}

impl CounterCache {
    pub fn new(store: Arc<dyn BlockStore>, byte_order: ByteOrder, capacity: usize) -> Self {
        Self {
            store,
            byte_order,
            capacity: capacity.max(1),
            slots: Mutex::new(LruCache::unbounded()),
        }
    }

    fn slot(&self, segment: u64) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(&segment) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(Mutex::new(Slot::default()));
        slots.put(segment, Arc::clone(&slot));
        slot
    }

    /// Lock `segment`, reading its counter block from the store on first
    /// touch, and run `f` against it. The segment stays locked for the
    /// duration of `f`.
    pub fn with_segment<T>(
        &self,
        segment: u64,
        f: impl FnOnce(&mut SegmentEntry<'_>) -> Result<T>,
    ) -> Result<T> {
        let result = {
            let slot = self.slot(segment);
            let mut guard = slot.lock();
            if !guard.loaded {
                guard.counters = CounterBlock::read_from(&*self.store, self.byte_order, segment)?;
                guard.loaded = true;
            }
            let mut entry = SegmentEntry {
                segment,
                slot: &mut *guard,
                store: &*self.store,
                byte_order: self.byte_order,
            };
            f(&mut entry)
        };
        self.trim();
        result
    }

    /// Write `segment` back if it is resident and dirty.
    pub fn flush(&self, segment: u64) -> Result<bool> {
        let slot = {
            let mut slots = self.slots.lock();
            match slots.get(&segment) {
                Some(slot) => Arc::clone(slot),
                None => return Ok(false),
            }
        };
        let mut guard = slot.lock();
        if !guard.loaded {
            return Ok(false);
        }
        SegmentEntry {
            segment,
            slot: &mut *guard,
            store: &*self.store,
            byte_order: self.byte_order,
        }
        .flush()
    }

    /// Flush every dirty resident block. Returns how many were written.
    pub fn flush_all(&self) -> Result<usize> {
        let segments: Vec<u64> = self.slots.lock().iter().map(|(&segment, _)| segment).collect();
        let mut written = 0;
        for segment in segments {
            if self.flush(segment)? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Drop `segment` from the cache.
    ///
    /// Fails with [`CbdError::EvictDirty`] if the block holds unpersisted
    /// increments; flush first. Returns `false` when the segment was not
    /// resident or is currently locked by another caller.
    pub fn evict(&self, segment: u64) -> Result<bool> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.peek(&segment) else {
            return Ok(false);
        };
        if Arc::strong_count(slot) > 1 {
            return Ok(false);
        }
        if slot.lock().dirty {
            return Err(CbdError::EvictDirty { segment });
        }
        slots.pop(&segment);
        Ok(true)
    }

    /// Forget every resident block, dirty or not. Only for the consistency
    /// pass, which re-reads all counters from the store afterwards.
    pub fn invalidate_all(&self) -> usize {
        let mut slots = self.slots.lock();
        let dropped = slots.len();
        slots.clear();
        dropped
    }

    /// Whether `segment` is resident and dirty.
    pub fn is_dirty(&self, segment: u64) -> bool {
        let slot = match self.slots.lock().peek(&segment) {
            Some(slot) => Arc::clone(slot),
            None => return false,
        };
        let dirty = slot.lock().dirty;
        dirty
    }

    pub fn resident(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn trim(&self) {
        let mut slots = self.slots.lock();
        let excess = slots.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        // A slot is only cloned out under the map lock, so a strong count of
        // one means nobody else can be holding or about to take its mutex.
        let victims: Vec<u64> = slots
            .iter()
            .rev()
            .filter(|(_, slot)| Arc::strong_count(*slot) == 1 && !slot.lock().dirty)
            .map(|(&segment, _)| segment)
            .take(excess)
            .collect();
        for segment in &victims {
            slots.pop(segment);
        }
        tracing::debug!(evicted = victims.len(), resident = slots.len(), "trimmed counter cache");
    }
}
