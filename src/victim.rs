//! Metadata-only cache of recently-evicted objects.
//!
//! When the evacuator drops an object it may record the object's identity
//! here and repoint the owning soft pointer at the entry. A later resolution
//! then reports a *victim* fault instead of a plain miss, which is what
//! separates "never cached" from "recently reclaimed" in the pool's
//! accounting. No payload bytes are ever held.
//!
//! Eviction is strict FIFO once either the entry-count or byte bound is
//! exceeded; evicting an entry nulls the soft-pointer slot it was keeping
//! warm.

use crate::object::SlotWord;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metadata remembered for one evicted object.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VictimEntry {
    /// Address of the owning soft-pointer slot.
    slot_addr: u64,
    /// Log footprint the object used to occupy.
    pub size: u32,
}

struct VictimInner {
    entries: HashMap<u32, VictimEntry>,
    fifo: VecDeque<u32>,
    bytes: u64,
    next_id: u32,
}

/// Bounded FIFO victim cache.
pub struct VictimCache {
    inner: Mutex<VictimInner>,
    count_limit: usize,
    size_limit: u64,
}

impl VictimCache {
    /// Create a cache bounded by entry count and total remembered bytes.
    pub fn new(count_limit: usize, size_limit: u64) -> Self {
        Self {
            inner: Mutex::new(VictimInner {
                entries: HashMap::new(),
                fifo: VecDeque::new(),
                bytes: 0,
                next_id: 1,
            }),
            count_limit,
            size_limit,
        }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes represented by the held entries.
    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    /// Record an evicted object and return the entry id to store in its
    /// slot. Overflow evicts the oldest entries first, nulling their slots.
    ///
    /// # Safety contract
    ///
    /// `slot_addr` must stay valid until the entry is removed; the pool's
    /// deferred slot retirement guarantees this for every slot that ever
    /// reaches the victim cache.
    pub(crate) fn insert(&self, slot_addr: u64, size: u32) -> u32 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        // Id 0 is never issued; a victim word must not be mistaken for null.
        inner.next_id = inner.next_id.wrapping_add(1).max(1);
        inner.entries.insert(id, VictimEntry { slot_addr, size });
        inner.fifo.push_back(id);
        inner.bytes += size as u64;
        while inner.entries.len() > self.count_limit || inner.bytes > self.size_limit {
            let Some(old) = inner.fifo.pop_front() else {
                break;
            };
            if let Some(entry) = inner.entries.remove(&old) {
                inner.bytes -= entry.size as u64;
                expire_slot(entry.slot_addr, old);
            }
        }
        id
    }

    /// Drop an entry (the owning pointer was freed or re-resolved). Returns
    /// the entry if it was still present.
    pub(crate) fn remove(&self, id: u32) -> Option<VictimEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(&id)?;
        inner.bytes -= entry.size as u64;
        // The id stays in the FIFO; pop_front skips ids no longer in the
        // map.
        Some(entry)
    }

    /// Whether an entry id is still tracked.
    pub(crate) fn contains(&self, id: u32) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }
}

/// CAS a slot from "victim entry id" back to null. A failure means the
/// application freed or rebound the pointer first, which already detached it
/// from this entry.
fn expire_slot(slot_addr: u64, id: u32) {
    // SAFETY: the insert contract keeps slot_addr mapped while the entry
    // lives; we only touch it through an atomic CAS.
    let slot = unsafe { &*(slot_addr as *const AtomicU64) };
    let _ = slot.compare_exchange(
        SlotWord::victim_word(id),
        0,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::SoftPtr;

    #[test]
    fn test_insert_and_remove() {
        let cache = VictimCache::new(16, 1 << 20);
        let ptr = SoftPtr::null();
        let id = cache.insert(ptr.slot_addr(), 128);
        assert!(cache.contains(id));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.bytes(), 128);

        let entry = cache.remove(id).unwrap();
        assert_eq!(entry.size, 128);
        assert!(!cache.contains(id));
        assert!(cache.is_empty());
        assert!(cache.remove(id).is_none());
    }

    #[test]
    fn test_fifo_eviction_by_count() {
        let cache = VictimCache::new(2, 1 << 20);
        let ptrs: Vec<SoftPtr> = (0..3).map(|_| SoftPtr::null()).collect();
        let ids: Vec<u32> = ptrs
            .iter()
            .map(|p| {
                let id = cache.insert(p.slot_addr(), 64);
                p.raw().store(SlotWord::victim_word(id), Ordering::Release);
                id
            })
            .collect();

        // Third insert evicted the first entry and nulled its slot.
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(ids[0]));
        assert!(ptrs[0].is_null());
        assert!(ptrs[1].is_victim());
        assert!(ptrs[2].is_victim());
    }

    #[test]
    fn test_fifo_eviction_by_bytes() {
        let cache = VictimCache::new(100, 256);
        let a = SoftPtr::null();
        let b = SoftPtr::null();
        let ida = cache.insert(a.slot_addr(), 200);
        a.raw().store(SlotWord::victim_word(ida), Ordering::Release);
        let idb = cache.insert(b.slot_addr(), 200);

        assert!(!cache.contains(ida));
        assert!(cache.contains(idb));
        assert!(a.is_null());
        assert_eq!(cache.bytes(), 200);
    }

    #[test]
    fn test_eviction_skips_removed_ids() {
        let cache = VictimCache::new(2, 1 << 20);
        let ptrs: Vec<SoftPtr> = (0..3).map(|_| SoftPtr::null()).collect();
        let id0 = cache.insert(ptrs[0].slot_addr(), 8);
        cache.remove(id0);
        // Two more inserts fit without evicting the live ones.
        let id1 = cache.insert(ptrs[1].slot_addr(), 8);
        let id2 = cache.insert(ptrs[2].slot_addr(), 8);
        assert!(cache.contains(id1));
        assert!(cache.contains(id2));
    }
}
