//! Background evacuation: aging, eviction, compaction, region return.
//!
//! One evacuator thread runs per pool. Each sweep walks the pool's chunks in
//! region order and classifies every object:
//!
//! - dead or tombstoned: skip
//! - live and accessed: clear the accessed bit, keep
//! - live and idle: evict — claim the owner slot, remember the identity in
//!   the victim cache, kill the object
//! - large-object fragments: follow the head's decision along `next`
//!
//! Idle objects are only evicted when the pool is under pressure (live bytes
//! over the limit, or a coordinator reclaim request); an unpressured sweep
//! just ages. Chunks whose objects are all dead become garbage, and a sealed
//! region whose chunks are all garbage is handed back to the coordinator.
//!
//! Eviction and relocation never race readers: the owner slot is CASed
//! first, and a header is invalidated only by whoever won that CAS. Readers
//! catch the transition through the double-check protocol.

use crate::log::{LogAllocator, LogChunk, LogSegment};
use crate::object::{ObjectHdr, ObjectRef, SlotWord};
use crate::victim::VictimCache;
use crossbeam_deque::Injector;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Fraction of a chunk that must be dead before survivors are relocated.
const COMPACT_DEAD_RATIO: f64 = 0.5;

/// How a sweep treats idle objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepMode {
    /// Clear accessed bits only.
    Age,
    /// Evict idle objects and compact sparse chunks.
    Evict,
    /// Evict everything evictable until the byte target is met.
    Force,
}

/// One pending coordinator (or operator) reclaim demand.
struct ReclaimRequest {
    bytes: u64,
    done: Arc<ReclaimDone>,
}

struct ReclaimDone {
    result: Mutex<Option<bool>>,
    cv: Condvar,
}

impl ReclaimDone {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    fn finish(&self, ok: bool) {
        let mut slot = self.result.lock();
        *slot = Some(ok);
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.result.lock();
        while slot.is_none() {
            if self.cv.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.unwrap_or(false)
    }
}

struct EvacShared {
    alloc: Arc<LogAllocator>,
    victims: Arc<VictimCache>,
    limit: Arc<AtomicU64>,
    pending: Injector<ReclaimRequest>,
    /// Soft-pointer slots freed by the application, dropped only by the
    /// worker between sweeps so an in-flight slot CAS never touches freed
    /// memory.
    retired: Injector<Box<AtomicU64>>,
    shutdown: AtomicBool,
    wake_lock: Mutex<()>,
    wake_cv: Condvar,
}

impl EvacShared {
    fn wake(&self) {
        let _guard = self.wake_lock.lock();
        self.wake_cv.notify_one();
    }

    fn force_reclaim(&self, bytes: u64, timeout: Duration) -> bool {
        let done = ReclaimDone::new();
        self.pending.push(ReclaimRequest {
            bytes,
            done: Arc::clone(&done),
        });
        self.wake();
        done.wait(timeout)
    }

    fn drain_retired(&self) {
        loop {
            match self.retired.steal() {
                crossbeam_deque::Steal::Success(slot) => drop(slot),
                crossbeam_deque::Steal::Retry => continue,
                crossbeam_deque::Steal::Empty => break,
            }
        }
    }
}

/// Cloneable, non-owning reference to a pool's evacuator, for callbacks
/// installed into the resource client (a strong reference there would cycle
/// client -> handlers -> evacuator -> allocator -> client).
#[derive(Clone)]
pub(crate) struct EvacHandle {
    shared: std::sync::Weak<EvacShared>,
}

impl EvacHandle {
    pub fn wake(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.wake();
        }
    }

    pub fn force_reclaim(&self, bytes: u64, timeout: Duration) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.force_reclaim(bytes, timeout),
            None => false,
        }
    }
}

/// Handle to a pool's background evacuator thread.
pub(crate) struct Evacuator {
    shared: Arc<EvacShared>,
    handle: Option<JoinHandle<()>>,
}

impl Evacuator {
    /// Spawn the evacuator for a pool. `limit` is shared with the pool; the
    /// worker re-reads it every sweep.
    pub fn spawn(
        name: &str,
        alloc: Arc<LogAllocator>,
        victims: Arc<VictimCache>,
        limit: Arc<AtomicU64>,
        interval: Duration,
    ) -> Self {
        let shared = Arc::new(EvacShared {
            alloc,
            victims,
            limit,
            pending: Injector::new(),
            retired: Injector::new(),
            shutdown: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake_cv: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("softcache-evac-{name}"))
            .spawn(move || run(worker, interval))
            .expect("failed to spawn evacuator");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> EvacHandle {
        EvacHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Nudge the worker (allocation failure, limit change).
    pub fn wake(&self) {
        self.shared.wake();
    }

    /// Hand a freed soft-pointer slot to the worker for deferred drop.
    pub fn retire_slot(&self, slot: Box<AtomicU64>) {
        self.shared.retired.push(slot);
    }

    /// Demand that `bytes` of region memory be surrendered; blocks until the
    /// worker reports or `timeout` elapses.
    pub fn force_reclaim(&self, bytes: u64, timeout: Duration) -> bool {
        self.shared.force_reclaim(bytes, timeout)
    }
}

impl Drop for Evacuator {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        // The worker is gone; no slot CAS can be in flight anymore.
        self.shared.drain_retired();
    }
}

fn run(shared: Arc<EvacShared>, interval: Duration) {
    let mut last_accesses = 0i64;
    loop {
        {
            let mut guard = shared.wake_lock.lock();
            shared
                .wake_cv
                .wait_for(&mut guard, interval);
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        // Between sweeps no slot CAS is in flight; retired slots can go.
        shared.drain_retired();

        // Coordinator demands first; they escalate the sweep.
        let mut demands = Vec::new();
        loop {
            match shared.pending.steal() {
                crossbeam_deque::Steal::Success(req) => demands.push(req),
                crossbeam_deque::Steal::Retry => continue,
                crossbeam_deque::Steal::Empty => break,
            }
        }
        if !demands.is_empty() {
            let target: u64 = demands.iter().map(|d| d.bytes).sum();
            let freed = force_reclaim_pass(&shared, target);
            let ok = freed >= target || shared.alloc.region_count() == 0;
            tracing::info!(target, freed, ok, "forced reclamation pass");
            for demand in demands {
                demand.done.finish(ok || freed >= demand.bytes);
            }
            continue;
        }

        let alive = shared.alloc.total_alive();
        let limit = shared.limit.load(Ordering::Relaxed);
        let accesses = shared.alloc.total_accesses();
        let mode = if alive > limit {
            SweepMode::Evict
        } else if accesses != last_accesses || has_drainable(&shared) {
            SweepMode::Age
        } else {
            // Nothing moved since the last sweep; nothing to age.
            continue;
        };
        last_accesses = accesses;
        sweep(&shared, mode, u64::MAX);
        release_empty_regions(&shared);
    }
}

/// A sealed segment with no live bytes wants a confirming sweep so its
/// chunks can be marked garbage and the region handed back.
fn has_drainable(shared: &EvacShared) -> bool {
    shared
        .alloc
        .segments_snapshot()
        .iter()
        .any(|seg| seg.is_sealed() && seg.alive_bytes() <= 0)
}

/// Escalated pass servicing a `ForceReclaim`: seal open tails so idle
/// regions can drain, then evict until `target` region bytes came back.
fn force_reclaim_pass(shared: &EvacShared, target: u64) -> u64 {
    let deadline = Instant::now() + Duration::from_secs(2);
    shared.alloc.seal_all();
    let mut freed = 0u64;
    while freed < target && Instant::now() < deadline {
        sweep(shared, SweepMode::Force, target);
        freed += release_empty_regions(shared);
        if shared.alloc.region_count() == 0 {
            break;
        }
    }
    freed
}

/// One pass over every chunk of every region.
fn sweep(shared: &EvacShared, mode: SweepMode, evict_budget: u64) {
    let mut evicted = 0u64;
    for seg in shared.alloc.segments_snapshot() {
        for chunk in seg.chunks_snapshot() {
            if chunk.is_garbage() {
                continue;
            }
            let stats = scan_chunk(shared, &chunk, mode, &mut evicted);
            if chunk.is_sealed() && stats.complete && stats.live == 0 {
                chunk.mark_garbage();
            } else if mode != SweepMode::Age
                && chunk.is_sealed()
                && stats.complete
                && stats.live_bytes > 0
                && (stats.dead_bytes as f64)
                    >= (stats.live_bytes + stats.dead_bytes) as f64 * COMPACT_DEAD_RATIO
            {
                compact_chunk(shared, &seg, &chunk);
            }
            if evicted >= evict_budget {
                return;
            }
        }
    }
}

#[derive(Default)]
struct ChunkScan {
    /// Live objects remaining after the scan.
    live: u64,
    live_bytes: u64,
    dead_bytes: u64,
    /// The walk covered the whole used range (no in-flight header stopped
    /// it).
    complete: bool,
}

fn scan_chunk(
    shared: &EvacShared,
    chunk: &Arc<LogChunk>,
    mode: SweepMode,
    evicted: &mut u64,
) -> ChunkScan {
    let mut stats = ChunkScan::default();
    let mut walked = 0u64;
    shared.alloc.for_each_object(chunk, |obj, hdr, loc| {
        walked += hdr.footprint() as u64;
        if !hdr.is_present() {
            stats.dead_bytes += hdr.footprint() as u64;
            return true;
        }
        // Fragments live and die with their head.
        if !hdr.is_small() && !hdr.is_head() {
            stats.live += 1;
            stats.live_bytes += hdr.footprint() as u64;
            return true;
        }
        if hdr.is_accessed() {
            obj.clear_accessed();
            stats.live += 1;
            stats.live_bytes += hdr.footprint() as u64;
            return true;
        }
        match mode {
            SweepMode::Age => {
                stats.live += 1;
                stats.live_bytes += hdr.footprint() as u64;
            }
            SweepMode::Evict | SweepMode::Force => {
                if evict_object(shared, obj, hdr, loc.pack()) {
                    *evicted += hdr.footprint() as u64;
                    stats.dead_bytes += hdr.footprint() as u64;
                } else {
                    stats.live += 1;
                    stats.live_bytes += hdr.footprint() as u64;
                }
            }
        }
        true
    });
    stats.complete = walked >= chunk.used() as u64;
    stats
}

/// Evict one object (head of chain for large objects).
///
/// The victim entry is prepared first so the slot can be repointed in a
/// single CAS from "location" to "victim". Losing the CAS means the
/// application freed the pointer concurrently; the prepared entry is
/// withdrawn and the object left to that free.
fn evict_object(shared: &EvacShared, obj: ObjectRef, hdr: ObjectHdr, packed_loc: u64) -> bool {
    let rref = obj.rref().load(Ordering::Acquire);
    if rref == 0 {
        // Unowned (failed large alloc, or already mid-free): just make sure
        // it is dead.
        if let Some(dead) = obj.kill() {
            if let Some(seg) = owner_segment(shared, obj) {
                shared.alloc.account_dead(&seg, dead.footprint());
            }
        }
        return true;
    }
    let vid = shared.victims.insert(rref, hdr.footprint() as u32);
    // SAFETY: rref points at a soft-pointer slot; slots outlive their
    // objects via the pool's deferred retirement.
    let slot = unsafe { &*(rref as *const std::sync::atomic::AtomicU64) };
    if slot
        .compare_exchange(
            packed_loc,
            SlotWord::victim_word(vid),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        shared.victims.remove(vid);
        return false;
    }
    // We own the object now; kill the whole chain.
    match SlotWord::classify(packed_loc) {
        SlotWord::Loc(loc) => {
            shared.alloc.kill_chain(loc);
        }
        _ => unreachable!("evict_object is only called with a location word"),
    }
    true
}

fn owner_segment(shared: &EvacShared, obj: ObjectRef) -> Option<Arc<LogSegment>> {
    shared
        .alloc
        .segments_snapshot()
        .into_iter()
        .find(|seg| seg.contains(obj.addr()))
}

/// Relocate the survivors of a mostly-dead chunk, then retire the chunk.
///
/// Move protocol per object: copy the payload to a fresh allocation, CAS the
/// owner slot from the old location to the new one, then invalidate the
/// source header. A reader that raced the move faults on its double-check
/// and re-resolves the slot to the new location.
fn compact_chunk(shared: &EvacShared, seg: &Arc<LogSegment>, chunk: &Arc<LogChunk>) {
    let mut moved = 0u32;
    let mut stayed = 0u32;
    shared.alloc.for_each_object(chunk, |obj, hdr, loc| {
        if !hdr.is_present() {
            return true;
        }
        // Large objects are not relocated; their chunks drain by eviction.
        if !hdr.is_small() {
            stayed += 1;
            return true;
        }
        let rref = obj.rref().load(Ordering::Acquire);
        if rref == 0 {
            stayed += 1;
            return true;
        }
        let Some((new_obj, new_loc, new_seg)) =
            shared.alloc.alloc_small_raw(hdr.size_units, true)
        else {
            stayed += 1;
            return false; // out of space; retry next sweep
        };
        // Copy payload while the source is still live.
        // SAFETY: both objects are pinned (source by `seg`, destination by
        // `new_seg`) and sized for `payload_size` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                obj.payload_addr(true) as *const u8,
                new_obj.payload_addr(true) as *mut u8,
                hdr.payload_size(),
            );
        }
        new_obj.init_small(hdr.size_units, rref);
        // SAFETY: as in evict_object.
        let slot = unsafe { &*(rref as *const std::sync::atomic::AtomicU64) };
        if slot
            .compare_exchange(
                loc.pack(),
                new_loc.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            if obj.kill().is_some() {
                shared.alloc.account_dead(seg, hdr.footprint());
            }
            moved += 1;
        } else {
            // Owner freed (or another mover won); withdraw the copy.
            if new_obj.kill().is_some() {
                shared.alloc.account_dead(&new_seg, hdr.footprint());
            }
            stayed += 1;
        }
        true
    });
    if stayed == 0 && moved > 0 {
        // Scan barrier for the drained chunk: its first slot becomes the
        // tombstone sentinel, then the chunk is retired outright.
        // SAFETY: every object here is dead and the segment Arc pins the
        // mapping.
        let first = unsafe { ObjectRef::new(chunk.base()) };
        first.tombstone();
        chunk.mark_garbage();
    }
    tracing::debug!(
        region = seg.region_id(),
        moved,
        stayed,
        "chunk compaction"
    );
}

/// Return every sealed region whose chunks are all garbage. Returns the
/// number of bytes handed back.
fn release_empty_regions(shared: &EvacShared) -> u64 {
    let mut freed = 0u64;
    for seg in shared.alloc.segments_snapshot() {
        if !seg.is_sealed() || seg.alive_bytes() > 0 {
            continue;
        }
        let chunks = seg.chunks_snapshot();
        if chunks.is_empty() || chunks.iter().any(|c| !c.is_garbage()) {
            continue;
        }
        freed += seg.size() as u64;
        shared.alloc.destroy_segment(&seg);
    }
    freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{FreeOutcome, ReadResult};
    use crate::region::LocalClient;

    const CHUNK: usize = 64 * 1024;
    const REGION: usize = 128 * 1024;

    struct Fixture {
        shared: Arc<EvacShared>,
    }

    /// Build the shared state without the background thread, so tests drive
    /// sweeps deterministically.
    fn fixture(limit: u64) -> Fixture {
        let alloc = LogAllocator::new(LocalClient::new(u64::MAX), REGION, CHUNK);
        Fixture {
            shared: Arc::new(EvacShared {
                alloc,
                victims: Arc::new(VictimCache::new(1024, 1 << 20)),
                limit: Arc::new(AtomicU64::new(limit)),
                pending: Injector::new(),
                retired: Injector::new(),
                shutdown: AtomicBool::new(false),
                wake_lock: Mutex::new(()),
                wake_cv: Condvar::new(),
            }),
        }
    }

    #[test]
    fn test_age_sweep_clears_accessed_but_keeps() {
        let f = fixture(u64::MAX);
        let ptr = f.shared.alloc.alloc(64).unwrap();
        sweep(&f.shared, SweepMode::Age, u64::MAX);
        // Still readable: aging never evicts.
        assert!(matches!(f.shared.alloc.read(&ptr), ReadResult::Hit(_)));
        f.shared.alloc.release(&ptr);
    }

    #[test]
    fn test_evict_sweep_takes_idle_objects() {
        let f = fixture(0);
        let hot = f.shared.alloc.alloc(64).unwrap();
        let cold = f.shared.alloc.alloc(64).unwrap();

        // First sweep clears both accessed bits (eviction requires an idle
        // object, and fresh objects start accessed).
        sweep(&f.shared, SweepMode::Evict, u64::MAX);
        // Keep one object hot.
        assert!(matches!(f.shared.alloc.read(&hot), ReadResult::Hit(_)));

        sweep(&f.shared, SweepMode::Evict, u64::MAX);
        assert!(matches!(f.shared.alloc.read(&hot), ReadResult::Hit(_)));
        match f.shared.alloc.read(&cold) {
            ReadResult::VictimFault(id) => assert!(f.shared.victims.contains(id)),
            other => panic!("expected victim fault, got {other:?}"),
        }

        // Freeing the evicted pointer withdraws the victim entry.
        match f.shared.alloc.release(&cold) {
            FreeOutcome::Victim(id) => {
                f.shared.victims.remove(id);
            }
            other => panic!("expected victim outcome, got {other:?}"),
        }
        f.shared.alloc.release(&hot);
    }

    #[test]
    fn test_idle_region_returned_after_evictions() {
        let f = fixture(0);
        let ptrs: Vec<_> = (0..8)
            .map(|_| f.shared.alloc.alloc(1008).unwrap())
            .collect();
        assert_eq!(f.shared.alloc.region_count(), 1);

        f.shared.alloc.seal_all();
        sweep(&f.shared, SweepMode::Force, u64::MAX); // clears accessed
        sweep(&f.shared, SweepMode::Force, u64::MAX); // evicts
        let freed = release_empty_regions(&f.shared);
        assert_eq!(freed, REGION as u64);
        assert_eq!(f.shared.alloc.region_count(), 0);

        for ptr in &ptrs {
            assert!(matches!(
                f.shared.alloc.read(ptr),
                ReadResult::VictimFault(_)
            ));
        }
        for ptr in ptrs {
            f.shared.alloc.release(&ptr);
        }
    }

    #[test]
    fn test_compaction_moves_survivors() {
        let f = fixture(u64::MAX);
        // Fill one chunk with objects, free most of them, keep a few hot.
        let ptrs: Vec<_> = (0..32)
            .map(|_| f.shared.alloc.alloc(1008).unwrap())
            .collect();
        for ptr in &ptrs[..28] {
            assert!(matches!(f.shared.alloc.release(ptr), FreeOutcome::Freed(_)));
        }

        let seg = f.shared.alloc.segments_snapshot().pop().unwrap();
        let chunk = seg.chunks_snapshot().remove(0);
        chunk.seal();

        let payloads: Vec<Vec<u8>> = ptrs[28..]
            .iter()
            .enumerate()
            .map(|(i, ptr)| {
                let data = vec![i as u8 + 1; 1008];
                assert!(f.shared.alloc.write_at(ptr, 0, &data));
                data
            })
            .collect();

        compact_chunk(&f.shared, &seg, &chunk);
        assert!(chunk.is_garbage());

        // Survivors moved; contents intact through the same soft pointers.
        for (ptr, expect) in ptrs[28..].iter().zip(&payloads) {
            match f.shared.alloc.read(ptr) {
                ReadResult::Hit(buf) => assert_eq!(&buf[..1008], expect.as_slice()),
                other => panic!("expected hit after compaction, got {other:?}"),
            }
        }
        for ptr in &ptrs[28..] {
            assert!(matches!(f.shared.alloc.release(ptr), FreeOutcome::Freed(_)));
        }
    }

    #[test]
    fn test_spawned_evacuator_reclaims_on_demand() {
        let alloc = LogAllocator::new(LocalClient::new(u64::MAX), REGION, CHUNK);
        let victims = Arc::new(VictimCache::new(1024, 1 << 20));
        let evac = Evacuator::spawn(
            "test",
            Arc::clone(&alloc),
            victims,
            Arc::new(AtomicU64::new(u64::MAX)),
            Duration::from_millis(10),
        );

        let ptrs: Vec<_> = (0..64).map(|_| alloc.alloc(1008).unwrap()).collect();
        let before = alloc.region_count();
        assert!(before >= 1);

        assert!(evac.force_reclaim(REGION as u64, Duration::from_secs(2)));
        assert!(alloc.region_count() < before || alloc.total_alive() == 0);

        for ptr in ptrs {
            alloc.release(&ptr);
        }
        drop(evac);
    }
}
