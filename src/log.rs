//! Log-structured allocator over coordinator-granted regions.
//!
//! Objects are bump-allocated into fixed-size chunks carved out of regions.
//! Each thread keeps one open chunk as its allocation buffer, so the steady
//! state allocates without contention; sealing a chunk is the single
//! synchronization point with the evacuator. Freed bytes are never reused in
//! place — space comes back only when the evacuator returns a whole region.
//!
//! ```text
//!  region (16 MiB)                      region
//! +---------+---------+-----+         +---------+----
//! | chunk 0 | chunk 1 | ... |         | chunk 0 | ...
//! +---------+---------+-----+         +---------+----
//!    ^ per-thread bump allocation within one open chunk
//! ```

use crate::object::{
    size_to_units, Location, ObjectHdr, ObjectRef, SlotWord, SoftPtr, INVALID_HDR,
    LARGE_HDR_SIZE, MAX_REGION_ID, SMALL_HDR_SIZE, SMALL_OBJ_THRESHOLD, UNIT,
};
use crate::region::{RegionHandle, ResourceClient};
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// How many thread-local accesses are batched before hitting the pool-wide
/// counter.
const ACCESS_FLUSH: i32 = 64;

/// Sealed flag packed into the high bit of a chunk's position word, so a
/// reservation and a concurrent seal linearize on one atomic: a reservation
/// that succeeds is always visible to the sealer's subsequent scan.
const CHUNK_SEALED: u32 = 1 << 31;
const CHUNK_POS_MASK: u32 = CHUNK_SEALED - 1;

/// A bump-allocation slab inside a region.
pub(crate) struct LogChunk {
    segment: Weak<LogSegment>,
    region_id: u32,
    /// Absolute address of the chunk's first byte.
    base: u64,
    /// Offset of the chunk within its region.
    start_offset: u32,
    size: u32,
    /// Packed `[sealed:1][pos:31]`; the owner thread bumps it, the evacuator
    /// reads and seals it.
    pos: AtomicU32,
    /// Set by the evacuator once every object in the chunk is dead and the
    /// chunk must never be scanned again.
    garbage: AtomicBool,
}

impl LogChunk {
    /// Reserve `total` bytes, returning the chunk-relative offset.
    fn reserve(&self, total: u32) -> Option<u32> {
        let mut cur = self.pos.load(Ordering::Acquire);
        loop {
            if cur & CHUNK_SEALED != 0 {
                return None;
            }
            let next = cur.checked_add(total)?;
            if next > self.size {
                self.seal();
                return None;
            }
            match self
                .pos
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(cur),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Allocate a small object; returns the uninitialized object and its
    /// location.
    fn alloc_small(&self, size_units: u32) -> Option<(ObjectRef, Location)> {
        let total = (SMALL_HDR_SIZE + size_units as usize * UNIT) as u32;
        let off = self.reserve(total)?;
        // SAFETY: the reservation proves [base+off, base+off+total) lies in
        // this chunk's mapping, which the caller keeps pinned.
        let obj = unsafe { ObjectRef::new(self.base + off as u64) };
        Some((
            obj,
            Location {
                region_id: self.region_id,
                offset: self.start_offset + off,
            },
        ))
    }

    /// Allocate one fragment of a large object, taking at most the space
    /// left in the chunk. Returns the fragment and its payload size in
    /// bytes.
    fn alloc_large_frag(&self, remaining: usize) -> Option<(ObjectRef, Location, usize)> {
        let avail = self.size.saturating_sub(self.used()) as usize;
        if avail < LARGE_HDR_SIZE + UNIT {
            self.seal();
            return None;
        }
        let payload = remaining.min(avail - LARGE_HDR_SIZE);
        let units = size_to_units(payload);
        let total = (LARGE_HDR_SIZE + units as usize * UNIT) as u32;
        let off = self.reserve(total)?;
        // SAFETY: as in alloc_small.
        let obj = unsafe { ObjectRef::new(self.base + off as u64) };
        Some((
            obj,
            Location {
                region_id: self.region_id,
                offset: self.start_offset + off,
            },
            units as usize * UNIT,
        ))
    }

    pub(crate) fn seal(&self) {
        self.pos.fetch_or(CHUNK_SEALED, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn is_sealed(&self) -> bool {
        self.pos.load(Ordering::Acquire) & CHUNK_SEALED != 0
    }

    #[inline]
    pub(crate) fn used(&self) -> u32 {
        self.pos.load(Ordering::Acquire) & CHUNK_POS_MASK
    }

    #[inline]
    pub(crate) fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub(crate) fn mark_garbage(&self) {
        self.garbage.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_garbage(&self) -> bool {
        self.garbage.load(Ordering::Acquire)
    }

    pub(crate) fn segment(&self) -> Option<Arc<LogSegment>> {
        self.segment.upgrade()
    }
}

/// One region plus the chunks carved from it.
pub(crate) struct LogSegment {
    region_id: u32,
    /// Id on the control-plane wire (what `free_region` wants back).
    ctrl_id: i64,
    handle: RegionHandle,
    chunk_size: u32,
    /// Offset of the next chunk to hand out.
    next_chunk: AtomicU32,
    sealed: AtomicBool,
    /// Live payload+header bytes across all chunks.
    alive_bytes: AtomicI64,
    chunks: Mutex<Vec<Arc<LogChunk>>>,
    destroyed: AtomicBool,
}

impl LogSegment {
    fn new(region_id: u32, ctrl_id: i64, handle: RegionHandle, chunk_size: u32) -> Arc<Self> {
        debug_assert_eq!(
            handle.size() % chunk_size as usize,
            0,
            "region size must be a multiple of the chunk size"
        );
        Arc::new(Self {
            region_id,
            ctrl_id,
            handle,
            chunk_size,
            next_chunk: AtomicU32::new(0),
            sealed: AtomicBool::new(false),
            alive_bytes: AtomicI64::new(0),
            chunks: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Carve the next chunk out of the region, sealing the segment when the
    /// region is exhausted.
    fn alloc_chunk(self: &Arc<Self>) -> Option<Arc<LogChunk>> {
        let mut chunks = self.chunks.lock();
        let off = self.next_chunk.load(Ordering::Acquire);
        if off as usize >= self.handle.size() {
            self.sealed.store(true, Ordering::SeqCst);
            return None;
        }
        self.next_chunk
            .store(off + self.chunk_size, Ordering::Release);
        if (off + self.chunk_size) as usize >= self.handle.size() {
            self.sealed.store(true, Ordering::SeqCst);
        }
        let chunk = Arc::new(LogChunk {
            segment: Arc::downgrade(self),
            region_id: self.region_id,
            base: self.handle.base() + off as u64,
            start_offset: off,
            size: self.chunk_size,
            pos: AtomicU32::new(0),
            garbage: AtomicBool::new(false),
        });
        chunks.push(Arc::clone(&chunk));
        Some(chunk)
    }

    #[inline]
    pub(crate) fn region_id(&self) -> u32 {
        self.region_id
    }

    #[inline]
    pub(crate) fn base(&self) -> u64 {
        self.handle.base()
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.handle.size()
    }

    /// Whether `addr` falls inside this segment's region.
    #[inline]
    pub(crate) fn contains(&self, addr: u64) -> bool {
        self.handle.contains(addr)
    }

    #[inline]
    pub(crate) fn alive_bytes(&self) -> i64 {
        self.alive_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
        for chunk in self.chunks.lock().iter() {
            chunk.seal();
        }
    }

    pub(crate) fn chunks_snapshot(&self) -> Vec<Arc<LogChunk>> {
        self.chunks.lock().clone()
    }
}

/// Outcome of releasing a soft pointer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FreeOutcome {
    /// The object was live; this many log bytes became dead.
    Freed(usize),
    /// The pointer resolved to a victim entry; the caller drops it.
    Victim(u32),
    /// The pointer was already unbound.
    Null,
}

/// Outcome of resolving and copying out a soft pointer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadResult {
    /// Payload snapshot (rounded up to whole allocation units).
    Hit(Vec<u8>),
    /// The object was evicted or reclaimed.
    Fault,
    /// The object was evicted but its identity is still in the victim
    /// cache.
    VictimFault(u32),
    /// The pointer was never bound.
    Null,
}

thread_local! {
    /// Per-thread open chunk, keyed by allocator id (one slot per pool).
    static PCAB: RefCell<HashMap<u64, Arc<LogChunk>>> = RefCell::new(HashMap::new());
    /// Per-thread access counter, flushed in batches.
    static ACCESS_CNT: RefCell<i32> = const { RefCell::new(0) };
}

static ALLOCATOR_IDS: AtomicU64 = AtomicU64::new(1);

/// Per-pool log allocator.
pub(crate) struct LogAllocator {
    id: u64,
    region_size: usize,
    chunk_size: u32,
    client: Arc<dyn ResourceClient>,
    regions: RwLock<HashMap<u32, Arc<LogSegment>>>,
    open_segment: Mutex<Option<Arc<LogSegment>>>,
    next_region: AtomicU32,
    total_alive: AtomicI64,
    total_accesses: AtomicI64,
}

impl LogAllocator {
    pub fn new(client: Arc<dyn ResourceClient>, region_size: usize, chunk_size: usize) -> Arc<Self> {
        assert!(region_size >= chunk_size && region_size % chunk_size == 0);
        assert!(chunk_size >= SMALL_OBJ_THRESHOLD + LARGE_HDR_SIZE);
        Arc::new(Self {
            id: ALLOCATOR_IDS.fetch_add(1, Ordering::Relaxed),
            region_size,
            chunk_size: chunk_size as u32,
            client,
            regions: RwLock::new(HashMap::new()),
            open_segment: Mutex::new(None),
            next_region: AtomicU32::new(0),
            total_alive: AtomicI64::new(0),
            total_accesses: AtomicI64::new(0),
        })
    }

    /// Live log bytes across all regions.
    pub fn total_alive(&self) -> u64 {
        self.total_alive.load(Ordering::Relaxed).max(0) as u64
    }

    /// Monotone pool-wide access counter (the evacuator's time proxy).
    pub fn total_accesses(&self) -> i64 {
        self.total_accesses.load(Ordering::Relaxed)
    }

    /// Count one application access, batched per thread.
    pub fn count_access(&self) {
        ACCESS_CNT.with(|cnt| {
            let mut c = cnt.borrow_mut();
            *c += 1;
            if *c >= ACCESS_FLUSH {
                self.total_accesses
                    .fetch_add(*c as i64, Ordering::Relaxed);
                *c = 0;
            }
        });
    }

    /// Snapshot of all segments, for the evacuator's round-robin scan.
    pub fn segments_snapshot(&self) -> Vec<Arc<LogSegment>> {
        let mut segs: Vec<_> = self.regions.read().values().cloned().collect();
        segs.sort_by_key(|s| s.region_id());
        segs
    }

    pub fn get_region(&self, region_id: u32) -> Option<Arc<LogSegment>> {
        self.regions.read().get(&region_id).cloned()
    }

    /// Number of regions currently held.
    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    fn resolve(&self, loc: Location) -> Option<(Arc<LogSegment>, ObjectRef)> {
        let seg = self.get_region(loc.region_id)?;
        if loc.offset as usize + LARGE_HDR_SIZE > seg.size() {
            return None;
        }
        // SAFETY: the Arc pins the mapping and the offset was bounds-checked.
        let obj = unsafe { ObjectRef::new(seg.base() + loc.offset as u64) };
        Some((seg, obj))
    }

    /// Request a fresh region and register it as a segment.
    fn alloc_segment(&self, overcommit: bool) -> Option<Arc<LogSegment>> {
        let (ctrl_id, handle) = self.client.alloc_region(self.region_size, overcommit)?;
        let rid = self.next_region.fetch_add(1, Ordering::Relaxed);
        assert!(rid <= MAX_REGION_ID, "region id space exhausted");
        let seg = LogSegment::new(rid, ctrl_id, handle, self.chunk_size);
        self.regions.write().insert(rid, Arc::clone(&seg));
        tracing::debug!(region = rid, ctrl = ctrl_id, "region added to log");
        Some(seg)
    }

    /// Hand out a chunk from the open segment, requesting a region when the
    /// segment is exhausted.
    fn alloc_chunk(&self, overcommit: bool) -> Option<Arc<LogChunk>> {
        let mut open = self.open_segment.lock();
        if let Some(seg) = open.as_ref() {
            if let Some(chunk) = seg.alloc_chunk() {
                return Some(chunk);
            }
        }
        let seg = self.alloc_segment(overcommit)?;
        let chunk = seg.alloc_chunk();
        *open = Some(seg);
        chunk
    }

    fn account_alloc(&self, seg: &LogSegment, bytes: usize) {
        seg.alive_bytes.fetch_add(bytes as i64, Ordering::Relaxed);
        self.total_alive.fetch_add(bytes as i64, Ordering::Relaxed);
    }

    pub(crate) fn account_dead(&self, seg: &LogSegment, bytes: usize) {
        seg.alive_bytes.fetch_sub(bytes as i64, Ordering::Relaxed);
        self.total_alive.fetch_sub(bytes as i64, Ordering::Relaxed);
    }

    /// Allocate a small object without binding it to a soft pointer.
    /// The compactor uses this directly; `alloc` wraps it.
    pub(crate) fn alloc_small_raw(
        &self,
        size_units: u32,
        overcommit: bool,
    ) -> Option<(ObjectRef, Location, Arc<LogSegment>)> {
        loop {
            let cached = PCAB.with(|p| p.borrow().get(&self.id).cloned());
            if let Some(chunk) = cached {
                if let Some((obj, loc)) = chunk.alloc_small(size_units) {
                    let seg = chunk.segment()?;
                    self.account_alloc(&seg, SMALL_HDR_SIZE + size_units as usize * UNIT);
                    return Some((obj, loc, seg));
                }
                chunk.seal();
                PCAB.with(|p| p.borrow_mut().remove(&self.id));
                continue;
            }
            let chunk = self.alloc_chunk(overcommit)?;
            PCAB.with(|p| p.borrow_mut().insert(self.id, chunk));
        }
    }

    /// Allocate `size` payload bytes and bind them to a fresh soft pointer.
    pub fn alloc(&self, size: usize) -> Option<SoftPtr> {
        let ptr = SoftPtr::null();
        if self.alloc_to(size, &ptr) {
            Some(ptr)
        } else {
            None
        }
    }

    /// Allocate `size` payload bytes into an existing (null) soft pointer.
    ///
    /// When the coordinator refuses a region within the limit, one
    /// overcommit request follows; the coordinator may reject that too, and
    /// rejection is an ordinary `false`, not an error.
    pub fn alloc_to(&self, size: usize, ptr: &SoftPtr) -> bool {
        debug_assert!(ptr.is_null(), "alloc_to requires an unbound pointer");
        if size >= SMALL_OBJ_THRESHOLD {
            return self.alloc_large(size, ptr);
        }
        let units = size_to_units(size);
        let Some((obj, loc, _seg)) = self
            .alloc_small_raw(units, false)
            .or_else(|| self.alloc_small_raw(units, true))
        else {
            return false;
        };
        obj.init_small(units, ptr.slot_addr());
        ptr.raw().store(loc.pack(), Ordering::Release);
        true
    }

    /// Allocate a fragment chain for a large object.
    ///
    /// The head fragment comes from the thread-local chunk when it has room;
    /// tail fragments come from freshly obtained regions, each linked
    /// forward from its predecessor. On failure, fragments in pre-existing
    /// chunks are killed for the evacuator to reclaim, and regions obtained
    /// during this attempt are handed straight back.
    fn alloc_large(&self, size: usize, ptr: &SoftPtr) -> bool {
        let mut remaining = size_to_units(size) as usize * UNIT;
        // (obj, loc, payload bytes, segment)
        let mut frags: Vec<(ObjectRef, Location, usize, Arc<LogSegment>)> = Vec::new();
        let mut created: Vec<Arc<LogSegment>> = Vec::new();

        let pcab = PCAB.with(|p| p.borrow().get(&self.id).cloned());
        if let Some(chunk) = pcab {
            if let Some((obj, loc, payload)) = chunk.alloc_large_frag(remaining) {
                if let Some(seg) = chunk.segment() {
                    self.account_alloc(&seg, LARGE_HDR_SIZE + payload);
                    obj.init_large(size_to_units(payload), true, 0);
                    remaining -= payload;
                    frags.push((obj, loc, payload, seg));
                }
            }
            // A chunk the head filled up is done serving small allocations.
            if chunk.is_sealed() {
                PCAB.with(|p| p.borrow_mut().remove(&self.id));
            }
        }

        let mut last_chunk: Option<Arc<LogChunk>> = None;
        'fill: while remaining > 0 {
            let Some(seg) = self.alloc_segment(true) else {
                return self.abort_large(frags, created);
            };
            created.push(Arc::clone(&seg));
            while remaining > 0 {
                let Some(chunk) = seg.alloc_chunk() else {
                    continue 'fill;
                };
                let Some((obj, loc, payload)) = chunk.alloc_large_frag(remaining) else {
                    return self.abort_large(frags, created);
                };
                self.account_alloc(&seg, LARGE_HDR_SIZE + payload);
                let is_head = frags.is_empty();
                obj.init_large(size_to_units(payload), is_head, 0);
                if let Some((prev, _, _, _)) = frags.last() {
                    prev.next_word().store(loc.pack(), Ordering::Release);
                }
                remaining -= payload;
                frags.push((obj, loc, payload, Arc::clone(&seg)));
                last_chunk = Some(chunk);
            }
        }

        let Some((head, head_loc, _, _)) = frags.first() else {
            return false;
        };
        head.rref().store(ptr.slot_addr(), Ordering::Release);
        ptr.raw().store(head_loc.pack(), Ordering::Release);

        // Adopt the last tail chunk as the new thread-local buffer if it
        // still has room.
        if let Some(chunk) = last_chunk {
            if !chunk.is_sealed() {
                PCAB.with(|p| p.borrow_mut().insert(self.id, chunk));
            }
        }
        true
    }

    fn abort_large(
        &self,
        frags: Vec<(ObjectRef, Location, usize, Arc<LogSegment>)>,
        created: Vec<Arc<LogSegment>>,
    ) -> bool {
        for (obj, _, payload, seg) in frags {
            if obj.kill().is_some() {
                self.account_dead(&seg, LARGE_HDR_SIZE + payload);
            }
        }
        // Nothing else landed in the regions this attempt obtained; hand
        // them straight back instead of waiting for the evacuator.
        for seg in created {
            seg.seal();
            self.destroy_segment(&seg);
        }
        false
    }

    /// Unbind a soft pointer and kill the object behind it.
    ///
    /// The slot CAS is the claim: whichever of the application and the
    /// evacuator nulls the slot first is the one that touches the header.
    pub(crate) fn release(&self, ptr: &SoftPtr) -> FreeOutcome {
        loop {
            let word = ptr.raw().load(Ordering::Acquire);
            match SlotWord::classify(word) {
                SlotWord::Null => return FreeOutcome::Null,
                SlotWord::Victim(id) => {
                    if ptr
                        .raw()
                        .compare_exchange(word, 0, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return FreeOutcome::Victim(id);
                    }
                }
                SlotWord::Loc(loc) => {
                    if ptr
                        .raw()
                        .compare_exchange(word, 0, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return FreeOutcome::Freed(self.kill_chain(loc));
                    }
                }
            }
        }
    }

    /// Kill an object (and for large objects, every fragment). Returns dead
    /// bytes.
    pub(crate) fn kill_chain(&self, loc: Location) -> usize {
        let mut dead = 0;
        let mut cursor = Some(loc);
        while let Some(loc) = cursor.take() {
            let Some((seg, obj)) = self.resolve(loc) else {
                break;
            };
            let next = SlotWord::classify(obj.next_word().load(Ordering::Acquire));
            let Some(hdr) = obj.kill() else {
                break;
            };
            self.account_dead(&seg, hdr.footprint());
            dead += hdr.footprint();
            if !hdr.is_small() {
                if let SlotWord::Loc(next_loc) = next {
                    cursor = Some(next_loc);
                }
            }
        }
        dead
    }

    /// Resolve a soft pointer and copy its payload out.
    ///
    /// One retry is allowed: a fault whose slot has meanwhile been repointed
    /// (the compactor moved the object) re-resolves instead of reporting a
    /// spurious miss.
    pub(crate) fn read(&self, ptr: &SoftPtr) -> ReadResult {
        let mut last_word = 0;
        for attempt in 0..2 {
            let word = ptr.raw().load(Ordering::Acquire);
            if attempt > 0 && word == last_word {
                return ReadResult::Fault;
            }
            last_word = word;
            match SlotWord::classify(word) {
                SlotWord::Null => return ReadResult::Null,
                SlotWord::Victim(id) => return ReadResult::VictimFault(id),
                SlotWord::Loc(loc) => {
                    if let Some(buf) = self.read_chain(loc) {
                        return ReadResult::Hit(buf);
                    }
                }
            }
        }
        ReadResult::Fault
    }

    fn read_chain(&self, loc: Location) -> Option<Vec<u8>> {
        let (_seg, head) = self.resolve(loc)?;
        let mut buf = Vec::new();
        if !head.copy_out(&mut buf, true) {
            return None;
        }
        let hdr = head.hdr()?;
        if hdr.is_small() {
            return Some(buf);
        }
        let mut next = SlotWord::classify(head.next_word().load(Ordering::Acquire));
        while let SlotWord::Loc(frag_loc) = next {
            let (_seg, frag) = self.resolve(frag_loc)?;
            if !frag.copy_out(&mut buf, false) {
                return None;
            }
            next = SlotWord::classify(frag.next_word().load(Ordering::Acquire));
        }
        Some(buf)
    }

    /// Stored payload capacity behind a pointer (whole chain for large
    /// objects).
    pub(crate) fn payload_size(&self, ptr: &SoftPtr) -> Option<usize> {
        let SlotWord::Loc(loc) = ptr.word() else {
            return None;
        };
        let (_seg, head) = self.resolve(loc)?;
        let hdr = head.hdr()?;
        if !hdr.is_present() {
            return None;
        }
        if hdr.is_small() {
            return Some(hdr.payload_size());
        }
        let mut total = hdr.payload_size();
        let mut next = SlotWord::classify(head.next_word().load(Ordering::Acquire));
        while let SlotWord::Loc(frag_loc) = next {
            let (_seg, frag) = self.resolve(frag_loc)?;
            let fhdr = frag.hdr()?;
            total += fhdr.payload_size();
            next = SlotWord::classify(frag.next_word().load(Ordering::Acquire));
        }
        Some(total)
    }

    /// Write `bytes` at `offset` into the stored payload, spanning fragment
    /// boundaries for large objects. Mirrors the read protocol; fails if the
    /// object faults or the write runs past the stored capacity.
    pub(crate) fn write_at(&self, ptr: &SoftPtr, offset: usize, bytes: &[u8]) -> bool {
        let SlotWord::Loc(loc) = ptr.word() else {
            return false;
        };
        let Some((_seg, head)) = self.resolve(loc) else {
            return false;
        };
        let Some(hdr) = head.hdr() else {
            return false;
        };
        if hdr.is_small() {
            return head.copy_in(offset, bytes);
        }

        // Walk the chain, writing the overlap of [offset, offset+len) with
        // each fragment's payload window.
        let mut frag = head;
        let mut frag_start = 0usize;
        let mut written = 0usize;
        loop {
            let Some(fhdr) = frag.hdr() else {
                return false;
            };
            if !fhdr.is_present() {
                return false;
            }
            let frag_len = fhdr.payload_size();
            let frag_end = frag_start + frag_len;
            if offset < frag_end && written < bytes.len() {
                let local_off = offset.max(frag_start) - frag_start;
                let n = (frag_len - local_off).min(bytes.len() - written);
                if !frag.copy_in(local_off, &bytes[written..written + n]) {
                    return false;
                }
                written += n;
            }
            if written >= bytes.len() {
                return true;
            }
            match SlotWord::classify(frag.next_word().load(Ordering::Acquire)) {
                SlotWord::Loc(next_loc) => {
                    let Some((_seg, next)) = self.resolve(next_loc) else {
                        return false;
                    };
                    frag = next;
                    frag_start = frag_end;
                }
                _ => return false,
            }
        }
    }

    /// Seal every open chunk and segment so idle tails stop pinning regions.
    /// Used by the evacuator when it must actually return memory.
    pub(crate) fn seal_all(&self) {
        let mut open = self.open_segment.lock();
        for seg in self.regions.read().values() {
            seg.seal();
        }
        *open = None;
    }

    /// Drop a segment from the table and hand its region back.
    ///
    /// In-flight readers still hold the `Arc`, so the mapping survives until
    /// the last of them finishes; new resolutions fault immediately.
    pub(crate) fn destroy_segment(&self, seg: &Arc<LogSegment>) {
        if seg.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut open = self.open_segment.lock();
            if let Some(cur) = open.as_ref() {
                if cur.region_id() == seg.region_id() {
                    *open = None;
                }
            }
        }
        self.regions.write().remove(&seg.region_id());
        self.client.free_region(seg.ctrl_id);
        tracing::debug!(region = seg.region_id(), "region returned");
    }

    /// Iterate the objects of one chunk, in log order.
    ///
    /// The callback receives each object plus its decoded header. Iteration
    /// stops at the first unwritten or tombstoned slot, or when the callback
    /// returns `false`.
    pub(crate) fn for_each_object<F>(&self, chunk: &LogChunk, mut callback: F)
    where
        F: FnMut(ObjectRef, ObjectHdr, Location) -> bool,
    {
        let used = chunk.used() as u64;
        let mut off = 0u64;
        while off + SMALL_HDR_SIZE as u64 <= used {
            // SAFETY: off stays below the chunk's used watermark and the
            // caller pins the segment.
            let obj = unsafe { ObjectRef::new(chunk.base() + off) };
            let word = obj.hdr_word();
            if word == INVALID_HDR {
                break;
            }
            let Some(hdr) = ObjectHdr::unpack(word) else {
                // Unwritten tail of an open chunk (or an in-flight header).
                break;
            };
            let loc = Location {
                region_id: chunk.region_id,
                offset: chunk.start_offset + off as u32,
            };
            if !callback(obj, hdr, loc) {
                break;
            }
            off += hdr.footprint() as u64;
        }
    }
}
