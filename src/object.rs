//! Object headers and soft pointers.
//!
//! Every object in the log starts with an atomic header word. All liveness
//! transitions are CAS operations on that word; no object carries a lock.
//!
//! Header word layout: `[magic:16][size_units:24][reserved:16][flags:8]`
//! where `size_units` is the payload size in 16-byte allocation units. The
//! all-ones sentinel [`INVALID_HDR`] marks a tombstoned slot left behind by
//! compaction; a valid header always carries the magic.
//!
//! The second header word is the back-reference (`rref`): the in-process
//! address of the owning soft-pointer slot. Large objects carry a third word
//! linking to the next fragment. The bidirectional slot/object link is what
//! lets the evacuator move or invalidate objects without racing the
//! application: whichever side wins the CAS on the *slot* is the only one
//! allowed to touch the header afterwards.

use std::sync::atomic::{AtomicU64, Ordering};

/// Allocation unit in bytes; payload sizes round up to this.
pub const UNIT: usize = 16;

/// Small-object header size (flags word + rref).
pub const SMALL_HDR_SIZE: usize = 16;

/// Large-object header size (flags word + rref + next + pad).
pub const LARGE_HDR_SIZE: usize = 32;

/// Payloads at or above this size are stored as fragment chains.
/// One unit short of 8 KiB so a maximal small object plus header stays
/// within 8 KiB.
pub const SMALL_OBJ_THRESHOLD: usize = 8192 - SMALL_HDR_SIZE;

/// Sentinel marking a tombstoned header.
pub const INVALID_HDR: u64 = u64::MAX;

const MAGIC: u64 = 0xCAFE;
const MAGIC_SHIFT: u32 = 48;
const SIZE_SHIFT: u32 = 24;
const SIZE_MASK: u64 = 0xFF_FFFF;
const FLAGS_MASK: u64 = 0xFF;

/// Object is live; cleared on free/evict before bytes are reclaimed.
pub const FLAG_PRESENT: u64 = 1 << 0;
/// Set by every successful read, cleared by the evacuator's aging pass.
pub const FLAG_ACCESSED: u64 = 1 << 1;
/// Object was chosen for eviction or relocation.
pub const FLAG_EVACUATE: u64 = 1 << 2;
/// Small object (single allocation) vs large (fragment chain).
pub const FLAG_SMALL: u64 = 1 << 3;
/// First fragment of a large object.
pub const FLAG_HEAD: u64 = 1 << 4;

/// Decoded header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ObjectHdr {
    pub flags: u64,
    pub size_units: u32,
}

impl ObjectHdr {
    /// Pack into the header word.
    #[inline]
    pub fn pack(self) -> u64 {
        (MAGIC << MAGIC_SHIFT)
            | ((self.size_units as u64 & SIZE_MASK) << SIZE_SHIFT)
            | (self.flags & FLAGS_MASK)
    }

    /// Unpack a header word; `None` for the invalid sentinel, a missing
    /// magic (unwritten or corrupt memory), or anything else unparseable.
    #[inline]
    pub fn unpack(word: u64) -> Option<Self> {
        if word == INVALID_HDR || (word >> MAGIC_SHIFT) != MAGIC {
            return None;
        }
        Some(Self {
            flags: word & FLAGS_MASK,
            size_units: ((word >> SIZE_SHIFT) & SIZE_MASK) as u32,
        })
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.flags & FLAG_PRESENT != 0
    }

    #[inline]
    pub fn is_accessed(self) -> bool {
        self.flags & FLAG_ACCESSED != 0
    }

    #[inline]
    pub fn is_small(self) -> bool {
        self.flags & FLAG_SMALL != 0
    }

    #[inline]
    pub fn is_head(self) -> bool {
        self.flags & FLAG_HEAD != 0
    }

    /// Payload size in bytes.
    #[inline]
    pub fn payload_size(self) -> usize {
        self.size_units as usize * UNIT
    }

    /// Total footprint in the log, header included.
    #[inline]
    pub fn footprint(self) -> usize {
        let hdr = if self.is_small() {
            SMALL_HDR_SIZE
        } else {
            LARGE_HDR_SIZE
        };
        hdr + self.payload_size()
    }
}

/// Round a payload size up to whole allocation units.
#[inline]
pub(crate) fn size_to_units(size: usize) -> u32 {
    (size.max(1).div_ceil(UNIT)) as u32
}

// ---------------------------------------------------------------------------
// Location words
// ---------------------------------------------------------------------------

const LOC_MARK: u64 = 1 << 62;
const VICTIM_MARK: u64 = 1 << 63;
const REGION_MASK: u64 = 0x3F_FFFF;
const REGION_SHIFT: u32 = 32;

/// Largest internal region id that fits a packed location.
pub(crate) const MAX_REGION_ID: u32 = REGION_MASK as u32;

/// Packed position of an object: region id plus byte offset.
///
/// A location never encodes a raw address; resolution goes through the
/// region table, which is what keeps reads safe against unmapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Location {
    pub region_id: u32,
    pub offset: u32,
}

impl Location {
    #[inline]
    pub fn pack(self) -> u64 {
        debug_assert!(self.region_id <= MAX_REGION_ID);
        LOC_MARK | ((self.region_id as u64) << REGION_SHIFT) | self.offset as u64
    }
}

/// The three states of a soft-pointer slot (or a fragment `next` word).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotWord {
    /// Nothing behind the pointer.
    Null,
    /// The object was evicted; its identity lives in the victim cache.
    Victim(u32),
    /// The object lives in the log at this location.
    Loc(Location),
}

impl SlotWord {
    #[inline]
    pub fn classify(word: u64) -> Self {
        if word == 0 {
            Self::Null
        } else if word & VICTIM_MARK != 0 {
            Self::Victim(word as u32)
        } else {
            Self::Loc(Location {
                region_id: ((word >> REGION_SHIFT) & REGION_MASK) as u32,
                offset: word as u32,
            })
        }
    }

    #[inline]
    pub fn victim_word(id: u32) -> u64 {
        VICTIM_MARK | id as u64
    }
}

// ---------------------------------------------------------------------------
// Soft pointer
// ---------------------------------------------------------------------------

/// Application-visible handle to a cached object.
///
/// The pointer owns a heap-pinned atomic slot; the object's `rref` header
/// word stores the slot's address so the evacuator can repoint or invalidate
/// the handle without coordination beyond CAS. Resolution never dangles: an
/// evicted or reclaimed object reports a fault.
///
/// Soft pointers are not `Clone`; each live object has exactly one owner.
/// Return the pointer to its pool with [`crate::CachePool::free`] when done —
/// a pointer dropped while still bound leaks its object until the evacuator
/// collects it.
pub struct SoftPtr {
    slot: Box<AtomicU64>,
}

impl SoftPtr {
    /// A pointer bound to nothing.
    pub fn null() -> Self {
        Self {
            slot: Box::new(AtomicU64::new(0)),
        }
    }

    /// Whether the pointer is bound to nothing at all (not even a victim
    /// entry).
    pub fn is_null(&self) -> bool {
        self.slot.load(Ordering::Acquire) == 0
    }

    /// Whether the pointer currently resolves into the victim cache.
    pub fn is_victim(&self) -> bool {
        matches!(self.word(), SlotWord::Victim(_))
    }

    #[inline]
    pub(crate) fn word(&self) -> SlotWord {
        SlotWord::classify(self.slot.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn raw(&self) -> &AtomicU64 {
        &self.slot
    }

    /// Address of the slot, stored into object `rref` words.
    #[inline]
    pub(crate) fn slot_addr(&self) -> u64 {
        &*self.slot as *const AtomicU64 as u64
    }

    /// Consume the pointer, yielding the slot for deferred reclamation.
    pub(crate) fn into_slot(self) -> Box<AtomicU64> {
        self.slot
    }
}

impl Default for SoftPtr {
    fn default() -> Self {
        Self::null()
    }
}

impl std::fmt::Debug for SoftPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.word() {
            SlotWord::Null => write!(f, "SoftPtr(null)"),
            SlotWord::Victim(id) => write!(f, "SoftPtr(victim #{id})"),
            SlotWord::Loc(loc) => write!(f, "SoftPtr({}+{:#x})", loc.region_id, loc.offset),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw object access
// ---------------------------------------------------------------------------

/// A resolved object address.
///
/// Constructing one asserts that `addr` points at least `LARGE_HDR_SIZE`
/// bytes into memory that stays mapped for the reference's lifetime — in
/// practice the caller holds the `Arc` of the containing segment.
#[derive(Clone, Copy)]
pub(crate) struct ObjectRef {
    addr: u64,
}

impl ObjectRef {
    /// See the type-level mapping requirement.
    #[inline]
    pub unsafe fn new(addr: u64) -> Self {
        debug_assert_eq!(addr % UNIT as u64, 0, "object address must be aligned");
        Self { addr }
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    #[inline]
    fn word0(&self) -> &AtomicU64 {
        // SAFETY: mapping guaranteed by the constructor contract; the unit
        // alignment of object addresses satisfies AtomicU64's.
        unsafe { &*(self.addr as *const AtomicU64) }
    }

    #[inline]
    pub fn rref(&self) -> &AtomicU64 {
        // SAFETY: as word0; rref is the second header word.
        unsafe { &*((self.addr + 8) as *const AtomicU64) }
    }

    /// `next` fragment word; only meaningful for large objects.
    #[inline]
    pub fn next_word(&self) -> &AtomicU64 {
        // SAFETY: as word0; large headers span 32 bytes.
        unsafe { &*((self.addr + 16) as *const AtomicU64) }
    }

    /// Load and decode the header.
    #[inline]
    pub fn hdr(&self) -> Option<ObjectHdr> {
        ObjectHdr::unpack(self.word0().load(Ordering::Acquire))
    }

    /// Raw header word, for callers that need to see the sentinel.
    #[inline]
    pub fn hdr_word(&self) -> u64 {
        self.word0().load(Ordering::Acquire)
    }

    /// Start of the payload bytes.
    #[inline]
    pub fn payload_addr(&self, small: bool) -> u64 {
        self.addr
            + if small {
                SMALL_HDR_SIZE as u64
            } else {
                LARGE_HDR_SIZE as u64
            }
    }

    /// Initialize a fresh small-object header. New objects start accessed so
    /// they survive the sweep already in flight when they were written.
    pub fn init_small(&self, size_units: u32, slot_addr: u64) {
        self.rref().store(slot_addr, Ordering::Relaxed);
        let hdr = ObjectHdr {
            flags: FLAG_PRESENT | FLAG_ACCESSED | FLAG_SMALL,
            size_units,
        };
        self.word0().store(hdr.pack(), Ordering::Release);
    }

    /// Initialize a fresh large-object fragment header.
    pub fn init_large(&self, size_units: u32, is_head: bool, slot_addr: u64) {
        self.rref().store(slot_addr, Ordering::Relaxed);
        self.next_word().store(0, Ordering::Relaxed);
        let mut flags = FLAG_PRESENT | FLAG_ACCESSED;
        if is_head {
            flags |= FLAG_HEAD;
        }
        let hdr = ObjectHdr {
            flags,
            size_units,
        };
        self.word0().store(hdr.pack(), Ordering::Release);
    }

    /// Best-effort accessed-bit set (plain RMW, no retry semantics needed).
    #[inline]
    pub fn mark_accessed(&self) {
        self.word0().fetch_or(FLAG_ACCESSED, Ordering::AcqRel);
    }

    /// CAS-clear the accessed bit. Returns false if the header changed
    /// underneath (freed or invalidated), which the caller treats as "skip".
    pub fn clear_accessed(&self) -> bool {
        let cur = self.word0().load(Ordering::Acquire);
        if ObjectHdr::unpack(cur).is_none() {
            return false;
        }
        self.word0()
            .compare_exchange(cur, cur & !FLAG_ACCESSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear `present` (and set `evacuate`), making readers fault.
    ///
    /// Returns the header as it was if this call did the clearing, `None` if
    /// the object was already dead or tombstoned.
    pub fn kill(&self) -> Option<ObjectHdr> {
        loop {
            let cur = self.word0().load(Ordering::Acquire);
            let hdr = ObjectHdr::unpack(cur)?;
            if !hdr.is_present() {
                return None;
            }
            let next = (cur & !FLAG_PRESENT) | FLAG_EVACUATE;
            if self
                .word0()
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.rref().store(0, Ordering::Release);
                return Some(hdr);
            }
        }
    }

    /// Tombstone the header outright. Only valid once the containing chunk
    /// can never be scanned again (compaction source).
    pub fn tombstone(&self) {
        self.rref().store(0, Ordering::Relaxed);
        self.word0().store(INVALID_HDR, Ordering::Release);
    }

    /// Copy this fragment's payload out under the double-check protocol.
    ///
    /// Appends exactly `payload_size` bytes to `buf` on success. A `false`
    /// return means the object faulted; any bytes staged in `buf` past
    /// `start` were discarded.
    pub fn copy_out(&self, buf: &mut Vec<u8>, mark_accessed: bool) -> bool {
        let start = buf.len();
        let Some(hdr) = self.hdr() else {
            return false;
        };
        if !hdr.is_present() {
            return false;
        }
        if mark_accessed {
            self.mark_accessed();
        }
        let src = self.payload_addr(hdr.is_small()) as *const u8;
        buf.reserve(hdr.payload_size());
        // SAFETY: the segment is pinned by the caller and the header said
        // payload_size bytes follow the header; a concurrent invalidation is
        // caught by the re-check below, at which point the copy is discarded.
        unsafe {
            let dst = buf.as_mut_ptr().add(start);
            std::ptr::copy_nonoverlapping(src, dst, hdr.payload_size());
            buf.set_len(start + hdr.payload_size());
        }
        match self.hdr() {
            Some(after) if after.is_present() => true,
            _ => {
                buf.truncate(start);
                false
            }
        }
    }

    /// Write `bytes` into the payload at `offset` under the mirrored
    /// double-check protocol. Fails when the object faulted or the write
    /// would run past the stored payload.
    pub fn copy_in(&self, offset: usize, bytes: &[u8]) -> bool {
        let Some(hdr) = self.hdr() else {
            return false;
        };
        if !hdr.is_present() || offset + bytes.len() > hdr.payload_size() {
            return false;
        }
        let dst = (self.payload_addr(hdr.is_small()) + offset as u64) as *mut u8;
        // SAFETY: bounds checked against the stored payload size above; the
        // segment is pinned by the caller. A concurrent invalidation makes
        // the write moot (the bytes are never read again) and is reported
        // through the re-check.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        matches!(self.hdr(), Some(after) if after.is_present())
    }
}
