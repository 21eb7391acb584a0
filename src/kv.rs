//! Synchronized key-value map over a cache pool.
//!
//! Buckets are an array of chain heads, each behind its own lock; node
//! payloads are soft pointers into the pool's log. A soft-pointer fault
//! during any walk deletes the node and surfaces as a miss — the evacuator
//! may take objects at any time, and the map simply forgets them.
//!
//! Stored pair layout: `[klen: u64][vlen: u64][key bytes][value bytes]`.
//!
//! Ordered-set values (`zadd` / `zrange` / `zrevrange`) are one KV value of
//! layout `[count: u64] { [len: u64][score: f64][bytes] }*`, kept sorted by
//! score; every mutation materializes the whole value, edits it, and stores
//! it back.

use crate::error::{CacheError, CacheResult};
use crate::log::ReadResult;
use crate::object::SoftPtr;
use crate::pool::CachePool;
use ahash::RandomState;
use parking_lot::Mutex;
use std::sync::Arc;

/// Default bucket count (must be a power of two).
const DEFAULT_BUCKETS: usize = 1 << 16;

/// Pair header: klen + vlen.
const PAIR_HDR: usize = 16;

/// Update-type argument for [`SyncKV::zadd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    /// The element must already exist (score update).
    Exist,
    /// The element must not exist yet (insert).
    NotExist,
}

struct Node {
    hash: u64,
    pair: SoftPtr,
    next: Option<Box<Node>>,
}

#[derive(Default)]
struct Bucket {
    head: Option<Box<Node>>,
}

/// Sharded, bucket-locked hash map backed by a cache pool.
pub struct SyncKV {
    pool: Arc<CachePool>,
    buckets: Box<[Mutex<Bucket>]>,
    mask: u64,
    hasher: RandomState,
}

/// What a chain walk learned about one node.
enum Probe {
    /// Payload copied out and the key matched.
    Match(Vec<u8>),
    /// Live node for a different key.
    Other,
    /// The object faulted (plain).
    Dead,
    /// The object faulted into the victim cache.
    DeadVictim,
}

impl SyncKV {
    /// Create a map over `pool` with the default bucket count.
    pub fn new(pool: Arc<CachePool>) -> Self {
        Self::with_buckets(pool, DEFAULT_BUCKETS)
    }

    /// Create a map with an explicit bucket count (power of two).
    pub fn with_buckets(pool: Arc<CachePool>, buckets: usize) -> Self {
        assert!(buckets.is_power_of_two(), "bucket count must be 2^n");
        let table = (0..buckets)
            .map(|_| Mutex::new(Bucket::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Fixed seeds in tests for reproducible bucket placement.
        #[cfg(test)]
        let hasher = RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        );
        #[cfg(not(test))]
        let hasher = RandomState::new();
        Self {
            pool,
            buckets: table,
            mask: (buckets - 1) as u64,
            hasher,
        }
    }

    /// The pool backing this map.
    pub fn pool(&self) -> &Arc<CachePool> {
        &self.pool
    }

    fn hash_key(&self, key: &[u8]) -> u64 {
        if key.len() == 8 {
            // Integer keys skip the byte hasher.
            hash_u64(u64::from_le_bytes(key.try_into().unwrap()))
        } else {
            self.hasher.hash_one(key)
        }
    }

    #[inline]
    fn bucket(&self, hash: u64) -> &Mutex<Bucket> {
        &self.buckets[(hash & self.mask) as usize]
    }

    fn probe(&self, node: &Node, key: &[u8]) -> Probe {
        match self.pool.read(&node.pair) {
            ReadResult::Hit(buf) => match decode_pair(&buf) {
                Some((k, v)) if k == key => Probe::Match(v.to_vec()),
                Some(_) => Probe::Other,
                None => Probe::Dead,
            },
            ReadResult::VictimFault(_) => Probe::DeadVictim,
            ReadResult::Fault | ReadResult::Null => Probe::Dead,
        }
    }

    /// Unlink the node at `cur` and free its object.
    fn unlink(&self, cur: &mut Option<Box<Node>>) {
        if let Some(mut dead) = cur.take() {
            *cur = dead.next.take();
            let Node { pair, .. } = *dead;
            self.pool.free(pair);
        }
    }

    /// Look up `key`, copying the value out on a hit.
    ///
    /// A faulted node is deleted in passing; a fault that still resolves in
    /// the victim cache is additionally counted as a victim hit.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let hash = self.hash_key(key);
        let mut bucket = self.bucket(hash).lock();
        let mut cur = &mut bucket.head;
        loop {
            let Some(node) = cur.as_ref() else { break };
            if node.hash != hash {
                cur = &mut cur.as_mut().unwrap().next;
                continue;
            }
            match self.probe(node, key) {
                Probe::Match(value) => {
                    self.pool.stats().inc_hit();
                    self.pool.alloc_ref().count_access();
                    return Some(value);
                }
                Probe::Other => {
                    cur = &mut cur.as_mut().unwrap().next;
                }
                Probe::Dead => {
                    self.unlink(cur);
                }
                Probe::DeadVictim => {
                    self.pool.stats().inc_victim_hit();
                    self.unlink(cur);
                }
            }
        }
        drop(bucket);
        self.pool.stats().inc_miss();
        None
    }

    /// Store `key -> value`.
    ///
    /// An existing pair is updated in place when the new value fits the
    /// stored payload; otherwise the stale node is removed and a fresh
    /// object allocated. Returns false when no space could be obtained; the
    /// chain is left intact.
    pub fn set(&self, key: &[u8], value: &[u8]) -> bool {
        let hash = self.hash_key(key);
        let mut bucket = self.bucket(hash).lock();

        let mut cur = &mut bucket.head;
        loop {
            let Some(node) = cur.as_ref() else { break };
            if node.hash != hash {
                cur = &mut cur.as_mut().unwrap().next;
                continue;
            }
            match self.probe(node, key) {
                Probe::Match(_) => {
                    let node = cur.as_ref().unwrap();
                    if self.update_in_place(&node.pair, key, value) {
                        self.pool.alloc_ref().count_access();
                        return true;
                    }
                    // Does not fit (or faulted mid-write): replace.
                    self.unlink(cur);
                    break;
                }
                Probe::Other => {
                    cur = &mut cur.as_mut().unwrap().next;
                }
                Probe::Dead | Probe::DeadVictim => {
                    self.unlink(cur);
                }
            }
        }

        let payload = encode_pair(key, value);
        let Some(ptr) = self.pool.alloc(payload.len()) else {
            return false;
        };
        if !self.pool.alloc_ref().write_at(&ptr, 0, &payload) {
            // Evicted between allocation and fill; give the space back.
            self.pool.free(ptr);
            return false;
        }
        bucket.head = Some(Box::new(Node {
            hash,
            pair: ptr,
            next: bucket.head.take(),
        }));
        self.pool.alloc_ref().count_access();
        true
    }

    /// In-place value update: write the new length word, then the bytes.
    /// Requires the new pair to fit the stored payload.
    fn update_in_place(&self, pair: &SoftPtr, key: &[u8], value: &[u8]) -> bool {
        let alloc = self.pool.alloc_ref();
        let Some(stored) = alloc.payload_size(pair) else {
            return false;
        };
        if PAIR_HDR + key.len() + value.len() > stored {
            return false;
        }
        let vlen = (value.len() as u64).to_le_bytes();
        alloc.write_at(pair, 8, &vlen) && alloc.write_at(pair, PAIR_HDR + key.len(), value)
    }

    /// Remove `key`. Returns whether a live pair was removed.
    pub fn remove(&self, key: &[u8]) -> bool {
        let hash = self.hash_key(key);
        let mut bucket = self.bucket(hash).lock();
        let mut cur = &mut bucket.head;
        loop {
            let Some(node) = cur.as_ref() else { break };
            if node.hash != hash {
                cur = &mut cur.as_mut().unwrap().next;
                continue;
            }
            match self.probe(node, key) {
                Probe::Match(_) => {
                    self.unlink(cur);
                    self.pool.alloc_ref().count_access();
                    return true;
                }
                Probe::Other => {
                    cur = &mut cur.as_mut().unwrap().next;
                }
                Probe::Dead | Probe::DeadVictim => {
                    self.unlink(cur);
                }
            }
        }
        false
    }

    /// Drop every pair, bucket by bucket.
    pub fn clear(&self) {
        for bucket in self.buckets.iter() {
            let mut bucket = bucket.lock();
            while bucket.head.is_some() {
                self.unlink(&mut bucket.head);
            }
        }
    }

    /// Look up `key`; on miss, run the pool's construct callback and store
    /// the recomputed value (best effort).
    ///
    /// `None` means a miss with no callback installed, or a callback that
    /// declined.
    pub fn get_or_construct(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(value) = self.get(key) {
            return Some(value);
        }
        let value = self.pool.construct(key)?;
        self.set(key, &value);
        Some(value)
    }

    // -- ordered set -------------------------------------------------------

    /// Add `elem` with `score` to the ordered set stored at `key`.
    ///
    /// `Exist` updates the score of an existing element and fails with
    /// [`CacheError::ElementNotFound`] otherwise; `NotExist` inserts a new
    /// element and fails with [`CacheError::ElementExists`] on a duplicate.
    pub fn zadd(
        &self,
        key: &[u8],
        elem: &[u8],
        score: f64,
        update: UpdateType,
    ) -> CacheResult<()> {
        let mut entries = match self.get(key) {
            Some(value) => decode_zset(&value).ok_or(CacheError::Corrupted)?,
            None => Vec::new(),
        };
        let existing = entries.iter().position(|(_, e)| e.as_slice() == elem);
        match (update, existing) {
            (UpdateType::Exist, None) => return Err(CacheError::ElementNotFound),
            (UpdateType::NotExist, Some(_)) => return Err(CacheError::ElementExists),
            (UpdateType::Exist, Some(idx)) => {
                entries.remove(idx);
            }
            (UpdateType::NotExist, None) => {}
        }
        // Stable insert: after every element with a smaller-or-equal score.
        let at = entries.partition_point(|(s, _)| *s <= score);
        entries.insert(at, (score, elem.to_vec()));
        if self.set(key, &encode_zset(&entries)) {
            Ok(())
        } else {
            Err(CacheError::OutOfMemory)
        }
    }

    /// Copy out elements `start..=end` of the ordered set at `key`, in
    /// ascending score order.
    pub fn zrange(&self, key: &[u8], start: i64, end: i64) -> CacheResult<Vec<Vec<u8>>> {
        let value = self.get(key).ok_or(CacheError::KeyNotFound)?;
        let entries = decode_zset(&value).ok_or(CacheError::Corrupted)?;
        let count = entries.len() as i64;
        if start < 0 || end < start || end >= count {
            return Err(CacheError::InvalidRange);
        }
        Ok(entries[start as usize..=end as usize]
            .iter()
            .map(|(_, e)| e.clone())
            .collect())
    }

    /// [`Self::zrange`] with the result reversed (descending score order).
    pub fn zrevrange(&self, key: &[u8], start: i64, end: i64) -> CacheResult<Vec<Vec<u8>>> {
        let mut out = self.zrange(key, start, end)?;
        out.reverse();
        Ok(out)
    }
}

impl Drop for SyncKV {
    fn drop(&mut self) {
        // Objects and victim entries must be released before the nodes (and
        // their soft-pointer slots) go away.
        self.clear();
    }
}

/// 64-bit integer finalizer (splitmix64) for 8-byte keys.
#[inline]
fn hash_u64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

fn encode_pair(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PAIR_HDR + key.len() + value.len());
    buf.extend_from_slice(&(key.len() as u64).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u64).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

/// Split a stored pair back into key and value. The buffer may carry
/// allocation-unit slack past the value.
fn decode_pair(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    if buf.len() < PAIR_HDR {
        return None;
    }
    let klen = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
    let vlen = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as usize;
    let end = PAIR_HDR.checked_add(klen)?.checked_add(vlen)?;
    if end > buf.len() {
        return None;
    }
    Some((
        &buf[PAIR_HDR..PAIR_HDR + klen],
        &buf[PAIR_HDR + klen..end],
    ))
}

fn encode_zset(entries: &[(f64, Vec<u8>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for (score, elem) in entries {
        buf.extend_from_slice(&(elem.len() as u64).to_le_bytes());
        buf.extend_from_slice(&score.to_le_bytes());
        buf.extend_from_slice(elem);
    }
    buf
}

fn decode_zset(buf: &[u8]) -> Option<Vec<(f64, Vec<u8>)>> {
    if buf.len() < 8 {
        return None;
    }
    let count = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    let mut off = 8usize;
    for _ in 0..count {
        if off + 16 > buf.len() {
            return None;
        }
        let len = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()) as usize;
        let score = f64::from_le_bytes(buf[off + 8..off + 16].try_into().unwrap());
        off += 16;
        if off + len > buf.len() {
            return None;
        }
        entries.push((score, buf[off..off + len].to_vec()));
        off += len;
    }
    Some(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{CacheManager, PoolConfig};
    use std::time::Duration;

    fn test_kv(limit: u64) -> SyncKV {
        let config = PoolConfig {
            limit_bytes: limit,
            region_size: 256 * 1024,
            chunk_size: 64 * 1024,
            victim_count: 1024,
            victim_bytes: 1 << 20,
            evac_interval: Duration::from_millis(20),
        };
        let manager = CacheManager::new(config.clone());
        manager.create_pool_with("kv-test", config);
        SyncKV::with_buckets(manager.get_pool("kv-test").unwrap(), 256)
    }

    #[test]
    fn test_set_get_remove() {
        let kv = test_kv(1 << 20);
        assert!(kv.get(b"missing").is_none());
        assert!(kv.set(b"alpha", b"one"));
        assert_eq!(kv.get(b"alpha").unwrap(), b"one");
        assert!(kv.remove(b"alpha"));
        assert!(kv.get(b"alpha").is_none());
        assert!(!kv.remove(b"alpha"));

        let snap = kv.pool().stats().snapshot();
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.misses, 2);
    }

    #[test]
    fn test_set_updates_in_place_and_grows() {
        let kv = test_kv(1 << 20);
        assert!(kv.set(b"k", b"aaaaaaaa"));
        let live_before = kv.pool().live_bytes();

        // Shrinking fits the stored payload: no new allocation.
        assert!(kv.set(b"k", b"bb"));
        assert_eq!(kv.get(b"k").unwrap(), b"bb");
        assert_eq!(kv.pool().live_bytes(), live_before);

        // Growing past the stored payload reallocates.
        let big = vec![7u8; 512];
        assert!(kv.set(b"k", &big));
        assert_eq!(kv.get(b"k").unwrap(), big);
    }

    #[test]
    fn test_eight_byte_keys_use_integer_hash() {
        let kv = test_kv(1 << 20);
        for i in 0u64..64 {
            assert!(kv.set(&i.to_le_bytes(), &i.to_be_bytes()));
        }
        for i in 0u64..64 {
            assert_eq!(kv.get(&i.to_le_bytes()).unwrap(), i.to_be_bytes());
        }
    }

    #[test]
    fn test_clear_drains_everything() {
        let kv = test_kv(1 << 20);
        for i in 0u32..100 {
            assert!(kv.set(format!("key-{i}").as_bytes(), &i.to_le_bytes()));
        }
        kv.clear();
        assert_eq!(kv.pool().live_bytes(), 0);
        for i in 0u32..100 {
            assert!(kv.get(format!("key-{i}").as_bytes()).is_none());
        }
    }

    #[test]
    fn test_get_or_construct() {
        let kv = test_kv(1 << 20);
        assert!(kv.get_or_construct(b"k").is_none());

        kv.pool()
            .set_construct_func(Box::new(|key| Some([key, b"!"].concat())));
        assert_eq!(kv.get_or_construct(b"k").unwrap(), b"k!");
        // Stored by the construct path: a plain get now hits.
        assert_eq!(kv.get(b"k").unwrap(), b"k!");
        assert!(kv.pool().stats().snapshot().miss_bytes >= 2);
    }

    #[test]
    fn test_victim_fault_counts_miss_and_victim_hit() {
        let kv = test_kv(1 << 20);
        assert!(kv.set(b"victim-key", &[7u8; 64]));

        // Forced reclamation evicts the object into the victim cache.
        assert!(kv.pool().reclaim(1 << 20, Duration::from_secs(2)));

        let before = kv.pool().stats().snapshot();
        assert!(kv.get(b"victim-key").is_none());
        let after = kv.pool().stats().snapshot();

        // One fault: exactly one miss, refined by exactly one victim hit.
        assert_eq!(after.misses, before.misses + 1);
        assert_eq!(after.victim_hits, before.victim_hits + 1);
        assert_eq!(after.hits, before.hits);

        // The fault consumed the node and its entry: a second read is a
        // plain miss.
        assert!(kv.get(b"victim-key").is_none());
        let last = kv.pool().stats().snapshot();
        assert_eq!(last.misses, after.misses + 1);
        assert_eq!(last.victim_hits, after.victim_hits);
    }

    #[test]
    fn test_pair_codec_tolerates_slack() {
        let mut buf = encode_pair(b"key", b"value");
        buf.extend_from_slice(&[0u8; 9]); // allocation rounding
        let (k, v) = decode_pair(&buf).unwrap();
        assert_eq!(k, b"key");
        assert_eq!(v, b"value");

        assert!(decode_pair(&[0u8; 3]).is_none());
        // Lengths past the buffer are rejected.
        let mut bad = encode_pair(b"key", b"value");
        bad[0] = 0xFF;
        assert!(decode_pair(&bad).is_none());
    }

    #[test]
    fn test_zadd_zrange_ordering() {
        let kv = test_kv(1 << 20);
        kv.zadd(b"z", b"a", 1.0, UpdateType::NotExist).unwrap();
        kv.zadd(b"z", b"b", 3.0, UpdateType::NotExist).unwrap();
        kv.zadd(b"z", b"c", 2.0, UpdateType::NotExist).unwrap();

        let asc = kv.zrange(b"z", 0, 2).unwrap();
        assert_eq!(asc, vec![b"a".to_vec(), b"c".to_vec(), b"b".to_vec()]);
        let desc = kv.zrevrange(b"z", 0, 2).unwrap();
        assert_eq!(desc, vec![b"b".to_vec(), b"c".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_zadd_update_semantics() {
        let kv = test_kv(1 << 20);
        assert_eq!(
            kv.zadd(b"z", b"a", 1.0, UpdateType::Exist),
            Err(CacheError::ElementNotFound)
        );
        kv.zadd(b"z", b"a", 1.0, UpdateType::NotExist).unwrap();
        assert_eq!(
            kv.zadd(b"z", b"a", 2.0, UpdateType::NotExist),
            Err(CacheError::ElementExists)
        );
        kv.zadd(b"z", b"b", 2.0, UpdateType::NotExist).unwrap();

        // Score update moves the element.
        kv.zadd(b"z", b"a", 3.0, UpdateType::Exist).unwrap();
        let asc = kv.zrange(b"z", 0, 1).unwrap();
        assert_eq!(asc, vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_zrange_bounds() {
        let kv = test_kv(1 << 20);
        assert_eq!(kv.zrange(b"z", 0, 0), Err(CacheError::KeyNotFound));
        kv.zadd(b"z", b"a", 1.0, UpdateType::NotExist).unwrap();
        assert_eq!(kv.zrange(b"z", -1, 0), Err(CacheError::InvalidRange));
        assert_eq!(kv.zrange(b"z", 0, 1), Err(CacheError::InvalidRange));
        assert_eq!(kv.zrange(b"z", 1, 0), Err(CacheError::InvalidRange));
        assert_eq!(kv.zrange(b"z", 0, 0).unwrap(), vec![b"a".to_vec()]);
    }

    #[test]
    fn test_zset_codec_roundtrip() {
        let entries = vec![
            (1.5, b"x".to_vec()),
            (2.5, b"longer-element".to_vec()),
            (2.5, b"tie".to_vec()),
        ];
        let decoded = decode_zset(&encode_zset(&entries)).unwrap();
        assert_eq!(decoded, entries);
        assert!(decode_zset(&[1, 0, 0, 0, 0, 0, 0, 0]).is_none());
    }
}
