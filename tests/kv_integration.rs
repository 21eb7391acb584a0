//! End-to-end KV scenarios against real pools.
//!
//! These tests exercise the whole stack — sync map, pool, log allocator,
//! victim cache, and the background evacuator — through the public API only.

use softcache::{CacheManager, PoolConfig, SyncKV, UpdateType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn manager(limit: u64) -> CacheManager {
    CacheManager::new(PoolConfig {
        limit_bytes: limit,
        region_size: 1024 * 1024,
        chunk_size: 256 * 1024,
        victim_count: 4096,
        victim_bytes: 4 << 20,
        evac_interval: Duration::from_millis(20),
    })
}

/// 1 KiB value derived from the key's hash, position-dependent so
/// corruption is detectable.
fn value_for(key: &[u8]) -> Vec<u8> {
    let seed = key.iter().fold(0u8, |acc, b| acc.wrapping_mul(31).wrapping_add(*b));
    (0..1024).map(|i| (i as u8).wrapping_add(seed)).collect()
}

// ============================================================================
// Warm-up and read-back
// ============================================================================

#[test]
fn test_warmup_then_read_all_hits() {
    let manager = manager(4 << 20);
    assert!(manager.create_pool("warm"));
    let pool = manager.get_pool("warm").unwrap();
    let kv = SyncKV::new(Arc::clone(&pool));

    for i in 0..1000 {
        let key = format!("k{i}");
        assert!(kv.set(key.as_bytes(), &value_for(key.as_bytes())));
    }
    for i in 0..1000 {
        let key = format!("k{i}");
        let got = kv.get(key.as_bytes());
        if let Some(got) = &got {
            assert_eq!(got, &value_for(key.as_bytes()), "corrupt value for {key}");
        }
    }

    // Inside the limit nothing ages out: at least 99% of reads hit.
    let snap = pool.stats().snapshot();
    assert!(snap.hits >= 990, "hits = {}", snap.hits);
    assert!(snap.misses <= 10, "misses = {}", snap.misses);
}

// ============================================================================
// Eviction under a tiny limit, with construct on the miss path
// ============================================================================

#[test]
fn test_eviction_misses_recompute_via_construct() {
    let manager = CacheManager::new(PoolConfig {
        limit_bytes: 64 * 1024,
        region_size: 64 * 1024,
        chunk_size: 16 * 1024,
        victim_count: 4096,
        victim_bytes: 1 << 20,
        evac_interval: Duration::from_millis(5),
    });
    assert!(manager.create_pool("tiny"));
    let pool = manager.get_pool("tiny").unwrap();

    let constructed = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&constructed);
    pool.set_construct_func(Box::new(move |_key| {
        counter.fetch_add(1, Ordering::Relaxed);
        Some(vec![0u8; 1024])
    }));

    let kv = SyncKV::new(Arc::clone(&pool));
    for i in 0..1000 {
        // Most inserts overflow the limit; failures are expected and fine.
        let key = format!("k{i}");
        let _ = kv.set(key.as_bytes(), &value_for(key.as_bytes()));
    }

    // Every read must produce a value: cached or reconstructed.
    for pass in 0..3 {
        for i in 0..1000 {
            let key = format!("k{i}");
            let value = kv.get_or_construct(key.as_bytes());
            assert!(value.is_some(), "pass {pass}: no value for {key}");
            assert_eq!(value.unwrap().len(), 1024);
        }
    }

    let snap = pool.stats().snapshot();
    assert!(snap.misses > 0, "a 64 KiB pool cannot hold 1000 KiB");
    assert_eq!(constructed.load(Ordering::Relaxed), snap.misses);
    // The pool never grew materially past its limit.
    assert!(pool.live_bytes() <= pool.limit() + 64 * 1024);
}

// ============================================================================
// Concurrent writers
// ============================================================================

#[test]
fn test_concurrent_mixed_workload() {
    use rand::{Rng, SeedableRng};

    const THREADS: u64 = 8;
    const OPS: u64 = 100_000;
    const KEYSPACE: u64 = 512;

    let manager = manager(64 << 20);
    assert!(manager.create_pool("conc"));
    let pool = manager.get_pool("conc").unwrap();
    let kv = Arc::new(SyncKV::new(Arc::clone(&pool)));

    let total_gets = Arc::new(AtomicU64::new(0));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let kv = Arc::clone(&kv);
            let total_gets = Arc::clone(&total_gets);
            std::thread::spawn(move || {
                let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(0xC0FFEE ^ t);
                let mut gets = 0u64;
                for _ in 0..OPS {
                    let key = (rng.gen_range(0..KEYSPACE)).to_le_bytes();
                    match rng.gen_range(0..10) {
                        0..=4 => {
                            let _ = kv.get(&key);
                            gets += 1;
                        }
                        5..=7 => {
                            let len = rng.gen_range(8..200);
                            let fill = key[0];
                            assert!(kv.set(&key, &vec![fill; len]));
                        }
                        _ => {
                            let _ = kv.remove(&key);
                        }
                    }
                }
                total_gets.fetch_add(gets, Ordering::Relaxed);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Every get resolved to exactly one of hit or miss.
    let snap = pool.stats().snapshot();
    assert_eq!(snap.hits + snap.misses, total_gets.load(Ordering::Relaxed));

    kv.clear();
    assert_eq!(pool.live_bytes(), 0);
}

// ============================================================================
// Ordered sets
// ============================================================================

#[test]
fn test_ordered_set_scenario() {
    let manager = manager(4 << 20);
    assert!(manager.create_pool("zset"));
    let kv = SyncKV::new(manager.get_pool("zset").unwrap());

    kv.zadd(b"board", b"a", 1.0, UpdateType::NotExist).unwrap();
    kv.zadd(b"board", b"b", 3.0, UpdateType::NotExist).unwrap();
    kv.zadd(b"board", b"c", 2.0, UpdateType::NotExist).unwrap();

    assert_eq!(
        kv.zrange(b"board", 0, 2).unwrap(),
        vec![b"a".to_vec(), b"c".to_vec(), b"b".to_vec()]
    );
    assert_eq!(
        kv.zrevrange(b"board", 0, 2).unwrap(),
        vec![b"b".to_vec(), b"c".to_vec(), b"a".to_vec()]
    );

    // zrange and zrevrange reverse each other element-wise.
    let asc = kv.zrange(b"board", 0, 2).unwrap();
    let mut desc = kv.zrevrange(b"board", 0, 2).unwrap();
    desc.reverse();
    assert_eq!(asc, desc);

    // An element appears exactly once after NOT_EXIST insertion.
    let count = asc.iter().filter(|e| e.as_slice() == b"a").count();
    assert_eq!(count, 1);
}

// ============================================================================
// Round-trip laws
// ============================================================================

#[test]
fn test_set_get_roundtrip_without_pressure() {
    let manager = manager(16 << 20);
    assert!(manager.create_pool("law"));
    let kv = SyncKV::new(manager.get_pool("law").unwrap());

    for len in [0usize, 1, 15, 16, 17, 255, 4096] {
        let key = format!("len-{len}");
        let value = vec![0xA5u8; len];
        assert!(kv.set(key.as_bytes(), &value));
        assert_eq!(kv.get(key.as_bytes()).unwrap(), value, "len {len}");
    }

    // Overwrite is last-write-wins.
    assert!(kv.set(b"law", b"first"));
    assert!(kv.set(b"law", b"second"));
    assert_eq!(kv.get(b"law").unwrap(), b"second");

    // Removal is observable immediately.
    assert!(kv.remove(b"law"));
    assert!(kv.get(b"law").is_none());
}
