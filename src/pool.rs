//! Cache pools and the process-wide pool registry.
//!
//! A [`CachePool`] owns one log allocator, one victim cache, and one
//! background evacuator, plus the pool's statistics and (optionally) the
//! application's construct callback for the miss path. Pools are created and
//! looked up by name through the [`CacheManager`].

use crate::config::CacheConfig;
use crate::ctrl::StatsMsg;
use crate::error::{CacheError, CacheResult};
use crate::evacuator::Evacuator;
use crate::log::{FreeOutcome, LogAllocator, ReadResult};
use crate::object::SoftPtr;
use crate::region::{ClientHandlers, LocalClient, ResourceClient, ShmClient};
use crate::stats::CacheStats;
use crate::victim::VictimCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Name of the pool that always exists.
pub const DEFAULT_POOL: &str = "default";

/// The application's construct callback: recompute the value for a missed
/// key, or decline with `None`.
pub type ConstructFn = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Tunables for one pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Soft cap on live log bytes; the evacuator works the pool back under
    /// it, tolerating at most one region of overshoot.
    pub limit_bytes: u64,
    /// Region granted by the coordinator (power of two).
    pub region_size: usize,
    /// Bump-allocation slab inside a region; must divide the region size.
    pub chunk_size: usize,
    /// Victim-cache entry bound.
    pub victim_count: usize,
    /// Victim-cache remembered-bytes bound.
    pub victim_bytes: u64,
    /// Evacuator sweep interval.
    pub evac_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            limit_bytes: 1 << 30,
            region_size: 16 << 20,
            chunk_size: 4 << 20,
            victim_count: 8192,
            victim_bytes: 8 << 20,
            evac_interval: Duration::from_millis(50),
        }
    }
}

/// A named cache pool.
pub struct CachePool {
    name: String,
    alloc: Arc<LogAllocator>,
    victims: Arc<VictimCache>,
    stats: Arc<CacheStats>,
    evac: Evacuator,
    limit: Arc<AtomicU64>,
    client: Arc<dyn ResourceClient>,
    construct: RwLock<Option<ConstructFn>>,
    region_size: usize,
}

impl CachePool {
    fn new(name: &str, config: &PoolConfig, client: Arc<dyn ResourceClient>) -> Arc<Self> {
        let alloc = LogAllocator::new(
            Arc::clone(&client),
            config.region_size,
            config.chunk_size,
        );
        let victims = Arc::new(VictimCache::new(config.victim_count, config.victim_bytes));
        let stats = Arc::new(CacheStats::new(name));
        let limit = Arc::new(AtomicU64::new(config.limit_bytes));
        let evac = Evacuator::spawn(
            name,
            Arc::clone(&alloc),
            Arc::clone(&victims),
            Arc::clone(&limit),
            config.evac_interval,
        );

        // Wire the coordinator-initiated paths. Weak captures only: the
        // client must not keep the pool alive.
        let reclaim_evac = evac.handle();
        let limit_evac = evac.handle();
        let limit_push = Arc::clone(&limit);
        let stats_src = Arc::clone(&stats);
        let alloc_src = Arc::downgrade(&alloc);
        let limit_src = Arc::clone(&limit);
        let region_size = config.region_size as u64;
        client.install_handlers(ClientHandlers {
            reclaim: Box::new(move |bytes| {
                reclaim_evac.force_reclaim(bytes, Duration::from_secs(2))
            }),
            limit: Box::new(move |bytes| {
                limit_push.store(bytes, Ordering::Relaxed);
                limit_evac.wake();
            }),
            stats: Box::new(move || {
                let headroom = match alloc_src.upgrade() {
                    Some(alloc) => {
                        let limit = limit_src.load(Ordering::Relaxed);
                        (limit.saturating_sub(alloc.total_alive()) / region_size.max(1)) as u32
                    }
                    None => 0,
                };
                stats_src.to_stats_msg(headroom)
            }),
        });

        Arc::new(Self {
            name: name.to_string(),
            alloc,
            victims,
            stats,
            evac,
            limit,
            client,
            construct: RwLock::new(None),
            region_size: config.region_size,
        })
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current pool limit in bytes.
    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Live log bytes.
    pub fn live_bytes(&self) -> u64 {
        self.alloc.total_alive()
    }

    /// Regions currently held from the coordinator.
    pub fn region_count(&self) -> usize {
        self.alloc.region_count()
    }

    /// Pool statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Wire-format statistics snapshot, as a coordinator poll would see it.
    pub fn stats_msg(&self) -> StatsMsg {
        let headroom = self
            .limit()
            .saturating_sub(self.live_bytes())
            / self.region_size.max(1) as u64;
        self.stats.to_stats_msg(headroom as u32)
    }

    pub(crate) fn alloc_ref(&self) -> &Arc<LogAllocator> {
        &self.alloc
    }

    /// Allocate `size` payload bytes, returning a bound soft pointer.
    ///
    /// `None` means no region could be obtained; the evacuator is nudged so
    /// a retry after construct has a chance.
    pub fn alloc(&self, size: usize) -> Option<SoftPtr> {
        match self.alloc.alloc(size) {
            Some(ptr) => Some(ptr),
            None => {
                self.evac.wake();
                None
            }
        }
    }

    /// Allocate into an existing unbound pointer.
    pub fn alloc_to(&self, size: usize, dst: &SoftPtr) -> bool {
        let ok = self.alloc.alloc_to(size, dst);
        if !ok {
            self.evac.wake();
        }
        ok
    }

    /// Release a pointer and the object behind it.
    ///
    /// Returns whether a live object or victim entry was actually released.
    /// The slot is retired through the evacuator so a concurrent slot CAS
    /// can never touch freed memory.
    pub fn free(&self, ptr: SoftPtr) -> bool {
        let released = match self.alloc.release(&ptr) {
            FreeOutcome::Freed(_) => true,
            FreeOutcome::Victim(id) => {
                self.victims.remove(id);
                true
            }
            FreeOutcome::Null => false,
        };
        self.evac.retire_slot(ptr.into_slot());
        released
    }

    /// Copy the payload behind `ptr` out of the log.
    pub(crate) fn read(&self, ptr: &SoftPtr) -> ReadResult {
        self.alloc.read(ptr)
    }

    /// Update the pool limit, propagating it to the coordinator and the
    /// evacuator.
    pub fn update_limit(&self, bytes: u64) {
        self.limit.store(bytes, Ordering::Relaxed);
        self.client.update_limit(bytes);
        self.evac.wake();
    }

    /// Install the construct callback. Returns false if one is already
    /// installed; the callback is chosen once and never replaced.
    pub fn set_construct_func(&self, f: ConstructFn) -> bool {
        let mut slot = self.construct.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(f);
        true
    }

    /// Run the construct callback for a missed key, recording the miss
    /// penalty (elapsed nanoseconds and produced bytes).
    pub fn construct(&self, key: &[u8]) -> Option<Vec<u8>> {
        let guard = self.construct.read();
        let f = guard.as_ref()?;
        let start = Instant::now();
        let out = f(key);
        let nanos = start.elapsed().as_nanos() as u64;
        let bytes = out.as_ref().map(|v| v.len() as u64).unwrap_or(0);
        self.stats.record_miss_penalty(nanos, bytes);
        out
    }

    /// Synchronously demand that `bytes` of region memory be surrendered.
    /// Also the service path for a coordinator `ForceReclaim`.
    pub fn reclaim(&self, bytes: u64, timeout: Duration) -> bool {
        self.evac.force_reclaim(bytes, timeout)
    }
}

impl std::fmt::Debug for CachePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePool")
            .field("name", &self.name)
            .field("limit", &self.limit())
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}

/// Where a manager's pools get their memory from.
enum ClientMode {
    /// Anonymous mappings from an in-process budget.
    Local,
    /// A coordinator daemon at this socket path.
    Daemon(PathBuf),
}

/// Process-wide pool registry.
pub struct CacheManager {
    pools: Mutex<HashMap<String, Arc<CachePool>>>,
    defaults: PoolConfig,
    mode: ClientMode,
}

static GLOBAL: OnceLock<CacheManager> = OnceLock::new();

impl CacheManager {
    /// The process-wide manager (daemon-less), with its `default` pool.
    pub fn global() -> &'static CacheManager {
        GLOBAL.get_or_init(|| {
            let manager = CacheManager::new(PoolConfig::default());
            manager.create_pool(DEFAULT_POOL);
            manager
        })
    }

    /// A manager granting memory from in-process budgets.
    pub fn new(defaults: PoolConfig) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            defaults,
            mode: ClientMode::Local,
        }
    }

    /// A manager whose pools connect to the coordinator daemon.
    pub fn with_daemon(defaults: PoolConfig, socket: impl Into<PathBuf>) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            defaults,
            mode: ClientMode::Daemon(socket.into()),
        }
    }

    fn make_client(&self, limit: u64) -> Option<Arc<dyn ResourceClient>> {
        match &self.mode {
            ClientMode::Local => Some(LocalClient::new(limit)),
            ClientMode::Daemon(path) => match ShmClient::connect(path) {
                Ok(client) => {
                    client.update_limit(limit);
                    Some(client)
                }
                Err(err) => {
                    tracing::error!(%err, path = %path.display(), "coordinator connect failed");
                    None
                }
            },
        }
    }

    /// Create a pool with the manager's default configuration.
    ///
    /// Returns false if the name is taken (or the coordinator refused the
    /// connection).
    pub fn create_pool(&self, name: &str) -> bool {
        self.create_pool_with(name, self.defaults.clone())
    }

    /// Create a pool with an explicit configuration.
    pub fn create_pool_with(&self, name: &str, config: PoolConfig) -> bool {
        let mut pools = self.pools.lock();
        if pools.contains_key(name) {
            return false;
        }
        let Some(client) = self.make_client(config.limit_bytes) else {
            return false;
        };
        let pool = CachePool::new(name, &config, client);
        tracing::info!(
            pool = name,
            limit = config.limit_bytes,
            region = config.region_size,
            "pool created"
        );
        pools.insert(name.to_string(), pool);
        true
    }

    /// Look up a pool by name.
    pub fn get_pool(&self, name: &str) -> Option<Arc<CachePool>> {
        self.pools.lock().get(name).cloned()
    }

    /// Delete a pool.
    ///
    /// Fails with [`CacheError::PoolBusy`] while anything else still holds
    /// the pool (soft pointers into a pool keep their owner alive, so a
    /// reachable pointer implies a reachable pool).
    pub fn delete_pool(&self, name: &str) -> CacheResult<()> {
        let mut pools = self.pools.lock();
        let pool = pools.get(name).ok_or(CacheError::KeyNotFound)?;
        if Arc::strong_count(pool) > 1 {
            return Err(CacheError::PoolBusy);
        }
        pools.remove(name);
        Ok(())
    }

    /// Apply a configuration file: create missing pools, retarget limits of
    /// existing ones.
    pub fn apply_config(&self, config: &CacheConfig) {
        for (name, entry) in &config.pools {
            if let Some(pool) = self.get_pool(name) {
                pool.update_limit(entry.limit_bytes());
            } else {
                self.create_pool_with(name, entry.pool_config(&self.defaults));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(limit: u64) -> PoolConfig {
        PoolConfig {
            limit_bytes: limit,
            region_size: 256 * 1024,
            chunk_size: 64 * 1024,
            victim_count: 1024,
            victim_bytes: 1 << 20,
            evac_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_pool_alloc_free_roundtrip() {
        let manager = CacheManager::new(small_config(1 << 20));
        assert!(manager.create_pool("p"));
        let pool = manager.get_pool("p").unwrap();

        let ptr = pool.alloc(128).unwrap();
        assert!(pool.live_bytes() >= 128);
        assert!(pool.free(ptr));
        assert_eq!(pool.live_bytes(), 0);

        let ptr = SoftPtr::null();
        assert!(!pool.free(ptr));
    }

    #[test]
    fn test_create_pool_duplicate_fails() {
        let manager = CacheManager::new(small_config(1 << 20));
        assert!(manager.create_pool("p"));
        assert!(!manager.create_pool("p"));
    }

    #[test]
    fn test_delete_pool_busy_then_ok() {
        let manager = CacheManager::new(small_config(1 << 20));
        manager.create_pool("p");
        let pool = manager.get_pool("p").unwrap();
        assert_eq!(manager.delete_pool("p"), Err(CacheError::PoolBusy));
        drop(pool);
        assert_eq!(manager.delete_pool("p"), Ok(()));
        assert_eq!(manager.delete_pool("p"), Err(CacheError::KeyNotFound));
    }

    #[test]
    fn test_construct_records_penalty() {
        let manager = CacheManager::new(small_config(1 << 20));
        manager.create_pool("p");
        let pool = manager.get_pool("p").unwrap();

        assert!(pool.construct(b"k").is_none());
        assert!(pool.set_construct_func(Box::new(|key| Some(key.to_vec()))));
        assert!(!pool.set_construct_func(Box::new(|_| None)));

        let out = pool.construct(b"hello").unwrap();
        assert_eq!(out, b"hello");
        let snap = pool.stats().snapshot();
        assert_eq!(snap.miss_bytes, 5);
    }

    #[test]
    fn test_update_limit_reaches_evacuator() {
        let manager = CacheManager::new(small_config(1 << 20));
        manager.create_pool("p");
        let pool = manager.get_pool("p").unwrap();
        pool.update_limit(64 * 1024);
        assert_eq!(pool.limit(), 64 * 1024);
    }

    #[test]
    fn test_apply_config() {
        let manager = CacheManager::new(small_config(1 << 20));
        let raw = r#"{"a": 1, "b": 2}"#;
        let config: CacheConfig = serde_json::from_str(raw).unwrap();
        manager.apply_config(&config);
        assert_eq!(manager.get_pool("a").unwrap().limit(), 1 << 20);
        assert_eq!(manager.get_pool("b").unwrap().limit(), 2 << 20);

        // Re-applying retargets limits instead of failing.
        let config: CacheConfig = serde_json::from_str(r#"{"a": 3}"#).unwrap();
        manager.apply_config(&config);
        assert_eq!(manager.get_pool("a").unwrap().limit(), 3 << 20);
    }

    #[test]
    fn test_global_has_default_pool() {
        let manager = CacheManager::global();
        assert!(manager.get_pool(DEFAULT_POOL).is_some());
        assert!(!manager.create_pool(DEFAULT_POOL));
    }

    #[test]
    fn test_stats_msg_headroom() {
        let manager = CacheManager::new(small_config(1 << 20));
        manager.create_pool("p");
        let pool = manager.get_pool("p").unwrap();
        // Empty pool: full limit of headroom, in regions.
        assert_eq!(pool.stats_msg().headroom, (1 << 20) / (256 * 1024));
    }
}
