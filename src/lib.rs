//! softcache: a soft-memory cache runtime.
//!
//! Applications store best-effort data in memory whose size an external
//! coordinator controls and may withdraw at any moment. When capacity goes
//! away, objects are evicted rather than swapped: readers observe a *miss*
//! instead of a page fault and recompute the value through a per-pool
//! construct callback.
//!
//! ```text
//!                  +---------------------------+
//!                  |          SyncKV           |
//!                  |  (bucket-locked chains)   |
//!                  +------------+--------------+
//!                               | soft pointers
//!                               v
//!  +-----------+     +---------------------+     +--------------+
//!  | Victim    |<----|    CachePool        |---->|  Evacuator   |
//!  | cache     |     | stats / construct   |     | age/compact/ |
//!  +-----------+     +---------+-----------+     | reclaim      |
//!                              |                 +------+-------+
//!                              v                        |
//!                    +-----------------+                |
//!                    |  LogAllocator   |<---------------+
//!                    | chunks in       |
//!                    | regions         |
//!                    +--------+--------+
//!                             | alloc/free regions
//!                             v
//!                    +-----------------+      32-byte CtrlMsg
//!                    | ResourceClient  |<---------------------> coordinator
//!                    +-----------------+
//! ```
//!
//! # Example
//!
//! ```no_run
//! use softcache::{CacheManager, SyncKV};
//!
//! let manager = CacheManager::global();
//! manager.create_pool("images");
//! let pool = manager.get_pool("images").unwrap();
//! pool.update_limit(64 << 20);
//! pool.set_construct_func(Box::new(|key| Some(key.to_vec())));
//!
//! let kv = SyncKV::new(pool);
//! kv.set(b"k", b"v");
//! assert_eq!(kv.get(b"k").unwrap(), b"v");
//! ```
//!
//! The cache layer never raises for misses: soft-pointer faults surface as
//! `None` / `false` on the hot path, and [`CacheError`] covers only the
//! synchronous failures a caller can act on.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod ctrl;
mod error;
mod evacuator;
mod kv;
mod log;
mod object;
mod pool;
mod region;
mod stats;
mod victim;

pub use config::{CacheConfig, PoolDetail, PoolEntry};
pub use ctrl::{
    region_name, CtrlMsg, CtrlOpCode, CtrlRetCode, MemMsg, MemPayload, StatsMsg, CTRL_MSG_SIZE,
};
pub use error::{CacheError, CacheResult};
pub use kv::{SyncKV, UpdateType};
pub use object::SoftPtr;
pub use pool::{CacheManager, CachePool, ConstructFn, PoolConfig, DEFAULT_POOL};
pub use region::{ClientHandlers, LocalClient, RegionHandle, ResourceClient, ShmClient};
pub use stats::{CacheStats, StatsSnapshot, REPORT_INTERVAL};
pub use victim::VictimCache;
