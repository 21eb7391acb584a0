//! Memory regions and the coordinator resource client.
//!
//! A region is a contiguous address range granted by the external memory
//! coordinator. [`RegionHandle`] owns one mapping and unmaps it on drop.
//! [`ResourceClient`] is the seam between the runtime and the coordinator:
//! [`ShmClient`] speaks the real wire protocol over a Unix socket and maps
//! named shared regions, while [`LocalClient`] grants anonymous mappings from
//! an in-process budget (used by tests and daemon-less deployments).

use crate::ctrl::{
    region_name, CtrlMsg, CtrlOpCode, CtrlRetCode, MemMsg, MemPayload, StatsMsg, CTRL_MSG_SIZE,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::CString;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// How long a request waits for the coordinator before giving up.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// A mapped memory region.
///
/// The handle owns the mapping; dropping it unmaps the range. Shared regions
/// created by this process also unlink their shm name on drop.
pub struct RegionHandle {
    ptr: NonNull<u8>,
    size: usize,
    /// Set when this process created the shm object and must unlink it.
    owned_name: Option<CString>,
}

// SAFETY: the handle is raw memory with a stable address; all object-level
// synchronization happens through atomics stored inside the region.
unsafe impl Send for RegionHandle {}
unsafe impl Sync for RegionHandle {}

impl RegionHandle {
    /// Map an anonymous region of `size` bytes.
    pub fn map_anon(size: usize) -> io::Result<Self> {
        // SAFETY: requesting a fresh private mapping from the kernel; the
        // result is checked before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned null"),
            size,
            owned_name: None,
        })
    }

    /// Map a named shared region, e.g. `region-{pid}-{rid}`.
    ///
    /// With `create` set the shm object is created (and sized); otherwise an
    /// existing object published by the coordinator is opened.
    pub fn map_named(name: &str, size: usize, create: bool) -> io::Result<Self> {
        let cname = CString::new(name).map_err(|_| io::ErrorKind::InvalidInput)?;
        let oflag = if create {
            libc::O_RDWR | libc::O_CREAT
        } else {
            libc::O_RDWR
        };
        // SAFETY: cname is a valid NUL-terminated string; fd is checked and
        // closed below on every path.
        unsafe {
            let fd = libc::shm_open(cname.as_ptr(), oflag, 0o600);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            if create && libc::ftruncate(fd, size as libc::off_t) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
                return Err(err);
            }
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if ptr == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                if create {
                    libc::shm_unlink(cname.as_ptr());
                }
                return Err(err);
            }
            Ok(Self {
                ptr: NonNull::new(ptr as *mut u8).expect("mmap returned null"),
                size,
                owned_name: create.then_some(cname),
            })
        }
    }

    /// Base address of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Base address as an integer.
    #[inline]
    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Size of the mapping in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `addr` falls inside the mapping.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base() && addr < self.base() + self.size as u64
    }
}

impl Drop for RegionHandle {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from a successful mmap and are unmapped
        // exactly once.
        unsafe {
            let rc = libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            debug_assert_eq!(rc, 0, "munmap failed");
            if let Some(name) = &self.owned_name {
                libc::shm_unlink(name.as_ptr());
            }
        }
    }
}

/// Callbacks installed by the pool so the client can service
/// coordinator-initiated traffic.
pub struct ClientHandlers {
    /// Surrender at least the given number of bytes; returns whether the
    /// target was met in time.
    pub reclaim: Box<dyn Fn(u64) -> bool + Send + Sync>,
    /// Apply a coordinator-pushed limit.
    pub limit: Box<dyn Fn(u64) + Send + Sync>,
    /// Produce a statistics snapshot for `ProfStats`.
    pub stats: Box<dyn Fn() -> StatsMsg + Send + Sync>,
}

/// The runtime's view of the memory coordinator.
///
/// Implementations must be cheap to share; every pool holds one behind an
/// `Arc`. Test doubles inject their own implementation.
pub trait ResourceClient: Send + Sync {
    /// Request a region of `size` bytes. Overcommit requests may be rejected;
    /// rejection returns `None` and is not an error.
    fn alloc_region(&self, size: usize, overcommit: bool) -> Option<(i64, RegionHandle)>;

    /// Return a region to the coordinator.
    fn free_region(&self, id: i64);

    /// Propagate a new pool limit to the coordinator.
    fn update_limit(&self, bytes: u64);

    /// Install the pool-side handlers for coordinator-initiated messages.
    fn install_handlers(&self, handlers: ClientHandlers);
}

/// In-process resource client granting anonymous mappings from a budget.
///
/// Grant rule: a plain request is honored while used bytes are strictly under
/// the budget (one region of overshoot is tolerated, matching the pool's
/// steady-state invariant); an overcommit request is additionally allowed one
/// region past the budget.
pub struct LocalClient {
    budget: AtomicU64,
    used: AtomicU64,
    next_id: AtomicU64,
    granted: Mutex<HashMap<i64, usize>>,
    handlers: RwLock<Option<ClientHandlers>>,
}

impl LocalClient {
    /// Create a client with the given byte budget.
    pub fn new(budget: u64) -> Arc<Self> {
        Arc::new(Self {
            budget: AtomicU64::new(budget),
            used: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            granted: Mutex::new(HashMap::new()),
            handlers: RwLock::new(None),
        })
    }

    /// Bytes currently granted.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Inject a coordinator-style forced reclamation of `bytes`.
    ///
    /// Returns whether the installed handler reported success; `false` when
    /// no handler is installed.
    pub fn force_reclaim(&self, bytes: u64) -> bool {
        let handlers = self.handlers.read();
        match handlers.as_ref() {
            Some(h) => (h.reclaim)(bytes),
            None => false,
        }
    }

    /// Inject a coordinator-style limit update.
    pub fn push_limit(&self, bytes: u64) {
        self.budget.store(bytes, Ordering::Relaxed);
        if let Some(h) = self.handlers.read().as_ref() {
            (h.limit)(bytes);
        }
    }

    /// Read the stats snapshot the way a coordinator poll would.
    pub fn poll_stats(&self) -> StatsMsg {
        self.handlers
            .read()
            .as_ref()
            .map(|h| (h.stats)())
            .unwrap_or_default()
    }
}

impl ResourceClient for LocalClient {
    fn alloc_region(&self, size: usize, overcommit: bool) -> Option<(i64, RegionHandle)> {
        let budget = self.budget.load(Ordering::Relaxed);
        let headroom = if overcommit {
            budget.saturating_add(size as u64)
        } else {
            budget
        };
        // Serialize grant decisions so used-vs-budget stays consistent.
        let mut granted = self.granted.lock();
        if self.used.load(Ordering::Relaxed) >= headroom {
            return None;
        }
        let handle = match RegionHandle::map_anon(size) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(size, %err, "anonymous region mapping failed");
                return None;
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) as i64;
        granted.insert(id, size);
        self.used.fetch_add(size as u64, Ordering::Relaxed);
        Some((id, handle))
    }

    fn free_region(&self, id: i64) {
        if let Some(size) = self.granted.lock().remove(&id) {
            self.used.fetch_sub(size as u64, Ordering::Relaxed);
        }
    }

    fn update_limit(&self, bytes: u64) {
        self.budget.store(bytes, Ordering::Relaxed);
    }

    fn install_handlers(&self, handlers: ClientHandlers) {
        *self.handlers.write() = Some(handlers);
    }
}

struct ShmClientInner {
    writer: Mutex<UnixStream>,
    pending: Mutex<HashMap<u64, mpsc::SyncSender<CtrlMsg>>>,
    handlers: RwLock<Option<ClientHandlers>>,
    shutdown: AtomicBool,
}

impl ShmClientInner {
    fn send(&self, msg: &CtrlMsg) -> io::Result<()> {
        self.writer.lock().write_all(&msg.encode())
    }

    fn send_stats(&self, stats: &StatsMsg) -> io::Result<()> {
        self.writer.lock().write_all(&stats.encode())
    }

    /// Issue a request and wait for its correlated reply.
    fn request(&self, msg: CtrlMsg) -> Option<CtrlMsg> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.pending.lock().insert(msg.id, tx);
        if let Err(err) = self.send(&msg) {
            self.pending.lock().remove(&msg.id);
            tracing::warn!(%err, op = ?msg.op, "control-plane send failed");
            return None;
        }
        let reply = rx.recv_timeout(RPC_TIMEOUT).ok();
        self.pending.lock().remove(&msg.id);
        if reply.is_none() {
            tracing::warn!(op = ?msg.op, "control-plane request timed out");
        }
        reply
    }

    /// Reader loop: route replies to waiters, service daemon-initiated ops.
    fn run_reader(&self, mut stream: UnixStream) {
        let mut frame = [0u8; CTRL_MSG_SIZE];
        while !self.shutdown.load(Ordering::Acquire) {
            if stream.read_exact(&mut frame).is_err() {
                break;
            }
            let Some(msg) = CtrlMsg::decode(&frame) else {
                tracing::warn!("undecodable control-plane frame, dropping");
                continue;
            };
            match msg.op {
                CtrlOpCode::ForceReclaim => {
                    let bytes = match msg.mmsg.payload {
                        MemPayload::Size(size) => size,
                        _ => 0,
                    };
                    let ok = self
                        .handlers
                        .read()
                        .as_ref()
                        .map(|h| (h.reclaim)(bytes))
                        .unwrap_or(false);
                    let reply = CtrlMsg {
                        id: msg.id,
                        op: CtrlOpCode::ForceReclaim,
                        ret: if ok {
                            CtrlRetCode::MemSucc
                        } else {
                            CtrlRetCode::MemFail
                        },
                        mmsg: MemMsg::empty(),
                    };
                    let _ = self.send(&reply);
                }
                CtrlOpCode::UpdLimit => {
                    if let MemPayload::Size(bytes) = msg.mmsg.payload {
                        if let Some(h) = self.handlers.read().as_ref() {
                            (h.limit)(bytes);
                        }
                    }
                    let reply = CtrlMsg {
                        id: msg.id,
                        op: CtrlOpCode::UpdLimit,
                        ret: CtrlRetCode::MemSucc,
                        mmsg: MemMsg::empty(),
                    };
                    let _ = self.send(&reply);
                }
                CtrlOpCode::ProfStats => {
                    let stats = self
                        .handlers
                        .read()
                        .as_ref()
                        .map(|h| (h.stats)())
                        .unwrap_or_default();
                    let _ = self.send_stats(&stats);
                }
                _ => {
                    let tx = self.pending.lock().remove(&msg.id);
                    if let Some(tx) = tx {
                        let _ = tx.try_send(msg);
                    } else {
                        tracing::debug!(id = msg.id, op = ?msg.op, "unmatched reply");
                    }
                }
            }
        }
    }
}

/// Resource client speaking the coordinator wire protocol over a Unix socket.
///
/// Granted regions are mapped by their shared name `region-{pid}-{rid}`.
/// Daemon-initiated messages (`ForceReclaim`, `UpdLimit`, `ProfStats`) are
/// serviced by a dedicated reader thread.
pub struct ShmClient {
    inner: Arc<ShmClientInner>,
    next_id: AtomicU64,
    pid: u32,
}

impl ShmClient {
    /// Connect and perform the `Connect` handshake.
    ///
    /// A handshake failure is fatal: steady state can degrade to
    /// out-of-memory, but a client that never connected has no coordinator
    /// to degrade against.
    pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<Arc<Self>> {
        let mut stream = UnixStream::connect(path)?;

        let hello = CtrlMsg::request(0, CtrlOpCode::Connect, MemMsg::empty());
        stream.write_all(&hello.encode())?;
        let mut frame = [0u8; CTRL_MSG_SIZE];
        stream.read_exact(&mut frame)?;
        let reply = CtrlMsg::decode(&frame)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad connect reply"))?;
        if reply.ret != CtrlRetCode::ConnSucc {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "coordinator rejected connection",
            ));
        }

        let reader = stream.try_clone()?;
        let inner = Arc::new(ShmClientInner {
            writer: Mutex::new(stream),
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(None),
            shutdown: AtomicBool::new(false),
        });
        let inner2 = Arc::clone(&inner);
        std::thread::Builder::new()
            .name("softcache-ctrl".into())
            .spawn(move || inner2.run_reader(reader))
            .expect("failed to spawn control-plane reader");

        Ok(Arc::new(Self {
            inner,
            next_id: AtomicU64::new(1),
            pid: std::process::id(),
        }))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Advertise this client's reclamation weight; heavier clients are asked
    /// to surrender memory first.
    pub fn set_weight(&self, weight: f32) {
        let msg = CtrlMsg::request(
            self.next_id(),
            CtrlOpCode::SetWeight,
            MemMsg {
                region_id: -1,
                payload: MemPayload::Weight(weight),
            },
        );
        let _ = self.inner.request(msg);
    }

    /// Advertise latency criticality; critical clients are reclaimed last.
    pub fn set_lat_critical(&self, critical: bool) {
        let msg = CtrlMsg::request(
            self.next_id(),
            CtrlOpCode::SetLatCritical,
            MemMsg {
                region_id: -1,
                payload: MemPayload::LatCritical(critical),
            },
        );
        let _ = self.inner.request(msg);
    }
}

impl ResourceClient for ShmClient {
    fn alloc_region(&self, size: usize, overcommit: bool) -> Option<(i64, RegionHandle)> {
        let op = if overcommit {
            CtrlOpCode::Overcommit
        } else {
            CtrlOpCode::Alloc
        };
        let msg = CtrlMsg::request(
            self.next_id(),
            op,
            MemMsg {
                region_id: -1,
                payload: MemPayload::Size(size as u64),
            },
        );
        let reply = self.inner.request(msg)?;
        // Older coordinators acknowledge grants with ConnSucc.
        if !matches!(reply.ret, CtrlRetCode::MemSucc | CtrlRetCode::ConnSucc) {
            return None;
        }
        let rid = reply.mmsg.region_id;
        match RegionHandle::map_named(&region_name(self.pid, rid), size, false) {
            Ok(handle) => Some((rid, handle)),
            Err(err) => {
                tracing::error!(rid, %err, "granted region could not be mapped");
                None
            }
        }
    }

    fn free_region(&self, id: i64) {
        // Fire-and-forget: frees happen on the evacuator thread, which must
        // not wait on the reader thread (the reader may itself be waiting on
        // the evacuator while servicing a ForceReclaim). The daemon's reply
        // drains as an unmatched frame.
        let msg = CtrlMsg::request(
            self.next_id(),
            CtrlOpCode::Free,
            MemMsg {
                region_id: id,
                payload: MemPayload::None,
            },
        );
        if let Err(err) = self.inner.send(&msg) {
            tracing::warn!(id, %err, "region free not delivered");
        }
    }

    fn update_limit(&self, bytes: u64) {
        let msg = CtrlMsg::request(
            self.next_id(),
            CtrlOpCode::UpdLimitReq,
            MemMsg {
                region_id: -1,
                payload: MemPayload::Size(bytes),
            },
        );
        let _ = self.inner.request(msg);
    }

    fn install_handlers(&self, handlers: ClientHandlers) {
        *self.inner.handlers.write() = Some(handlers);
    }
}

impl Drop for ShmClient {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let bye = CtrlMsg::request(self.next_id(), CtrlOpCode::Disconnect, MemMsg::empty());
        let _ = self.inner.send(&bye);
        let _ = self
            .inner
            .writer
            .lock()
            .shutdown(std::net::Shutdown::Both);
    }
}
