//! Ring-buffer creation inside the traced process.
//!
//! Rings are created in bulk while the session arms, one per slot of
//! the thread pool, and only claimed (never created) from the trace hot
//! path. Real sessions back every ring with a POSIX shared-memory
//! object that the recorder maps read-write from the other side; tests
//! back rings with plain heap memory and drain them in-process. Both
//! implement [`RingBacking`]; the producer logic is identical.

use crate::error::McountError;
use fgtrace_format::ring::{ring_total_size, RingConsumer, RingHeader, RingProducer};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::os::fd::AsRawFd;
use std::sync::Arc;

/// One mapped ring, owned by its producer thread.
pub struct RingMapping {
    base: *mut u8,
    total: usize,
    /// Name of the backing shared-memory object, if any.
    pub shm_name: Option<String>,
    _heap: Option<Arc<HeapMem>>,
}

unsafe impl Send for RingMapping {}

impl RingMapping {
    pub fn producer(&self) -> Result<RingProducer, McountError> {
        Ok(unsafe { RingProducer::new(self.base) }?)
    }
}

impl Drop for RingMapping {
    fn drop(&mut self) {
        if self._heap.is_none() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.total);
            }
        }
    }
}

/// Allocates ring slots ahead of time. Called only while the session
/// arms (and again from the fork handler); never from the trampolines.
pub trait RingBacking: Send + Sync {
    fn create(&self, slot: u32) -> Result<RingMapping, McountError>;
}

impl<B: RingBacking> RingBacking for Arc<B> {
    fn create(&self, slot: u32) -> Result<RingMapping, McountError> {
        (**self).create(slot)
    }
}

/// Shared-memory backing used by real sessions. Names carry the
/// creating pid so a forked child's fresh slots never collide with the
/// parent's.
pub struct ShmBacking {
    pub session: String,
    pub capacity: u32,
}

impl RingBacking for ShmBacking {
    fn create(&self, slot: u32) -> Result<RingMapping, McountError> {
        let name = fgtrace_format::shm_name(&self.session, std::process::id(), slot);
        let total = ring_total_size(self.capacity);

        let fd = nix::sys::mman::shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(McountError::RingSetup)?;
        nix::unistd::ftruncate(&fd, total as i64).map_err(McountError::RingSetup)?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let _ = nix::sys::mman::shm_unlink(name.as_str());
            return Err(McountError::RingSetup(nix::Error::last()));
        }
        let base = base as *mut u8;
        // The owning thread id is stamped at claim time.
        unsafe { RingHeader::init(base, self.capacity, 0) };

        Ok(RingMapping {
            base,
            total,
            shm_name: Some(name),
            _heap: None,
        })
    }
}

/// Heap storage shared between a test producer and consumer.
pub struct HeapMem {
    buf: UnsafeCell<Box<[u64]>>,
}

unsafe impl Send for HeapMem {}
unsafe impl Sync for HeapMem {}

impl HeapMem {
    fn base(&self) -> *mut u8 {
        unsafe { (*self.buf.get()).as_mut_ptr() as *mut u8 }
    }
}

/// In-process backing for tests: every created ring is registered so the
/// test can attach a consumer to it.
pub struct HeapBacking {
    capacity: u32,
    rings: Mutex<Vec<(u32, Arc<HeapMem>)>>,
}

impl HeapBacking {
    pub fn new(capacity: u32) -> Self {
        HeapBacking {
            capacity,
            rings: Mutex::new(Vec::new()),
        }
    }

    /// Attach a consumer to the ring whose header carries `tid`. Slots
    /// are created with the slot index as a placeholder id, so tests can
    /// also look rings up before they are claimed.
    pub fn consumer(&self, tid: u32) -> Option<RingConsumer> {
        let rings = self.rings.lock();
        for (_, mem) in rings.iter() {
            let consumer = unsafe { RingConsumer::new(mem.base()) }.ok()?;
            if consumer.tid() == tid {
                return Some(consumer);
            }
        }
        None
    }

    pub fn slots(&self) -> Vec<u32> {
        self.rings.lock().iter().map(|(s, _)| *s).collect()
    }
}

impl RingBacking for HeapBacking {
    fn create(&self, slot: u32) -> Result<RingMapping, McountError> {
        let total = ring_total_size(self.capacity);
        let mem = Arc::new(HeapMem {
            buf: UnsafeCell::new(vec![0u64; total / 8].into_boxed_slice()),
        });
        let base = mem.base();
        unsafe { RingHeader::init(base, self.capacity, slot) };
        self.rings.lock().push((slot, mem.clone()));
        Ok(RingMapping {
            base,
            total,
            shm_name: None,
            _heap: Some(mem),
        })
    }
}
