//! Per-thread engine state, its preallocated pool and the thread-local
//! plumbing.
//!
//! Everything a thread needs to trace — shadow stack, ring mapping,
//! dynamic trigger state — is built up front while the session arms,
//! one [`TraceThread`] per pool slot, and the rings are announced to
//! the recorder at the same time. A thread's first instrumented call
//! only *claims* a slot: one atomic counter bump, one `gettid`, one
//! store of the id into the ring header. No allocation, no locks, no
//! syscalls beyond `gettid` ever happen on the trampoline path.
//!
//! Teardown runs from the thread-local destructor (ordinary thread-exit
//! context, not the trampoline): it restores any return addresses still
//! pointing at the trampoline so code running after teardown returns
//! natively, balances the record stream and tells the recorder the
//! thread is gone.

use crate::filter::DynamicState;
use crate::ring::RingMapping;
use crate::session::Session;
use crate::shadow_stack::{FrameFlags, ShadowStack};
use fgtrace_format::record::{LostReason, Record};
use fgtrace_format::ring::RingProducer;
use fgtrace_format::wire::Message;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub struct TraceThread {
    /// Stamped at claim time; zero while the slot sits in the pool.
    pub tid: u32,
    pub session: &'static Session,
    pub stack: ShadowStack,
    pub dynamic: DynamicState,
    /// Number of recorded frames currently live; the next recorded entry
    /// gets this as its stream depth.
    pub record_depth: u16,
    pub producer: RingProducer,
    mapping: RingMapping,
    /// Last timestamp handed out; timestamps are strictly monotonic per
    /// thread.
    pub last_time: u64,
    /// Records dropped on the floor since the last `lost` record made it
    /// into the ring.
    pub ring_lost: u32,
    /// Entries refused because the shadow stack hit its cap.
    pub overflow: u32,
    /// Lowest stack index holding a deferred entry record, if any.
    pub deferred_from: Option<usize>,
    torn_down: bool,
}

impl TraceThread {
    /// Build one pool slot. Runs while the session arms, never on the
    /// trampoline path, so allocation and syscalls are fine here.
    fn new(session: &'static Session, slot: u32) -> Result<Box<Self>, crate::McountError> {
        let mapping = session.ring_backing().create(slot)?;
        let producer = mapping.producer()?;
        Ok(Box::new(TraceThread {
            tid: 0,
            session,
            stack: ShadowStack::new(session.max_stack()),
            dynamic: session.initial_dynamic(),
            record_depth: 0,
            producer,
            mapping,
            last_time: 0,
            ring_lost: 0,
            overflow: 0,
            deferred_from: None,
            torn_down: false,
        }))
    }

    /// Attach a pool slot to the calling thread: record the thread id
    /// and stamp it into the ring header so the recorder can tell whose
    /// stream this is.
    fn bind_current(&mut self) {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u32;
        self.tid = tid;
        self.producer.set_tid(tid);
    }

    /// A fresh, strictly increasing timestamp.
    pub fn tick(&mut self) -> u64 {
        let mut t = self.session.now();
        if t <= self.last_time {
            t = self.last_time + 1;
        }
        self.last_time = t;
        t
    }

    /// Push encoded record bytes, preceded by any pending `lost` marker.
    /// Never blocks; failed pushes are counted and reported later.
    pub fn emit(&mut self, now: u64, bytes: &[u8]) {
        if self.ring_lost > 0 {
            let depth = self.record_depth.min(255) as u8;
            let lost = Record::lost(now, LostReason::RingFull, self.ring_lost as u64, depth);
            if !self.producer.push(&lost.encode()) {
                self.ring_lost += 1;
                return;
            }
            self.ring_lost = 0;
        }
        if !self.producer.push(bytes) {
            self.ring_lost += 1;
        }
    }

    /// Restore patched return slots and balance the record stream, then
    /// hand the ring to the consumer for its final drain.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let now = self.tick();
        while let Some(frame) = self.stack.pop() {
            if !frame.parent_loc.is_null() {
                unsafe { *frame.parent_loc = frame.parent_addr };
            }
            // Deferred entries die with the frame; recorded ones get a
            // synthetic exit so every tid's stream stays balanced.
            if frame.is_recorded() && !frame.is_deferred() {
                self.record_depth = self.record_depth.saturating_sub(1);
                let rec = Record::exit(
                    now,
                    frame.child_addr as u64,
                    frame.record_depth.min(255) as u8,
                );
                self.emit(now, &rec.encode());
            }
        }
        if self.overflow > 0 {
            let lost = Record::lost(now, LostReason::StackOverflow, self.overflow as u64, 0);
            self.emit(now, &lost.encode());
            self.overflow = 0;
        }

        self.producer.mark_done();
        self.session.notify(&Message::TaskEnd { tid: self.tid });

        // Give the consumer a bounded window to catch up; overrun is
        // counted, not waited out.
        let deadline = self.session.flush_deadline();
        let step = Duration::from_millis(2);
        let mut waited = Duration::ZERO;
        while !self.producer.is_drained() && waited < deadline {
            std::thread::sleep(step);
            waited += step;
        }
    }

    /// In the forked child: take over a freshly created slot's ring and
    /// give the stale one (shared with the parent's recorder) back to it
    /// without flushing a single byte.
    fn adopt_fresh_ring(&mut self, fresh: Box<TraceThread>) {
        let mut fresh = fresh;
        std::mem::swap(&mut self.mapping, &mut fresh.mapping);
        std::mem::swap(&mut self.producer, &mut fresh.producer);
        // `fresh` now holds the parent-shared ring; silence its
        // teardown so dropping it only unmaps the child's view.
        fresh.torn_down = true;
        drop(fresh);

        self.ring_lost = 0;
        self.overflow = 0;
        self.deferred_from = None;
        self.torn_down = false;
        self.bind_current();
    }

    /// True while a signal-boundary frame is on the stack.
    pub fn in_signal_handler(&self) -> bool {
        self.stack
            .frames()
            .iter()
            .any(|f| f.flags.contains(FrameFlags::SIGNAL_BOUNDARY))
    }
}

impl Drop for TraceThread {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct PoolSlot {
    thread: UnsafeCell<Option<Box<TraceThread>>>,
}

// Each slot index is handed out exactly once by the `next` counter, and
// fill/refill only run while no thread can claim (session arming, fork
// child before any traced call), so slot contents are never shared.
unsafe impl Sync for PoolSlot {}

/// The preallocated per-thread state pool, sized while the session arms.
///
/// Claiming is wait-free: one `fetch_add` on the slot cursor. A program
/// with more threads than slots keeps running untraced on the overflow
/// threads; the refusals are counted and reported at teardown.
pub struct ThreadPool {
    slots: Box<[PoolSlot]>,
    next: AtomicUsize,
    exhausted: AtomicU32,
}

impl ThreadPool {
    pub fn with_capacity(capacity: usize) -> ThreadPool {
        let slots = (0..capacity)
            .map(|_| PoolSlot {
                thread: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ThreadPool {
            slots,
            next: AtomicUsize::new(0),
            exhausted: AtomicU32::new(0),
        }
    }

    /// Build every slot's thread state and announce its ring to the
    /// recorder. Runs once while the session arms, before any thread
    /// can reach the trampolines.
    pub fn fill(&self, session: &'static Session) {
        for (slot, entry) in self.slots.iter().enumerate() {
            match TraceThread::new(session, slot as u32) {
                Ok(thread) => {
                    if let Some(shm) = &thread.mapping.shm_name {
                        session.notify(&Message::RingReady {
                            slot: slot as u32,
                            shm: shm.clone(),
                        });
                    }
                    unsafe { *entry.thread.get() = Some(thread) };
                }
                Err(err) => {
                    log::warn!("ring slot {slot} unavailable: {err}");
                }
            }
        }
    }

    fn take_slot(&self) -> Option<Box<TraceThread>> {
        let index = self.next.fetch_add(1, Ordering::AcqRel);
        self.slots
            .get(index)
            .and_then(|slot| unsafe { (*slot.thread.get()).take() })
    }

    /// Claim the next free slot. Wait-free; returns `None` (and counts
    /// the refusal) when the pool is spent.
    pub fn claim(&self) -> Option<Box<TraceThread>> {
        let taken = self.take_slot();
        if taken.is_none() {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }

    /// Threads that found the pool empty on their first traced call.
    pub fn exhausted(&self) -> u32 {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// At session teardown: mark every ring that was never claimed as
    /// done so the consumer can close it without waiting out the drain
    /// deadline. Goes through the same cursor as `claim`, so a late
    /// thread racing us simply finds the pool spent.
    pub fn retire_unclaimed(&self) {
        while let Some(mut thread) = self.take_slot() {
            thread.torn_down = true;
            thread.producer.mark_done();
        }
    }

    /// In the forked child: throw away every inherited slot (their
    /// rings belong to the parent's recorder view) and rebuild the pool
    /// with rings named after the child. Single-threaded by definition.
    pub fn refill_after_fork(&self, session: &'static Session) {
        for (slot, entry) in self.slots.iter().enumerate() {
            let stale = unsafe { (*entry.thread.get()).take() };
            if let Some(mut stale) = stale {
                // Unmap only; never flush parent-owned rings from here.
                stale.torn_down = true;
                drop(stale);
            }
            match TraceThread::new(session, slot as u32) {
                Ok(thread) => {
                    if let Some(shm) = &thread.mapping.shm_name {
                        session.notify(&Message::RingReady {
                            slot: slot as u32,
                            shm: shm.clone(),
                        });
                    }
                    unsafe { *entry.thread.get() = Some(thread) };
                }
                Err(err) => {
                    log::warn!("ring slot {slot} unavailable after fork: {err}");
                }
            }
        }
        self.next.store(0, Ordering::Release);
        self.exhausted.store(0, Ordering::Relaxed);
    }
}

thread_local! {
    static THREAD: RefCell<Option<Box<TraceThread>>> = const { RefCell::new(None) };
    static IN_ENGINE: Cell<bool> = const { Cell::new(false) };
}

struct EngineGuard;

impl EngineGuard {
    fn enter() -> Option<EngineGuard> {
        IN_ENGINE
            .try_with(|flag| {
                if flag.get() {
                    None
                } else {
                    flag.set(true);
                    Some(EngineGuard)
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        let _ = IN_ENGINE.try_with(|flag| flag.set(false));
    }
}

/// Run `f` with this thread's engine state, claiming a pool slot on
/// first touch.
///
/// Returns `None` when the engine is re-entered (a traced function was
/// reached from inside engine code) or when the pool has no slot left;
/// entries are silently skipped in both cases and the refusal is
/// counted in the pool, never logged from here.
pub fn with_thread<R>(
    session: &'static Session,
    create: bool,
    f: impl FnOnce(&mut TraceThread) -> R,
) -> Option<R> {
    let _guard = EngineGuard::enter()?;
    THREAD
        .try_with(|slot| {
            let mut slot = slot.try_borrow_mut().ok()?;
            if slot.is_none() {
                if !create {
                    return None;
                }
                let mut thread = session.pool().claim()?;
                thread.bind_current();
                *slot = Some(thread);
            }
            Some(f(slot.as_mut().unwrap()))
        })
        .ok()
        .flatten()
}

/// Runs in the child right after `fork`: rebuild the pool with
/// child-owned rings and move the current thread onto one of them, or
/// abandon the state entirely if that fails.
pub fn handle_fork_child(session: &'static Session) {
    session.pool().refill_after_fork(session);
    let _ = THREAD.try_with(|slot| {
        let Ok(mut slot) = slot.try_borrow_mut() else {
            return;
        };
        let adopted = match slot.as_mut() {
            Some(thread) => match session.pool().claim() {
                Some(fresh) => {
                    thread.adopt_fresh_ring(fresh);
                    true
                }
                None => false,
            },
            None => return,
        };
        if !adopted {
            // Leak rather than flush records into the parent's ring.
            if let Some(thread) = slot.take() {
                std::mem::forget(thread);
            }
        }
    });
}

/// Tear down this thread's state early (session shutdown).
pub fn teardown_current() {
    let _ = THREAD.try_with(|slot| {
        if let Ok(mut slot) = slot.try_borrow_mut() {
            slot.take();
        }
    });
}

#[cfg(test)]
pub fn make_test_thread(session: &'static Session) -> Box<TraceThread> {
    let mut thread = session.pool().claim().expect("pool slot");
    thread.bind_current();
    thread
}
