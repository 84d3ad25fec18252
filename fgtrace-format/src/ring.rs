//! Per-thread shared-memory ring buffers.
//!
//! Each traced thread owns one ring: a page-sized header followed by a
//! power-of-two data area, backed by a POSIX shared-memory object. The
//! traced thread is the only producer; the recorder is the only consumer.
//! Head and tail are free-running 32-bit offsets. A record slot starts with
//! one 64-bit word holding the record length and a commit marker; the
//! marker is written last, with release semantics, so the consumer can only
//! observe a torn record with the marker absent. Records never wrap: when
//! the contiguous space at the end of the data area is too small, the
//! producer drops a pad slot and continues at offset zero.
//!
//! Nothing here allocates and nothing blocks; a full ring bumps the `lost`
//! counter and drops the record on the floor.

use crate::FormatError;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const RING_MAGIC: u32 = 0x4647_5452; // "FGTR"
pub const RING_VERSION: u32 = 1;

/// The header occupies one page so the data area stays page-aligned.
pub const RING_HEADER_SIZE: usize = 4096;

const SLOT_WORD_SIZE: usize = 8;
const COMMIT_MARKER: u32 = 0xc0de_0000;
const PAD_MARKER: u32 = 0xc0de_ffff;

/// Shared ring state at the start of the mapping.
#[repr(C)]
pub struct RingHeader {
    pub magic: u32,
    pub version: u32,
    pub capacity: u32,
    /// Id of the thread writing this ring. Rings are created ahead of
    /// time with the id unset (zero) and stamped when a thread claims
    /// the ring; the consumer treats a zero id as "never claimed".
    pub tid: AtomicU32,
    pub head: AtomicU32,
    pub tail: AtomicU32,
    pub lost: AtomicU32,
    pub done: AtomicU32,
}

impl RingHeader {
    /// Initialize a freshly created (zeroed) mapping.
    ///
    /// # Safety
    /// `base` must point to at least [`ring_total_size`] writable bytes.
    pub unsafe fn init(base: *mut u8, capacity: u32, tid: u32) {
        let header = &mut *(base as *mut RingHeader);
        header.magic = RING_MAGIC;
        header.version = RING_VERSION;
        header.capacity = capacity;
        header.tid = AtomicU32::new(tid);
        header.head = AtomicU32::new(0);
        header.tail = AtomicU32::new(0);
        header.lost = AtomicU32::new(0);
        header.done = AtomicU32::new(0);
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        if self.magic != RING_MAGIC {
            return Err(FormatError::BadMagic(self.magic));
        }
        if self.version != RING_VERSION {
            return Err(FormatError::UnsupportedVersion(self.version));
        }
        if !self.capacity.is_power_of_two() || (self.capacity as usize) < RING_HEADER_SIZE {
            return Err(FormatError::BadCapacity(self.capacity));
        }
        Ok(())
    }
}

/// Bytes needed for a ring with the given data capacity.
pub fn ring_total_size(capacity: u32) -> usize {
    RING_HEADER_SIZE + capacity as usize
}

/// On-ring size of a record of `len` encoded bytes.
fn slot_size(len: usize) -> usize {
    SLOT_WORD_SIZE + ((len + 7) & !7)
}

fn make_slot_word(len: usize) -> u64 {
    ((COMMIT_MARKER as u64) << 32) | len as u64
}

/// The producer half. Exactly one per ring, owned by the traced thread.
pub struct RingProducer {
    header: *const RingHeader,
    data: *mut u8,
    mask: u32,
    capacity: u32,
    head: u32,
}

unsafe impl Send for RingProducer {}

impl RingProducer {
    /// # Safety
    /// `base` must point to a mapping of [`ring_total_size`] bytes whose
    /// header has been initialized with [`RingHeader::init`], and no other
    /// producer may exist for the same ring.
    pub unsafe fn new(base: *mut u8) -> Result<Self, FormatError> {
        let header = base as *const RingHeader;
        (*header).validate()?;
        let capacity = (*header).capacity;
        Ok(RingProducer {
            header,
            data: base.add(RING_HEADER_SIZE),
            mask: capacity - 1,
            capacity,
            head: (*header).head.load(Ordering::Relaxed),
        })
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*self.header }
    }

    fn slot_word_at(&self, offset: u32) -> &AtomicU64 {
        unsafe { &*(self.data.add((offset & self.mask) as usize) as *const AtomicU64) }
    }

    /// Append one encoded record. Returns false (and counts it as lost)
    /// when the ring has no room; never blocks.
    pub fn push(&mut self, record: &[u8]) -> bool {
        let size = slot_size(record.len()) as u32;
        debug_assert!(size <= self.capacity / 2);

        let tail = self.header().tail.load(Ordering::Acquire);
        let mut head = self.head;
        let mut used = head.wrapping_sub(tail);

        // Pad out the end of the data area if the record does not fit in
        // the remaining contiguous space.
        let to_end = self.capacity - (head & self.mask);
        if to_end < size {
            if used + to_end + size > self.capacity {
                self.bump_lost(1);
                return false;
            }
            let pad_word = ((PAD_MARKER as u64) << 32) | (to_end - SLOT_WORD_SIZE as u32) as u64;
            self.slot_word_at(head).store(pad_word, Ordering::Release);
            head = head.wrapping_add(to_end);
            used += to_end;
        }
        if used + size > self.capacity {
            self.bump_lost(1);
            return false;
        }

        let start = (head.wrapping_add(SLOT_WORD_SIZE as u32) & self.mask) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(record.as_ptr(), self.data.add(start), record.len());
        }
        self.slot_word_at(head)
            .store(make_slot_word(record.len()), Ordering::Release);

        self.head = head.wrapping_add(size);
        self.header().head.store(self.head, Ordering::Release);
        true
    }

    /// Stamp the owning thread's id into the header when the ring is
    /// claimed. A single atomic store; safe from the trace hot path.
    pub fn set_tid(&self, tid: u32) {
        self.header().tid.store(tid, Ordering::Release);
    }

    /// Count records dropped before they ever reached the ring.
    pub fn bump_lost(&self, n: u32) {
        self.header().lost.fetch_add(n, Ordering::Relaxed);
    }

    pub fn lost(&self) -> u32 {
        self.header().lost.load(Ordering::Relaxed)
    }

    /// Signal the consumer that no further records will arrive.
    pub fn mark_done(&self) {
        self.header().done.store(1, Ordering::Release);
    }

    /// True once the consumer has caught up with everything we published.
    pub fn is_drained(&self) -> bool {
        self.header().tail.load(Ordering::Acquire) == self.head
    }
}

/// The consumer half. Exactly one per ring, owned by the recorder.
pub struct RingConsumer {
    header: *const RingHeader,
    data: *const u8,
    mask: u32,
    capacity: u32,
    tail: u32,
}

unsafe impl Send for RingConsumer {}

impl RingConsumer {
    /// # Safety
    /// `base` must point to a mapping of [`ring_total_size`] bytes with an
    /// initialized header, and no other consumer may exist for the ring.
    pub unsafe fn new(base: *const u8) -> Result<Self, FormatError> {
        let header = base as *const RingHeader;
        (*header).validate()?;
        let capacity = (*header).capacity;
        Ok(RingConsumer {
            header,
            data: base.add(RING_HEADER_SIZE),
            mask: capacity - 1,
            capacity,
            tail: (*header).tail.load(Ordering::Relaxed),
        })
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*self.header }
    }

    /// The claiming thread's id, or zero while the ring is unclaimed.
    pub fn tid(&self) -> u32 {
        self.header().tid.load(Ordering::Acquire)
    }

    fn slot_word_at(&self, offset: u32) -> &AtomicU64 {
        unsafe { &*(self.data.add((offset & self.mask) as usize) as *const AtomicU64) }
    }

    /// Copy all complete records out of the ring, appending their bytes to
    /// `out`. Returns the number of bytes copied.
    pub fn drain(&mut self, out: &mut Vec<u8>) -> usize {
        let head = self.header().head.load(Ordering::Acquire);
        let mut tail = self.tail;
        let before = out.len();

        while tail != head {
            let word = self.slot_word_at(tail).load(Ordering::Acquire);
            let marker = (word >> 32) as u32;
            let len = (word & 0xffff_ffff) as usize;
            if marker == PAD_MARKER {
                tail = tail.wrapping_add(SLOT_WORD_SIZE as u32 + len as u32);
                continue;
            }
            if marker != COMMIT_MARKER {
                // Reserved but not yet committed; everything after it is
                // unreachable until the producer finishes.
                break;
            }
            let start = (tail.wrapping_add(SLOT_WORD_SIZE as u32) & self.mask) as usize;
            out.extend_from_slice(unsafe {
                std::slice::from_raw_parts(self.data.add(start), len)
            });
            tail = tail.wrapping_add(slot_size(len) as u32);
        }

        if tail != self.tail {
            self.tail = tail;
            self.header().tail.store(tail, Ordering::Release);
        }
        out.len() - before
    }

    pub fn is_done(&self) -> bool {
        self.header().done.load(Ordering::Acquire) == 1
    }

    /// True when the producer is finished and everything has been drained.
    pub fn is_exhausted(&self) -> bool {
        self.is_done() && self.header().head.load(Ordering::Acquire) == self.tail
    }

    pub fn lost(&self) -> u32 {
        self.header().lost.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, RecordStream};

    struct TestRing {
        // Backing store, kept 8-byte aligned by using u64 storage.
        buf: Vec<u64>,
    }

    impl TestRing {
        fn new(capacity: u32) -> Self {
            let mut buf = vec![0u64; ring_total_size(capacity) / 8];
            unsafe { RingHeader::init(buf.as_mut_ptr() as *mut u8, capacity, 1) };
            TestRing { buf }
        }

        fn base(&mut self) -> *mut u8 {
            self.buf.as_mut_ptr() as *mut u8
        }
    }

    #[test]
    fn push_and_drain_round_trip() {
        let mut ring = TestRing::new(4096);
        let base = ring.base();
        let mut producer = unsafe { RingProducer::new(base) }.unwrap();
        let mut consumer = unsafe { RingConsumer::new(base) }.unwrap();

        for i in 0..10u64 {
            let rec = Record::entry(i * 10, 0x1000 + i, i as u8);
            assert!(producer.push(&rec.encode()));
        }

        let mut out = Vec::new();
        consumer.drain(&mut out);
        let records: Vec<_> = RecordStream::new(&out)
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(records.len(), 10);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.time, i as u64 * 10);
            assert_eq!(r.addr, 0x1000 + i as u64);
        }
    }

    #[test]
    fn full_ring_counts_lost() {
        let mut ring = TestRing::new(4096);
        let base = ring.base();
        let mut producer = unsafe { RingProducer::new(base) }.unwrap();
        let rec = Record::entry(1, 2, 3).encode();

        let mut pushed = 0;
        while producer.push(&rec) {
            pushed += 1;
            assert!(pushed < 1000);
        }
        assert!(pushed > 0);
        assert_eq!(producer.lost(), 1);

        // Draining makes room again.
        let mut consumer = unsafe { RingConsumer::new(base) }.unwrap();
        let mut out = Vec::new();
        consumer.drain(&mut out);
        assert!(producer.push(&rec));
    }

    #[test]
    fn wraparound_preserves_records() {
        let mut ring = TestRing::new(4096);
        let base = ring.base();
        let mut producer = unsafe { RingProducer::new(base) }.unwrap();
        let mut consumer = unsafe { RingConsumer::new(base) }.unwrap();

        // Interleave pushes and drains long enough to wrap several times.
        let mut out = Vec::new();
        let mut written = 0u64;
        for round in 0..200u64 {
            for _ in 0..7 {
                let rec = Record::entry(written, written, (round % 200) as u8);
                if producer.push(&rec.encode()) {
                    written += 1;
                }
            }
            consumer.drain(&mut out);
        }
        let records: Vec<_> = RecordStream::new(&out)
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(records.len() as u64, written);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.time, i as u64);
        }
    }

    #[test]
    fn concurrent_producer_consumer() {
        let capacity = 8192u32;
        let mut buf = vec![0u64; ring_total_size(capacity) / 8];
        let base = buf.as_mut_ptr() as *mut u8;
        unsafe { RingHeader::init(base, capacity, 7) };
        let mut producer = unsafe { RingProducer::new(base) }.unwrap();
        let mut consumer = unsafe { RingConsumer::new(base) }.unwrap();

        const COUNT: u64 = 50_000;
        let handle = std::thread::spawn(move || {
            let mut sent = 0u64;
            let mut dropped = 0u64;
            for i in 0..COUNT {
                let rec = Record::entry(i, i, 0);
                if producer.push(&rec.encode()) {
                    sent += 1;
                } else {
                    dropped += 1;
                }
            }
            producer.mark_done();
            (sent, dropped)
        });

        let mut out = Vec::new();
        while !consumer.is_exhausted() {
            if consumer.drain(&mut out) == 0 {
                std::thread::yield_now();
            }
        }
        let (sent, dropped) = handle.join().unwrap();
        assert_eq!(sent + dropped, COUNT);

        let records: Vec<_> = RecordStream::new(&out)
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(records.len() as u64, sent);
        // Timestamps arrive in program order even with drops in between.
        let mut last = 0;
        for r in &records {
            assert!(r.time >= last);
            last = r.time;
        }
        assert_eq!(consumer.lost() as u64, dropped);
    }

    #[test]
    fn tid_is_stamped_at_claim_time() {
        let mut ring = TestRing::new(4096);
        let base = ring.base();
        unsafe { RingHeader::init(base, 4096, 0) };
        let producer = unsafe { RingProducer::new(base) }.unwrap();
        let consumer = unsafe { RingConsumer::new(base) }.unwrap();
        assert_eq!(consumer.tid(), 0);
        producer.set_tid(4242);
        assert_eq!(consumer.tid(), 4242);
    }

    #[test]
    fn validate_rejects_garbage() {
        let mut buf = vec![0u64; ring_total_size(4096) / 8];
        let header = unsafe { &*(buf.as_mut_ptr() as *const RingHeader) };
        assert!(matches!(header.validate(), Err(FormatError::BadMagic(_))));
    }
}
