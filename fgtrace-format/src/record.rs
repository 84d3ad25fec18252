//! The binary trace record format.
//!
//! A record is a fixed 16-byte header, optionally followed by one
//! length-prefixed payload chunk (captured arguments, a return value, or
//! event data such as a PMU counter vector). Records are little-endian and
//! 8-byte aligned; the same byte layout is used inside the shared-memory
//! rings and in the per-thread `<tid>.dat` files.
//!
//! Header layout, two 64-bit words:
//!
//! ```text
//! word 0: | flags (14 bits) | kind (2 bits) | timestamp (48 bits) |
//! word 1: | event id (8)    | depth (8)     | address   (48 bits) |
//! ```
//!
//! For `Lost` records the address field carries the number of dropped
//! records and the event-id field the [`LostReason`].

use crate::FormatError;
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

/// Size of the fixed record header.
pub const RECORD_SIZE: usize = 16;

/// Timestamps keep only the low 48 bits; good for ~78 hours of nanoseconds.
pub const TIMESTAMP_MASK: u64 = (1 << 48) - 1;

/// Function addresses are stored as 48-bit offsets; canonical userspace
/// addresses on the supported architectures fit.
pub const ADDRESS_MASK: u64 = (1 << 48) - 1;

/// Largest payload chunk a single record may carry.
pub const MAX_PAYLOAD: usize = 4080;

const KIND_SHIFT: u32 = 48;
const FLAGS_SHIFT: u32 = 50;
const DEPTH_SHIFT: u32 = 48;
const EVENT_SHIFT: u32 = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Entry,
    Exit,
    Event,
    Lost,
}

impl RecordKind {
    fn from_bits(bits: u64) -> Self {
        match bits & 0x3 {
            0 => RecordKind::Entry,
            1 => RecordKind::Exit,
            2 => RecordKind::Event,
            _ => RecordKind::Lost,
        }
    }

    fn to_bits(self) -> u64 {
        match self {
            RecordKind::Entry => 0,
            RecordKind::Exit => 1,
            RecordKind::Event => 2,
            RecordKind::Lost => 3,
        }
    }
}

bitflags! {
    /// Per-record flags stored in the top 14 bits of word 0.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u16 {
        /// An argument payload chunk follows the header.
        const ARGS = 1 << 0;
        /// A return-value payload chunk follows the header.
        const RETVAL = 1 << 1;
        /// An event data chunk follows the header.
        const DATA = 1 << 2;
    }
}

/// Why records were dropped at this point in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostReason {
    RingFull,
    StackOverflow,
    Longjmp,
    Signal,
    Unknown(u8),
}

impl LostReason {
    pub fn as_u8(self) -> u8 {
        match self {
            LostReason::RingFull => 0,
            LostReason::StackOverflow => 1,
            LostReason::Longjmp => 2,
            LostReason::Signal => 3,
            LostReason::Unknown(v) => v,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LostReason::RingFull,
            1 => LostReason::StackOverflow,
            2 => LostReason::Longjmp,
            3 => LostReason::Signal,
            other => LostReason::Unknown(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LostReason::RingFull => "ring-full",
            LostReason::StackOverflow => "stack-overflow",
            LostReason::Longjmp => "longjmp",
            LostReason::Signal => "signal",
            LostReason::Unknown(_) => "unknown",
        }
    }
}

/// A decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub time: u64,
    pub kind: RecordKind,
    pub flags: RecordFlags,
    pub addr: u64,
    pub depth: u8,
    pub event_id: u8,
}

impl Record {
    pub fn entry(time: u64, addr: u64, depth: u8) -> Self {
        Record {
            time: time & TIMESTAMP_MASK,
            kind: RecordKind::Entry,
            flags: RecordFlags::empty(),
            addr: addr & ADDRESS_MASK,
            depth,
            event_id: 0,
        }
    }

    pub fn exit(time: u64, addr: u64, depth: u8) -> Self {
        Record {
            time: time & TIMESTAMP_MASK,
            kind: RecordKind::Exit,
            flags: RecordFlags::empty(),
            addr: addr & ADDRESS_MASK,
            depth,
            event_id: 0,
        }
    }

    pub fn event(time: u64, addr: u64, depth: u8, event_id: u8) -> Self {
        Record {
            time: time & TIMESTAMP_MASK,
            kind: RecordKind::Event,
            flags: RecordFlags::empty(),
            addr: addr & ADDRESS_MASK,
            depth,
            event_id,
        }
    }

    pub fn lost(time: u64, reason: LostReason, count: u64, depth: u8) -> Self {
        Record {
            time: time & TIMESTAMP_MASK,
            kind: RecordKind::Lost,
            flags: RecordFlags::empty(),
            addr: count & ADDRESS_MASK,
            depth,
            event_id: reason.as_u8(),
        }
    }

    pub fn with_flags(mut self, flags: RecordFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// For `Lost` records, the number of dropped records.
    pub fn lost_count(&self) -> u64 {
        self.addr
    }

    /// For `Lost` records, the reason encoded in the event-id field.
    pub fn lost_reason(&self) -> LostReason {
        LostReason::from_u8(self.event_id)
    }

    pub fn has_payload(&self) -> bool {
        self.flags
            .intersects(RecordFlags::ARGS | RecordFlags::RETVAL | RecordFlags::DATA)
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let word0 = (self.time & TIMESTAMP_MASK)
            | (self.kind.to_bits() << KIND_SHIFT)
            | ((self.flags.bits() as u64) << FLAGS_SHIFT);
        let word1 = (self.addr & ADDRESS_MASK)
            | ((self.depth as u64) << DEPTH_SHIFT)
            | ((self.event_id as u64) << EVENT_SHIFT);
        let mut buf = [0u8; RECORD_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], word0);
        LittleEndian::write_u64(&mut buf[8..16], word1);
        buf
    }

    pub fn decode(buf: &[u8; RECORD_SIZE]) -> Self {
        let word0 = LittleEndian::read_u64(&buf[0..8]);
        let word1 = LittleEndian::read_u64(&buf[8..16]);
        Record {
            time: word0 & TIMESTAMP_MASK,
            kind: RecordKind::from_bits(word0 >> KIND_SHIFT),
            flags: RecordFlags::from_bits_truncate((word0 >> FLAGS_SHIFT) as u16),
            addr: word1 & ADDRESS_MASK,
            depth: (word1 >> DEPTH_SHIFT) as u8,
            event_id: (word1 >> EVENT_SHIFT) as u8,
        }
    }
}

/// Encoded size of a payload chunk: 4-byte length prefix plus the data,
/// rounded up to the 8-byte record alignment.
pub const fn payload_encoded_len(data_len: usize) -> usize {
    (4 + data_len + 7) & !7
}

/// Total on-stream size of a record with an optional payload.
pub fn record_encoded_len(payload: Option<usize>) -> usize {
    RECORD_SIZE + payload.map_or(0, payload_encoded_len)
}

/// Append a payload chunk to `out`.
pub fn encode_payload(out: &mut Vec<u8>, data: &[u8]) -> Result<(), FormatError> {
    if data.len() > MAX_PAYLOAD {
        return Err(FormatError::OversizedPayload(data.len(), MAX_PAYLOAD));
    }
    let start = out.len();
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    let aligned = start + payload_encoded_len(data.len());
    out.resize(aligned, 0);
    Ok(())
}

/// An iterator over a contiguous record stream, as found in a `<tid>.dat`
/// file or in a drained ring region.
pub struct RecordStream<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        RecordStream { data, pos: 0 }
    }

    /// Byte offset of the next undecoded record.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        if self.pos + len > self.data.len() {
            return Err(FormatError::Truncated {
                needed: len,
                avail: self.data.len() - self.pos,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn next_inner(&mut self) -> Result<(Record, Option<&'a [u8]>), FormatError> {
        let header: &[u8; RECORD_SIZE] = self.take(RECORD_SIZE)?.try_into().unwrap();
        let record = Record::decode(header);
        if !record.has_payload() {
            return Ok((record, None));
        }
        let len_bytes = self.take(4)?;
        let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        if len > MAX_PAYLOAD {
            return Err(FormatError::OversizedPayload(len, MAX_PAYLOAD));
        }
        let payload = self.take(len)?;
        // Skip the alignment padding.
        let consumed = 4 + len;
        let pad = payload_encoded_len(len) - consumed;
        self.take(pad)?;
        Ok((record, Some(payload)))
    }
}

impl<'a> Iterator for RecordStream<'a> {
    type Item = Result<(Record, Option<&'a [u8]>), FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.data.len() {
            return None;
        }
        Some(self.next_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let r = Record::entry(0x1234_5678_9abc, 0x7fff_dead_beef, 42);
        assert_eq!(Record::decode(&r.encode()), r);

        let r = Record::exit(TIMESTAMP_MASK, ADDRESS_MASK, 255);
        let d = Record::decode(&r.encode());
        assert_eq!(d.time, TIMESTAMP_MASK);
        assert_eq!(d.addr, ADDRESS_MASK);
        assert_eq!(d.depth, 255);
        assert_eq!(d.kind, RecordKind::Exit);
    }

    #[test]
    fn timestamp_truncates_to_48_bits() {
        let r = Record::entry(u64::MAX, 0x1000, 0);
        assert_eq!(r.time, TIMESTAMP_MASK);
        assert_eq!(Record::decode(&r.encode()).time, TIMESTAMP_MASK);
    }

    #[test]
    fn lost_record_carries_count_and_reason() {
        let r = Record::lost(99, LostReason::Longjmp, 7, 3);
        let d = Record::decode(&r.encode());
        assert_eq!(d.kind, RecordKind::Lost);
        assert_eq!(d.lost_count(), 7);
        assert_eq!(d.lost_reason(), LostReason::Longjmp);
        assert_eq!(d.depth, 3);
    }

    #[test]
    fn stream_round_trip_with_payloads() {
        let mut buf = Vec::new();
        let e = Record::entry(100, 0x4000, 0).with_flags(RecordFlags::ARGS);
        buf.extend_from_slice(&e.encode());
        encode_payload(&mut buf, &[1, 2, 3, 4, 5]).unwrap();
        let x = Record::exit(200, 0x4000, 0);
        buf.extend_from_slice(&x.encode());

        let mut stream = RecordStream::new(&buf);
        let (r1, p1) = stream.next().unwrap().unwrap();
        assert_eq!(r1, e);
        assert_eq!(p1, Some(&[1u8, 2, 3, 4, 5][..]));
        let (r2, p2) = stream.next().unwrap().unwrap();
        assert_eq!(r2, x);
        assert_eq!(p2, None);
        assert!(stream.next().is_none());
    }

    #[test]
    fn stream_reports_truncation() {
        let e = Record::entry(1, 2, 3).with_flags(RecordFlags::ARGS);
        let mut buf = Vec::new();
        buf.extend_from_slice(&e.encode());
        buf.extend_from_slice(&8u32.to_le_bytes());
        buf.extend_from_slice(&[0; 3]); // payload cut short
        let mut stream = RecordStream::new(&buf);
        assert!(matches!(
            stream.next(),
            Some(Err(FormatError::Truncated { .. }))
        ));
    }

    #[test]
    fn payload_alignment() {
        assert_eq!(payload_encoded_len(0), 8);
        assert_eq!(payload_encoded_len(4), 8);
        assert_eq!(payload_encoded_len(5), 16);
        assert_eq!(payload_encoded_len(12), 16);
        let mut buf = Vec::new();
        encode_payload(&mut buf, &[0xff; 5]).unwrap();
        assert_eq!(buf.len(), 16);
    }
}
