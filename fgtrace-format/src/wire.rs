//! Length-prefixed control frames.
//!
//! The engine announces its ring slots to the recorder over a pipe when
//! the session arms, and reports thread and session teardown; the same
//! framing carries the record stream in network mode. A frame is a
//! 4-byte little-endian length followed by a 1-byte tag and the message
//! body. Delivery is best effort; record boundaries are preserved by
//! the framing. Nothing on the trace hot path ever writes a frame.

use crate::FormatError;
use std::io::{Read, Write};

/// Frames larger than this are rejected as corrupt.
pub const MAX_FRAME: usize = 4096;

const TAG_RING_READY: u8 = 2;
const TAG_TASK_END: u8 = 3;
const TAG_SESSION_END: u8 = 4;

/// Control messages from the traced process to the recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A preallocated ring slot is mapped and may be consumed. Which
    /// thread ends up writing it is stamped into the ring header when
    /// the slot is claimed.
    RingReady { slot: u32, shm: String },
    /// The thread exited; its ring holds everything it will ever hold.
    TaskEnd { tid: u32 },
    /// The session is flushing; no further messages will arrive.
    SessionEnd { reason: u32 },
}

impl Message {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), FormatError> {
        let mut body = Vec::with_capacity(32);
        match self {
            Message::RingReady { slot, shm } => {
                body.push(TAG_RING_READY);
                body.extend_from_slice(&slot.to_le_bytes());
                body.extend_from_slice(shm.as_bytes());
            }
            Message::TaskEnd { tid } => {
                body.push(TAG_TASK_END);
                body.extend_from_slice(&tid.to_le_bytes());
            }
            Message::SessionEnd { reason } => {
                body.push(TAG_SESSION_END);
                body.extend_from_slice(&reason.to_le_bytes());
            }
        }
        if body.len() > MAX_FRAME {
            return Err(FormatError::OversizedFrame(body.len(), MAX_FRAME));
        }
        w.write_all(&(body.len() as u32).to_le_bytes())?;
        w.write_all(&body)?;
        w.flush()?;
        Ok(())
    }

    /// Read one frame. Returns `None` on a clean end of stream.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Message>, FormatError> {
        let mut len_buf = [0u8; 4];
        match r.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME {
            return Err(FormatError::OversizedFrame(len, MAX_FRAME));
        }
        let mut body = vec![0u8; len];
        r.read_exact(&mut body)?;

        let take_u32 = |bytes: &[u8]| -> u32 {
            u32::from_le_bytes(bytes[..4].try_into().unwrap())
        };
        let msg = match body[0] {
            TAG_RING_READY if len >= 5 => Message::RingReady {
                slot: take_u32(&body[1..]),
                shm: String::from_utf8_lossy(&body[5..]).into_owned(),
            },
            TAG_TASK_END if len >= 5 => Message::TaskEnd {
                tid: take_u32(&body[1..]),
            },
            TAG_SESSION_END if len >= 5 => Message::SessionEnd {
                reason: take_u32(&body[1..]),
            },
            tag => return Err(FormatError::BadMessageTag(tag)),
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let messages = vec![
            Message::RingReady {
                slot: 0,
                shm: "/fgtrace-abc-99-0".to_string(),
            },
            Message::RingReady {
                slot: 1,
                shm: "/fgtrace-abc-99-1".to_string(),
            },
            Message::TaskEnd { tid: 101 },
            Message::SessionEnd { reason: 0 },
        ];
        let mut buf = Vec::new();
        for m in &messages {
            m.write_to(&mut buf).unwrap();
        }
        let mut cursor = std::io::Cursor::new(buf);
        for expected in &messages {
            let got = Message::read_from(&mut cursor).unwrap().unwrap();
            assert_eq!(&got, expected);
        }
        assert!(Message::read_from(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME as u32 + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            Message::read_from(&mut cursor),
            Err(FormatError::OversizedFrame(..))
        ));
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&5u32.to_le_bytes());
        buf.push(99);
        buf.extend_from_slice(&[0; 4]);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            Message::read_from(&mut cursor),
            Err(FormatError::BadMessageTag(99))
        ));
    }
}
