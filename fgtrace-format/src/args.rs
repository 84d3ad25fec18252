//! Captured-argument payload codec.
//!
//! Argument and return-value payloads are self-describing so the
//! analysis side can render them without re-parsing the original spec:
//! a 4-byte header per value (index, format code, data length) followed
//! by the raw bytes. The encode half writes into a caller-provided
//! buffer and never allocates; it runs on the trace hot path.

use crate::spec::ArgFormat;

impl ArgFormat {
    pub fn code(self) -> u8 {
        match self {
            ArgFormat::Int => 0,
            ArgFormat::Uint => 1,
            ArgFormat::Hex => 2,
            ArgFormat::Str => 3,
            ArgFormat::Char => 4,
            ArgFormat::Float => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ArgFormat::Int),
            1 => Some(ArgFormat::Uint),
            2 => Some(ArgFormat::Hex),
            3 => Some(ArgFormat::Str),
            4 => Some(ArgFormat::Char),
            5 => Some(ArgFormat::Float),
            _ => None,
        }
    }
}

/// Append one value at `pos`; returns the new position, or `None` when
/// the buffer is full (the value is then dropped, not truncated).
pub fn encode_arg(
    out: &mut [u8],
    pos: usize,
    index: u8,
    format: ArgFormat,
    data: &[u8],
) -> Option<usize> {
    let end = pos.checked_add(4 + data.len())?;
    if end > out.len() || data.len() > u16::MAX as usize {
        return None;
    }
    out[pos] = index;
    out[pos + 1] = format.code();
    out[pos + 2..pos + 4].copy_from_slice(&(data.len() as u16).to_le_bytes());
    out[pos + 4..end].copy_from_slice(data);
    Some(end)
}

/// One decoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgValue {
    /// 1-based argument index; 0 is the return value.
    pub index: u8,
    pub format: ArgFormat,
    pub data: Vec<u8>,
}

/// Decode a payload, stopping quietly at the first malformed header.
pub fn decode_args(payload: &[u8]) -> Vec<ArgValue> {
    let mut values = Vec::new();
    let mut pos = 0;
    while pos + 4 <= payload.len() {
        let index = payload[pos];
        let Some(format) = ArgFormat::from_code(payload[pos + 1]) else {
            break;
        };
        let len = u16::from_le_bytes([payload[pos + 2], payload[pos + 3]]) as usize;
        if pos + 4 + len > payload.len() {
            break;
        }
        values.push(ArgValue {
            index,
            format,
            data: payload[pos + 4..pos + 4 + len].to_vec(),
        });
        pos += 4 + len;
    }
    values
}

fn int_from_le(data: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = data.len().min(8);
    buf[..n].copy_from_slice(&data[..n]);
    u64::from_le_bytes(buf)
}

fn sign_extend(value: u64, bytes: usize) -> i64 {
    let bits = (bytes.min(8) * 8) as u32;
    if bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

impl ArgValue {
    /// Render the value the way the replay output prints it.
    pub fn render(&self) -> String {
        match self.format {
            ArgFormat::Int => sign_extend(int_from_le(&self.data), self.data.len()).to_string(),
            ArgFormat::Uint => int_from_le(&self.data).to_string(),
            ArgFormat::Hex => format!("{:#x}", int_from_le(&self.data)),
            ArgFormat::Char => {
                let c = self.data.first().copied().unwrap_or(0);
                if c.is_ascii_graphic() || c == b' ' {
                    format!("'{}'", c as char)
                } else {
                    format!("'\\x{c:02x}'")
                }
            }
            ArgFormat::Str => {
                format!("\"{}\"", String::from_utf8_lossy(&self.data))
            }
            ArgFormat::Float => match self.data.len() {
                4 => f32::from_le_bytes(self.data[..4].try_into().unwrap()).to_string(),
                8 => f64::from_le_bytes(self.data[..8].try_into().unwrap()).to_string(),
                _ => format!("{:#x}", int_from_le(&self.data)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut buf = [0u8; 64];
        let mut pos = 0;
        pos = encode_arg(&mut buf, pos, 1, ArgFormat::Int, &(-5i32).to_le_bytes()).unwrap();
        pos = encode_arg(&mut buf, pos, 2, ArgFormat::Str, b"hello").unwrap();
        pos = encode_arg(&mut buf, pos, 0, ArgFormat::Hex, &0xabcdu64.to_le_bytes()).unwrap();

        let values = decode_args(&buf[..pos]);
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].render(), "-5");
        assert_eq!(values[1].render(), "\"hello\"");
        assert_eq!(values[2].render(), "0xabcd");
    }

    #[test]
    fn full_buffer_drops_whole_value() {
        let mut buf = [0u8; 10];
        let pos = encode_arg(&mut buf, 0, 1, ArgFormat::Int, &[0; 4]).unwrap();
        assert_eq!(pos, 8);
        assert!(encode_arg(&mut buf, pos, 2, ArgFormat::Int, &[0; 4]).is_none());
    }

    #[test]
    fn truncated_payload_is_tolerated() {
        let mut buf = [0u8; 32];
        let pos = encode_arg(&mut buf, 0, 1, ArgFormat::Uint, &7u64.to_le_bytes()).unwrap();
        let values = decode_args(&buf[..pos - 3]);
        assert!(values.is_empty());
    }

    #[test]
    fn char_rendering_escapes() {
        let v = ArgValue {
            index: 1,
            format: ArgFormat::Char,
            data: vec![b'A'],
        };
        assert_eq!(v.render(), "'A'");
        let v = ArgValue {
            index: 1,
            format: ArgFormat::Char,
            data: vec![7],
        };
        assert_eq!(v.render(), "'\\x07'");
    }
}
