use thiserror::Error;

/// Errors produced while encoding or decoding any of the shared formats.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad magic value {0:#x} in ring header")]
    BadMagic(u32),

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),

    #[error("ring capacity {0} is not a power of two")]
    BadCapacity(u32),

    #[error("truncated record stream: needed {needed} bytes, {avail} available")]
    Truncated { needed: usize, avail: usize },

    #[error("record payload length {0} exceeds the maximum of {1}")]
    OversizedPayload(usize, usize),

    #[error("invalid filter spec `{spec}`: {reason}")]
    BadSpec { spec: String, reason: String },

    #[error("invalid regular expression `{0}`: {1}")]
    BadRegex(String, regex::Error),

    #[error("invalid control message tag {0}")]
    BadMessageTag(u8),

    #[error("control frame of {0} bytes exceeds the maximum of {1}")]
    OversizedFrame(usize, usize),

    #[error("malformed info line `{0}`")]
    BadInfoLine(String),

    #[error("malformed symbol file line `{0}`")]
    BadSymLine(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
