use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("{0:?} does not look like a trace directory")]
    NotATraceDir(PathBuf),

    #[error("trace directory {0:?} has no data files")]
    EmptyTrace(PathBuf),

    #[error("could not launch {command}: {source}")]
    Launch {
        command: String,
        source: std::io::Error,
    },

    #[error("engine library not found; pass --libmcount or set FGTRACE_LIBMCOUNT")]
    NoEngineLibrary,

    #[error("the `{0}` command is not built into this binary")]
    Unsupported(&'static str),

    #[error("bad option value `{value}` for {what}")]
    BadOption { what: &'static str, value: String },

    #[error(transparent)]
    Format(#[from] fgtrace_format::FormatError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
