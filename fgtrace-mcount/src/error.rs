use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while setting up or tearing down the engine.
///
/// Nothing on the trampoline path returns these; hot-path failures are
/// counted and surfaced as `lost` records instead.
#[derive(Debug, Error)]
pub enum McountError {
    #[error("could not patch {addr:#x} ({symbol}): {reason}")]
    PatchFailed {
        addr: usize,
        symbol: String,
        reason: String,
    },

    #[error("no symbol matches pattern `{0}`")]
    SymbolMissing(String),

    #[error("module {0:?} has no usable symbol table")]
    NoSymbols(PathBuf),

    #[error("failed to parse {path:?}: {source}")]
    ObjectParse {
        path: PathBuf,
        source: object::read::Error,
    },

    #[error("perf event `{0}` could not be opened: {1}")]
    PmuOpenFailed(&'static str, std::io::Error),

    #[error("malformed stapsdt note in {0:?}")]
    SdtParse(PathBuf),

    #[error("shared memory ring setup failed: {0}")]
    RingSetup(nix::Error),

    #[error("stub pool exhausted after {0} stubs")]
    StubPoolFull(usize),

    #[error(transparent)]
    Format(#[from] fgtrace_format::FormatError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
