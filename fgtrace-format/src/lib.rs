//! Shared data plane for the fgtrace function-graph tracer.
//!
//! Everything that crosses the boundary between the traced process (the
//! `fgtrace-mcount` engine injected via `LD_PRELOAD`) and the recorder
//! (`fgtrace` itself) is defined here: the binary record codec, the
//! shared-memory ring layout, the control-channel framing, the filter and
//! trigger spec language, the symbol file format and the `info` sidecar
//! codec. The engine and the recorder must never disagree about any of it,
//! so both halves live in one crate and are tested in isolation.

pub mod args;
pub mod error;
pub mod info;
pub mod record;
pub mod ring;
pub mod spec;
pub mod symfile;
pub mod wire;

pub use error::FormatError;

/// Default per-thread ring buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: u32 = 128 * 1024;

/// Default shadow stack depth cap.
pub const DEFAULT_MAX_STACK: usize = 1024;

/// Version string recorded in the `info` sidecar.
pub const FGTRACE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of preallocated per-thread ring slots.
pub const DEFAULT_MAX_THREADS: usize = 32;

/// Name of the shared-memory object backing one ring slot. Slots are
/// created ahead of time, so the name carries the creating process and
/// a slot index rather than a thread id; the claiming thread stamps its
/// id into the ring header instead.
pub fn shm_name(session: &str, pid: u32, slot: u32) -> String {
    format!("/fgtrace-{session}-{pid}-{slot}")
}

/// Environment protocol between the recorder and the injected engine.
///
/// The recorder sets these on the child before exec; the engine reads them
/// from its constructor. They mirror the command-line options one to one.
pub mod env {
    pub const DIR: &str = "FGTRACE_DIR";
    pub const SESSION: &str = "FGTRACE_SESSION";
    pub const PIPE_FD: &str = "FGTRACE_PIPE_FD";
    pub const FILTER: &str = "FGTRACE_FILTER";
    pub const TRIGGER: &str = "FGTRACE_TRIGGER";
    pub const ARGUMENT: &str = "FGTRACE_ARGUMENT";
    pub const RETVAL: &str = "FGTRACE_RETVAL";
    pub const EVENT: &str = "FGTRACE_EVENT";
    pub const PATCH: &str = "FGTRACE_PATCH";
    pub const NO_LIBCALL: &str = "FGTRACE_NO_LIBCALL";
    pub const SIZE_FILTER: &str = "FGTRACE_SIZE_FILTER";
    pub const DEPTH: &str = "FGTRACE_DEPTH";
    pub const MAX_STACK: &str = "FGTRACE_MAX_STACK";
    pub const MAX_THREADS: &str = "FGTRACE_MAX_THREADS";
    pub const TIME_FILTER: &str = "FGTRACE_TIME_FILTER";
    pub const BUFFER: &str = "FGTRACE_BUFFER";
    pub const PATTERN: &str = "FGTRACE_PATTERN";
    pub const DEBUG: &str = "FGTRACE_DEBUG";
    pub const DISABLED: &str = "FGTRACE_DISABLED";
    pub const KEEP_PID: &str = "FGTRACE_KEEP_PID";
    pub const RT_PRIO: &str = "FGTRACE_RT_PRIO";
    pub const KERNEL_BUFFER: &str = "FGTRACE_KERNEL_BUFFER";
    pub const SIGNAL: &str = "FGTRACE_SIGNAL";
}
