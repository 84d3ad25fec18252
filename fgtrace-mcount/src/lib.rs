//! The fgtrace in-process engine.
//!
//! This crate builds as a `cdylib` that the recorder injects into the
//! target with `LD_PRELOAD`. A constructor in the `.init_array` section
//! creates the [`session::Session`] before `main` runs: it loads the
//! symbol index, compiles the filter set, installs the patches and opens
//! the control pipe back to the recorder. From then on every instrumented
//! function entry funnels through the architecture trampoline into
//! [`mcount::fgtrace_entry`], and every return through
//! [`mcount::fgtrace_exit`].
//!
//! Everything on the entry/exit path is written to be async-signal-safe:
//! no allocation, no locks other than wait-free atomics, no formatting.
//! Setup and teardown are ordinary Rust with ordinary error handling.

pub mod arch;
pub mod error;
pub mod filter;
pub mod mcount;
pub mod patch;
pub mod pmu;
pub mod ring;
pub mod sdt;
pub mod session;
pub mod shadow_stack;
pub mod symbols;
pub mod thread;

pub use error::McountError;

/// Engine constructor, run by the dynamic loader before `main`.
///
/// Failure must never prevent the target from running; on error the
/// session stays detached and the program executes unpatched.
extern "C" fn fgtrace_startup() {
    session::startup_from_env();
}

/// Engine destructor, run on normal process exit.
extern "C" fn fgtrace_shutdown() {
    session::shutdown();
}

#[used]
#[link_section = ".init_array"]
static FGTRACE_INIT: extern "C" fn() = fgtrace_startup;

#[used]
#[link_section = ".fini_array"]
static FGTRACE_FINI: extern "C" fn() = fgtrace_shutdown;
