//! Architecture backends.
//!
//! The engine is architecture-independent; everything that is not lives
//! behind the [`Arch`] capability trait: the saved-register layout, the
//! prologue patch and PLT hook encodings, instruction cache maintenance
//! and the SDT event hook. The trampolines themselves are `global_asm!`
//! in the per-architecture modules.

use crate::error::McountError;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{RetRegs, SavedRegs, X86_64 as Native};

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::{Aarch64 as Native, RetRegs, SavedRegs};

/// Size of one stub slot in the patch pool.
pub const STUB_SIZE: usize = 32;

/// Register-passing shape of the calling convention.
#[derive(Debug, Clone, Copy)]
pub struct RegLayout {
    pub int_args: u8,
    pub float_args: u8,
}

/// A fully encoded prologue patch: the bytes to write at the function
/// entry, the bytes they replace, and the contents of the stub slot.
#[derive(Debug, Clone)]
pub struct ProloguePatch {
    pub original: [u8; 8],
    pub replacement: [u8; 8],
    /// Number of instruction bytes rewritten at the entry point.
    pub len: u8,
    pub stub: [u8; STUB_SIZE],
}

/// The architecture capability interface.
pub trait Arch: Send + Sync {
    fn name(&self) -> &'static str;

    fn reg_layout(&self) -> RegLayout;

    /// Fetch 1-based integer argument `idx` from the saved registers.
    /// Arguments beyond the register window live on the caller stack at
    /// `parent_loc`; `None` asks the caller to read them from there.
    fn int_arg(&self, regs: &SavedRegs, idx: u8) -> Option<u64>;

    /// Fetch 1-based float argument `idx` (full vector register).
    fn float_arg(&self, regs: &SavedRegs, idx: u8) -> Option<[u8; 16]>;

    fn int_retval(&self, rets: &RetRegs) -> u64;

    fn float_retval(&self, rets: &RetRegs) -> [u8; 16];

    /// Address of the return trampoline that replaces saved return
    /// addresses.
    fn return_trampoline(&self) -> usize;

    /// Encode a prologue patch for the function at `func`, whose first
    /// bytes are `site`. The stub will live at `stub_addr`. Fails when
    /// the prologue is not a recognized patchable pattern.
    fn patch_prologue(
        &self,
        func: usize,
        site: &[u8],
        stub_addr: usize,
    ) -> Result<ProloguePatch, McountError>;

    /// Size of the PLT header entry (PLT0) on this architecture.
    fn plt0_size(&self) -> usize;

    /// Offset within PLT0 where the GOT address is materialized.
    fn plthook_addr_offset(&self) -> usize;

    /// Address of the resolver trampoline installed into `GOT[2]`.
    fn plt_resolver_trampoline(&self) -> usize;

    /// Flush the instruction cache after rewriting code.
    fn cache_flush(&self, addr: *const u8, len: usize);

    /// Arm an SDT probe site. Returns `Ok(false)` where the architecture
    /// has no probe hook; the probe is then discovered but dormant.
    fn enable_event(&self, probe_addr: usize) -> Result<bool, McountError>;
}

/// The backend for the architecture we were compiled for.
pub fn native() -> &'static Native {
    static NATIVE: Native = Native;
    &NATIVE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_layout_is_sane() {
        let arch = native();
        let layout = arch.reg_layout();
        assert!(layout.int_args >= 6);
        assert_eq!(layout.float_args, 8);
        assert_ne!(arch.return_trampoline(), 0);
    }
}
