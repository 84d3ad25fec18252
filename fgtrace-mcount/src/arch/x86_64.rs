//! x86_64 backend: System V calling convention, `mcount` instrumentation
//! and 5-byte-nop prologue patching.

use super::{Arch, McountError, ProloguePatch, RegLayout, STUB_SIZE};
use std::arch::global_asm;

/// Argument registers captured by the entry trampolines. The layout must
/// match the stores in the assembly below.
#[repr(C)]
pub struct SavedRegs {
    pub r9: u64,
    pub r8: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    /// Number of vector registers used, for variadic callees.
    pub rax: u64,
    _pad: u64,
    pub xmm: [[u8; 16]; 8],
}

/// Return-value registers captured by the return trampoline.
#[repr(C)]
pub struct RetRegs {
    pub rax: u64,
    pub rdx: u64,
    pub xmm0: [u8; 16],
    pub xmm1: [u8; 16],
}

pub struct X86_64;

// The compiler-inserted profiling call. The callee prologue has already
// set up rbp, so the caller's return address sits at [rbp + 8] and the
// return into the callee body at [rsp] (our own return address).
//
// Frame size 200 keeps rsp 16-byte aligned at the call below.
global_asm!(
    r#"
    .text
    .globl mcount
    .globl _mcount
    .type mcount,@function
mcount:
_mcount:
    sub rsp, 200
    mov qword ptr [rsp + 0],  r9
    mov qword ptr [rsp + 8],  r8
    mov qword ptr [rsp + 16], rcx
    mov qword ptr [rsp + 24], rdx
    mov qword ptr [rsp + 32], rsi
    mov qword ptr [rsp + 40], rdi
    mov qword ptr [rsp + 48], rax
    movdqu [rsp + 64],  xmm0
    movdqu [rsp + 80],  xmm1
    movdqu [rsp + 96],  xmm2
    movdqu [rsp + 112], xmm3
    movdqu [rsp + 128], xmm4
    movdqu [rsp + 144], xmm5
    movdqu [rsp + 160], xmm6
    movdqu [rsp + 176], xmm7
    lea rdi, [rbp + 8]
    mov rsi, qword ptr [rsp + 200]
    mov rdx, rsp
    call {entry}
    movdqu xmm7, [rsp + 176]
    movdqu xmm6, [rsp + 160]
    movdqu xmm5, [rsp + 144]
    movdqu xmm4, [rsp + 128]
    movdqu xmm3, [rsp + 112]
    movdqu xmm2, [rsp + 96]
    movdqu xmm1, [rsp + 80]
    movdqu xmm0, [rsp + 64]
    mov rax, qword ptr [rsp + 48]
    mov rdi, qword ptr [rsp + 40]
    mov rsi, qword ptr [rsp + 32]
    mov rdx, qword ptr [rsp + 24]
    mov rcx, qword ptr [rsp + 16]
    mov r8,  qword ptr [rsp + 8]
    mov r9,  qword ptr [rsp + 0]
    add rsp, 200
    ret
"#,
    entry = sym crate::mcount::fgtrace_entry,
);

// The traced function returns here instead of to its caller. Preserve
// the return-value registers around the engine call, then jump to the
// real return address it hands back.
global_asm!(
    r#"
    .text
    .globl fgtrace_return_trampoline
    .type fgtrace_return_trampoline,@function
fgtrace_return_trampoline:
    sub rsp, 64
    mov qword ptr [rsp + 0], rax
    mov qword ptr [rsp + 8], rdx
    movdqu [rsp + 16], xmm0
    movdqu [rsp + 32], xmm1
    mov rdi, rsp
    lea rsi, [rsp + 64]
    call {exit}
    mov qword ptr [rsp + 48], rax
    movdqu xmm1, [rsp + 32]
    movdqu xmm0, [rsp + 16]
    mov rdx, qword ptr [rsp + 8]
    mov rax, qword ptr [rsp + 0]
    add rsp, 48
    ret
"#,
    exit = sym crate::mcount::fgtrace_exit,
);

// Entry path for dynamically patched prologues. The stub did an
// indirect `call` through its trampoline pointer, so [rsp] is the stub
// return address (stub + 6) and [rsp + 8] the caller's return address.
// The function address literal lives at stub + 16, i.e. 10 bytes past
// the stub return address.
global_asm!(
    r#"
    .text
    .globl fgtrace_patch_trampoline
    .type fgtrace_patch_trampoline,@function
fgtrace_patch_trampoline:
    sub rsp, 192
    mov qword ptr [rsp + 0],  r9
    mov qword ptr [rsp + 8],  r8
    mov qword ptr [rsp + 16], rcx
    mov qword ptr [rsp + 24], rdx
    mov qword ptr [rsp + 32], rsi
    mov qword ptr [rsp + 40], rdi
    mov qword ptr [rsp + 48], rax
    movdqu [rsp + 64],  xmm0
    movdqu [rsp + 80],  xmm1
    movdqu [rsp + 96],  xmm2
    movdqu [rsp + 112], xmm3
    movdqu [rsp + 128], xmm4
    movdqu [rsp + 144], xmm5
    movdqu [rsp + 160], xmm6
    movdqu [rsp + 176], xmm7
    mov rax, qword ptr [rsp + 192]
    mov rsi, qword ptr [rax + 10]
    lea rdi, [rsp + 200]
    mov rdx, rsp
    call {entry}
    movdqu xmm7, [rsp + 176]
    movdqu xmm6, [rsp + 160]
    movdqu xmm5, [rsp + 144]
    movdqu xmm4, [rsp + 128]
    movdqu xmm3, [rsp + 112]
    movdqu xmm2, [rsp + 96]
    movdqu xmm1, [rsp + 80]
    movdqu xmm0, [rsp + 64]
    mov rax, qword ptr [rsp + 48]
    mov rdi, qword ptr [rsp + 40]
    mov rsi, qword ptr [rsp + 32]
    mov rdx, qword ptr [rsp + 24]
    mov rcx, qword ptr [rsp + 16]
    mov r8,  qword ptr [rsp + 8]
    mov r9,  qword ptr [rsp + 0]
    add rsp, 192
    ret
"#,
    entry = sym crate::mcount::fgtrace_entry,
);

// Stand-in for the lazy-binding resolver: GOT[2] points here while the
// PLT hook is installed. Count the resolution, then fall through to the
// real resolver with the resolver's two stack words untouched.
global_asm!(
    r#"
    .text
    .globl fgtrace_plt_resolver_trampoline
    .type fgtrace_plt_resolver_trampoline,@function
fgtrace_plt_resolver_trampoline:
    sub rsp, 56
    mov qword ptr [rsp + 0],  rdi
    mov qword ptr [rsp + 8],  rsi
    mov qword ptr [rsp + 16], rdx
    mov qword ptr [rsp + 24], rcx
    mov qword ptr [rsp + 32], r8
    mov qword ptr [rsp + 40], r9
    mov qword ptr [rsp + 48], rax
    mov rdx, rsp
    and rsp, -16
    push rdx
    push rdx
    call {count}
    pop rdx
    pop rdx
    mov rsp, rdx
    mov rax, qword ptr [rsp + 48]
    mov r9,  qword ptr [rsp + 40]
    mov r8,  qword ptr [rsp + 32]
    mov rcx, qword ptr [rsp + 24]
    mov rdx, qword ptr [rsp + 16]
    mov rsi, qword ptr [rsp + 8]
    mov rdi, qword ptr [rsp + 0]
    add rsp, 56
    jmp qword ptr [rip + {resolver}]
"#,
    count = sym crate::patch::fgtrace_plt_count,
    resolver = sym crate::patch::FGTRACE_REAL_RESOLVER,
);

extern "C" {
    pub fn fgtrace_return_trampoline();
    pub fn fgtrace_patch_trampoline();
    pub fn fgtrace_plt_resolver_trampoline();
}

/// The 5-byte nop emitted for `-fpatchable-function-entry` padding.
pub const NOP5: [u8; 5] = [0x0f, 0x1f, 0x44, 0x00, 0x00];

fn rel32(from: usize, to: usize) -> Result<i32, McountError> {
    let delta = (to as i64) - (from as i64);
    i32::try_from(delta).map_err(|_| McountError::PatchFailed {
        addr: from,
        symbol: String::new(),
        reason: format!("branch target {to:#x} out of rel32 range"),
    })
}

impl Arch for X86_64 {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn reg_layout(&self) -> RegLayout {
        RegLayout {
            int_args: 6,
            float_args: 8,
        }
    }

    fn int_arg(&self, regs: &SavedRegs, idx: u8) -> Option<u64> {
        match idx {
            1 => Some(regs.rdi),
            2 => Some(regs.rsi),
            3 => Some(regs.rdx),
            4 => Some(regs.rcx),
            5 => Some(regs.r8),
            6 => Some(regs.r9),
            _ => None,
        }
    }

    fn float_arg(&self, regs: &SavedRegs, idx: u8) -> Option<[u8; 16]> {
        regs.xmm.get(idx.checked_sub(1)? as usize).copied()
    }

    fn int_retval(&self, rets: &RetRegs) -> u64 {
        rets.rax
    }

    fn float_retval(&self, rets: &RetRegs) -> [u8; 16] {
        rets.xmm0
    }

    fn return_trampoline(&self) -> usize {
        fgtrace_return_trampoline as usize
    }

    fn patch_prologue(
        &self,
        func: usize,
        site: &[u8],
        stub_addr: usize,
    ) -> Result<ProloguePatch, McountError> {
        if site.len() < NOP5.len() || site[..NOP5.len()] != NOP5 {
            return Err(McountError::PatchFailed {
                addr: func,
                symbol: String::new(),
                reason: "prologue is not a patchable 5-byte nop".to_string(),
            });
        }

        let mut original = [0u8; 8];
        original[..5].copy_from_slice(&site[..5]);

        // jmp rel32 to the stub.
        let mut replacement = [0u8; 8];
        replacement[0] = 0xe9;
        replacement[1..5].copy_from_slice(&rel32(func + 5, stub_addr)?.to_le_bytes());

        // Stub: call the shared trampoline through an absolute pointer
        // (the pool may sit far from our text), resume the function
        // past the patched nop, and keep the function address as a
        // literal the trampoline reads through the stub return address.
        let mut stub = [0u8; STUB_SIZE];
        stub[0..2].copy_from_slice(&[0xff, 0x15]); // call [rip + 0x12]
        stub[2..6].copy_from_slice(&0x12u32.to_le_bytes());
        stub[6] = 0xe9; // jmp func + 5
        stub[7..11].copy_from_slice(&rel32(stub_addr + 11, func + 5)?.to_le_bytes());
        stub[11..16].copy_from_slice(&NOP5);
        stub[16..24].copy_from_slice(&(func as u64).to_le_bytes());
        stub[24..32].copy_from_slice(&(fgtrace_patch_trampoline as u64).to_le_bytes());

        Ok(ProloguePatch {
            original,
            replacement,
            len: 5,
            stub,
        })
    }

    fn plt0_size(&self) -> usize {
        16
    }

    fn plthook_addr_offset(&self) -> usize {
        2
    }

    fn plt_resolver_trampoline(&self) -> usize {
        fgtrace_plt_resolver_trampoline as usize
    }

    fn cache_flush(&self, _addr: *const u8, _len: usize) {
        // Instruction fetch is coherent with data writes on x86_64.
    }

    fn enable_event(&self, _probe_addr: usize) -> Result<bool, McountError> {
        // SDT sites are single-byte nops; there is no room for a hook.
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_rejects_non_nop_prologue() {
        let arch = X86_64;
        let site = [0x55, 0x48, 0x89, 0xe5, 0x90]; // push rbp; mov rbp,rsp
        assert!(arch.patch_prologue(0x1000, &site, 0x2000).is_err());
    }

    #[test]
    fn patch_encodes_jump_and_stub() {
        let arch = X86_64;
        let func = 0x40_1000usize;
        let stub = 0x40_2000usize;
        let patch = arch.patch_prologue(func, &NOP5, stub).unwrap();
        assert_eq!(patch.len, 5);
        assert_eq!(patch.original[..5], NOP5);
        assert_eq!(patch.replacement[0], 0xe9);
        let rel = i32::from_le_bytes(patch.replacement[1..5].try_into().unwrap());
        assert_eq!((func + 5).wrapping_add(rel as usize), stub);

        // The stub calls the trampoline through its pointer slot...
        assert_eq!(&patch.stub[0..2], &[0xff, 0x15]);
        let tramp = u64::from_le_bytes(patch.stub[24..32].try_into().unwrap());
        assert_eq!(tramp, fgtrace_patch_trampoline as u64);
        // ...jumps back past the patched bytes...
        assert_eq!(patch.stub[6], 0xe9);
        let back = i32::from_le_bytes(patch.stub[7..11].try_into().unwrap());
        assert_eq!((stub + 11).wrapping_add(back as usize), func + 5);
        // ...and carries the function address at the fixed literal slot.
        let literal = u64::from_le_bytes(patch.stub[16..24].try_into().unwrap());
        assert_eq!(literal, func as u64);
    }

    #[test]
    fn far_targets_are_refused() {
        let arch = X86_64;
        assert!(arch
            .patch_prologue(0x1000, &NOP5, 0x1000 + (1usize << 40))
            .is_err());
    }
}
