//! The dynamic patcher.
//!
//! Two mechanisms coexist. Prologue patching rewrites the padding nops
//! of `-fpatchable-function-entry` functions into a jump to a
//! per-function stub, which funnels into the shared patch trampoline.
//! The PLT hook redirects the lazy-binding resolver slot (`GOT[2]`) at
//! a counting trampoline that forwards to the real resolver.
//!
//! Every rewrite follows the same discipline: `mprotect` the page
//! writable, write, restore the protection, flush the instruction
//! cache. Each patched site keeps its original bytes in the patch table
//! so `unpatch` can restore them, including from the fatal-signal
//! handler.

use crate::arch::{Arch, Native, ProloguePatch, STUB_SIZE};
use crate::error::McountError;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

/// The saved lazy-binding resolver; the PLT resolver trampoline jumps
/// through this after counting. Kept un-exported so the trampoline's
/// pc-relative reference stays local to this library.
pub(crate) static FGTRACE_REAL_RESOLVER: AtomicUsize = AtomicUsize::new(0);

static PLT_RESOLVE_COUNT: AtomicU64 = AtomicU64::new(0);

/// Called from the PLT resolver trampoline on every lazy resolution.
pub(crate) extern "C" fn fgtrace_plt_count() {
    PLT_RESOLVE_COUNT.fetch_add(1, Ordering::Relaxed);
}

pub fn plt_resolve_count() -> u64 {
    PLT_RESOLVE_COUNT.load(Ordering::Relaxed)
}

const PAGE: usize = 4096;
const POOL_SIZE: usize = 64 * 1024;
/// A stub must be reachable from its site with a single branch; 128MB
/// satisfies the tighter of the two architectures.
const POOL_RANGE: usize = 1 << 27;

fn page_floor(addr: usize) -> usize {
    addr & !(PAGE - 1)
}

fn protect(addr: usize, len: usize, prot: libc::c_int) -> Result<(), McountError> {
    let start = page_floor(addr);
    let size = addr + len - start;
    let size = (size + PAGE - 1) & !(PAGE - 1);
    let rc = unsafe { libc::mprotect(start as *mut libc::c_void, size, prot) };
    if rc != 0 {
        return Err(McountError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Temporarily open a code page for writing, run `f`, seal it again.
fn with_code_writable<R>(
    addr: usize,
    len: usize,
    f: impl FnOnce() -> R,
) -> Result<R, McountError> {
    protect(addr, len, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)?;
    let result = f();
    protect(addr, len, libc::PROT_READ | libc::PROT_EXEC)?;
    Ok(result)
}

/// Open a data page (the GOT under RELRO) for writing. It stays
/// writable afterwards; lazy binding needs it that way anyway.
fn with_data_writable<R>(
    addr: usize,
    len: usize,
    f: impl FnOnce() -> R,
) -> Result<R, McountError> {
    protect(addr, len, libc::PROT_READ | libc::PROT_WRITE)?;
    Ok(f())
}

/// An executable arena for per-function stubs, mapped near the code it
/// serves so the entry branch reaches it.
struct StubPool {
    base: usize,
    used: usize,
}

impl StubPool {
    fn new(hint: usize) -> Result<StubPool, McountError> {
        let base = unsafe {
            libc::mmap(
                page_floor(hint) as *mut libc::c_void,
                POOL_SIZE,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(McountError::Io(std::io::Error::last_os_error()));
        }
        Ok(StubPool {
            base: base as usize,
            used: 0,
        })
    }

    fn in_range(&self, addr: usize) -> bool {
        self.base.abs_diff(addr) < POOL_RANGE
    }

    fn alloc(&mut self) -> Option<usize> {
        if self.used + STUB_SIZE > POOL_SIZE {
            return None;
        }
        let addr = self.base + self.used;
        self.used += STUB_SIZE;
        Some(addr)
    }
}

/// One rewritten call site.
#[derive(Debug, Clone)]
pub struct PatchSite {
    pub addr: usize,
    pub original: [u8; 8],
    pub len: u8,
    pub stub_addr: usize,
}

struct PltHook {
    got2: *mut usize,
    original: usize,
}

unsafe impl Send for PltHook {}

/// All live patches. Immutable after arming except through the
/// stop-the-world re-patch path.
#[derive(Default)]
pub struct PatchTable {
    sites: FxHashMap<usize, PatchSite>,
    pools: Vec<StubPool>,
    plt_hooks: Vec<PltHook>,
}

impl PatchTable {
    pub fn new() -> Self {
        PatchTable::default()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn site(&self, addr: usize) -> Option<&PatchSite> {
        self.sites.get(&addr)
    }

    fn pool_near(&mut self, addr: usize) -> Result<&mut StubPool, McountError> {
        let usable = self
            .pools
            .iter()
            .position(|p| p.in_range(addr) && p.used + STUB_SIZE <= POOL_SIZE);
        let index = match usable {
            Some(i) => i,
            None => {
                self.pools.push(StubPool::new(addr)?);
                let pool = self.pools.last().unwrap();
                if !pool.in_range(addr) {
                    return Err(McountError::PatchFailed {
                        addr,
                        symbol: String::new(),
                        reason: "no stub space reachable from the call site".to_string(),
                    });
                }
                self.pools.len() - 1
            }
        };
        Ok(&mut self.pools[index])
    }

    /// Rewrite the prologue of the function at `func`.
    pub fn patch_function(&mut self, arch: &'static Native, func: usize) -> Result<(), McountError> {
        if self.sites.contains_key(&func) {
            return Ok(());
        }
        let site_bytes = unsafe { std::slice::from_raw_parts(func as *const u8, 16) };
        let stub_addr = {
            let pool = self.pool_near(func)?;
            pool.alloc().ok_or(McountError::StubPoolFull(self.sites.len()))?
        };

        let patch: ProloguePatch = arch.patch_prologue(func, site_bytes, stub_addr)?;

        unsafe {
            std::ptr::copy_nonoverlapping(patch.stub.as_ptr(), stub_addr as *mut u8, STUB_SIZE);
        }
        arch.cache_flush(stub_addr as *const u8, STUB_SIZE);

        let len = patch.len as usize;
        with_code_writable(func, len, || unsafe {
            std::ptr::copy_nonoverlapping(patch.replacement.as_ptr(), func as *mut u8, len);
        })?;
        arch.cache_flush(func as *const u8, len);

        self.sites.insert(
            func,
            PatchSite {
                addr: func,
                original: patch.original,
                len: patch.len,
                stub_addr,
            },
        );
        Ok(())
    }

    /// Redirect the lazy-binding resolver slot of one module.
    pub fn install_plt_hook(&mut self, arch: &'static Native, got_plt: usize) -> Result<(), McountError> {
        let got2 = (got_plt + 2 * std::mem::size_of::<usize>()) as *mut usize;
        let original = unsafe { std::ptr::read(got2) };
        if original == 0 {
            return Err(McountError::PatchFailed {
                addr: got2 as usize,
                symbol: "GOT[2]".to_string(),
                reason: "no lazy resolver installed (bound now?)".to_string(),
            });
        }
        FGTRACE_REAL_RESOLVER.store(original, Ordering::SeqCst);
        with_data_writable(got2 as usize, 8, || unsafe {
            std::ptr::write(got2, arch.plt_resolver_trampoline());
        })?;
        self.plt_hooks.push(PltHook { got2, original });
        Ok(())
    }

    /// Restore every rewritten byte. Used on detach, finish and from
    /// the fatal-signal handler so post-mortem debuggers see pristine
    /// code.
    pub fn unpatch_all(&mut self, arch: &'static Native) {
        for site in self.sites.values() {
            let len = site.len as usize;
            let restore = with_code_writable(site.addr, len, || unsafe {
                std::ptr::copy_nonoverlapping(
                    site.original.as_ptr(),
                    site.addr as *mut u8,
                    len,
                );
            });
            if restore.is_ok() {
                arch.cache_flush(site.addr as *const u8, len);
            }
        }
        self.sites.clear();

        for hook in self.plt_hooks.drain(..) {
            let _ = with_data_writable(hook.got2 as usize, 8, || unsafe {
                std::ptr::write(hook.got2, hook.original);
            });
        }
    }
}

// --- stop-the-world rendezvous -------------------------------------------

static STW_ARRIVED: AtomicUsize = AtomicUsize::new(0);
static STW_RELEASE: AtomicBool = AtomicBool::new(false);
static STW_HANDLER: Once = Once::new();

extern "C" fn stw_handler(_sig: libc::c_int) {
    STW_ARRIVED.fetch_add(1, Ordering::AcqRel);
    while !STW_RELEASE.load(Ordering::Acquire) {
        std::hint::spin_loop();
    }
    STW_ARRIVED.fetch_sub(1, Ordering::AcqRel);
}

fn stw_signal() -> libc::c_int {
    libc::SIGRTMIN() + 2
}

/// Parks every other thread of the process in a signal handler for the
/// lifetime of the guard. Required for re-patching code other threads
/// may be executing.
pub struct StopTheWorld {
    stopped: usize,
}

impl StopTheWorld {
    pub fn stop() -> Result<StopTheWorld, McountError> {
        STW_HANDLER.call_once(|| unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = stw_handler as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigaction(stw_signal(), &action, std::ptr::null_mut());
        });

        STW_RELEASE.store(false, Ordering::Release);
        let me = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
        let pid = std::process::id() as i32;
        let mut stopped = 0;
        for entry in std::fs::read_dir("/proc/self/task")? {
            let entry = entry?;
            let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            if tid == me {
                continue;
            }
            let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, stw_signal()) };
            if rc == 0 {
                stopped += 1;
            }
        }

        let deadline = Instant::now() + Duration::from_millis(100);
        while STW_ARRIVED.load(Ordering::Acquire) < stopped {
            if Instant::now() > deadline {
                // Threads that never arrived are likely exiting; patch
                // anyway rather than deadlock.
                break;
            }
            std::hint::spin_loop();
        }
        Ok(StopTheWorld { stopped })
    }

    pub fn stopped_threads(&self) -> usize {
        self.stopped
    }
}

impl Drop for StopTheWorld {
    fn drop(&mut self) {
        STW_RELEASE.store(true, Ordering::Release);
    }
}

// --- crash recovery -------------------------------------------------------

static CRASH_HANDLER: Once = Once::new();

extern "C" fn crash_handler(sig: libc::c_int) {
    // Restore original bytes so the core dump and any attached debugger
    // see the unpatched text, then let the default action run.
    if let Some(session) = crate::session::Session::current() {
        session.unpatch_on_crash();
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// Install best-effort unpatch-and-reraise handlers for fatal signals.
pub fn install_crash_handler() {
    CRASH_HANDLER.call_once(|| unsafe {
        for sig in [
            libc::SIGSEGV,
            libc::SIGBUS,
            libc::SIGILL,
            libc::SIGFPE,
            libc::SIGABRT,
        ] {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = crash_handler as usize;
            action.sa_flags = libc::SA_RESETHAND;
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    });
}
