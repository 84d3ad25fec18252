//! Process-wide session lifecycle.
//!
//! The constructor parses the `FGTRACE_*` environment, loads the symbol
//! index, compiles the filter set, installs the patches and signal
//! handlers, and flips the session to `Tracing` before `main` runs.
//! Teardown drains the current thread, restores every patched byte and
//! tells the recorder the session is over.
//!
//! State machine: `Init -> Armed -> Tracing -> Flushing -> Done`, with
//! `Detached` reachable from anywhere on a fatal setup error. The
//! trampolines reach the session through one process-wide pointer;
//! per-thread state hangs off a single thread-local.

use crate::arch::{self, Native};
use crate::error::McountError;
use crate::filter::{DynamicState, FilterSet};
use crate::patch::{self, PatchTable};
use crate::pmu::Pmu;
use crate::ring::{RingBacking, ShmBacking};
use crate::sdt::EventTable;
use crate::symbols::SymbolIndex;
use crate::thread::{self, ThreadPool};
use fgtrace_format::spec::{
    parse_event_specs, parse_spec_list, FilterItem, PatternType, PmuGroup, SpecKind,
};
use fgtrace_format::wire::Message;
use fgtrace_format::{env as env_keys, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_STACK, DEFAULT_MAX_THREADS};
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::os::fd::FromRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Init = 0,
    Armed = 1,
    Tracing = 2,
    Flushing = 3,
    Done = 4,
    Detached = 5,
}

impl SessionState {
    fn from_u8(v: u8) -> SessionState {
        match v {
            0 => SessionState::Init,
            1 => SessionState::Armed,
            2 => SessionState::Tracing,
            3 => SessionState::Flushing,
            4 => SessionState::Done,
            _ => SessionState::Detached,
        }
    }
}

/// Everything the engine reads from its environment.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub dir: PathBuf,
    pub session_id: String,
    pub filter: String,
    pub trigger: String,
    pub argument: String,
    pub retval: String,
    pub event: String,
    pub patch: String,
    pub pattern: PatternType,
    pub depth: Option<u16>,
    pub max_stack: usize,
    /// Preallocated thread slots; threads beyond this run untraced.
    pub max_threads: usize,
    pub time_filter: Option<u64>,
    pub size_filter: Option<u64>,
    pub bufsize: u32,
    pub disabled: bool,
    pub libcall: bool,
    pub signal_spec: String,
    pub flush_deadline: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            dir: PathBuf::from("fgtrace.data"),
            session_id: "0000000000000000".to_string(),
            filter: String::new(),
            trigger: String::new(),
            argument: String::new(),
            retval: String::new(),
            event: String::new(),
            patch: String::new(),
            pattern: PatternType::Regex,
            depth: None,
            max_stack: DEFAULT_MAX_STACK,
            max_threads: DEFAULT_MAX_THREADS,
            time_filter: None,
            size_filter: None,
            bufsize: DEFAULT_BUFFER_SIZE,
            disabled: false,
            libcall: true,
            signal_spec: String::new(),
            flush_deadline: Duration::ZERO,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> SessionConfig {
        let var = |key: &str| std::env::var(key).unwrap_or_default();
        let mut config = SessionConfig {
            flush_deadline: Duration::from_secs(1),
            ..SessionConfig::default()
        };
        if let Ok(dir) = std::env::var(env_keys::DIR) {
            config.dir = PathBuf::from(dir);
        }
        if let Ok(sid) = std::env::var(env_keys::SESSION) {
            config.session_id = sid;
        }
        config.filter = var(env_keys::FILTER);
        config.trigger = var(env_keys::TRIGGER);
        config.argument = var(env_keys::ARGUMENT);
        config.retval = var(env_keys::RETVAL);
        config.event = var(env_keys::EVENT);
        config.patch = var(env_keys::PATCH);
        config.signal_spec = var(env_keys::SIGNAL);
        if let Ok(p) = var(env_keys::PATTERN).parse() {
            config.pattern = p;
        }
        if let Ok(d) = var(env_keys::DEPTH).parse() {
            config.depth = Some(d);
        }
        if let Ok(n) = var(env_keys::MAX_STACK).parse() {
            config.max_stack = n;
        }
        if let Ok(n) = var(env_keys::MAX_THREADS).parse::<usize>() {
            config.max_threads = n.max(1);
        }
        if let Ok(t) = humantime::parse_duration(&var(env_keys::TIME_FILTER)) {
            config.time_filter = Some(t.as_nanos() as u64);
        }
        if let Some(n) = fgtrace_format::spec::parse_size_value(&var(env_keys::SIZE_FILTER)) {
            config.size_filter = Some(n);
        }
        if let Some(n) = fgtrace_format::spec::parse_size_value(&var(env_keys::BUFFER)) {
            // Rings need a power-of-two data area.
            config.bufsize = (n as u32).max(4096).next_power_of_two();
        }
        config.disabled = var(env_keys::DISABLED) == "1";
        config.libcall = var(env_keys::NO_LIBCALL) != "1";
        config
    }
}

pub struct Session {
    config: SessionConfig,
    state: AtomicU8,
    recording: AtomicBool,
    end_sent: AtomicBool,
    filters: FilterSet,
    symbols: RwLock<SymbolIndex>,
    patches: Mutex<PatchTable>,
    events: EventTable,
    pmu: Pmu,
    pool: ThreadPool,
    ring_backing: Box<dyn RingBacking>,
    notifier: Mutex<Option<File>>,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

static CURRENT: AtomicPtr<Session> = AtomicPtr::new(std::ptr::null_mut());

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

impl Session {
    /// The process-wide session, once installed by the constructor.
    pub fn current() -> Option<&'static Session> {
        let p = CURRENT.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }

    fn parse_all_specs(config: &SessionConfig) -> Vec<FilterItem> {
        let mut items = Vec::new();
        for (text, kind) in [
            (&config.filter, SpecKind::Filter),
            (&config.trigger, SpecKind::Trigger),
            (&config.argument, SpecKind::Argument),
            (&config.retval, SpecKind::Retval),
        ] {
            if text.is_empty() {
                continue;
            }
            match parse_spec_list(text, kind, config.pattern) {
                Ok(parsed) => items.extend(parsed),
                Err(err) => log::warn!("ignoring bad spec: {err}"),
            }
        }
        items
    }

    /// Arm a session in the current process: load symbols, compile
    /// filters, install patches, write the symbol and event sidecars.
    fn arm(config: SessionConfig) -> Result<&'static Session, McountError> {
        let symbols = SymbolIndex::load_process();

        let items = Self::parse_all_specs(&config);
        let filters = FilterSet::compile(&items, &symbols, config.pattern);

        let event_specs = parse_event_specs(&config.event)?;
        let notes: Vec<_> = symbols
            .modules()
            .iter()
            .flat_map(|m| m.sdt_notes.iter().cloned())
            .collect();
        let mut events = EventTable::build(notes, &event_specs);
        events.arm_all(arch::native());

        let mut patches = PatchTable::new();
        if !config.patch.is_empty() {
            match parse_spec_list(&config.patch, SpecKind::Filter, config.pattern) {
                Ok(patterns) => {
                    for item in &patterns {
                        let targets: Vec<usize> = symbols
                            .symbols()
                            .iter()
                            .filter(|s| {
                                item.pattern.matches(&s.name)
                                    || s.demangled
                                        .as_deref()
                                        .is_some_and(|d| item.pattern.matches(d))
                            })
                            .map(|s| s.addr as usize)
                            .collect();
                        for addr in targets {
                            if let Err(err) = patches.patch_function(arch::native(), addr) {
                                // Refusing the site keeps the target's
                                // semantics intact; report and move on.
                                log::error!("{err}");
                            }
                        }
                    }
                }
                Err(err) => log::warn!("ignoring bad patch spec: {err}"),
            }
        }
        if config.libcall {
            if let Some(got_plt) = symbols.modules().first().and_then(|m| m.got_plt) {
                if let Err(err) = patches.install_plt_hook(arch::native(), got_plt as usize) {
                    log::debug!("plt hook not installed: {err}");
                }
            }
        }

        // Sidecar files; a failure degrades the trace, not the target.
        if let Err(err) = std::fs::create_dir_all(&config.dir) {
            log::warn!("cannot create trace dir {}: {err}", config.dir.display());
        }
        if let Err(err) = symbols.write_symfiles(&config.dir) {
            log::warn!("symbol files incomplete: {err}");
        }
        if let Err(err) = events.write_events_txt(&config.dir) {
            log::warn!("events.txt not written: {err}");
        }

        let notifier = std::env::var(env_keys::PIPE_FD)
            .ok()
            .and_then(|fd| fd.parse::<i32>().ok())
            .map(|fd| unsafe { File::from_raw_fd(fd) });

        install_signal_triggers(&config.signal_spec);
        patch::install_crash_handler();
        unsafe {
            libc::pthread_atfork(None, None, Some(fork_child_handler));
        }

        let recording = !config.disabled;
        let ring_backing = Box::new(ShmBacking {
            session: config.session_id.clone(),
            capacity: config.bufsize,
        });
        let pool = ThreadPool::with_capacity(config.max_threads);
        let session = Box::new(Session {
            config,
            state: AtomicU8::new(SessionState::Armed as u8),
            recording: AtomicBool::new(recording),
            end_sent: AtomicBool::new(false),
            filters,
            symbols: RwLock::new(symbols),
            patches: Mutex::new(patches),
            events,
            pmu: Pmu::new(),
            pool,
            ring_backing,
            notifier: Mutex::new(notifier),
            clock: Box::new(monotonic_ns),
        });
        let leaked: &'static Session = Box::leak(session);
        // Every per-thread slot, ring included, exists before the first
        // traced call; the trampolines only ever claim.
        leaked.pool.fill(leaked);
        CURRENT.store(leaked as *const Session as *mut Session, Ordering::Release);
        Ok(leaked)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_tracing(&self) -> bool {
        self.state() == SessionState::Tracing
    }

    pub fn recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    pub fn set_recording(&self, on: bool) {
        self.recording.store(on, Ordering::Relaxed);
    }

    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    pub fn arch(&self) -> &'static Native {
        arch::native()
    }

    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    pub fn max_stack(&self) -> usize {
        self.config.max_stack
    }

    pub fn flush_deadline(&self) -> Duration {
        self.config.flush_deadline
    }

    pub fn size_filter(&self) -> Option<u64> {
        self.config.size_filter
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn initial_dynamic(&self) -> DynamicState {
        let limit = self
            .config
            .depth
            .map(|d| d.saturating_sub(1))
            .unwrap_or(u16::MAX);
        DynamicState::new(limit, self.config.time_filter.unwrap_or(0))
    }

    /// Short read lock on every entry; writers only appear when a
    /// module is loaded mid-run.
    pub fn symbol_size(&self, addr: usize) -> Option<u64> {
        self.symbols.read().lookup(addr as u64).map(|s| s.size)
    }

    pub fn symbols(&self) -> &RwLock<SymbolIndex> {
        &self.symbols
    }

    pub fn pmu_read(&self, group: PmuGroup) -> Option<([u64; 2], usize)> {
        self.pmu.read(group)
    }

    pub fn event_for(&self, addr: usize) -> Option<u8> {
        self.events.lookup(addr as u64)
    }

    pub fn ring_backing(&self) -> &dyn RingBacking {
        &*self.ring_backing
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    pub fn notify(&self, msg: &Message) {
        let mut guard = self.notifier.lock();
        if let Some(file) = guard.as_mut() {
            if msg.write_to(file).is_err() {
                // The recorder went away; stop talking to it.
                *guard = None;
            }
        }
    }

    /// A dlopen'd module showing up mid-run takes the writer lock; new
    /// entries block on the index only for the duration of the load.
    pub fn load_late_module(&self, path: &std::path::Path, base: u64) -> Result<(), McountError> {
        let mut symbols = self.symbols.write();
        symbols.load_module(path, base)?;
        Ok(())
    }

    /// A `finish` trigger fired: stop tracing, restore the text and let
    /// in-flight frames drain on their own.
    pub fn request_finish(&self) {
        if self
            .state
            .compare_exchange(
                SessionState::Tracing as u8,
                SessionState::Flushing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.set_recording(false);
        if let Some(mut patches) = self.patches.try_lock() {
            patches.unpatch_all(arch::native());
        }
        if !self.end_sent.swap(true, Ordering::AcqRel) {
            self.notify(&Message::SessionEnd { reason: 1 });
        }
    }

    /// Called from the fatal-signal handler. Best effort only.
    pub fn unpatch_on_crash(&self) {
        if let Some(mut patches) = self.patches.try_lock() {
            patches.unpatch_all(arch::native());
        }
    }

    fn teardown(&self) {
        let prev = self
            .state
            .swap(SessionState::Done as u8, Ordering::AcqRel);
        if SessionState::from_u8(prev) == SessionState::Done {
            return;
        }
        thread::teardown_current();
        self.pool.retire_unclaimed();
        let refused = self.pool.exhausted();
        if refused > 0 {
            log::warn!(
                "{refused} thread(s) ran untraced: the {}-slot pool was spent \
                 (raise {})",
                self.config.max_threads,
                env_keys::MAX_THREADS
            );
        }
        if let Some(mut patches) = self.patches.try_lock() {
            patches.unpatch_all(arch::native());
        }
        self.pmu.close_all();
        if !self.end_sent.swap(true, Ordering::AcqRel) {
            self.notify(&Message::SessionEnd { reason: 0 });
        }
    }

    /// Test constructor: a leaked, fully armed session that is not
    /// installed as the process session, backed by whatever the test
    /// supplies.
    #[cfg(test)]
    pub(crate) fn for_test(
        config: SessionConfig,
        filter: &str,
        trigger: &str,
        symbols: Vec<(&str, u64, u64)>,
        backing: std::sync::Arc<crate::ring::HeapBacking>,
        clock: Box<dyn Fn() -> u64 + Send + Sync>,
    ) -> &'static Session {
        let index = crate::symbols::index_for_tests(symbols);
        let mut items = Vec::new();
        if !filter.is_empty() {
            items.extend(parse_spec_list(filter, SpecKind::Filter, config.pattern).unwrap());
        }
        if !trigger.is_empty() {
            items.extend(parse_spec_list(trigger, SpecKind::Trigger, config.pattern).unwrap());
        }
        let filters = FilterSet::compile(&items, &index, config.pattern);
        let recording = !config.disabled;
        let pool = ThreadPool::with_capacity(config.max_threads);
        let leaked: &'static Session = Box::leak(Box::new(Session {
            config,
            state: AtomicU8::new(SessionState::Tracing as u8),
            recording: AtomicBool::new(recording),
            end_sent: AtomicBool::new(false),
            filters,
            symbols: RwLock::new(index),
            patches: Mutex::new(PatchTable::new()),
            events: EventTable::default(),
            pmu: Pmu::new(),
            pool,
            ring_backing: Box::new(backing),
            notifier: Mutex::new(None),
            clock,
        }));
        leaked.pool.fill(leaked);
        leaked
    }
}

/// Entry point for the `.init_array` constructor.
pub(crate) fn startup_from_env() {
    if Session::current().is_some() {
        return;
    }
    // Not launched under the recorder: stay out of the way entirely.
    if std::env::var_os(env_keys::DIR).is_none() {
        return;
    }
    if let Ok(debug) = std::env::var(env_keys::DEBUG) {
        let _ = env_logger::Builder::new()
            .parse_filters(&debug)
            .target(env_logger::Target::Stderr)
            .try_init();
    }
    let config = SessionConfig::from_env();
    match Session::arm(config) {
        Ok(session) => {
            session
                .state
                .store(SessionState::Tracing as u8, Ordering::Release);
            log::debug!(
                "session armed: {} filter entries, {} patches",
                session.filters.len(),
                session.patches.lock().len()
            );
        }
        Err(err) => {
            // The target must run regardless; detach and get out of
            // the way.
            log::error!("fgtrace session failed to arm: {err}");
        }
    }
}

/// Entry point for the `.fini_array` destructor.
pub(crate) fn shutdown() {
    if let Some(session) = Session::current() {
        session.teardown();
    }
}

extern "C" fn fork_child_handler() {
    if let Some(session) = Session::current() {
        thread::handle_fork_child(session);
    }
}

// --- signal triggers ------------------------------------------------------

const SIG_ACT_NONE: u8 = 0;
const SIG_ACT_FINISH: u8 = 1;
const SIG_ACT_TRACE_ON: u8 = 2;
const SIG_ACT_TRACE_OFF: u8 = 3;

static SIGNAL_ACTIONS: [AtomicU8; 65] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const NONE: AtomicU8 = AtomicU8::new(SIG_ACT_NONE);
    [NONE; 65]
};

static SIGNAL_COUNT: AtomicUsize = AtomicUsize::new(0);

extern "C" fn signal_trigger_handler(sig: libc::c_int) {
    SIGNAL_COUNT.fetch_add(1, Ordering::Relaxed);
    let Some(session) = Session::current() else {
        return;
    };
    // Fence off the interrupted shadow stack while the handler runs, so
    // an unlucky interrupt point cannot be mistaken for a longjmp.
    thread::with_thread(session, false, |th| {
        let now = th.tick();
        crate::mcount::signal_boundary(th, now);
    });

    let action = SIGNAL_ACTIONS
        .get(sig as usize)
        .map(|a| a.load(Ordering::Relaxed))
        .unwrap_or(SIG_ACT_NONE);
    match action {
        SIG_ACT_FINISH => session.request_finish(),
        SIG_ACT_TRACE_ON => session.set_recording(true),
        SIG_ACT_TRACE_OFF => session.set_recording(false),
        _ => {}
    }

    thread::with_thread(session, false, |th| {
        crate::mcount::signal_boundary_end(th);
    });
}

/// Parse one signal name: `SIGUSR1`, `USR1` or a number.
pub(crate) fn parse_signal_name(name: &str) -> Option<i32> {
    if let Ok(n) = name.parse::<i32>() {
        return (1..=64).contains(&n).then_some(n);
    }
    let name = name.strip_prefix("SIG").unwrap_or(name);
    match name {
        "HUP" => Some(libc::SIGHUP),
        "INT" => Some(libc::SIGINT),
        "QUIT" => Some(libc::SIGQUIT),
        "TERM" => Some(libc::SIGTERM),
        "USR1" => Some(libc::SIGUSR1),
        "USR2" => Some(libc::SIGUSR2),
        _ => None,
    }
}

/// Parse `SIG@act` pairs: which tracing action to take when a signal
/// arrives. Returns the accepted pairs.
pub(crate) fn parse_signal_spec(spec: &str) -> Vec<(i32, u8)> {
    let mut pairs = Vec::new();
    for token in spec.split(';').map(str::trim).filter(|t| !t.is_empty()) {
        let Some((name, action)) = token.split_once('@') else {
            log::warn!("ignoring malformed signal trigger `{token}`");
            continue;
        };
        let Some(sig) = parse_signal_name(name) else {
            log::warn!("unknown signal `{name}`");
            continue;
        };
        let action = match action {
            "finish" => SIG_ACT_FINISH,
            "trace-on" | "traceon" => SIG_ACT_TRACE_ON,
            "trace-off" | "traceoff" => SIG_ACT_TRACE_OFF,
            other => {
                log::warn!("unknown signal action `{other}`");
                continue;
            }
        };
        pairs.push((sig, action));
    }
    pairs
}

fn install_signal_triggers(spec: &str) {
    for (sig, action) in parse_signal_spec(spec) {
        SIGNAL_ACTIONS[sig as usize].store(action, Ordering::Relaxed);
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = signal_trigger_handler as usize;
            sa.sa_flags = libc::SA_RESTART;
            libc::sigaction(sig, &sa, std::ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_spec_parsing() {
        let pairs = parse_signal_spec("SIGUSR1@finish;USR2@trace-off;12@trace-on");
        assert_eq!(
            pairs,
            vec![
                (libc::SIGUSR1, SIG_ACT_FINISH),
                (libc::SIGUSR2, SIG_ACT_TRACE_OFF),
                (12, SIG_ACT_TRACE_ON),
            ]
        );
        assert!(parse_signal_spec("nonsense").is_empty());
        assert!(parse_signal_spec("SIGWHAT@finish").is_empty());
    }

    #[test]
    fn config_from_env_defaults_are_sane() {
        let config = SessionConfig::default();
        assert_eq!(config.max_stack, DEFAULT_MAX_STACK);
        assert_eq!(config.max_threads, DEFAULT_MAX_THREADS);
        assert_eq!(config.bufsize, DEFAULT_BUFFER_SIZE);
        assert!(config.libcall);
        assert!(!config.disabled);
    }

    #[test]
    fn state_round_trip() {
        for state in [
            SessionState::Init,
            SessionState::Armed,
            SessionState::Tracing,
            SessionState::Flushing,
            SessionState::Done,
            SessionState::Detached,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }
}
