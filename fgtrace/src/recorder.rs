//! The record side: launch the target suspended with the engine
//! preloaded, then drain its per-thread rings into `<tid>.dat` files
//! while it runs.
//!
//! The child is forked and parked on a pipe so the recorder can finish
//! its setup before the target executes a single instruction; exec
//! failures travel back over a second pipe. The engine announces
//! threads and rings over the control pipe; one consumer thread maps
//! each ring and appends every drained batch to the thread's data file.

use crate::cli::{RecordArgs, Which};
use crate::error::TraceError;
use crate::info;
use fgtrace_format::env as env_keys;
use fgtrace_format::ring::RingConsumer;
use fgtrace_format::wire::Message;
use rand::Rng;
use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::raw::c_char;
use std::os::unix::prelude::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One traced thread, as reported over the control pipe.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
}

pub struct RecordOutcome {
    pub exit_status: Option<i32>,
    pub tasks: Vec<TaskEntry>,
    pub lost_records: u64,
    pub elapsed: Duration,
}

/// Run `fgtrace record`: returns the child's exit code.
pub fn record(args: &RecordArgs) -> Result<i32, TraceError> {
    let outcome = record_into(args, &args.dir)?;
    log::debug!(
        "recorded {} task(s) in {:.3}s, {} records lost",
        outcome.tasks.len(),
        outcome.elapsed.as_secs_f64(),
        outcome.lost_records
    );
    Ok(outcome.exit_status.unwrap_or(0))
}

/// Record into `dir` (which `live` points at a temporary directory).
pub fn record_into(args: &RecordArgs, dir: &Path) -> Result<RecordOutcome, TraceError> {
    prepare_trace_dir(dir)?;
    if args.keep_pid {
        log::warn!("--keep-pid: pid-preserving launch is not implemented; tracing normally");
    }

    let libmcount = find_libmcount(args.libmcount.as_deref())?;
    let session_id = new_session_id();

    // Control pipe: the engine writes framed messages, we read them.
    let (read_end, write_end) = nix::unistd::pipe().map_err(io_err)?;
    set_cloexec(&read_end)?;

    let env_vars = engine_env(args, dir, &session_id, &libmcount, write_end.as_raw_fd());

    let command_name = OsString::from(&args.command[0]);
    let command_args: Vec<OsString> = args.command[1..].iter().map(OsString::from).collect();

    let start = Instant::now();
    let process = SuspendedProcess::launch(&command_name, &command_args, &env_vars).map_err(
        |source| TraceError::Launch {
            command: args.command.join(" "),
            source,
        },
    )?;

    // Hand the write end to the child alone; EOF then means the whole
    // process tree is gone.
    drop(write_end);

    let reader = std::fs::File::from(read_end);
    let rt_prio = args.rt_prio;
    let dir_for_consumer = dir.to_path_buf();
    let consumer =
        std::thread::spawn(move || consume_rings(reader, &dir_for_consumer, rt_prio));

    let child_pid = process.pid();
    let running = process.resume().map_err(|source| TraceError::Launch {
        command: args.command.join(" "),
        source,
    })?;

    let (exit_status, rusage) = running.wait_with_rusage();
    let elapsed = start.elapsed();

    let (tasks, lost_records) = consumer
        .join()
        .unwrap_or_else(|_| (Vec::new(), 0));
    if lost_records > 0 {
        log::warn!("{lost_records} records were lost; the trace is partial");
    }

    write_task_file(dir, &session_id, &tasks)?;
    info::write_info_file(
        dir,
        &args.command,
        child_pid,
        exit_status,
        rusage.as_ref(),
        &tasks,
        &args.trace,
        elapsed,
    )?;
    write_default_opts(dir, args)?;

    Ok(RecordOutcome {
        exit_status,
        tasks,
        lost_records,
        elapsed,
    })
}

fn io_err(err: nix::Error) -> TraceError {
    TraceError::Io(std::io::Error::from(err))
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), TraceError> {
    nix::fcntl::fcntl(
        fd,
        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
    )
    .map_err(io_err)?;
    Ok(())
}

fn new_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

/// A directory is only cleared if it already looks like ours.
fn prepare_trace_dir(dir: &Path) -> Result<(), TraceError> {
    if dir.exists() {
        if !dir.join("info").exists() && dir.read_dir()?.next().is_some() {
            return Err(TraceError::NotATraceDir(dir.to_path_buf()));
        }
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// The engine library normally sits next to our own executable.
fn find_libmcount(explicit: Option<&Path>) -> Result<PathBuf, TraceError> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(TraceError::NoEngineLibrary);
    }
    if let Ok(path) = std::env::var("FGTRACE_LIBMCOUNT") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }
    let exe = std::env::current_exe()?;
    for dir in [exe.parent(), exe.parent().and_then(|p| p.parent())]
        .into_iter()
        .flatten()
    {
        for name in ["libfgtrace_mcount.so", "deps/libfgtrace_mcount.so"] {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    Err(TraceError::NoEngineLibrary)
}

fn engine_env(
    args: &RecordArgs,
    dir: &Path,
    session_id: &str,
    libmcount: &Path,
    pipe_fd: i32,
) -> Vec<(OsString, OsString)> {
    let trace = &args.trace;
    let mut vars: Vec<(OsString, OsString)> = Vec::new();
    let mut push = |key: &str, value: String| {
        if !value.is_empty() {
            vars.push((OsString::from(key), OsString::from(value)));
        }
    };

    let preload = match std::env::var("LD_PRELOAD") {
        Ok(existing) if !existing.is_empty() => {
            format!("{}:{existing}", libmcount.display())
        }
        _ => libmcount.display().to_string(),
    };
    push("LD_PRELOAD", preload);
    push(env_keys::DIR, dir.display().to_string());
    push(env_keys::SESSION, session_id.to_string());
    push(env_keys::PIPE_FD, pipe_fd.to_string());
    push(env_keys::FILTER, trace.joined(Which::Filter));
    push(env_keys::TRIGGER, trace.joined(Which::Trigger));
    push(env_keys::ARGUMENT, trace.joined(Which::Argument));
    push(env_keys::RETVAL, trace.joined(Which::Retval));
    push(env_keys::EVENT, trace.joined(Which::Event));
    push(env_keys::PATCH, trace.joined(Which::Patch));
    push(env_keys::SIGNAL, trace.joined(Which::Signal));
    push(env_keys::PATTERN, trace.match_type.clone());
    if let Some(depth) = trace.depth {
        push(env_keys::DEPTH, depth.to_string());
    }
    if let Some(max_stack) = trace.max_stack {
        push(env_keys::MAX_STACK, max_stack.to_string());
    }
    if let Some(time) = &trace.time_filter {
        push(env_keys::TIME_FILTER, time.clone());
    }
    if let Some(size) = &trace.size_filter {
        push(env_keys::SIZE_FILTER, size.clone());
    }
    if let Some(buffer) = &trace.buffer {
        push(env_keys::BUFFER, buffer.clone());
    }
    if let Some(kernel) = &trace.kernel_buffer {
        push(env_keys::KERNEL_BUFFER, kernel.clone());
    }
    if trace.disable {
        push(env_keys::DISABLED, "1".to_string());
    }
    if trace.no_libcall {
        push(env_keys::NO_LIBCALL, "1".to_string());
    }
    if args.keep_pid {
        push(env_keys::KEEP_PID, "1".to_string());
    }
    if let Some(prio) = args.rt_prio {
        push(env_keys::RT_PRIO, prio.to_string());
    }
    if let Some(debug) = &trace.debug_domain {
        push(env_keys::DEBUG, debug.clone());
    }
    vars
}

// --- consumer --------------------------------------------------------------

/// One announced ring slot. The slot exists before any thread owns it;
/// the data file and task entry appear once a thread id shows up in the
/// ring header.
struct ActiveRing {
    slot: u32,
    tid: u32,
    consumer: RingConsumer,
    _map: memmap2::MmapRaw,
    shm: String,
    file: Option<BufWriter<File>>,
    scratch: Vec<u8>,
}

impl ActiveRing {
    fn open(slot: u32, shm: &str) -> Result<ActiveRing, TraceError> {
        let fd = nix::sys::mman::shm_open(shm, nix::fcntl::OFlag::O_RDWR, nix::sys::stat::Mode::empty())
            .map_err(io_err)?;
        let file = File::from(fd);
        let map = memmap2::MmapRaw::map_raw(&file)?;
        let consumer = unsafe { RingConsumer::new(map.as_ptr()) }?;
        Ok(ActiveRing {
            slot,
            tid: 0,
            consumer,
            _map: map,
            shm: shm.to_string(),
            file: None,
            scratch: Vec::with_capacity(64 * 1024),
        })
    }

    /// Notice a claim: the engine stamped a thread id into the header.
    /// That is the moment the task becomes real on our side.
    fn notice_claim(&mut self, dir: &Path, tasks: &mut Vec<TaskEntry>) -> Result<(), TraceError> {
        if self.tid != 0 {
            return Ok(());
        }
        let tid = self.consumer.tid();
        if tid == 0 {
            return Ok(());
        }
        self.tid = tid;
        let out = File::create(dir.join(format!("{tid}.dat")))?;
        self.file = Some(BufWriter::new(out));
        tasks.push(probe_task(tid));
        Ok(())
    }

    /// Copy whatever the producer has committed into the data file.
    fn drain(&mut self, dir: &Path, tasks: &mut Vec<TaskEntry>) -> Result<usize, TraceError> {
        self.notice_claim(dir, tasks)?;
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        self.scratch.clear();
        let n = self.consumer.drain(&mut self.scratch);
        if n > 0 {
            file.write_all(&self.scratch)?;
        }
        Ok(n)
    }

    fn finish(&mut self, dir: &Path, tasks: &mut Vec<TaskEntry>) -> u64 {
        while self.drain(dir, tasks).map(|n| n > 0).unwrap_or(false) {}
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        let _ = nix::sys::mman::shm_unlink(self.shm.as_str());
        if self.file.is_some() {
            self.consumer.lost() as u64
        } else {
            // Never claimed; nothing was lost in an unused slot.
            0
        }
    }
}

/// Fill in a task entry for a thread the rings just revealed. The
/// thread is usually still alive at this point; fall back gracefully
/// when it is not.
fn probe_task(tid: u32) -> TaskEntry {
    let comm = std::fs::read_to_string(format!("/proc/{tid}/comm"))
        .map(|s| s.trim_end().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::fs::read_to_string(format!("/proc/{tid}/status"))
        .ok()
        .and_then(|status| {
            status.lines().find_map(|line| {
                line.strip_prefix("Tgid:")
                    .and_then(|v| v.trim().parse::<u32>().ok())
            })
        })
        .unwrap_or(tid);
    TaskEntry { pid, tid, comm }
}

/// The consumer loop: drains every announced ring slot until the
/// control pipe reports the end of the session and the rings run dry.
/// Tasks are discovered from the thread ids the engine stamps into the
/// ring headers at claim time.
fn consume_rings(pipe: File, dir: &Path, rt_prio: Option<i32>) -> (Vec<TaskEntry>, u64) {
    if let Some(prio) = rt_prio {
        set_fifo_priority(prio);
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    let reader = std::thread::spawn(move || {
        let mut pipe = pipe;
        loop {
            match Message::read_from(&mut pipe) {
                Ok(Some(msg)) => {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    log::warn!("control pipe error: {err}");
                    break;
                }
            }
        }
        // Dropping tx disconnects the channel; that is the EOF signal.
    });

    let mut rings: Vec<ActiveRing> = Vec::new();
    let mut tasks: Vec<TaskEntry> = Vec::new();
    let mut lost = 0u64;
    let mut eof = false;

    loop {
        loop {
            match rx.try_recv() {
                Ok(msg) => handle_message(msg, &mut rings),
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    eof = true;
                    break;
                }
            }
        }

        let mut drained = 0;
        for ring in &mut rings {
            match ring.drain(dir, &mut tasks) {
                Ok(n) => drained += n,
                Err(err) => log::warn!("ring slot {} drain failed: {err}", ring.slot),
            }
        }
        rings.retain_mut(|ring| {
            if ring.consumer.is_exhausted() {
                lost += ring.finish(dir, &mut tasks);
                false
            } else {
                true
            }
        });

        if eof {
            // The process tree is gone; one final sweep and out.
            for ring in &mut rings {
                lost += ring.finish(dir, &mut tasks);
            }
            rings.clear();
            break;
        }
        if drained == 0 {
            match rx.recv_timeout(Duration::from_millis(2)) {
                Ok(msg) => handle_message(msg, &mut rings),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => eof = true,
            }
        }
    }

    let _ = reader.join();
    tasks.sort_by_key(|t| t.tid);
    (tasks, lost)
}

fn handle_message(msg: Message, rings: &mut Vec<ActiveRing>) {
    match msg {
        Message::RingReady { slot, shm } => match ActiveRing::open(slot, &shm) {
            Ok(ring) => rings.push(ring),
            Err(err) => log::warn!("cannot map ring slot {slot}: {err}"),
        },
        Message::TaskEnd { tid } => {
            log::debug!("task ended: {tid}");
        }
        Message::SessionEnd { reason } => {
            log::debug!("session ended (reason {reason})");
        }
    }
}

fn set_fifo_priority(prio: i32) {
    let param = libc::sched_param {
        sched_priority: prio,
    };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        log::warn!(
            "cannot set real-time priority {prio}: {}",
            std::io::Error::last_os_error()
        );
    }
}

// --- sidecar files ----------------------------------------------------------

fn write_task_file(dir: &Path, session_id: &str, tasks: &[TaskEntry]) -> Result<(), TraceError> {
    let mut out = BufWriter::new(File::create(dir.join("task.txt"))?);
    for task in tasks {
        writeln!(
            out,
            "TASK tid={} pid={} comm={} sid={}",
            task.tid, task.pid, task.comm, session_id
        )?;
    }
    Ok(())
}

/// Options that analysis commands should default to for this trace.
fn write_default_opts(dir: &Path, args: &RecordArgs) -> Result<(), TraceError> {
    let mut opts = Vec::new();
    if let Some(depth) = args.trace.depth {
        opts.push(format!("--depth={depth}"));
    }
    if let Some(time) = &args.trace.time_filter {
        opts.push(format!("--time-filter={time}"));
    }
    if opts.is_empty() {
        return Ok(());
    }
    std::fs::write(dir.join("default.opts"), format!("{}\n", opts.join(" ")))?;
    Ok(())
}

// --- suspended launch -------------------------------------------------------

/// A forked child parked before exec, so tracing is armed before the
/// target starts. The resume pipe releases it; the execerr pipe
/// reports an exec failure back.
pub struct SuspendedProcess {
    pid: nix::unistd::Pid,
    resume_sender: OwnedFd,
    execerr_receiver: OwnedFd,
}

impl SuspendedProcess {
    pub fn launch(
        command: &OsStr,
        args: &[OsString],
        env_vars: &[(OsString, OsString)],
    ) -> std::io::Result<SuspendedProcess> {
        let argv: Vec<CString> = std::iter::once(command)
            .chain(args.iter().map(|a| a.as_os_str()))
            .map(|s| CString::new(s.as_bytes().to_vec()).unwrap())
            .collect();
        let argv_ptrs: Vec<*const c_char> = argv
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        // Merge the requested variables over the current environment.
        let mut merged: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
        for (key, value) in env_vars {
            merged.insert(key.clone(), value.clone());
        }
        let envp: Vec<CString> = merged
            .into_iter()
            .filter_map(|(mut key, value)| {
                key.push("=");
                key.push(&value);
                CString::new(key.as_bytes().to_vec()).ok()
            })
            .collect();
        let envp_ptrs: Vec<*const c_char> = envp
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let (resume_r, resume_w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
        let (execerr_r, execerr_w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;

        match unsafe { nix::unistd::fork() }? {
            nix::unistd::ForkResult::Child => {
                drop(resume_w);
                drop(execerr_r);
                Self::child(resume_r, execerr_w, &argv_ptrs, &envp_ptrs)
            }
            nix::unistd::ForkResult::Parent { child } => {
                drop(resume_r);
                drop(execerr_w);
                Ok(SuspendedProcess {
                    pid: child,
                    resume_sender: resume_w,
                    execerr_receiver: execerr_r,
                })
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn child(
        resume: OwnedFd,
        execerr: OwnedFd,
        argv: &[*const c_char],
        envp: &[*const c_char],
    ) -> ! {
        // Wait for the go-ahead byte; a closed pipe means the recorder
        // gave up and we should vanish quietly.
        loop {
            let mut buf = [0u8; 1];
            match nix::unistd::read(&resume, &mut buf) {
                Ok(0) => std::process::exit(0),
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => {}
                Err(_) => std::process::exit(1),
            }
        }
        unsafe {
            libc::execvpe(argv[0], argv.as_ptr(), envp.as_ptr());
        }
        // Exec failed; report errno and die without running atexit
        // handlers.
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(0)
            .to_be_bytes();
        let _ = nix::unistd::write(execerr, &errno);
        unsafe { libc::_exit(127) }
    }

    pub fn resume(self) -> std::io::Result<RunningProcess> {
        nix::unistd::write(&self.resume_sender, &[0x42])?;
        drop(self.resume_sender);

        loop {
            let mut buf = [0u8; 4];
            match nix::unistd::read(&self.execerr_receiver, &mut buf) {
                Ok(0) => break, // pipe closed by exec: success
                Ok(4) => {
                    let errno = i32::from_be_bytes(buf);
                    let _ = nix::sys::wait::waitpid(self.pid, None);
                    return Err(std::io::Error::from_raw_os_error(errno));
                }
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => {}
                Err(err) => return Err(std::io::Error::from(err)),
            }
        }
        Ok(RunningProcess { pid: self.pid })
    }
}

pub struct RunningProcess {
    pid: nix::unistd::Pid,
}

impl RunningProcess {
    /// Wait for the child, collecting its resource usage for the info
    /// sidecar. Returns the exit status (negated signal number when
    /// killed).
    pub fn wait_with_rusage(self) -> (Option<i32>, Option<libc::rusage>) {
        let mut status: libc::c_int = 0;
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        loop {
            let rc = unsafe { libc::wait4(self.pid.as_raw(), &mut status, 0, &mut rusage) };
            if rc >= 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return (None, None);
            }
        }
        let code = if libc::WIFEXITED(status) {
            Some(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            Some(-libc::WTERMSIG(status))
        } else {
            None
        };
        (code, Some(rusage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_hex() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 16);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn refuses_to_clear_foreign_directories() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("precious.txt"), "do not delete").unwrap();
        assert!(matches!(
            prepare_trace_dir(&target),
            Err(TraceError::NotATraceDir(_))
        ));
        assert!(target.join("precious.txt").exists());
    }

    #[test]
    fn clears_previous_trace_directories() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("info"), "# fgtrace info\n").unwrap();
        std::fs::write(target.join("1.dat"), "x").unwrap();
        prepare_trace_dir(&target).unwrap();
        assert!(target.exists());
        assert!(!target.join("1.dat").exists());
    }

    #[test]
    fn suspended_child_runs_after_resume() {
        let marker = tempfile::NamedTempFile::new().unwrap();
        let path = marker.path().to_string_lossy().into_owned();
        let process = SuspendedProcess::launch(
            OsStr::new("sh"),
            &[
                OsString::from("-c"),
                OsString::from(format!("echo done > {path}")),
            ],
            &[],
        )
        .unwrap();
        let running = process.resume().unwrap();
        let (status, rusage) = running.wait_with_rusage();
        assert_eq!(status, Some(0));
        assert!(rusage.is_some());
        let contents = std::fs::read_to_string(marker.path()).unwrap();
        assert_eq!(contents.trim(), "done");
    }

    #[test]
    fn exec_failure_is_reported() {
        let process = SuspendedProcess::launch(
            OsStr::new("/nonexistent/never-a-binary"),
            &[],
            &[],
        )
        .unwrap();
        assert!(process.resume().is_err());
    }
}
