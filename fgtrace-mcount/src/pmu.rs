//! PMU counter groups read through the kernel perf interface.
//!
//! Each trigger-selectable group (cycles+instructions, cache
//! references+misses, branches+misses) is opened as one perf event
//! group: the leader first, then the member with the leader's fd, both
//! excluding the kernel and close-on-exec. A grouped read returns the
//! counter vector atomically. Opening is lazy and failure merely omits
//! the event.

use crate::error::McountError;
use fgtrace_format::spec::PmuGroup;
use parking_lot::Mutex;
use std::os::fd::{FromRawFd, OwnedFd};

const PERF_TYPE_HARDWARE: u32 = 0;

const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;

const PERF_FORMAT_GROUP: u64 = 1 << 3;
const PERF_ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

/// The subset of `perf_event_attr` the group opens need.
#[repr(C)]
struct PerfEventAttr {
    kind: u32,
    size: u32,
    config: u64,
    sample_period_or_freq: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events_or_watermark: u32,
    bp_type: u32,
    bp_addr_or_config: u64,
    bp_len_or_config: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clock_id: i32,
}

fn sys_perf_event_open(
    attr: &PerfEventAttr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> libc::c_int {
    unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const _,
            pid,
            cpu,
            group_fd,
            flags,
        ) as libc::c_int
    }
}

struct GroupConfig {
    name: &'static str,
    events: [(u32, u64); 2],
}

fn group_config(group: PmuGroup) -> GroupConfig {
    match group {
        PmuGroup::Cycle => GroupConfig {
            name: "cycles/instructions",
            events: [
                (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
                (PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
            ],
        },
        PmuGroup::Cache => GroupConfig {
            name: "cache-references/misses",
            events: [
                (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES),
                (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
            ],
        },
        PmuGroup::Branch => GroupConfig {
            name: "branches/branch-misses",
            events: [
                (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
                (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
            ],
        },
    }
}

struct PmuHandle {
    group: PmuGroup,
    /// Leader first. Closed on drop.
    fds: Vec<OwnedFd>,
}

fn open_group(group: PmuGroup) -> Result<PmuHandle, McountError> {
    let config = group_config(group);
    let mut fds: Vec<OwnedFd> = Vec::with_capacity(config.events.len());

    for (kind, event) in config.events {
        let mut attr: PerfEventAttr = unsafe { std::mem::zeroed() };
        attr.size = std::mem::size_of::<PerfEventAttr>() as u32;
        attr.kind = kind;
        attr.config = event;
        attr.read_format = PERF_FORMAT_GROUP;
        attr.flags = PERF_ATTR_FLAG_EXCLUDE_KERNEL;

        let group_fd = fds
            .first()
            .map(|fd| std::os::fd::AsRawFd::as_raw_fd(fd))
            .unwrap_or(-1);
        let fd = sys_perf_event_open(&attr, 0, -1, group_fd, PERF_FLAG_FD_CLOEXEC);
        if fd < 0 {
            return Err(McountError::PmuOpenFailed(
                config.name,
                std::io::Error::last_os_error(),
            ));
        }
        fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
    }
    Ok(PmuHandle { group, fds })
}

impl PmuHandle {
    /// One grouped read: `{nr, counter[nr]}`.
    fn read(&self) -> Option<([u64; 2], usize)> {
        #[repr(C)]
        struct ReadBuf {
            nr: u64,
            values: [u64; 2],
        }
        let mut buf = ReadBuf {
            nr: 0,
            values: [0; 2],
        };
        let want = std::mem::size_of::<ReadBuf>();
        let leader = std::os::fd::AsRawFd::as_raw_fd(&self.fds[0]);
        let n = unsafe { libc::read(leader, &mut buf as *mut ReadBuf as *mut libc::c_void, want) };
        if n < 0 {
            return None;
        }
        let nr = (buf.nr as usize).min(2);
        Some((buf.values, nr))
    }
}

/// Lazily opened PMU groups. `None` caches an open failure so a broken
/// event is probed exactly once.
#[derive(Default)]
pub struct Pmu {
    groups: Mutex<Vec<(PmuGroup, Option<PmuHandle>)>>,
}

impl Pmu {
    pub fn new() -> Self {
        Pmu::default()
    }

    /// Read the counter vector for `group`. Uses `try_lock` so the hot
    /// path never blocks behind another reader; a contended read is
    /// simply skipped.
    pub fn read(&self, group: PmuGroup) -> Option<([u64; 2], usize)> {
        let mut groups = self.groups.try_lock()?;
        if let Some((_, handle)) = groups.iter().find(|(g, _)| *g == group) {
            return handle.as_ref()?.read();
        }
        let handle = match open_group(group) {
            Ok(h) => Some(h),
            Err(err) => {
                log::warn!("{err}; event omitted");
                None
            }
        };
        groups.push((group, handle));
        groups.last().unwrap().1.as_ref()?.read()
    }

    /// Drop every open fd (exec, finish).
    pub fn close_all(&self) {
        if let Some(mut groups) = self.groups.try_lock() {
            groups.clear();
        }
    }
}

impl std::fmt::Debug for PmuHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmuHandle")
            .field("group", &self.group)
            .field("fds", &self.fds.len())
            .finish()
    }
}
