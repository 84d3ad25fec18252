//! Collects the `info` sidecar values from the running system and
//! prints them back for `fgtrace info`.
//!
//! The actual file format lives in `fgtrace-format`; this module only
//! gathers values (procfs, `uname`, `os-release`, `getrusage` of the
//! child) and renders the human-readable summary.

use crate::cli::{TraceOptions, Which};
use crate::error::TraceError;
use crate::recorder::TaskEntry;
use fgtrace_format::info::{format_mem_pair, read_info, write_info, TraceInfo, UsageInfo};
use object::Object;
use std::path::Path;
use std::time::{Duration, SystemTime};

#[allow(clippy::too_many_arguments)]
pub fn write_info_file(
    dir: &Path,
    command: &[String],
    _child_pid: u32,
    exit_status: Option<i32>,
    rusage: Option<&libc::rusage>,
    tasks: &[TaskEntry],
    trace: &TraceOptions,
    elapsed: Duration,
) -> Result<(), TraceError> {
    let mut info = TraceInfo {
        version: Some(fgtrace_format::FGTRACE_VERSION.to_string()),
        pattern_type: Some(trace.match_type.clone()),
        record_date: Some(humantime::format_rfc3339_seconds(SystemTime::now()).to_string()),
        elapsed_time: Some(format!("{:.6} s", elapsed.as_secs_f64())),
        exit_status,
        ..TraceInfo::default()
    };

    let exename = resolve_exename(&command[0]);
    info.build_id = read_build_id(&exename);
    info.exename = Some(exename);
    info.cmdline = Some(own_cmdline());

    fill_cpuinfo(&mut info);
    fill_meminfo(&mut info);
    fill_osinfo(&mut info);
    fill_loadinfo(&mut info);

    if !tasks.is_empty() {
        info.tids = Some(tasks.iter().map(|t| t.tid).collect());
    }
    info.usage = rusage.map(usage_from_rusage);

    let argspec = trace.joined(Which::Argument);
    if !argspec.is_empty() {
        info.argspec = Some(argspec);
    }
    let retspec = trace.joined(Which::Retval);
    if !retspec.is_empty() {
        info.retspec = Some(retspec);
    }

    let (text, _mask) = write_info(&info);
    std::fs::write(dir.join("info"), text)?;
    Ok(())
}

fn resolve_exename(command: &str) -> String {
    let path = Path::new(command);
    std::fs::canonicalize(path)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| command.to_string())
}

fn read_build_id(exename: &str) -> Option<String> {
    let data = std::fs::read(exename).ok()?;
    let obj = object::File::parse(&*data).ok()?;
    let id = obj.build_id().ok()??;
    if id.len() != 20 {
        return None;
    }
    let mut hex = String::with_capacity(40);
    for byte in id {
        hex.push_str(&format!("{byte:02x}"));
    }
    Some(hex)
}

/// The recorder's own command line, quoted, NULs turned into spaces.
fn own_cmdline() -> String {
    let raw = std::fs::read("/proc/self/cmdline").unwrap_or_default();
    let mut line: String = raw
        .iter()
        .map(|&b| if b == 0 { ' ' } else { b as char })
        .collect();
    while line.ends_with(' ') {
        line.pop();
    }
    format!("\"{line}\"")
}

fn fill_cpuinfo(info: &mut TraceInfo) {
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    let possible = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if online > 0 && possible > 0 {
        info.nr_cpus = Some((online as u32, possible as u32));
    }
    info.arch = Some(std::env::consts::ARCH.to_string());
    if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
        for line in cpuinfo.lines() {
            // x86 says "model name", arm says "Processor" or "model name".
            if line.starts_with("model name") || line.starts_with("Processor") {
                if let Some((_, desc)) = line.split_once(':') {
                    info.cpudesc = Some(desc.trim().to_string());
                    break;
                }
            }
        }
    }
}

fn fill_meminfo(info: &mut TraceInfo) {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return;
    };
    let mut total = None;
    let mut free = None;
    for line in meminfo.lines() {
        let field = if line.starts_with("MemTotal:") {
            &mut total
        } else if line.starts_with("MemFree:") {
            &mut free
        } else {
            continue;
        };
        let rest = line.split_once(':').map(|(_, r)| r).unwrap_or_default();
        *field = rest
            .trim()
            .trim_end_matches(" kB")
            .trim()
            .parse::<u64>()
            .ok();
        if total.is_some() && free.is_some() {
            break;
        }
    }
    if let (Some(total), Some(free)) = (total, free) {
        info.meminfo = Some(format_mem_pair(free, total));
    }
}

fn fill_osinfo(info: &mut TraceInfo) {
    if let Ok(uts) = uname::uname() {
        info.kernel = Some(format!("{} {}", uts.sysname, uts.release));
        info.hostname = Some(uts.nodename);
    }
    info.distro = Some(match os_release::OsRelease::new() {
        Ok(release) if !release.pretty_name.is_empty() => {
            format!("\"{}\"", release.pretty_name)
        }
        _ => "\"Unknown\"".to_string(),
    });
}

fn fill_loadinfo(info: &mut TraceInfo) {
    let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") else {
        return;
    };
    let values: Vec<f32> = loadavg
        .split_whitespace()
        .take(3)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() == 3 {
        info.load = Some((values[0], values[1], values[2]));
    }
}

fn usage_from_rusage(r: &libc::rusage) -> UsageInfo {
    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    UsageInfo {
        systime: seconds(r.ru_stime),
        usrtime: seconds(r.ru_utime),
        vctxsw: r.ru_nvcsw,
        ictxsw: r.ru_nivcsw,
        maxrss: r.ru_maxrss,
        major_fault: r.ru_majflt,
        minor_fault: r.ru_minflt,
        rblock: r.ru_inblock,
        wblock: r.ru_oublock,
    }
}

/// Load and parse an existing info file.
pub fn load_info(dir: &Path) -> Result<TraceInfo, TraceError> {
    let path = dir.join("info");
    let text = std::fs::read_to_string(&path)
        .map_err(|_| TraceError::NotATraceDir(dir.to_path_buf()))?;
    let (info, _mask) = read_info(&text)?;
    Ok(info)
}

/// The `fgtrace info` command.
pub fn show_info(dir: &Path) -> Result<(), TraceError> {
    let info = load_info(dir)?;
    println!("# system information");
    println!("# ==================");
    print_field("program version", info.version.as_deref());
    if let Some((online, possible)) = info.nr_cpus {
        print_field(
            "cpu info",
            Some(&format!("{online} / {possible} (online / possible)")),
        );
    }
    print_field("cpu model", info.cpudesc.as_deref());
    print_field("arch", info.arch.as_deref());
    print_field("memory info", info.meminfo.as_deref());
    print_field("kernel version", info.kernel.as_deref());
    print_field("hostname", info.hostname.as_deref());
    print_field("distro", info.distro.as_deref());
    if let Some(load) = info.load {
        print_field(
            "load average",
            Some(&format!("{:.2} / {:.2} / {:.2}", load.0, load.1, load.2)),
        );
    }
    println!("#");
    println!("# process information");
    println!("# ===================");
    print_field("exe image", info.exename.as_deref());
    print_field("build id", info.build_id.as_deref());
    print_field("exit status", info.exit_status.map(|s| s.to_string()).as_deref());
    print_field("cmdline", info.cmdline.as_deref());
    if let Some(tids) = &info.tids {
        let list = tids
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        print_field("nr of tasks", Some(&tids.len().to_string()));
        print_field("task list", Some(&list));
    }
    if let Some(usage) = &info.usage {
        print_field("sys/usr time", Some(&format!("{:.6} / {:.6} s", usage.systime, usage.usrtime)));
        print_field("context switch", Some(&format!("{} / {} (vol / invol)", usage.vctxsw, usage.ictxsw)));
        print_field("max rss", Some(&format!("{} KB", usage.maxrss)));
        print_field("page fault", Some(&format!("{} / {} (major / minor)", usage.major_fault, usage.minor_fault)));
        print_field("disk iops", Some(&format!("{} / {} (read / write)", usage.rblock, usage.wblock)));
    }
    print_field("argspec", info.argspec.as_deref());
    print_field("retspec", info.retspec.as_deref());
    print_field("pattern", info.pattern_type.as_deref());
    print_field("record date", info.record_date.as_deref());
    print_field("elapsed time", info.elapsed_time.as_deref());
    Ok(())
}

fn print_field(name: &str, value: Option<&str>) {
    if let Some(value) = value {
        println!("# {name:<18}: {value}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_collectors_produce_values() {
        let mut info = TraceInfo::default();
        fill_cpuinfo(&mut info);
        fill_meminfo(&mut info);
        fill_osinfo(&mut info);
        fill_loadinfo(&mut info);
        assert!(info.nr_cpus.is_some());
        assert!(info.arch.is_some());
        // /proc may be constrained in odd sandboxes; meminfo and load
        // are best-effort, but on Linux proper they parse.
        assert!(info.meminfo.is_some());
        assert!(info.load.is_some());
        assert!(info.kernel.is_some());
    }

    #[test]
    fn cmdline_is_quoted() {
        let line = own_cmdline();
        assert!(line.starts_with('"'));
        assert!(line.ends_with('"'));
        assert!(!line.contains('\0'));
    }

    #[test]
    fn own_binary_has_readable_build_id_or_none() {
        // Not all toolchains embed one, but the reader must not panic
        // and must produce 40 hex chars when it does.
        let exe = std::env::current_exe().unwrap();
        if let Some(id) = read_build_id(&exe.display().to_string()) {
            assert_eq!(id.len(), 40);
            assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
        }
    }
}
