//! The `info` sidecar file codec.
//!
//! The info file is a key:value text header describing the recording
//! environment. Sections are written in a fixed order and announced by a
//! presence bitmask on the second line; multi-line sections declare their
//! length with a `lines=N` preamble. The codec is table driven: every
//! section is a `{tag, bit, encode, decode}` row, and both halves are
//! testable without touching the filesystem. Collecting the values (from
//! /proc, getrusage and friends) is the recorder's job, not ours.

use crate::FormatError;
use bitflags::bitflags;
use std::fmt::Write as _;

bitflags! {
    /// Which sections are present in an info file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InfoMask: u64 {
        const EXE_NAME = 1 << 0;
        const EXE_BUILD_ID = 1 << 1;
        const EXIT_STATUS = 1 << 2;
        const CMDLINE = 1 << 3;
        const CPUINFO = 1 << 4;
        const MEMINFO = 1 << 5;
        const OSINFO = 1 << 6;
        const TASKINFO = 1 << 7;
        const USAGEINFO = 1 << 8;
        const LOADINFO = 1 << 9;
        const ARG_SPEC = 1 << 10;
        const RECORD_DATE = 1 << 11;
        const PATTERN_TYPE = 1 << 12;
        const VERSION = 1 << 13;
    }
}

/// Resource usage of the traced process, from `getrusage(2)` of the child.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UsageInfo {
    pub systime: f64,
    pub usrtime: f64,
    pub vctxsw: i64,
    pub ictxsw: i64,
    pub maxrss: i64,
    pub major_fault: i64,
    pub minor_fault: i64,
    pub rblock: i64,
    pub wblock: i64,
}

/// Everything an info file can carry. `None` fields are left out and
/// their bit stays clear in the mask.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceInfo {
    pub exename: Option<String>,
    /// 40 hex characters naming the 20-byte GNU build-id.
    pub build_id: Option<String>,
    pub exit_status: Option<i32>,
    pub cmdline: Option<String>,

    pub nr_cpus: Option<(u32, u32)>,
    pub cpudesc: Option<String>,
    pub arch: Option<String>,

    /// Pre-formatted `free / total UNIT` string.
    pub meminfo: Option<String>,

    pub kernel: Option<String>,
    pub hostname: Option<String>,
    pub distro: Option<String>,

    pub tids: Option<Vec<u32>>,

    pub usage: Option<UsageInfo>,
    pub load: Option<(f32, f32, f32)>,

    pub argspec: Option<String>,
    pub retspec: Option<String>,
    pub argauto: Option<String>,
    pub retauto: Option<String>,
    pub enumauto: Option<String>,
    pub auto_args: bool,

    pub record_date: Option<String>,
    pub elapsed_time: Option<String>,

    pub pattern_type: Option<String>,
    pub version: Option<String>,
}

/// Scale a KB figure from /proc/meminfo into a human string with one
/// decimal digit and an explicit unit.
pub fn format_mem_pair(free_kb: u64, total_kb: u64) -> String {
    const UNITS: &[&str] = &["KB", "MB", "GB", "TB"];
    let mut unit = 0;
    let mut free = free_kb as f64;
    let mut total = total_kb as f64;
    while total >= 1024.0 && unit + 1 < UNITS.len() {
        free /= 1024.0;
        total /= 1024.0;
        unit += 1;
    }
    format!("{:.1} / {:.1} {} (free / total)", free, total, UNITS[unit])
}

struct Section {
    bit: InfoMask,
    encode: fn(&TraceInfo) -> Option<String>,
    decode: fn(&mut LineCursor<'_>, &mut TraceInfo) -> Result<(), FormatError>,
}

struct LineCursor<'a> {
    lines: &'a [String],
    pos: usize,
}

impl<'a> LineCursor<'a> {
    fn next(&mut self) -> Result<&'a str, FormatError> {
        let line = self
            .lines
            .get(self.pos)
            .ok_or_else(|| FormatError::BadInfoLine("<eof>".to_string()))?;
        self.pos += 1;
        Ok(line)
    }

    /// Read the next line and strip the expected `tag:` prefix.
    fn tagged(&mut self, tag: &str) -> Result<&'a str, FormatError> {
        let line = self.next()?;
        line.strip_prefix(tag)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| FormatError::BadInfoLine(line.to_string()))
    }

    fn section_lines(&mut self, tag: &str) -> Result<usize, FormatError> {
        let value = self.tagged(tag)?;
        value
            .strip_prefix("lines=")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| FormatError::BadInfoLine(value.to_string()))
    }
}

fn encode_cpuinfo(info: &TraceInfo) -> Option<String> {
    let (online, possible) = info.nr_cpus?;
    let mut out = String::new();
    let mut lines = 1;
    if info.cpudesc.is_some() {
        lines += 1;
    }
    if info.arch.is_some() {
        lines += 1;
    }
    let _ = writeln!(out, "cpuinfo:lines={lines}");
    let _ = writeln!(out, "cpuinfo:nr_cpus={online} / {possible} (online/possible)");
    if let Some(desc) = &info.cpudesc {
        let _ = writeln!(out, "cpuinfo:desc={desc}");
    }
    if let Some(arch) = &info.arch {
        let _ = writeln!(out, "cpuinfo:arch={arch}");
    }
    Some(out)
}

fn decode_cpuinfo(cursor: &mut LineCursor<'_>, info: &mut TraceInfo) -> Result<(), FormatError> {
    let lines = cursor.section_lines("cpuinfo")?;
    for _ in 0..lines {
        let value = cursor.tagged("cpuinfo")?;
        if let Some(rest) = value.strip_prefix("nr_cpus=") {
            let nums: Vec<u32> = rest
                .split(|c: char| !c.is_ascii_digit())
                .filter(|s| !s.is_empty())
                .take(2)
                .filter_map(|s| s.parse().ok())
                .collect();
            if nums.len() == 2 {
                info.nr_cpus = Some((nums[0], nums[1]));
            }
        } else if let Some(desc) = value.strip_prefix("desc=") {
            info.cpudesc = Some(desc.to_string());
            // Old files have no arch key; infer it from the description.
            if info.arch.is_none() {
                if desc.starts_with("ARMv6") || desc.starts_with("ARMv7") {
                    info.arch = Some("arm".to_string());
                } else if desc.starts_with("ARM64") {
                    info.arch = Some("aarch64".to_string());
                }
            }
        } else if let Some(arch) = value.strip_prefix("arch=") {
            info.arch = Some(arch.to_string());
        }
    }
    Ok(())
}

fn encode_osinfo(info: &TraceInfo) -> Option<String> {
    let kernel = info.kernel.as_ref()?;
    let mut out = String::new();
    let _ = writeln!(out, "osinfo:lines=3");
    let _ = writeln!(out, "osinfo:kernel={kernel}");
    let _ = writeln!(
        out,
        "osinfo:hostname={}",
        info.hostname.as_deref().unwrap_or("unknown")
    );
    let _ = writeln!(
        out,
        "osinfo:distro={}",
        info.distro.as_deref().unwrap_or("\"Unknown\"")
    );
    Some(out)
}

fn decode_osinfo(cursor: &mut LineCursor<'_>, info: &mut TraceInfo) -> Result<(), FormatError> {
    let lines = cursor.section_lines("osinfo")?;
    for _ in 0..lines {
        let value = cursor.tagged("osinfo")?;
        if let Some(v) = value.strip_prefix("kernel=") {
            info.kernel = Some(v.to_string());
        } else if let Some(v) = value.strip_prefix("hostname=") {
            info.hostname = Some(v.to_string());
        } else if let Some(v) = value.strip_prefix("distro=") {
            info.distro = Some(v.to_string());
        }
    }
    Ok(())
}

fn encode_taskinfo(info: &TraceInfo) -> Option<String> {
    let tids = info.tids.as_ref()?;
    let mut out = String::new();
    let _ = writeln!(out, "taskinfo:lines=2");
    let _ = writeln!(out, "taskinfo:nr_tid={}", tids.len());
    let list = tids
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let _ = writeln!(out, "taskinfo:tids={list}");
    Some(out)
}

fn decode_taskinfo(cursor: &mut LineCursor<'_>, info: &mut TraceInfo) -> Result<(), FormatError> {
    let lines = cursor.section_lines("taskinfo")?;
    let mut nr_tid = None;
    for _ in 0..lines {
        let value = cursor.tagged("taskinfo")?;
        if let Some(v) = value.strip_prefix("nr_tid=") {
            nr_tid = v.parse::<usize>().ok();
        } else if let Some(v) = value.strip_prefix("tids=") {
            let tids: Result<Vec<u32>, _> = v.split(',').map(|t| t.parse()).collect();
            let tids = tids.map_err(|_| FormatError::BadInfoLine(value.to_string()))?;
            if let Some(n) = nr_tid {
                if n != tids.len() {
                    return Err(FormatError::BadInfoLine(value.to_string()));
                }
            }
            info.tids = Some(tids);
        }
    }
    Ok(())
}

fn encode_usageinfo(info: &TraceInfo) -> Option<String> {
    let u = info.usage.as_ref()?;
    let mut out = String::new();
    let _ = writeln!(out, "usageinfo:lines=6");
    let _ = writeln!(out, "usageinfo:systime={:.6}", u.systime);
    let _ = writeln!(out, "usageinfo:usrtime={:.6}", u.usrtime);
    let _ = writeln!(
        out,
        "usageinfo:ctxsw={} / {} (voluntary / involuntary)",
        u.vctxsw, u.ictxsw
    );
    let _ = writeln!(out, "usageinfo:maxrss={}", u.maxrss);
    let _ = writeln!(
        out,
        "usageinfo:pagefault={} / {} (major / minor)",
        u.major_fault, u.minor_fault
    );
    let _ = writeln!(out, "usageinfo:iops={} / {} (read / write)", u.rblock, u.wblock);
    Some(out)
}

fn decode_usageinfo(cursor: &mut LineCursor<'_>, info: &mut TraceInfo) -> Result<(), FormatError> {
    let lines = cursor.section_lines("usageinfo")?;
    let mut u = UsageInfo::default();
    let pair = |v: &str| -> (i64, i64) {
        let nums: Vec<i64> = v
            .split(|c: char| !(c.is_ascii_digit() || c == '-'))
            .filter(|s| !s.is_empty() && *s != "-")
            .filter_map(|s| s.parse().ok())
            .collect();
        (
            nums.first().copied().unwrap_or(0),
            nums.get(1).copied().unwrap_or(0),
        )
    };
    for _ in 0..lines {
        let value = cursor.tagged("usageinfo")?;
        if let Some(v) = value.strip_prefix("systime=") {
            u.systime = v.parse().unwrap_or(0.0);
        } else if let Some(v) = value.strip_prefix("usrtime=") {
            u.usrtime = v.parse().unwrap_or(0.0);
        } else if let Some(v) = value.strip_prefix("ctxsw=") {
            (u.vctxsw, u.ictxsw) = pair(v);
        } else if let Some(v) = value.strip_prefix("maxrss=") {
            u.maxrss = v.parse().unwrap_or(0);
        } else if let Some(v) = value.strip_prefix("pagefault=") {
            (u.major_fault, u.minor_fault) = pair(v);
        } else if let Some(v) = value.strip_prefix("iops=") {
            (u.rblock, u.wblock) = pair(v);
        }
    }
    info.usage = Some(u);
    Ok(())
}

fn encode_argspec(info: &TraceInfo) -> Option<String> {
    if info.argspec.is_none() && info.retspec.is_none() && !info.auto_args {
        return None;
    }
    let mut body = String::new();
    let mut lines = 0;
    for (tag, value) in [
        ("argspec", &info.argspec),
        ("retspec", &info.retspec),
        ("argauto", &info.argauto),
        ("retauto", &info.retauto),
        ("enumauto", &info.enumauto),
    ] {
        if let Some(v) = value {
            let _ = writeln!(body, "{tag}:{v}");
            lines += 1;
        }
    }
    if info.auto_args {
        let _ = writeln!(body, "auto-args:1");
        lines += 1;
    }
    Some(format!("argspec:lines={lines}\n{body}"))
}

fn decode_argspec(cursor: &mut LineCursor<'_>, info: &mut TraceInfo) -> Result<(), FormatError> {
    let lines = cursor.section_lines("argspec")?;
    for _ in 0..lines {
        let line = cursor.next()?;
        if let Some(v) = line.strip_prefix("argspec:") {
            info.argspec = Some(v.to_string());
        } else if let Some(v) = line.strip_prefix("retspec:") {
            info.retspec = Some(v.to_string());
        } else if let Some(v) = line.strip_prefix("argauto:") {
            info.argauto = Some(v.to_string());
        } else if let Some(v) = line.strip_prefix("retauto:") {
            info.retauto = Some(v.to_string());
        } else if let Some(v) = line.strip_prefix("enumauto:") {
            info.enumauto = Some(v.to_string());
        } else if line == "auto-args:1" {
            info.auto_args = true;
        } else {
            return Err(FormatError::BadInfoLine(line.to_string()));
        }
    }
    Ok(())
}

fn encode_record_date(info: &TraceInfo) -> Option<String> {
    let date = info.record_date.as_ref()?;
    let elapsed = info.elapsed_time.as_deref().unwrap_or("0.0 s");
    Some(format!("record_date:{date}\nelapsed_time:{elapsed}\n"))
}

fn decode_record_date(cursor: &mut LineCursor<'_>, info: &mut TraceInfo) -> Result<(), FormatError> {
    info.record_date = Some(cursor.tagged("record_date")?.to_string());
    info.elapsed_time = Some(cursor.tagged("elapsed_time")?.to_string());
    Ok(())
}

static SECTIONS: &[Section] = &[
    Section {
        bit: InfoMask::EXE_NAME,
        encode: |i| i.exename.as_ref().map(|v| format!("exename:{v}\n")),
        decode: |c, i| {
            i.exename = Some(c.tagged("exename")?.to_string());
            Ok(())
        },
    },
    Section {
        bit: InfoMask::EXE_BUILD_ID,
        encode: |i| i.build_id.as_ref().map(|v| format!("build_id:{v}\n")),
        decode: |c, i| {
            let v = c.tagged("build_id")?;
            if v.len() != 40 || !v.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(FormatError::BadInfoLine(v.to_string()));
            }
            i.build_id = Some(v.to_string());
            Ok(())
        },
    },
    Section {
        bit: InfoMask::EXIT_STATUS,
        encode: |i| i.exit_status.map(|v| format!("exit_status:{v}\n")),
        decode: |c, i| {
            let v = c.tagged("exit_status")?;
            i.exit_status = v
                .parse()
                .map(Some)
                .map_err(|_| FormatError::BadInfoLine(v.to_string()))?;
            Ok(())
        },
    },
    Section {
        bit: InfoMask::CMDLINE,
        encode: |i| i.cmdline.as_ref().map(|v| format!("cmdline:{v}\n")),
        decode: |c, i| {
            i.cmdline = Some(c.tagged("cmdline")?.to_string());
            Ok(())
        },
    },
    Section {
        bit: InfoMask::CPUINFO,
        encode: encode_cpuinfo,
        decode: decode_cpuinfo,
    },
    Section {
        bit: InfoMask::MEMINFO,
        encode: |i| i.meminfo.as_ref().map(|v| format!("meminfo:{v}\n")),
        decode: |c, i| {
            i.meminfo = Some(c.tagged("meminfo")?.to_string());
            Ok(())
        },
    },
    Section {
        bit: InfoMask::OSINFO,
        encode: encode_osinfo,
        decode: decode_osinfo,
    },
    Section {
        bit: InfoMask::TASKINFO,
        encode: encode_taskinfo,
        decode: decode_taskinfo,
    },
    Section {
        bit: InfoMask::USAGEINFO,
        encode: encode_usageinfo,
        decode: decode_usageinfo,
    },
    Section {
        bit: InfoMask::LOADINFO,
        encode: |i| {
            i.load
                .map(|(a, b, c)| format!("loadinfo:{a:.2} / {b:.2} / {c:.2}\n"))
        },
        decode: |c, i| {
            let v = c.tagged("loadinfo")?;
            let nums: Vec<f32> = v
                .split(" / ")
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if nums.len() == 3 {
                i.load = Some((nums[0], nums[1], nums[2]));
            }
            Ok(())
        },
    },
    Section {
        bit: InfoMask::ARG_SPEC,
        encode: encode_argspec,
        decode: decode_argspec,
    },
    Section {
        bit: InfoMask::RECORD_DATE,
        encode: encode_record_date,
        decode: decode_record_date,
    },
    Section {
        bit: InfoMask::PATTERN_TYPE,
        encode: |i| i.pattern_type.as_ref().map(|v| format!("pattern_type:{v}\n")),
        decode: |c, i| {
            i.pattern_type = Some(c.tagged("pattern_type")?.to_string());
            Ok(())
        },
    },
    Section {
        bit: InfoMask::VERSION,
        encode: |i| i.version.as_ref().map(|v| format!("fgtrace_version:{v}\n")),
        decode: |c, i| {
            i.version = Some(c.tagged("fgtrace_version")?.to_string());
            Ok(())
        },
    },
];

const INFO_HEADER: &str = "# fgtrace info";

/// Serialize an info file, returning the text and the presence mask.
pub fn write_info(info: &TraceInfo) -> (String, InfoMask) {
    let mut mask = InfoMask::empty();
    let mut body = String::new();
    for section in SECTIONS {
        if let Some(text) = (section.encode)(info) {
            body.push_str(&text);
            mask |= section.bit;
        }
    }
    let mut out = String::new();
    let _ = writeln!(out, "{INFO_HEADER}");
    let _ = writeln!(out, "info_mask:{:016x}", mask.bits());
    out.push_str(&body);
    (out, mask)
}

/// Parse an info file produced by [`write_info`].
pub fn read_info(text: &str) -> Result<(TraceInfo, InfoMask), FormatError> {
    let lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    let mut cursor = LineCursor {
        lines: &lines,
        pos: 0,
    };
    let header = cursor.next()?;
    if header != INFO_HEADER {
        return Err(FormatError::BadInfoLine(header.to_string()));
    }
    let mask_line = cursor.tagged("info_mask")?;
    let bits = u64::from_str_radix(mask_line, 16)
        .map_err(|_| FormatError::BadInfoLine(mask_line.to_string()))?;
    let mask = InfoMask::from_bits_truncate(bits);

    let mut info = TraceInfo::default();
    for section in SECTIONS {
        if mask.contains(section.bit) {
            (section.decode)(&mut cursor, &mut info)?;
        }
    }
    Ok((info, mask))
}
