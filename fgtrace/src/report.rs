//! The `report` command: total/self time and call counts per function.

use crate::cli::ReportArgs;
use crate::data::{TraceData, TraceEvent};
use crate::error::TraceError;
use crate::replay::format_time;
use fgtrace_format::record::RecordKind;
use rustc_hash::FxHashMap;
use std::io::Write;

#[derive(Debug, Default, Clone)]
pub struct FunctionStat {
    pub total_ns: u64,
    pub self_ns: u64,
    pub calls: u64,
}

/// Walk each thread's stream with a stack, attributing wall time to the
/// function on top and charging children against their parent's self
/// time.
pub fn aggregate(events: &[TraceEvent]) -> FxHashMap<u64, FunctionStat> {
    struct Open {
        addr: u64,
        entry_time: u64,
        child_ns: u64,
    }

    let mut stats: FxHashMap<u64, FunctionStat> = FxHashMap::default();
    let mut stacks: FxHashMap<u32, Vec<Open>> = FxHashMap::default();

    for event in events {
        match event.record.kind {
            RecordKind::Entry => {
                stacks.entry(event.tid).or_default().push(Open {
                    addr: event.record.addr,
                    entry_time: event.record.time,
                    child_ns: 0,
                });
            }
            RecordKind::Exit => {
                let Some(stack) = stacks.get_mut(&event.tid) else {
                    continue;
                };
                let Some(open) = stack.pop() else { continue };
                let total = event.record.time.saturating_sub(open.entry_time);
                let stat = stats.entry(open.addr).or_default();
                stat.calls += 1;
                stat.total_ns += total;
                stat.self_ns += total.saturating_sub(open.child_ns);
                if let Some(parent) = stack.last_mut() {
                    parent.child_ns += total;
                }
            }
            _ => {}
        }
    }
    stats
}

pub fn report(args: &ReportArgs) -> Result<(), TraceError> {
    let data = TraceData::load(&args.data.dir)?;
    let events = data.merged_events()?;
    let stats = aggregate(&events);

    let mut rows: Vec<(String, FunctionStat)> = stats
        .into_iter()
        .map(|(addr, stat)| (data.symbols.name_of(addr), stat))
        .collect();
    match args.sort.as_str() {
        "self" => rows.sort_by(|a, b| b.1.self_ns.cmp(&a.1.self_ns)),
        "call" => rows.sort_by(|a, b| b.1.calls.cmp(&a.1.calls)),
        "total" => rows.sort_by(|a, b| b.1.total_ns.cmp(&a.1.total_ns)),
        other => {
            return Err(TraceError::BadOption {
                what: "sort key",
                value: other.to_string(),
            })
        }
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "  Total time   Self time       Calls  Function")?;
    writeln!(out, "  ==========  ==========  ==========  ====================")?;
    for (name, stat) in rows {
        writeln!(
            out,
            "  {}  {}  {:10}  {}",
            format_time(stat.total_ns),
            format_time(stat.self_ns),
            stat.calls,
            name
        )?;
    }
    Ok(())
}
