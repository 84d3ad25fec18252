//! The `replay` command: render a recorded trace as an indented call
//! graph, one line per function, in cross-thread time order.

use crate::cli::ReplayArgs;
use crate::data::{SymTable, TraceData, TraceEvent};
use crate::error::TraceError;
use fgtrace_format::args::decode_args;
use fgtrace_format::record::RecordKind;
use fgtrace_format::spec::PmuGroup;
use rustc_hash::{FxHashMap, FxHashSet};
use std::io::Write;

pub fn replay(args: &ReplayArgs) -> Result<(), TraceError> {
    let data = TraceData::load(&args.data.dir)?;
    let events = data.merged_events()?;
    let filter = ReplayFilter {
        tids: args.tid.clone(),
        time_ns: parse_time_filter(args.time_filter.as_deref())?,
        depth: args.depth,
    };
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    print_replay(&mut out, &events, &data.symbols, &data.events, &filter)?;
    Ok(())
}

pub(crate) fn parse_time_filter(value: Option<&str>) -> Result<Option<u64>, TraceError> {
    let Some(value) = value else { return Ok(None) };
    if let Ok(ns) = value.parse::<u64>() {
        return Ok(Some(ns));
    }
    humantime::parse_duration(value)
        .map(|d| Some(d.as_nanos() as u64))
        .map_err(|_| TraceError::BadOption {
            what: "time filter",
            value: value.to_string(),
        })
}

pub(crate) struct ReplayFilter {
    pub tids: Vec<u32>,
    pub time_ns: Option<u64>,
    pub depth: Option<u16>,
}

/// Format a nanosecond duration the way the trace output columns want
/// it: three fraction digits and a unit, right-aligned to ten columns.
pub(crate) fn format_time(ns: u64) -> String {
    const UNITS: [&str; 4] = ["ns", "us", "ms", " s"];
    let mut value = ns as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit + 1 < UNITS.len() {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:7.3} {}", value, UNITS[unit])
}

/// Match every exit to its entry and return the duration at both
/// indices.
pub(crate) fn compute_durations(events: &[TraceEvent]) -> Vec<Option<u64>> {
    let mut durations = vec![None; events.len()];
    let mut stacks: FxHashMap<u32, Vec<usize>> = FxHashMap::default();
    for (i, event) in events.iter().enumerate() {
        match event.record.kind {
            RecordKind::Entry => stacks.entry(event.tid).or_default().push(i),
            RecordKind::Exit => {
                if let Some(stack) = stacks.get_mut(&event.tid) {
                    if let Some(entry_idx) = stack.pop() {
                        let dt = event
                            .record
                            .time
                            .saturating_sub(events[entry_idx].record.time);
                        durations[entry_idx] = Some(dt);
                        durations[i] = Some(dt);
                    }
                }
            }
            _ => {}
        }
    }
    durations
}

fn render_args(payload: Option<&[u8]>) -> Option<String> {
    let payload = payload?;
    let values = decode_args(payload);
    if values.is_empty() {
        return None;
    }
    Some(
        values
            .iter()
            .map(|v| v.render())
            .collect::<Vec<_>>()
            .join(", "),
    )
}

fn render_retval(payload: Option<&[u8]>) -> Option<String> {
    let values = decode_args(payload?);
    values.first().map(|v| v.render())
}

fn event_label(id: u8, names: &FxHashMap<u8, String>) -> String {
    if let Some(name) = names.get(&id) {
        return name.clone();
    }
    for group in [PmuGroup::Cycle, PmuGroup::Cache, PmuGroup::Branch] {
        if group.event_id() == id {
            return format!("read:{}", group.name());
        }
    }
    format!("event:{id}")
}

pub(crate) fn print_replay<W: Write>(
    out: &mut W,
    events: &[TraceEvent],
    symbols: &SymTable,
    event_names: &FxHashMap<u8, String>,
    filter: &ReplayFilter,
) -> Result<(), TraceError> {
    let durations = compute_durations(events);

    let keep = |i: usize| -> bool {
        let event = &events[i];
        if !filter.tids.is_empty() && !filter.tids.contains(&event.tid) {
            return false;
        }
        match event.record.kind {
            RecordKind::Entry | RecordKind::Exit => {
                if let Some(limit) = filter.depth {
                    if event.record.depth as u16 >= limit {
                        return false;
                    }
                }
                if let Some(threshold) = filter.time_ns {
                    // Unfinished entries have no duration; keep them.
                    if let Some(dt) = durations[i] {
                        if dt < threshold {
                            return false;
                        }
                    }
                }
                true
            }
            _ => true,
        }
    };

    let printed: Vec<usize> = (0..events.len()).filter(|&i| keep(i)).collect();

    // For leaf folding: the next printed index on the same thread.
    let mut next_same_tid: FxHashMap<usize, usize> = FxHashMap::default();
    let mut last_per_tid: FxHashMap<u32, usize> = FxHashMap::default();
    for &i in &printed {
        if let Some(&prev) = last_per_tid.get(&events[i].tid) {
            next_same_tid.insert(prev, i);
        }
        last_per_tid.insert(events[i].tid, i);
    }

    // Exit indices that were folded into a leaf line.
    let mut consumed: FxHashSet<usize> = FxHashSet::default();

    writeln!(out, "# DURATION     TID     FUNCTION")?;
    let blank = " ".repeat(10);
    for &i in &printed {
        if consumed.contains(&i) {
            continue;
        }
        let event = &events[i];
        let indent = "  ".repeat(event.record.depth as usize);
        let tid = event.tid;
        match event.record.kind {
            RecordKind::Entry => {
                let name = symbols.name_of(event.record.addr);
                let args = render_args(event.payload.as_deref()).unwrap_or_default();
                // A leaf is an entry whose exit is the very next record
                // we print for this thread; fold the pair to one line.
                let exit_idx = next_same_tid.get(&i).copied().filter(|&n| {
                    events[n].record.kind == RecordKind::Exit
                        && events[n].record.addr == event.record.addr
                        && events[n].record.depth == event.record.depth
                });
                if let Some(exit_idx) = exit_idx {
                    consumed.insert(exit_idx);
                    let duration = durations[i].map(format_time).unwrap_or_else(|| blank.clone());
                    let retval = render_retval(events[exit_idx].payload.as_deref());
                    match retval {
                        Some(value) => writeln!(
                            out,
                            " {duration} [{tid:6}] | {indent}{name}({args}) = {value};"
                        )?,
                        None => writeln!(out, " {duration} [{tid:6}] | {indent}{name}({args});")?,
                    }
                } else {
                    writeln!(out, " {blank} [{tid:6}] | {indent}{name}({args}) {{")?;
                }
            }
            RecordKind::Exit => {
                let name = symbols.name_of(event.record.addr);
                let duration = durations[i].map(format_time).unwrap_or_else(|| blank.clone());
                match render_retval(event.payload.as_deref()) {
                    Some(value) => writeln!(
                        out,
                        " {duration} [{tid:6}] | {indent}}} = {value}; /* {name} */"
                    )?,
                    None => writeln!(out, " {duration} [{tid:6}] | {indent}}} /* {name} */")?,
                }
            }
            RecordKind::Event => {
                let label = event_label(event.record.event_id, event_names);
                let mut values = String::new();
                if let Some(payload) = &event.payload {
                    let counters: Vec<String> = payload
                        .chunks_exact(8)
                        .map(|c| u64::from_le_bytes(c.try_into().unwrap()).to_string())
                        .collect();
                    if !counters.is_empty() {
                        values = format!(" ({})", counters.join(", "));
                    }
                }
                writeln!(out, " {blank} [{tid:6}] | {indent}/* {label}{values} */")?;
            }
            RecordKind::Lost => {
                writeln!(
                    out,
                    " {blank} [{tid:6}] | /* lost {} records ({}) */",
                    event.record.lost_count(),
                    event.record.lost_reason().name()
                )?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fgtrace_format::record::Record;
    use fgtrace_format::symfile::{SymEntry, SymKind};

    fn sym(name: &str, addr: u64) -> SymEntry {
        SymEntry {
            addr,
            size: 0x40,
            kind: SymKind::Text,
            name: name.to_string(),
        }
    }

    fn entry(tid: u32, seq: u64, time: u64, addr: u64, depth: u8) -> TraceEvent {
        TraceEvent {
            tid,
            seq,
            record: Record::entry(time, addr, depth),
            payload: None,
        }
    }

    fn exit(tid: u32, seq: u64, time: u64, addr: u64, depth: u8) -> TraceEvent {
        TraceEvent {
            tid,
            seq,
            record: Record::exit(time, addr, depth),
            payload: None,
        }
    }

    fn render(events: &[TraceEvent], filter: &ReplayFilter) -> String {
        let symbols = SymTable::for_test(vec![sym("main", 0x1000), sym("g", 0x2000)]);
        let mut out = Vec::new();
        print_replay(&mut out, events, &symbols, &FxHashMap::default(), filter).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn no_filter() -> ReplayFilter {
        ReplayFilter {
            tids: Vec::new(),
            time_ns: None,
            depth: None,
        }
    }

    #[test]
    fn leaf_calls_fold_to_one_line() {
        let events = vec![
            entry(1, 0, 100, 0x1000, 0),
            entry(1, 1, 200, 0x2000, 1),
            exit(1, 2, 360, 0x2000, 1),
            exit(1, 3, 500, 0x1000, 0),
        ];
        let text = render(&events, &no_filter());
        assert!(text.contains("main() {"), "{text}");
        assert!(text.contains("g();"), "{text}");
        assert!(text.contains("} /* main */"), "{text}");
        // The leaf line carries its duration (160 ns).
        assert!(text.contains("160.000 ns"), "{text}");
    }

    #[test]
    fn durations_pair_entries_and_exits() {
        let events = vec![
            entry(1, 0, 100, 0x1000, 0),
            entry(1, 1, 200, 0x2000, 1),
            exit(1, 2, 300, 0x2000, 1),
            exit(1, 3, 700, 0x1000, 0),
        ];
        let durations = compute_durations(&events);
        assert_eq!(durations[0], Some(600));
        assert_eq!(durations[1], Some(100));
        assert_eq!(durations[2], Some(100));
        assert_eq!(durations[3], Some(600));
    }

    #[test]
    fn time_filter_drops_whole_pairs() {
        let events = vec![
            entry(1, 0, 100, 0x1000, 0),
            entry(1, 1, 200, 0x2000, 1),
            exit(1, 2, 210, 0x2000, 1), // 10 ns, under threshold
            exit(1, 3, 1_000_000, 0x1000, 0),
        ];
        let filter = ReplayFilter {
            time_ns: Some(1000),
            ..no_filter()
        };
        let text = render(&events, &filter);
        assert!(!text.contains("g("), "{text}");
        assert!(text.contains("main"), "{text}");
    }

    #[test]
    fn depth_filter_prunes_nested_calls() {
        let events = vec![
            entry(1, 0, 100, 0x1000, 0),
            entry(1, 1, 200, 0x2000, 1),
            exit(1, 2, 300, 0x2000, 1),
            exit(1, 3, 400, 0x1000, 0),
        ];
        let filter = ReplayFilter {
            depth: Some(1),
            ..no_filter()
        };
        let text = render(&events, &filter);
        assert!(!text.contains("g("), "{text}");
        // With the child pruned, main folds into one leaf line.
        assert!(text.contains("main();"), "{text}");
    }

    #[test]
    fn tid_filter_selects_threads() {
        let events = vec![
            entry(1, 0, 100, 0x1000, 0),
            exit(1, 1, 150, 0x1000, 0),
            entry(2, 0, 120, 0x2000, 0),
            exit(2, 1, 140, 0x2000, 0),
        ];
        let filter = ReplayFilter {
            tids: vec![2],
            ..no_filter()
        };
        let text = render(&events, &filter);
        assert!(!text.contains("main"), "{text}");
        assert!(text.contains("g();"), "{text}");
    }

    #[test]
    fn time_formatting_picks_units() {
        assert_eq!(format_time(160), "160.000 ns");
        assert_eq!(format_time(1_500), "  1.500 us");
        assert_eq!(format_time(2_000_000), "  2.000 ms");
        assert_eq!(format_time(3_200_000_000), "  3.200  s");
    }
}
