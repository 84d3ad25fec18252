//! The `dump` command: raw records, one line each, per thread.

use crate::cli::DumpArgs;
use crate::data::TraceData;
use crate::error::TraceError;
use fgtrace_format::record::RecordKind;
use std::io::Write;

pub fn dump(args: &DumpArgs) -> Result<(), TraceError> {
    let data = TraceData::load(&args.data.dir)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for tid in data.tids() {
        if let Some(want) = args.tid {
            if want != tid {
                continue;
            }
        }
        writeln!(out, "reading {tid}.dat")?;
        for event in data.stream(tid)? {
            let record = &event.record;
            let kind = match record.kind {
                RecordKind::Entry => "entry",
                RecordKind::Exit => "exit ",
                RecordKind::Event => "event",
                RecordKind::Lost => "lost ",
            };
            let secs = record.time / 1_000_000_000;
            let nanos = record.time % 1_000_000_000;
            match record.kind {
                RecordKind::Lost => {
                    writeln!(
                        out,
                        "{secs}.{nanos:09}  {tid}: [{kind}] {} records ({})",
                        record.lost_count(),
                        record.lost_reason().name()
                    )?;
                }
                RecordKind::Event => {
                    let name = data
                        .event_name(record.event_id)
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| format!("id={}", record.event_id));
                    writeln!(
                        out,
                        "{secs}.{nanos:09}  {tid}: [{kind}] {name} ({:x}) depth: {}",
                        record.addr, record.depth
                    )?;
                }
                _ => {
                    let name = data.symbols.name_of(record.addr);
                    writeln!(
                        out,
                        "{secs}.{nanos:09}  {tid}: [{kind}] {name} ({:x}) depth: {}",
                        record.addr, record.depth
                    )?;
                }
            }
            if let Some(payload) = &event.payload {
                let hex: Vec<String> = payload.iter().map(|b| format!("{b:02x}")).collect();
                writeln!(out, "           payload: {}", hex.join(" "))?;
            }
        }
    }
    Ok(())
}
