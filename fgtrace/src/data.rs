//! Loading a recorded trace directory and merging its per-thread
//! streams into one time-ordered sequence.

use crate::error::TraceError;
use crate::info::load_info;
use fgtrace_format::info::TraceInfo;
use fgtrace_format::record::{Record, RecordStream};
use fgtrace_format::symfile::{read_symfile, SymEntry};
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// One line of `task.txt`.
#[derive(Debug, Clone)]
pub struct Task {
    pub tid: u32,
    pub pid: u32,
    pub comm: String,
    pub sid: String,
}

/// Merged symbol table across every module's `.sym` file.
#[derive(Debug, Default)]
pub struct SymTable {
    entries: Vec<SymEntry>,
}

impl SymTable {
    pub fn lookup(&self, addr: u64) -> Option<&SymEntry> {
        let idx = self.entries.partition_point(|e| e.addr <= addr);
        let entry = &self.entries[idx.checked_sub(1)?];
        if addr < entry.addr + entry.size.max(1) {
            Some(entry)
        } else {
            None
        }
    }

    /// Resolve to a name, falling back to the raw address.
    pub fn name_of(&self, addr: u64) -> String {
        match self.lookup(addr) {
            Some(entry) => entry.name.clone(),
            None => format!("{addr:#x}"),
        }
    }

    #[cfg(test)]
    pub fn for_test(mut entries: Vec<SymEntry>) -> SymTable {
        entries.sort_by_key(|e| e.addr);
        SymTable { entries }
    }
}

/// One record with its origin attached, ready for cross-thread merging.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub tid: u32,
    pub seq: u64,
    pub record: Record,
    pub payload: Option<Vec<u8>>,
}

/// Everything a trace directory holds.
pub struct TraceData {
    pub dir: PathBuf,
    pub info: TraceInfo,
    pub tasks: Vec<Task>,
    pub events: FxHashMap<u8, String>,
    pub symbols: SymTable,
    pub default_opts: Vec<String>,
    streams: Vec<(u32, Vec<u8>)>,
}

impl TraceData {
    pub fn load(dir: &Path) -> Result<TraceData, TraceError> {
        let info = load_info(dir)?;
        let tasks = load_tasks(dir)?;
        let events = load_events(dir)?;
        let symbols = load_symbols(dir)?;
        let default_opts = load_default_opts(dir);

        let mut streams = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".dat") else {
                continue;
            };
            let Ok(tid) = stem.parse::<u32>() else {
                continue;
            };
            streams.push((tid, std::fs::read(&path)?));
        }
        if streams.is_empty() {
            return Err(TraceError::EmptyTrace(dir.to_path_buf()));
        }
        streams.sort_by_key(|(tid, _)| *tid);

        Ok(TraceData {
            dir: dir.to_path_buf(),
            info,
            tasks,
            events,
            symbols,
            default_opts,
            streams,
        })
    }

    pub fn tids(&self) -> Vec<u32> {
        self.streams.iter().map(|(tid, _)| *tid).collect()
    }

    /// Decode one thread's stream in recording order.
    pub fn stream(&self, tid: u32) -> Result<Vec<TraceEvent>, TraceError> {
        let Some((_, bytes)) = self.streams.iter().find(|(t, _)| *t == tid) else {
            return Ok(Vec::new());
        };
        decode_stream(tid, bytes)
    }

    /// All records of all threads, ordered by timestamp with
    /// `(tid, sequence)` breaking ties.
    pub fn merged_events(&self) -> Result<Vec<TraceEvent>, TraceError> {
        let mut sources = Vec::new();
        for (tid, bytes) in &self.streams {
            sources.push(decode_stream(*tid, bytes)?);
        }
        Ok(merge_by_time(sources))
    }

    /// The event name for an event id, if `events.txt` declared one.
    pub fn event_name(&self, id: u8) -> Option<&str> {
        self.events.get(&id).map(|s| s.as_str())
    }
}

fn decode_stream(tid: u32, bytes: &[u8]) -> Result<Vec<TraceEvent>, TraceError> {
    let mut events = Vec::new();
    let mut seq = 0u64;
    for item in RecordStream::new(bytes) {
        let (record, payload) = item?;
        events.push(TraceEvent {
            tid,
            seq,
            record,
            payload: payload.map(|p| p.to_vec()),
        });
        seq += 1;
    }
    Ok(events)
}

/// K-way merge of per-thread streams. Each stream is already in time
/// order, so a min-heap over one cursor per stream suffices; ties fall
/// back to `(tid, seq)` for a stable, reproducible order.
fn merge_by_time(sources: Vec<Vec<TraceEvent>>) -> Vec<TraceEvent> {
    let total: usize = sources.iter().map(|s| s.len()).sum();
    let mut merged = Vec::with_capacity(total);

    let mut iters: Vec<std::vec::IntoIter<TraceEvent>> =
        sources.into_iter().map(|s| s.into_iter()).collect();
    let mut pending: Vec<Option<TraceEvent>> = iters.iter_mut().map(|it| it.next()).collect();

    let mut heap: BinaryHeap<Reverse<((u64, u32, u64), usize)>> = BinaryHeap::new();
    for (i, slot) in pending.iter().enumerate() {
        if let Some(event) = slot {
            heap.push(Reverse(((event.record.time, event.tid, event.seq), i)));
        }
    }

    while let Some(Reverse((_, i))) = heap.pop() {
        let event = pending[i].take().expect("heap key without event");
        if let Some(next) = iters[i].next() {
            heap.push(Reverse(((next.record.time, next.tid, next.seq), i)));
            pending[i] = Some(next);
        }
        merged.push(event);
    }
    merged
}

fn load_tasks(dir: &Path) -> Result<Vec<Task>, TraceError> {
    let Ok(text) = std::fs::read_to_string(dir.join("task.txt")) else {
        return Ok(Vec::new());
    };
    let mut tasks = Vec::new();
    for line in text.lines() {
        let Some(rest) = line.strip_prefix("TASK ") else {
            continue;
        };
        let mut task = Task {
            tid: 0,
            pid: 0,
            comm: String::new(),
            sid: String::new(),
        };
        for field in rest.split_whitespace() {
            match field.split_once('=') {
                Some(("tid", v)) => task.tid = v.parse().unwrap_or(0),
                Some(("pid", v)) => task.pid = v.parse().unwrap_or(0),
                Some(("comm", v)) => task.comm = v.to_string(),
                Some(("sid", v)) => task.sid = v.to_string(),
                _ => {}
            }
        }
        if task.tid != 0 {
            tasks.push(task);
        }
    }
    Ok(tasks)
}

fn load_events(dir: &Path) -> Result<FxHashMap<u8, String>, TraceError> {
    let mut events = FxHashMap::default();
    let Ok(text) = std::fs::read_to_string(dir.join("events.txt")) else {
        return Ok(events);
    };
    for line in text.lines() {
        let Some(rest) = line.strip_prefix("EVENT: ") else {
            continue;
        };
        let mut parts = rest.splitn(2, ' ');
        let Some(id) = parts.next().and_then(|v| v.parse::<u8>().ok()) else {
            continue;
        };
        let Some(name) = parts.next() else { continue };
        events.insert(id, name.to_string());
    }
    Ok(events)
}

fn load_symbols(dir: &Path) -> Result<SymTable, TraceError> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sym") {
            continue;
        }
        let file = std::fs::File::open(&path)?;
        let mut reader = BufReader::new(file);
        match read_symfile(&mut reader) {
            Ok(mut syms) => entries.append(&mut syms),
            Err(err) => log::warn!("skipping {}: {err}", path.display()),
        }
    }
    entries.sort_by_key(|e| e.addr);
    Ok(SymTable { entries })
}

fn load_default_opts(dir: &Path) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(dir.join("default.opts")) else {
        return Vec::new();
    };
    shlex::split(text.trim()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(tid: u32, seq: u64, time: u64) -> TraceEvent {
        TraceEvent {
            tid,
            seq,
            record: Record::entry(time, 0x1000, 0),
            payload: None,
        }
    }

    #[test]
    fn merge_orders_across_threads() {
        let a = vec![event(1, 0, 10), event(1, 1, 30), event(1, 2, 50)];
        let b = vec![event(2, 0, 20), event(2, 1, 40)];
        let merged = merge_by_time(vec![a, b]);
        let times: Vec<u64> = merged.iter().map(|e| e.record.time).collect();
        assert_eq!(times, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn merge_breaks_ties_by_tid_then_seq() {
        let a = vec![event(2, 0, 10)];
        let b = vec![event(1, 0, 10), event(1, 1, 10)];
        let merged = merge_by_time(vec![a, b]);
        let keys: Vec<(u32, u64)> = merged.iter().map(|e| (e.tid, e.seq)).collect();
        assert_eq!(keys, vec![(1, 0), (1, 1), (2, 0)]);
    }

    #[test]
    fn task_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("task.txt"),
            "TASK tid=100 pid=99 comm=demo sid=abcd\n\
             TASK tid=101 pid=99 comm=worker sid=abcd\n\
             GARBAGE line ignored\n",
        )
        .unwrap();
        let tasks = load_tasks(dir.path()).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].tid, 100);
        assert_eq!(tasks[1].comm, "worker");
        assert_eq!(tasks[1].sid, "abcd");
    }

    #[test]
    fn events_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("events.txt"), "EVENT: 100 libfoo:init\n").unwrap();
        let events = load_events(dir.path()).unwrap();
        assert_eq!(events.get(&100).map(|s| s.as_str()), Some("libfoo:init"));
    }

    #[test]
    fn symtable_falls_back_to_hex() {
        let table = SymTable::for_test(vec![SymEntry {
            addr: 0x1000,
            size: 0x10,
            kind: fgtrace_format::symfile::SymKind::Text,
            name: "main".to_string(),
        }]);
        assert_eq!(table.name_of(0x1008), "main");
        assert_eq!(table.name_of(0x9999), "0x9999");
    }
}
