//! Statically-defined tracepoint (SDT) discovery.
//!
//! User probes compiled into a binary leave notes in the
//! `.note.stapsdt` section: owner `stapsdt`, type 3, and a descriptor
//! holding the probe, base and semaphore addresses followed by the
//! provider, event name and argument description strings. Probes that
//! match the user's `provider:event` patterns get an event id from the
//! user-event range, a line in `events.txt`, and an arming attempt
//! through the architecture hook.

use crate::arch::Arch;
use crate::error::McountError;
use fgtrace_format::spec::{EventSpec, USER_EVENT_BASE};
use std::io::Write;
use std::path::Path;

const SDT_NAME: &[u8] = b"stapsdt";
const SDT_TYPE: u32 = 3;

/// One parsed `stapsdt` note. Addresses are absolute (load bias
/// applied), except `link_addr` which is kept as found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdtNote {
    pub probe_addr: u64,
    pub link_addr: u64,
    pub sema_addr: u64,
    pub provider: String,
    pub event: String,
    pub args: String,
}

fn read_u32(data: &[u8], pos: usize) -> Option<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

fn read_u64(data: &[u8], pos: usize) -> Option<u64> {
    data.get(pos..pos + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
}

fn read_cstr(data: &[u8], pos: usize) -> Option<(&str, usize)> {
    let rest = data.get(pos..)?;
    let nul = memchr::memchr(0, rest)?;
    let s = std::str::from_utf8(&rest[..nul]).ok()?;
    Some((s, pos + nul + 1))
}

/// Parse a raw `.note.stapsdt` section. Malformed notes are skipped;
/// the section format makes resynchronization safe because every entry
/// declares its own lengths.
pub fn parse_stapsdt_notes(data: &[u8], base: u64) -> Vec<SdtNote> {
    let mut notes = Vec::new();
    let mut pos = 0;
    let align4 = |n: usize| (n + 3) & !3;

    while pos + 12 <= data.len() {
        let Some(namesz) = read_u32(data, pos) else { break };
        let Some(descsz) = read_u32(data, pos + 4) else { break };
        let Some(ntype) = read_u32(data, pos + 8) else { break };
        let name_start = pos + 12;
        let desc_start = name_start + align4(namesz as usize);
        let next = desc_start + align4(descsz as usize);
        if next > data.len() {
            break;
        }

        let name = &data[name_start..name_start + namesz as usize];
        if ntype == SDT_TYPE && name.strip_suffix(&[0]).unwrap_or(name) == SDT_NAME {
            if let Some(note) = parse_desc(&data[desc_start..desc_start + descsz as usize], base) {
                notes.push(note);
            }
        }
        pos = next;
    }
    notes
}

fn parse_desc(desc: &[u8], base: u64) -> Option<SdtNote> {
    let probe_addr = read_u64(desc, 0)?;
    let link_addr = read_u64(desc, 8)?;
    let sema_addr = read_u64(desc, 16)?;
    let (provider, next) = read_cstr(desc, 24)?;
    let (event, next) = read_cstr(desc, next)?;
    let (args, _) = read_cstr(desc, next)?;
    Some(SdtNote {
        probe_addr: probe_addr.wrapping_add(base),
        link_addr,
        sema_addr: if sema_addr == 0 {
            0
        } else {
            sema_addr.wrapping_add(base)
        },
        provider: provider.to_string(),
        event: event.to_string(),
        args: args.to_string(),
    })
}

/// One matched, registered event.
#[derive(Debug, Clone)]
pub struct RegisteredEvent {
    pub id: u8,
    pub note: SdtNote,
    pub armed: bool,
}

/// All events the session knows about, keyed by probe address on the
/// hot path. Immutable once the session is armed.
#[derive(Debug, Default)]
pub struct EventTable {
    events: Vec<RegisteredEvent>,
}

impl EventTable {
    /// Match discovered notes against the user's event specs and assign
    /// ids starting at the user-event base.
    pub fn build(notes: impl IntoIterator<Item = SdtNote>, specs: &[EventSpec]) -> Self {
        let mut events = Vec::new();
        let mut next_id = USER_EVENT_BASE;
        for note in notes {
            let matched = specs
                .iter()
                .any(|s| s.provider.matches(&note.provider) && s.event.matches(&note.event));
            if !matched {
                continue;
            }
            if next_id == u8::MAX {
                log::warn!("event id space exhausted; ignoring {}:{}", note.provider, note.event);
                break;
            }
            events.push(RegisteredEvent {
                id: next_id,
                note,
                armed: false,
            });
            next_id += 1;
        }
        EventTable { events }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredEvent> {
        self.events.iter()
    }

    pub fn lookup(&self, probe_addr: u64) -> Option<u8> {
        self.events
            .iter()
            .find(|e| e.note.probe_addr == probe_addr)
            .map(|e| e.id)
    }

    /// Arm every event through the architecture hook and bump the probe
    /// semaphores of the ones that took. Failure leaves the probe
    /// dormant, never kills the session.
    pub fn arm_all(&mut self, arch: &'static crate::arch::Native) {
        for event in &mut self.events {
            match arch.enable_event(event.note.probe_addr as usize) {
                Ok(true) => {
                    event.armed = true;
                    if event.note.sema_addr != 0 {
                        unsafe {
                            let sema = event.note.sema_addr as *mut u16;
                            *sema = (*sema).wrapping_add(1);
                        }
                    }
                }
                Ok(false) => {
                    log::debug!(
                        "probe {}:{} discovered but not armed on this architecture",
                        event.note.provider,
                        event.note.event
                    );
                }
                Err(err) => {
                    log::warn!(
                        "failed to arm probe {}:{}: {err}",
                        event.note.provider,
                        event.note.event
                    );
                }
            }
        }
    }

    /// Write the `events.txt` sidecar.
    pub fn write_events_txt(&self, dir: &Path) -> Result<(), McountError> {
        if self.events.is_empty() {
            return Ok(());
        }
        let mut out = std::fs::File::create(dir.join("events.txt"))?;
        for event in &self.events {
            writeln!(
                out,
                "EVENT: {} {}:{}",
                event.id, event.note.provider, event.note.event
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fgtrace_format::spec::parse_event_specs;

    /// Assemble a well-formed note section with the given probes.
    fn build_notes(probes: &[(&str, &str, u64, u64)]) -> Vec<u8> {
        let mut data = Vec::new();
        for (provider, event, addr, sema) in probes {
            let mut desc = Vec::new();
            desc.extend_from_slice(&addr.to_le_bytes());
            desc.extend_from_slice(&0x10000u64.to_le_bytes());
            desc.extend_from_slice(&sema.to_le_bytes());
            desc.extend_from_slice(provider.as_bytes());
            desc.push(0);
            desc.extend_from_slice(event.as_bytes());
            desc.push(0);
            desc.extend_from_slice(b"8@%rdi");
            desc.push(0);

            data.extend_from_slice(&8u32.to_le_bytes()); // namesz: "stapsdt\0"
            data.extend_from_slice(&(desc.len() as u32).to_le_bytes());
            data.extend_from_slice(&3u32.to_le_bytes());
            data.extend_from_slice(b"stapsdt\0");
            data.extend_from_slice(&desc);
            while data.len() % 4 != 0 {
                data.push(0);
            }
        }
        data
    }

    #[test]
    fn parses_synthesized_notes() {
        let data = build_notes(&[
            ("libfoo", "init", 0x4000, 0),
            ("libfoo", "shutdown", 0x4100, 0x8000),
        ]);
        let notes = parse_stapsdt_notes(&data, 0x1000);
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].provider, "libfoo");
        assert_eq!(notes[0].event, "init");
        assert_eq!(notes[0].probe_addr, 0x5000);
        assert_eq!(notes[0].sema_addr, 0);
        assert_eq!(notes[1].sema_addr, 0x9000);
        assert_eq!(notes[1].args, "8@%rdi");
    }

    #[test]
    fn ignores_foreign_notes() {
        let mut data = Vec::new();
        // A GNU build-id note first.
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&8u32.to_le_bytes());
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(b"GNU\0");
        data.extend_from_slice(&[0xab; 8]);
        data.extend_from_slice(&build_notes(&[("p", "e", 0x4000, 0)]));
        let notes = parse_stapsdt_notes(&data, 0);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].provider, "p");
    }

    #[test]
    fn truncated_section_is_tolerated() {
        let data = build_notes(&[("p", "e", 0x4000, 0)]);
        for cut in [3, 13, data.len() - 2] {
            let notes = parse_stapsdt_notes(&data[..cut], 0);
            assert!(notes.is_empty());
        }
    }

    #[test]
    fn event_table_matches_and_numbers() {
        let notes = parse_stapsdt_notes(
            &build_notes(&[
                ("libfoo", "init", 0x4000, 0),
                ("libbar", "init", 0x5000, 0),
                ("libfoo", "teardown", 0x6000, 0),
            ]),
            0,
        );
        let specs = parse_event_specs("libfoo:*").unwrap();
        let table = EventTable::build(notes, &specs);
        let ids: Vec<u8> = table.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![USER_EVENT_BASE, USER_EVENT_BASE + 1]);
        assert_eq!(table.lookup(0x4000), Some(USER_EVENT_BASE));
        assert_eq!(table.lookup(0x5000), None);
        assert_eq!(table.lookup(0x6000), Some(USER_EVENT_BASE + 1));
    }

    #[test]
    fn events_txt_format() {
        let notes = parse_stapsdt_notes(&build_notes(&[("prov", "ev", 0x4000, 0)]), 0);
        let specs = parse_event_specs("prov:ev").unwrap();
        let table = EventTable::build(notes, &specs);
        let dir = tempfile::tempdir().unwrap();
        table.write_events_txt(dir.path()).unwrap();
        let text = std::fs::read_to_string(dir.path().join("events.txt")).unwrap();
        assert_eq!(text, format!("EVENT: {} prov:ev\n", USER_EVENT_BASE));
    }
}
