//! Cross-module round trips over a synthetic single-thread trace: the
//! record stream, the ring, the info sidecar and the symbol file all
//! written and read back the way the recorder and the analysis side do.

use fgtrace_format::info::{read_info, write_info, TraceInfo};
use fgtrace_format::record::{
    encode_payload, LostReason, Record, RecordFlags, RecordKind, RecordStream,
};
use fgtrace_format::ring::{ring_total_size, RingConsumer, RingHeader, RingProducer};
use fgtrace_format::spec::{parse_spec_list, PatternType, SpecKind};
use fgtrace_format::symfile::{read_symfile, write_symfile, SymEntry, SymKind};
use fgtrace_format::wire::Message;

fn sample_records() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&Record::entry(1000, 0x1000, 0).encode());
    let entry_g = Record::entry(1100, 0x2000, 1).with_flags(RecordFlags::ARGS);
    buf.extend_from_slice(&entry_g.encode());
    encode_payload(&mut buf, &[1, 0, 8, 0, 42, 0, 0, 0, 0, 0, 0, 0]).unwrap();
    buf.extend_from_slice(&Record::exit(1900, 0x2000, 1).encode());
    buf.extend_from_slice(&Record::lost(2000, LostReason::RingFull, 3, 1).encode());
    buf.extend_from_slice(&Record::exit(2500, 0x1000, 0).encode());
    buf
}

#[test]
fn record_stream_survives_a_ring_crossing() {
    // Producer side: encode records and push them through a ring.
    let capacity = 4096u32;
    let mut backing = vec![0u64; ring_total_size(capacity) / 8];
    let base = backing.as_mut_ptr() as *mut u8;
    unsafe { RingHeader::init(base, capacity, 1) };
    let mut producer = unsafe { RingProducer::new(base) }.unwrap();
    let mut consumer = unsafe { RingConsumer::new(base) }.unwrap();

    let stream = sample_records();
    // Walk the stream and push each encoded record whole, as the
    // engine does.
    let mut cursor = RecordStream::new(&stream);
    let mut last_pos = 0;
    while let Some(item) = cursor.next() {
        item.unwrap();
        let end = cursor.position();
        assert!(producer.push(&stream[last_pos..end]));
        last_pos = end;
    }
    producer.mark_done();

    let mut drained = Vec::new();
    consumer.drain(&mut drained);
    assert!(consumer.is_exhausted());
    assert_eq!(drained, stream);

    // Analysis side: the drained bytes parse to the same sequence.
    let records: Vec<Record> = RecordStream::new(&drained)
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(records.len(), 5);
    assert_eq!(records[0].kind, RecordKind::Entry);
    assert_eq!(records[3].kind, RecordKind::Lost);
    assert_eq!(records[3].lost_count(), 3);
    assert_eq!(records[4].addr, 0x1000);

    // Balanced per tid: entries match exits.
    let entries = records.iter().filter(|r| r.kind == RecordKind::Entry).count();
    let exits = records.iter().filter(|r| r.kind == RecordKind::Exit).count();
    assert_eq!(entries, exits);
}

#[test]
fn sidecars_round_trip_together() {
    let info = TraceInfo {
        exename: Some("/usr/bin/demo".into()),
        tids: Some(vec![101, 102]),
        version: Some("0.1.0".into()),
        ..TraceInfo::default()
    };
    let (text, mask) = write_info(&info);
    let (parsed, parsed_mask) = read_info(&text).unwrap();
    assert_eq!(parsed_mask, mask);
    assert_eq!(parsed.tids, info.tids);

    let syms = vec![
        SymEntry {
            addr: 0x1000,
            size: 0x100,
            kind: SymKind::Text,
            name: "main".into(),
        },
        SymEntry {
            addr: 0x2000,
            size: 0x40,
            kind: SymKind::Local,
            name: "g".into(),
        },
    ];
    let mut buf = Vec::new();
    write_symfile(&mut buf, "/usr/bin/demo", &syms).unwrap();
    let parsed = read_symfile(&mut std::io::Cursor::new(buf)).unwrap();
    assert_eq!(parsed, syms);
}

#[test]
fn control_messages_frame_cleanly_in_sequence() {
    let mut wire = Vec::new();
    for slot in 0..2u32 {
        Message::RingReady {
            slot,
            shm: fgtrace_format::shm_name("cafebabe00000000", 7, slot),
        }
        .write_to(&mut wire)
        .unwrap();
    }
    Message::TaskEnd { tid: 8 }.write_to(&mut wire).unwrap();
    Message::SessionEnd { reason: 0 }.write_to(&mut wire).unwrap();

    let mut cursor = std::io::Cursor::new(wire);
    let mut count = 0;
    while let Some(msg) = Message::read_from(&mut cursor).unwrap() {
        count += 1;
        if let Message::RingReady { shm, .. } = &msg {
            assert!(shm.starts_with("/fgtrace-"));
        }
    }
    assert_eq!(count, 4);
}

#[test]
fn filter_specs_accept_the_documented_grammar() {
    for (spec, kind) in [
        ("foo", SpecKind::Filter),
        ("!bar", SpecKind::Filter),
        ("baz@arg1/i32,arg2/s", SpecKind::Argument),
        ("main@depth=3,time=10us,finish", SpecKind::Trigger),
        ("work@read=pmu-cycle", SpecKind::Trigger),
        ("calc@retval/x64", SpecKind::Retval),
    ] {
        for ptype in [PatternType::Literal, PatternType::Regex, PatternType::Glob] {
            parse_spec_list(spec, kind, ptype)
                .unwrap_or_else(|e| panic!("{spec} under {ptype:?}: {e}"));
        }
    }
}
