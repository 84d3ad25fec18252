//! The engine behind the entry and exit trampolines.
//!
//! `fgtrace_entry` runs immediately after an instrumented prologue; it
//! unwinds longjmp casualties, consults the filter set, pushes a shadow
//! frame, emits (or defers) the entry record and redirects the caller's
//! return slot at the trampoline. `fgtrace_exit` runs in place of the
//! real return; it pops the frame, settles the time-filter decision and
//! hands the saved return address back to the trampoline.
//!
//! Both paths are allocation-free and never block: every buffer is on
//! the stack or inside the preallocated shadow frame, and a full ring
//! only bumps a counter.

use crate::arch::{Arch, RetRegs, SavedRegs};
use crate::filter::EntryFlags;
use crate::session::Session;
use crate::shadow_stack::{DynamicSave, Frame, FrameFlags, DEFER_BUF};
use crate::thread::{self, TraceThread};
use fgtrace_format::args::encode_arg;
use fgtrace_format::record::{
    payload_encoded_len, LostReason, Record, RecordFlags, RECORD_SIZE,
};
use fgtrace_format::spec::{ArgFormat, ArgSpec, PmuGroup};

/// Upper bound for a captured argument payload on the fast path.
const ARG_CAPTURE_MAX: usize = 216;
/// Scratch large enough for a header plus the largest payload chunk.
const REC_BUF: usize = RECORD_SIZE + payload_encoded_len(ARG_CAPTURE_MAX);
/// Payload room when the entry must fit in the frame's deferral buffer.
const DEFER_DATA_MAX: usize = DEFER_BUF - RECORD_SIZE - 8;

/// C ABI entry hook, called from the architecture trampolines.
#[no_mangle]
pub extern "C" fn fgtrace_entry(parent_loc: *mut usize, child_addr: usize, regs: *mut SavedRegs) {
    let Some(session) = Session::current() else {
        return;
    };
    if !session.is_tracing() || parent_loc.is_null() {
        return;
    }
    thread::with_thread(session, true, |th| {
        let regs = unsafe { regs.as_ref() };
        entry_inner(session, th, parent_loc, child_addr, regs);
    });
}

/// C ABI exit hook. Returns the real return address; the trampoline
/// jumps there after restoring the return-value registers.
#[no_mangle]
pub extern "C" fn fgtrace_exit(rets: *mut RetRegs, sp: usize) -> usize {
    let result = Session::current().and_then(|session| {
        thread::with_thread(session, false, |th| {
            let rets = unsafe { rets.as_ref() };
            exit_inner(session, th, rets, sp)
        })
    });
    match result {
        Some(addr) if addr != 0 => addr,
        // A return with no matching shadow frame has nowhere to go;
        // dying loudly beats corrupting the target's control flow.
        _ => unsafe { libc::abort() },
    }
}

/// Record hook for armed SDT probe sites.
#[no_mangle]
pub extern "C" fn fgtrace_sdt_event(probe_addr: usize) {
    let Some(session) = Session::current() else {
        return;
    };
    if !session.is_tracing() {
        return;
    }
    thread::with_thread(session, true, |th| {
        let Some(event_id) = session.event_for(probe_addr) else {
            return;
        };
        let now = th.tick();
        flush_deferred(th);
        let depth = depth8(th.record_depth);
        let rec = Record::event(now, probe_addr as u64, depth, event_id);
        th.emit(now, &rec.encode());
    });
}

fn depth8(depth: u16) -> u8 {
    depth.min(255) as u8
}

pub(crate) fn entry_inner(
    session: &'static Session,
    th: &mut TraceThread,
    parent_loc: *mut usize,
    child: usize,
    regs: Option<&SavedRegs>,
) {
    if !session.is_tracing() {
        return;
    }
    let now = th.tick();
    let ploc = parent_loc as usize;

    // A new entry can only be deeper than every live frame; anything
    // deeper than us on the shadow stack was jumped over by longjmp.
    loop {
        let Some(top) = th.stack.top() else { break };
        if top.flags.contains(FrameFlags::SIGNAL_BOUNDARY) || top.parent_loc as usize >= ploc {
            break;
        }
        let frame = th.stack.pop().unwrap();
        discard_frame(th, &frame, now, LostReason::Longjmp);
    }

    if th.stack.is_full() {
        // Keep counting; the lost marker is emitted when the stack
        // shrinks back below the cap. The frame is not redirected, so
        // its return never reaches the exit hook.
        th.overflow = th.overflow.saturating_add(1);
        return;
    }

    let entry = session.filters().lookup(child as u64);
    let saved = DynamicSave {
        depth_limit: th.dynamic.depth_limit,
        time_threshold: th.dynamic.time_threshold,
        enabled: th.dynamic.enabled,
    };

    let mut flags = FrameFlags::empty();
    let mut retspec: Option<ArgSpec> = None;
    let mut pmu: Option<PmuGroup> = None;
    let mut argspecs: &[ArgSpec] = &[];

    if let Some(e) = entry {
        if e.flags.contains(EntryFlags::FILTER) {
            flags |= FrameFlags::IN_FILTER;
            th.dynamic.in_count += 1;
        }
        if e.flags.contains(EntryFlags::NOTRACE) {
            flags |= FrameFlags::OUT_FILTER;
            th.dynamic.out_count += 1;
        }
        if e.flags.contains(EntryFlags::DISABLE) {
            th.dynamic.enabled = false;
        }
        if e.flags.contains(EntryFlags::ENABLE) {
            th.dynamic.enabled = true;
        }
        if e.flags.contains(EntryFlags::TRACE_ON) {
            session.set_recording(true);
        }
        if e.flags.contains(EntryFlags::TRACE_OFF) {
            session.set_recording(false);
        }
        if e.flags.contains(EntryFlags::FINISH) {
            flags |= FrameFlags::FINISH;
        }
        if let Some(t) = e.time {
            th.dynamic.time_threshold = t;
        }
        retspec = e.retspec;
        pmu = e.pmu;
        argspecs = &e.args;
    }

    let record_depth = th.record_depth;
    let mut recorded = session.recording()
        && th.dynamic.enabled
        && th.dynamic.out_count == 0
        && (!session.filters().has_positive() || th.dynamic.in_count > 0)
        && record_depth <= th.dynamic.depth_limit;
    if let Some(e) = entry {
        if let Some(min_size) = e.size {
            recorded &= e.end - e.start >= min_size;
        }
    }
    if recorded {
        if let Some(min_size) = session.size_filter() {
            recorded &= session.symbol_size(child).map_or(true, |s| s >= min_size);
        }
    }

    // The depth trigger binds the subtree, not the triggering frame.
    if let Some(e) = entry {
        if let Some(d) = e.depth {
            th.dynamic.depth_limit = th
                .dynamic
                .depth_limit
                .min(record_depth.saturating_add(d));
        }
    }

    let time_threshold = if recorded { th.dynamic.time_threshold } else { 0 };

    let mut frame = Frame {
        parent_loc,
        parent_addr: unsafe { *parent_loc },
        child_addr: child,
        entry_time: now,
        record_depth,
        flags,
        time_threshold,
        saved,
        retspec,
        pmu,
        deferred_len: 0,
        deferred: [0; DEFER_BUF],
    };

    let trampoline = session.arch().return_trampoline();
    if frame.parent_addr == trampoline {
        // The slot is already redirected (tail-call sharing the return
        // slot). Recover the real address from the frame that owns it.
        if let Some(prev) = th
            .stack
            .frames()
            .iter()
            .rev()
            .find(|f| f.parent_loc == parent_loc)
        {
            frame.parent_addr = prev.parent_addr;
        }
    }

    if recorded {
        frame.flags |= FrameFlags::RECORDED;
        th.record_depth += 1;

        let mut payload = [0u8; ARG_CAPTURE_MAX];
        let mut payload_len = 0;
        if !argspecs.is_empty() {
            if let Some(regs) = regs {
                let cap = if time_threshold > 0 {
                    DEFER_DATA_MAX
                } else {
                    ARG_CAPTURE_MAX
                };
                payload_len = capture_args(
                    session.arch(),
                    regs,
                    parent_loc,
                    argspecs,
                    &mut payload[..cap],
                );
            }
        }

        let mut rec = Record::entry(now, child as u64, depth8(record_depth));
        if payload_len > 0 {
            rec = rec.with_flags(RecordFlags::ARGS);
            frame.flags |= FrameFlags::ARGS_CAPTURED;
        }
        let mut buf = [0u8; REC_BUF];
        let n = build_record(&mut buf, &rec, &payload[..payload_len]);

        if time_threshold > 0 {
            frame.flags |= FrameFlags::DEFERRED;
            frame.deferred[..n].copy_from_slice(&buf[..n]);
            frame.deferred_len = n as u16;
            if th.deferred_from.is_none() {
                th.deferred_from = Some(th.stack.depth());
            }
        } else {
            flush_deferred(th);
            th.emit(now, &buf[..n]);
            if let Some(group) = pmu {
                emit_pmu(session, th, now, child, group, record_depth);
            }
        }
    }

    th.stack.push(frame);
    unsafe { *parent_loc = trampoline };
}

pub(crate) fn exit_inner(
    session: &'static Session,
    th: &mut TraceThread,
    rets: Option<&RetRegs>,
    sp: usize,
) -> usize {
    let now = th.tick();

    // The returning frame is the outermost one whose return slot lies
    // below the trampoline's stack pointer; everything nested inside it
    // was jumped over and will never return.
    while th.stack.depth() >= 2 {
        let skip = {
            let top = th.stack.top().unwrap();
            let below = th.stack.peek(1).unwrap();
            !top.flags.contains(FrameFlags::SIGNAL_BOUNDARY)
                && !below.flags.contains(FrameFlags::SIGNAL_BOUNDARY)
                && (below.parent_loc as usize) < sp
        };
        if !skip {
            break;
        }
        let frame = th.stack.pop().unwrap();
        discard_frame(th, &frame, now, LostReason::Longjmp);
    }

    let Some(frame) = th.stack.pop() else {
        return 0;
    };
    restore_dynamic(th, &frame);
    if frame.is_recorded() {
        th.record_depth = th.record_depth.saturating_sub(1);
    }

    let elapsed = now.saturating_sub(frame.entry_time);
    if frame.is_deferred() {
        if th.deferred_from == Some(th.stack.depth()) {
            th.deferred_from = None;
        }
        if elapsed >= frame.time_threshold {
            flush_deferred(th);
            let len = frame.deferred_len as usize;
            th.emit(frame.entry_time, &frame.deferred[..len]);
            emit_exit(session, th, now, &frame, rets);
        }
        // Under the threshold both records evaporate; the entry never
        // left the frame.
    } else if frame.is_recorded() {
        emit_exit(session, th, now, &frame, rets);
        if let Some(group) = frame.pmu {
            emit_pmu(session, th, now, frame.child_addr, group, frame.record_depth);
        }
    }

    if th.overflow > 0 && !th.stack.is_full() {
        let lost = Record::lost(
            now,
            LostReason::StackOverflow,
            th.overflow as u64,
            depth8(th.record_depth),
        );
        th.emit(now, &lost.encode());
        th.overflow = 0;
    }

    if frame.flags.contains(FrameFlags::FINISH) {
        session.request_finish();
    }

    frame.parent_addr
}

/// Mark the entry of a signal handler frame; traced calls inside the
/// handler cannot unwind past it.
pub(crate) fn signal_boundary(th: &mut TraceThread, now: u64) {
    if th.stack.is_full() {
        return;
    }
    let frame = Frame {
        entry_time: now,
        flags: FrameFlags::SIGNAL_BOUNDARY,
        ..Frame::default()
    };
    th.stack.push(frame);
}

/// Remove the boundary once the handler is done with it.
pub(crate) fn signal_boundary_end(th: &mut TraceThread) {
    if let Some(top) = th.stack.top() {
        if top.flags.contains(FrameFlags::SIGNAL_BOUNDARY) {
            th.stack.pop();
        }
    }
}

fn restore_dynamic(th: &mut TraceThread, frame: &Frame) {
    th.dynamic.depth_limit = frame.saved.depth_limit;
    th.dynamic.time_threshold = frame.saved.time_threshold;
    th.dynamic.enabled = frame.saved.enabled;
    if frame.flags.contains(FrameFlags::IN_FILTER) {
        th.dynamic.in_count = th.dynamic.in_count.saturating_sub(1);
    }
    if frame.flags.contains(FrameFlags::OUT_FILTER) {
        th.dynamic.out_count = th.dynamic.out_count.saturating_sub(1);
    }
}

/// Drop a frame that will never see its exit (longjmp, teardown).
fn discard_frame(th: &mut TraceThread, frame: &Frame, now: u64, reason: LostReason) {
    restore_dynamic(th, frame);
    if !frame.is_recorded() {
        return;
    }
    th.record_depth = th.record_depth.saturating_sub(1);
    if frame.is_deferred() {
        // The entry only ever lived in the frame; nothing to balance.
        if th.deferred_from == Some(th.stack.depth()) {
            th.deferred_from = None;
        }
        return;
    }
    let rec = Record::lost(now, reason, 1, depth8(frame.record_depth));
    th.emit(now, &rec.encode());
}

/// Write out buffered entries below the current top, oldest first, so
/// that any record emitted now lands after its ancestors.
fn flush_deferred(th: &mut TraceThread) {
    let Some(from) = th.deferred_from.take() else {
        return;
    };
    for i in from..th.stack.depth() {
        let flushed = {
            let Some(frame) = th.stack.frame_mut(i) else {
                break;
            };
            if !frame.is_deferred() {
                continue;
            }
            frame.flags.remove(FrameFlags::DEFERRED);
            Some((frame.deferred, frame.deferred_len as usize, frame.entry_time))
        };
        if let Some((bytes, len, time)) = flushed {
            th.emit(time, &bytes[..len]);
        }
    }
}

fn emit_exit(
    session: &'static Session,
    th: &mut TraceThread,
    now: u64,
    frame: &Frame,
    rets: Option<&RetRegs>,
) {
    let mut payload = [0u8; 24];
    let mut payload_len = 0;
    if let (Some(spec), Some(rets)) = (frame.retspec, rets) {
        payload_len = capture_retval(session.arch(), rets, spec, &mut payload);
    }
    let mut rec = Record::exit(now, frame.child_addr as u64, depth8(frame.record_depth));
    if payload_len > 0 {
        rec = rec.with_flags(RecordFlags::RETVAL);
    }
    let mut buf = [0u8; REC_BUF];
    let n = build_record(&mut buf, &rec, &payload[..payload_len]);
    th.emit(now, &buf[..n]);
}

fn emit_pmu(
    session: &'static Session,
    th: &mut TraceThread,
    now: u64,
    addr: usize,
    group: PmuGroup,
    depth: u16,
) {
    let Some((counters, n)) = session.pmu_read(group) else {
        return;
    };
    let mut payload = [0u8; 16];
    for (i, c) in counters.iter().take(n).enumerate() {
        payload[i * 8..i * 8 + 8].copy_from_slice(&c.to_le_bytes());
    }
    let rec = Record::event(now, addr as u64, depth8(depth), group.event_id())
        .with_flags(RecordFlags::DATA);
    let mut buf = [0u8; REC_BUF];
    let len = build_record(&mut buf, &rec, &payload[..n * 8]);
    th.emit(now, &buf[..len]);
}

/// Assemble header plus optional payload chunk into `buf`.
fn build_record(buf: &mut [u8; REC_BUF], rec: &Record, payload: &[u8]) -> usize {
    buf[..RECORD_SIZE].copy_from_slice(&rec.encode());
    if payload.is_empty() {
        return RECORD_SIZE;
    }
    buf[RECORD_SIZE..RECORD_SIZE + 4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    let data_start = RECORD_SIZE + 4;
    buf[data_start..data_start + payload.len()].copy_from_slice(payload);
    let total = RECORD_SIZE + payload_encoded_len(payload.len());
    for b in &mut buf[data_start + payload.len()..total] {
        *b = 0;
    }
    total
}

fn capture_args(
    arch: &'static crate::arch::Native,
    regs: &SavedRegs,
    parent_loc: *mut usize,
    specs: &[ArgSpec],
    out: &mut [u8],
) -> usize {
    let layout = arch.reg_layout();
    let mut pos = 0;
    for spec in specs {
        let mut data = [0u8; 64];
        let len;
        if spec.fpreg || spec.format == ArgFormat::Float {
            let Some(q) = arch.float_arg(regs, spec.index) else {
                continue;
            };
            len = (spec.size as usize).min(16);
            data[..len].copy_from_slice(&q[..len]);
        } else {
            let raw = if spec.index <= layout.int_args {
                match arch.int_arg(regs, spec.index) {
                    Some(v) => v,
                    None => continue,
                }
            } else {
                // Overflow arguments sit above the return-address slot.
                let slot = (spec.index - layout.int_args) as usize;
                unsafe { *(parent_loc.add(slot) as *const u64) }
            };
            match spec.format {
                ArgFormat::Str => {
                    len = read_user_string(raw as *const u8, &mut data);
                }
                ArgFormat::Char => {
                    data[0] = raw as u8;
                    len = 1;
                }
                _ => {
                    len = (spec.size as usize).min(8);
                    data[..len].copy_from_slice(&raw.to_le_bytes()[..len]);
                }
            }
        }
        match encode_arg(out, pos, spec.index, spec.format, &data[..len]) {
            Some(p) => pos = p,
            None => break,
        }
    }
    pos
}

fn capture_retval(
    arch: &'static crate::arch::Native,
    rets: &RetRegs,
    spec: ArgSpec,
    out: &mut [u8],
) -> usize {
    let mut data = [0u8; 16];
    let len;
    if spec.format == ArgFormat::Float {
        let q = arch.float_retval(rets);
        len = (spec.size as usize).min(16);
        data[..len].copy_from_slice(&q[..len]);
    } else {
        let raw = arch.int_retval(rets);
        len = (spec.size as usize).min(8);
        data[..len].copy_from_slice(&raw.to_le_bytes()[..len]);
    }
    encode_arg(out, 0, 0, spec.format, &data[..len]).unwrap_or(0)
}

/// Copy a NUL-terminated string from target memory without risking a
/// fault: one `process_vm_readv` bounded by the page the pointer lives
/// on.
fn read_user_string(ptr: *const u8, out: &mut [u8; 64]) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let page_left = 4096 - (ptr as usize & 4095);
    let want = out.len().min(page_left);
    let local = libc::iovec {
        iov_base: out.as_mut_ptr() as *mut libc::c_void,
        iov_len: want,
    };
    let remote = libc::iovec {
        iov_base: ptr as *mut libc::c_void,
        iov_len: want,
    };
    let n = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if n <= 0 {
        return 0;
    }
    memchr::memchr(0, &out[..n as usize]).unwrap_or(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::HeapBacking;
    use crate::session::{Session, SessionConfig};
    use crate::thread::make_test_thread;
    use fgtrace_format::args::decode_args;
    use fgtrace_format::record::{RecordKind, RecordStream};
    use fgtrace_format::spec::PatternType;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const MAIN: usize = 0x1000;
    const FN_A: usize = 0x1100;
    const FN_B: usize = 0x1180;
    const FN_G: usize = 0x2000;

    fn test_symbols() -> Vec<(&'static str, u64, u64)> {
        vec![
            ("main", MAIN as u64, 0x100),
            ("a", FN_A as u64, 0x80),
            ("b", FN_B as u64, 0x80),
            ("g", FN_G as u64, 0x40),
        ]
    }

    struct Sim {
        session: &'static Session,
        backing: Arc<HeapBacking>,
        clock: Arc<AtomicU64>,
        th: Box<crate::thread::TraceThread>,
        slots: Box<[usize; 64]>,
    }

    impl Sim {
        fn new(filter: &str, trigger: &str) -> Sim {
            Self::with_config(filter, trigger, SessionConfig::default())
        }

        fn with_config(filter: &str, trigger: &str, mut config: SessionConfig) -> Sim {
            // One slot for the simulated thread, one spare.
            config.max_threads = 2;
            let clock = Arc::new(AtomicU64::new(1000));
            let backing = Arc::new(HeapBacking::new(65536));
            let session = Session::for_test(
                config,
                filter,
                trigger,
                test_symbols(),
                backing.clone(),
                {
                    let clock = clock.clone();
                    Box::new(move || clock.load(Ordering::Relaxed))
                },
            );
            let th = make_test_thread(session);
            let mut slots = Box::new([0usize; 64]);
            for (i, s) in slots.iter_mut().enumerate() {
                *s = 0xf000 + i;
            }
            Sim {
                session,
                backing,
                clock,
                th,
                slots,
            }
        }

        fn slot(&mut self, i: usize) -> *mut usize {
            &mut self.slots[i] as *mut usize
        }

        fn advance(&self, ns: u64) {
            self.clock.fetch_add(ns, Ordering::Relaxed);
        }

        fn call(&mut self, slot: usize, addr: usize) {
            let p = self.slot(slot);
            entry_inner(self.session, &mut self.th, p, addr, None);
        }

        fn ret(&mut self, slot: usize) -> usize {
            let sp = self.slot(slot) as usize + 8;
            exit_inner(self.session, &mut self.th, None, sp)
        }

        fn records(&mut self) -> Vec<(RecordKind, u64, u8)> {
            self.raw_records()
                .into_iter()
                .map(|(r, _)| (r.kind, r.addr, r.depth))
                .collect()
        }

        fn raw_records(&mut self) -> Vec<(Record, Option<Vec<u8>>)> {
            let mut consumer = self.backing.consumer(self.th.tid).unwrap();
            let mut out = Vec::new();
            consumer.drain(&mut out);
            RecordStream::new(&out)
                .map(|r| {
                    let (rec, payload) = r.unwrap();
                    (rec, payload.map(|p| p.to_vec()))
                })
                .collect()
        }
    }

    #[test]
    fn plain_call_pair_is_balanced() {
        // void g(){} int main(){ g(); return 0; }
        let mut sim = Sim::new("", "");
        sim.call(40, MAIN);
        sim.call(30, FN_G);
        let back_g = sim.ret(30);
        let back_main = sim.ret(40);
        assert_eq!(back_g, 0xf000 + 30);
        assert_eq!(back_main, 0xf000 + 40);

        let recs = sim.records();
        assert_eq!(
            recs,
            vec![
                (RecordKind::Entry, MAIN as u64, 0),
                (RecordKind::Entry, FN_G as u64, 1),
                (RecordKind::Exit, FN_G as u64, 1),
                (RecordKind::Exit, MAIN as u64, 0),
            ]
        );
    }

    #[test]
    fn notrace_filter_suppresses_subtree() {
        // Same program with filter `!g`.
        let mut sim = Sim::new("!g", "");
        sim.call(40, MAIN);
        sim.call(30, FN_G);
        sim.call(20, FN_A); // called from inside g
        sim.ret(20);
        sim.ret(30);
        sim.ret(40);

        let recs = sim.records();
        assert_eq!(
            recs,
            vec![
                (RecordKind::Entry, MAIN as u64, 0),
                (RecordKind::Exit, MAIN as u64, 0),
            ]
        );
    }

    #[test]
    fn positive_filter_limits_to_subtree() {
        let mut sim = Sim::new("a", "");
        sim.call(40, MAIN); // not recorded
        sim.call(30, FN_A);
        sim.call(20, FN_B); // inside `a`, recorded
        sim.ret(20);
        sim.ret(30);
        sim.call(30, FN_G); // outside `a`, not recorded
        sim.ret(30);
        sim.ret(40);

        let recs = sim.records();
        assert_eq!(
            recs,
            vec![
                (RecordKind::Entry, FN_A as u64, 0),
                (RecordKind::Entry, FN_B as u64, 1),
                (RecordKind::Exit, FN_B as u64, 1),
                (RecordKind::Exit, FN_A as u64, 0),
            ]
        );
    }

    #[test]
    fn depth_trigger_prunes_below() {
        // main@depth=1 on main -> a -> b.
        let mut sim = Sim::new("", "main@depth=1");
        sim.call(40, MAIN);
        sim.call(30, FN_A);
        sim.call(20, FN_B);
        sim.ret(20);
        sim.ret(30);
        sim.ret(40);

        let recs = sim.records();
        assert_eq!(
            recs,
            vec![
                (RecordKind::Entry, MAIN as u64, 0),
                (RecordKind::Entry, FN_A as u64, 1),
                (RecordKind::Exit, FN_A as u64, 1),
                (RecordKind::Exit, MAIN as u64, 0),
            ]
        );
    }

    #[test]
    fn time_filter_drops_fast_frames() {
        // g@time>=1ms; g runs 500us -> nothing recorded.
        let mut sim = Sim::new("", "g@time=1ms");
        sim.call(40, MAIN);
        sim.call(30, FN_G);
        sim.advance(500_000);
        sim.ret(30);
        sim.ret(40);
        let recs = sim.records();
        assert_eq!(recs[0].0, RecordKind::Entry);
        assert!(recs.iter().all(|(_, addr, _)| *addr != FN_G as u64));

        // The same g sleeping 2ms records both, back to back.
        let mut sim = Sim::new("", "g@time=1ms");
        sim.call(40, MAIN);
        sim.call(30, FN_G);
        sim.advance(2_000_000);
        sim.ret(30);
        sim.ret(40);
        let recs = sim.records();
        assert_eq!(
            recs.iter()
                .filter(|(_, addr, _)| *addr == FN_G as u64)
                .count(),
            2
        );
        // Entry/exit pair carries the original timestamps.
        let raw = {
            let mut sim = Sim::new("", "g@time=1ms");
            sim.call(40, MAIN);
            sim.call(30, FN_G);
            sim.advance(2_000_000);
            sim.ret(30);
            sim.ret(40);
            sim.raw_records()
        };
        let g_entry = raw
            .iter()
            .find(|(r, _)| r.kind == RecordKind::Entry && r.addr == FN_G as u64)
            .unwrap();
        let g_exit = raw
            .iter()
            .find(|(r, _)| r.kind == RecordKind::Exit && r.addr == FN_G as u64)
            .unwrap();
        assert!(g_exit.0.time >= g_entry.0.time + 2_000_000);
    }

    #[test]
    fn deferred_parent_flushes_before_recorded_child() {
        // The parent sits under a time threshold, but a child below it
        // must still appear after the parent's entry. The child resets
        // the inherited threshold, so its entry is written immediately.
        let mut sim = Sim::new("", "a@time=1s;b@time=0");
        sim.call(40, MAIN);
        sim.call(30, FN_A); // deferred
        sim.call(20, FN_B); // recorded now; forces the flush
        sim.ret(20);
        sim.advance(10);
        sim.ret(30); // under threshold, but already flushed
        sim.ret(40);

        let recs = sim.records();
        let a_entry = recs
            .iter()
            .position(|(k, addr, _)| *k == RecordKind::Entry && *addr == FN_A as u64)
            .unwrap();
        let b_entry = recs
            .iter()
            .position(|(k, addr, _)| *k == RecordKind::Entry && *addr == FN_B as u64)
            .unwrap();
        assert!(a_entry < b_entry);
        // Balanced: flushed entry gets its exit.
        let a_exit = recs
            .iter()
            .filter(|(k, addr, _)| *k == RecordKind::Exit && *addr == FN_A as u64)
            .count();
        assert_eq!(a_exit, 1);
    }

    #[test]
    fn longjmp_produces_lost_markers() {
        let mut sim = Sim::new("", "");
        sim.call(50, MAIN);
        sim.call(40, FN_A);
        sim.call(30, FN_B);
        // longjmp back into main's frame, then a fresh call shallower
        // than the two dead frames.
        sim.call(45, FN_G);
        sim.ret(45);
        sim.ret(50);

        let raw = sim.raw_records();
        let lost: Vec<_> = raw
            .iter()
            .filter(|(r, _)| r.kind == RecordKind::Lost)
            .collect();
        assert_eq!(lost.len(), 2);
        for (r, _) in &lost {
            assert_eq!(r.lost_reason(), LostReason::Longjmp);
        }
        // Entries and exits still balance per function that returned.
        let entries = raw
            .iter()
            .filter(|(r, _)| r.kind == RecordKind::Entry)
            .count();
        let exits = raw
            .iter()
            .filter(|(r, _)| r.kind == RecordKind::Exit)
            .count();
        assert_eq!(entries, exits + 2); // two entries closed by lost markers
    }

    #[test]
    fn stack_overflow_is_counted_not_fatal() {
        let config = SessionConfig {
            max_stack: 4,
            ..SessionConfig::default()
        };
        let mut sim = Sim::with_config("", "", config);
        for depth in 0..8 {
            sim.call(60 - depth * 2, MAIN + depth * 8);
        }
        // Only four frames fit; four entries overflowed.
        assert_eq!(sim.th.stack.depth(), 4);
        for depth in (0..4).rev() {
            sim.ret(60 - depth * 2);
        }
        let raw = sim.raw_records();
        let lost: Vec<_> = raw
            .iter()
            .filter(|(r, _)| r.kind == RecordKind::Lost)
            .collect();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].0.lost_reason(), LostReason::StackOverflow);
        assert_eq!(lost[0].0.lost_count(), 4);
    }

    #[test]
    fn trace_off_trigger_stops_recording() {
        let mut sim = Sim::new("", "a@trace-off;b@trace-on");
        sim.call(40, MAIN);
        sim.call(30, FN_A); // recording turns off before a is decided
        sim.call(20, FN_G); // not recorded
        sim.ret(20);
        sim.ret(30);
        sim.call(30, FN_B); // trace-on; b recorded again
        sim.ret(30);
        sim.ret(40);

        let recs = sim.records();
        assert!(recs
            .iter()
            .all(|(_, addr, _)| *addr != FN_G as u64));
        assert!(recs
            .iter()
            .any(|(k, addr, _)| *k == RecordKind::Entry && *addr == FN_B as u64));
    }

    #[test]
    fn finish_trigger_flushes_after_frame() {
        let mut sim = Sim::new("", "a@finish");
        sim.call(40, MAIN);
        sim.call(30, FN_A);
        sim.ret(30);
        assert!(!sim.session.is_tracing());
        // New entries are ignored after finish.
        sim.call(30, FN_B);
        assert_eq!(sim.th.stack.depth(), 1);
        let _ = sim.ret(40);
    }

    #[test]
    fn disable_trigger_is_frame_scoped() {
        let mut sim = Sim::new("", "a@disable");
        sim.call(40, MAIN);
        sim.call(30, FN_A);
        sim.call(20, FN_B); // disabled
        sim.ret(20);
        sim.ret(30);
        sim.call(30, FN_G); // enabled again after a returned
        sim.ret(30);
        sim.ret(40);

        let recs = sim.records();
        assert!(recs.iter().all(|(_, addr, _)| *addr != FN_B as u64));
        assert!(recs
            .iter()
            .any(|(k, addr, _)| *k == RecordKind::Entry && *addr == FN_G as u64));
    }

    #[test]
    fn thread_pool_claims_are_bounded_and_counted() {
        let sim = Sim::new("", "");
        // The simulated thread holds slot 0 of 2; one spare remains.
        let spare = sim.session.pool().claim();
        assert!(spare.is_some());
        assert!(sim.session.pool().claim().is_none());
        assert_eq!(sim.session.pool().exhausted(), 1);
    }

    #[test]
    fn claimed_ring_carries_the_thread_id() {
        let sim = Sim::new("", "");
        assert_ne!(sim.th.tid, 0);
        let consumer = sim.backing.consumer(sim.th.tid).unwrap();
        assert_eq!(consumer.tid(), sim.th.tid);
    }

    #[test]
    fn time_filter_is_deterministic() {
        // Two identical runs under the same threshold record the same
        // set of functions, whatever the absolute timings are.
        let run = |base: u64| -> Vec<(RecordKind, u64)> {
            let mut sim = Sim::new("", "a@time=1us");
            sim.clock.store(base, Ordering::Relaxed);
            sim.call(40, MAIN);
            sim.call(30, FN_A);
            sim.advance(500); // under threshold
            sim.ret(30);
            sim.call(30, FN_B);
            sim.advance(3_000);
            sim.ret(30);
            sim.ret(40);
            sim.records()
                .into_iter()
                .map(|(k, addr, _)| (k, addr))
                .collect()
        };
        assert_eq!(run(1_000), run(777_000));
    }

    #[test]
    fn pmu_trigger_emits_counter_events_when_available() {
        let mut sim = Sim::new("", "g@read=cycle");
        sim.call(40, MAIN);
        sim.call(30, FN_G);
        sim.ret(30);
        sim.ret(40);
        let raw = sim.raw_records();
        let events: Vec<_> = raw
            .iter()
            .filter(|(r, _)| r.kind == RecordKind::Event)
            .collect();
        // The kernel may refuse perf events entirely; when it grants
        // them the entry/exit reads arrive in order and never count
        // backwards.
        if events.len() == 2 {
            let read = |payload: &Option<Vec<u8>>| -> Vec<u64> {
                payload
                    .as_ref()
                    .unwrap()
                    .chunks_exact(8)
                    .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                    .collect()
            };
            let before = read(&events[0].1);
            let after = read(&events[1].1);
            assert_eq!(before.len(), 2);
            for (b, a) in before.iter().zip(&after) {
                assert!(a >= b);
            }
        } else {
            assert!(events.is_empty(), "partial pmu event pair: {events:?}");
        }
    }

    #[test]
    fn timestamps_are_strictly_monotonic() {
        let mut sim = Sim::new("", "");
        sim.call(40, MAIN);
        sim.call(30, FN_A);
        sim.ret(30);
        sim.call(30, FN_B);
        sim.ret(30);
        sim.ret(40);
        let raw = sim.raw_records();
        let mut last = 0;
        for (r, _) in &raw {
            assert!(r.time > last, "timestamp went backwards");
            last = r.time;
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn argument_and_retval_capture() {
        let mut sim = Sim::new("", "g@arg1/i32,arg2/u64,retval/x64");
        let mut regs: SavedRegs = unsafe { std::mem::zeroed() };
        regs.rdi = (-42i32) as u32 as u64;
        regs.rsi = 99;
        let p = sim.slot(30);
        sim.call(40, MAIN);
        entry_inner(sim.session, &mut sim.th, p, FN_G, Some(&regs));

        let mut rets: RetRegs = unsafe { std::mem::zeroed() };
        rets.rax = 0xdead;
        let sp = sim.slot(30) as usize + 8;
        exit_inner(sim.session, &mut sim.th, Some(&rets), sp);
        sim.ret(40);

        let raw = sim.raw_records();
        let (entry, entry_payload) = raw
            .iter()
            .find(|(r, _)| r.kind == RecordKind::Entry && r.addr == FN_G as u64)
            .unwrap();
        assert!(entry.flags.contains(RecordFlags::ARGS));
        let args = decode_args(entry_payload.as_ref().unwrap());
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].render(), "-42");
        assert_eq!(args[1].render(), "99");

        let (_, exit_payload) = raw
            .iter()
            .find(|(r, _)| r.kind == RecordKind::Exit && r.addr == FN_G as u64)
            .unwrap();
        let rets = decode_args(exit_payload.as_ref().unwrap());
        assert_eq!(rets[0].render(), "0xdead");
    }

    #[test]
    fn signal_boundary_blocks_unwind() {
        let mut sim = Sim::new("", "");
        sim.call(50, MAIN);
        let now = sim.th.tick();
        signal_boundary(&mut sim.th, now);
        sim.call(20, FN_A); // handler-side call, deeper slot
        // An entry shallower than the handler frame must not unwind
        // through the boundary.
        sim.call(40, FN_B);
        assert!(sim.th.stack.depth() >= 3);
    }
}
