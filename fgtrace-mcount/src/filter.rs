//! The compiled filter and trigger engine.
//!
//! User spec strings are compiled once at arm time: every pattern is
//! resolved against the symbol index to a set of address ranges, and the
//! action lists are interned into compact per-range entries kept in an
//! ordered map for O(log n) lookup on every function entry. Later spec
//! tokens override earlier ones on conflict, in order.
//!
//! The non-local trigger effects (`depth=`, `time=`, disable/enable)
//! live in [`DynamicState`], one per thread; the frame that installs an
//! effect saves the previous state in its shadow-stack frame and the
//! exit path restores it.

use bitflags::bitflags;
use fgtrace_format::spec::{Action, ArgSpec, FilterItem, Pattern, PatternType, PmuGroup};
use std::collections::BTreeMap;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u16 {
        const FILTER = 1 << 0;
        const NOTRACE = 1 << 1;
        const FINISH = 1 << 2;
        const DISABLE = 1 << 3;
        const ENABLE = 1 << 4;
        const RECOVER = 1 << 5;
        const TRACE_ON = 1 << 6;
        const TRACE_OFF = 1 << 7;
    }
}

/// The interned action set for one address range.
#[derive(Debug, Clone)]
pub struct CompiledEntry {
    pub start: u64,
    pub end: u64,
    pub flags: EntryFlags,
    pub depth: Option<u16>,
    pub time: Option<u64>,
    pub size: Option<u64>,
    pub args: Vec<ArgSpec>,
    pub retspec: Option<ArgSpec>,
    pub pmu: Option<PmuGroup>,
}

impl CompiledEntry {
    fn new(start: u64, end: u64) -> Self {
        CompiledEntry {
            start,
            end,
            flags: EntryFlags::empty(),
            depth: None,
            time: None,
            size: None,
            args: Vec::new(),
            retspec: None,
            pmu: None,
        }
    }

    fn apply(&mut self, action: &Action) {
        match action {
            Action::Filter => {
                self.flags.remove(EntryFlags::NOTRACE);
                self.flags.insert(EntryFlags::FILTER);
            }
            Action::Notrace => {
                self.flags.remove(EntryFlags::FILTER);
                self.flags.insert(EntryFlags::NOTRACE);
            }
            Action::Depth(n) => self.depth = Some(*n),
            Action::Time(ns) => self.time = Some(*ns),
            Action::Size(n) => self.size = Some(*n),
            Action::Args(args) => self.args = args.clone(),
            Action::Retval(r) => self.retspec = Some(*r),
            Action::Finish => self.flags.insert(EntryFlags::FINISH),
            Action::Disable => {
                self.flags.remove(EntryFlags::ENABLE);
                self.flags.insert(EntryFlags::DISABLE);
            }
            Action::Enable => {
                self.flags.remove(EntryFlags::DISABLE);
                self.flags.insert(EntryFlags::ENABLE);
            }
            Action::Recover => self.flags.insert(EntryFlags::RECOVER),
            Action::TraceOn => {
                self.flags.remove(EntryFlags::TRACE_OFF);
                self.flags.insert(EntryFlags::TRACE_ON);
            }
            Action::TraceOff => {
                self.flags.remove(EntryFlags::TRACE_ON);
                self.flags.insert(EntryFlags::TRACE_OFF);
            }
            Action::ReadPmu(group) => self.pmu = Some(*group),
        }
    }
}

/// Resolves a name pattern to address ranges. Implemented by the symbol
/// index; test code supplies fakes.
pub trait ResolvePattern {
    fn resolve(&self, pattern: &Pattern) -> Vec<(u64, u64)>;
}

/// The compiled filter set. Immutable once the session is armed.
pub struct FilterSet {
    entries: BTreeMap<u64, CompiledEntry>,
    has_positive: bool,
    pattern_type: PatternType,
}

impl FilterSet {
    pub fn empty(pattern_type: PatternType) -> Self {
        FilterSet {
            entries: BTreeMap::new(),
            has_positive: false,
            pattern_type,
        }
    }

    /// Compile spec items in order. Patterns that match no symbol are
    /// dropped with a warning; that is the documented `symbol-missing`
    /// policy.
    pub fn compile(
        items: &[FilterItem],
        resolver: &dyn ResolvePattern,
        pattern_type: PatternType,
    ) -> Self {
        let mut set = FilterSet::empty(pattern_type);
        for item in items {
            let ranges = resolver.resolve(&item.pattern);
            if ranges.is_empty() {
                log::warn!(
                    "no symbol matches pattern `{}`; entry dropped",
                    item.pattern.raw()
                );
                continue;
            }
            for (start, end) in ranges {
                let entry = set
                    .entries
                    .entry(start)
                    .or_insert_with(|| CompiledEntry::new(start, end));
                entry.end = entry.end.max(end);
                for action in &item.actions {
                    entry.apply(action);
                }
            }
        }
        set.has_positive = set
            .entries
            .values()
            .any(|e| e.flags.contains(EntryFlags::FILTER));
        set
    }

    /// Find the entry covering `addr`, if any.
    pub fn lookup(&self, addr: u64) -> Option<&CompiledEntry> {
        self.entries
            .range(..=addr)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| addr < e.end)
    }

    /// True when at least one positive pattern exists; unmatched
    /// addresses are then suppressed by default.
    pub fn has_positive(&self) -> bool {
        self.has_positive
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn pattern_type(&self) -> PatternType {
        self.pattern_type
    }

    pub fn entries(&self) -> impl Iterator<Item = &CompiledEntry> {
        self.entries.values()
    }
}

/// Per-thread dynamic trigger state.
#[derive(Debug, Clone, Copy)]
pub struct DynamicState {
    /// Cleared by a `disable` trigger, restored by `enable` or frame exit.
    pub enabled: bool,
    /// Highest record depth currently allowed.
    pub depth_limit: u16,
    /// Inherited `time=` threshold in nanoseconds; 0 means none.
    pub time_threshold: u64,
    /// Live frames that matched a positive filter.
    pub in_count: u32,
    /// Live frames inside a notrace subtree.
    pub out_count: u32,
}

impl DynamicState {
    pub fn new(depth_limit: u16, time_threshold: u64) -> Self {
        DynamicState {
            enabled: true,
            depth_limit,
            time_threshold,
            in_count: 0,
            out_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fgtrace_format::spec::{parse_spec_list, SpecKind};
    use rustc_hash::FxHashMap;

    struct FakeResolver {
        syms: FxHashMap<&'static str, (u64, u64)>,
    }

    impl FakeResolver {
        fn new() -> Self {
            let mut syms = FxHashMap::default();
            syms.insert("main", (0x1000u64, 0x1100u64));
            syms.insert("foo", (0x1100, 0x1180));
            syms.insert("bar", (0x1180, 0x1200));
            syms.insert("str_copy", (0x2000, 0x2040));
            syms.insert("str_cat", (0x2040, 0x2080));
            FakeResolver { syms }
        }
    }

    impl ResolvePattern for FakeResolver {
        fn resolve(&self, pattern: &Pattern) -> Vec<(u64, u64)> {
            self.syms
                .iter()
                .filter(|(name, _)| pattern.matches(name))
                .map(|(_, range)| *range)
                .collect()
        }
    }

    fn compile(spec: &str, ptype: PatternType) -> FilterSet {
        let items = parse_spec_list(spec, SpecKind::Filter, ptype).unwrap();
        FilterSet::compile(&items, &FakeResolver::new(), ptype)
    }

    #[test]
    fn lookup_hits_only_inside_range() {
        let set = compile("foo", PatternType::Regex);
        assert!(set.lookup(0x1100).is_some());
        assert!(set.lookup(0x117f).is_some());
        assert!(set.lookup(0x1180).is_none());
        assert!(set.lookup(0x0fff).is_none());
        assert!(set.has_positive());
    }

    #[test]
    fn glob_matches_several_symbols() {
        let set = compile("str_*", PatternType::Glob);
        assert_eq!(set.len(), 2);
        assert!(set.lookup(0x2000).is_some());
        assert!(set.lookup(0x2050).is_some());
    }

    #[test]
    fn notrace_does_not_count_as_positive() {
        let set = compile("!bar", PatternType::Regex);
        assert!(!set.has_positive());
        let entry = set.lookup(0x1180).unwrap();
        assert!(entry.flags.contains(EntryFlags::NOTRACE));
    }

    #[test]
    fn later_tokens_override_earlier() {
        let set = compile("foo;!foo", PatternType::Regex);
        let entry = set.lookup(0x1100).unwrap();
        assert!(entry.flags.contains(EntryFlags::NOTRACE));
        assert!(!entry.flags.contains(EntryFlags::FILTER));

        let set = compile("!foo;foo@depth=2", PatternType::Regex);
        let entry = set.lookup(0x1100).unwrap();
        assert!(entry.flags.contains(EntryFlags::FILTER));
        assert_eq!(entry.depth, Some(2));
    }

    #[test]
    fn unresolved_patterns_are_dropped() {
        let set = compile("no_such_symbol;main", PatternType::Regex);
        assert_eq!(set.len(), 1);
        assert!(set.lookup(0x1000).is_some());
    }

    #[test]
    fn trigger_params_land_in_entry() {
        let items = parse_spec_list(
            "main@depth=3,time=10us,finish;foo@read=pmu-cycle",
            SpecKind::Trigger,
            PatternType::Regex,
        )
        .unwrap();
        let set = FilterSet::compile(&items, &FakeResolver::new(), PatternType::Regex);
        let main = set.lookup(0x1000).unwrap();
        assert_eq!(main.depth, Some(3));
        assert_eq!(main.time, Some(10_000));
        assert!(main.flags.contains(EntryFlags::FINISH));
        let foo = set.lookup(0x1100).unwrap();
        assert_eq!(foo.pmu, Some(PmuGroup::Cycle));
    }

    #[test]
    fn filter_round_trip_accepts_same_sites() {
        // Compile, print, re-parse, re-compile: the accepted address set
        // must not change.
        let spec = "main@depth=3;!bar;str_*";
        let items = parse_spec_list(spec, SpecKind::Filter, PatternType::Glob).unwrap();
        let resolver = FakeResolver::new();
        let set = FilterSet::compile(&items, &resolver, PatternType::Glob);

        let printed = items
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(";");
        let reparsed = parse_spec_list(&printed, SpecKind::Filter, PatternType::Glob).unwrap();
        let set2 = FilterSet::compile(&reparsed, &resolver, PatternType::Glob);

        for addr in (0x0f00..0x2100).step_by(8) {
            let a = set.lookup(addr).map(|e| (e.start, e.flags));
            let b = set2.lookup(addr).map(|e| (e.start, e.flags));
            assert_eq!(a, b, "mismatch at {addr:#x}");
        }
    }
}
