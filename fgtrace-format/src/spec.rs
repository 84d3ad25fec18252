//! The user-facing filter, trigger, argument and event spec language.
//!
//! Specs are `;`-separated tokens of the form `pattern@action,action,...`.
//! A leading `!` negates the pattern. The same tokenizer serves the four
//! option surfaces; they differ only in the action implied when a token
//! has no explicit `@` list (a bare filter pattern means "trace this
//! subtree", a bare retval pattern means "capture the return value").
//!
//! Patterns are matched literally, as regular expressions or as globs,
//! selected by a session-wide policy. Under the regex policy a pattern
//! without any regex metacharacter degrades to a literal match.

use crate::FormatError;
use std::fmt;
use std::time::Duration;

const REGEX_CHARS: &[char] = &['*', '?', '[', ']', '(', ')', '{', '}', '|', '$', '^', '+', '.'];

/// How filter patterns are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatternType {
    Literal,
    #[default]
    Regex,
    Glob,
}

impl PatternType {
    pub fn name(self) -> &'static str {
        match self {
            PatternType::Literal => "literal",
            PatternType::Regex => "regex",
            PatternType::Glob => "glob",
        }
    }
}

impl std::str::FromStr for PatternType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "literal" => Ok(PatternType::Literal),
            "regex" => Ok(PatternType::Regex),
            "glob" => Ok(PatternType::Glob),
            other => Err(format!("unknown pattern type `{other}`")),
        }
    }
}

/// A compiled name pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    regex: Option<regex::Regex>,
}

impl Pattern {
    pub fn new(raw: &str, ptype: PatternType) -> Result<Self, FormatError> {
        let regex = match ptype {
            PatternType::Literal => None,
            PatternType::Regex => {
                if raw.contains(REGEX_CHARS) {
                    Some(
                        regex::Regex::new(raw)
                            .map_err(|e| FormatError::BadRegex(raw.to_string(), e))?,
                    )
                } else {
                    None
                }
            }
            PatternType::Glob => {
                let translated = glob_to_regex(raw);
                Some(
                    regex::Regex::new(&translated)
                        .map_err(|e| FormatError::BadRegex(raw.to_string(), e))?,
                )
            }
        };
        Ok(Pattern {
            raw: raw.to_string(),
            regex,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        match &self.regex {
            Some(re) => re.is_match(name),
            None => self.raw == name,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    let mut in_class = false;
    for c in glob.chars() {
        match c {
            '*' if !in_class => out.push_str(".*"),
            '?' if !in_class => out.push('.'),
            '[' => {
                in_class = true;
                out.push('[');
            }
            ']' => {
                in_class = false;
                out.push(']');
            }
            c if in_class => out.push(c),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

/// Value formats for captured arguments and return values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgFormat {
    /// Signed integer, the default.
    #[default]
    Int,
    Uint,
    Hex,
    /// NUL-terminated C string, copied with a bounded read.
    Str,
    Char,
    Float,
}

impl ArgFormat {
    fn letter(self) -> char {
        match self {
            ArgFormat::Int => 'i',
            ArgFormat::Uint => 'u',
            ArgFormat::Hex => 'x',
            ArgFormat::Str => 's',
            ArgFormat::Char => 'c',
            ArgFormat::Float => 'f',
        }
    }
}

/// One argument (or return value) capture description, e.g. `arg1/i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    /// 1-based argument index. Index 0 names the return value.
    pub index: u8,
    /// Float registers are numbered separately from integer registers.
    pub fpreg: bool,
    pub format: ArgFormat,
    /// Size in bytes: 1, 2, 4 or 8.
    pub size: u8,
}

impl ArgSpec {
    pub fn retval() -> Self {
        ArgSpec {
            index: 0,
            fpreg: false,
            format: ArgFormat::Int,
            size: 8,
        }
    }

    fn parse(token: &str, spec: &str) -> Result<Self, FormatError> {
        let bad = |reason: &str| FormatError::BadSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let (name, fmt) = match token.split_once('/') {
            Some((n, f)) => (n, Some(f)),
            None => (token, None),
        };

        let (index, fpreg) = if name == "retval" {
            (0, false)
        } else if let Some(n) = name.strip_prefix("fparg") {
            let idx: u8 = n.parse().map_err(|_| bad("bad float argument index"))?;
            (idx, true)
        } else if let Some(n) = name.strip_prefix("arg") {
            let idx: u8 = n.parse().map_err(|_| bad("bad argument index"))?;
            if idx == 0 {
                return Err(bad("argument indexes start at 1"));
            }
            (idx, false)
        } else {
            return Err(bad("expected argN, fpargN or retval"));
        };

        let mut arg = ArgSpec {
            index,
            fpreg,
            format: if fpreg { ArgFormat::Float } else { ArgFormat::Int },
            size: 8,
        };
        if let Some(fmt) = fmt {
            let mut chars = fmt.chars();
            match chars.next() {
                Some('d') | Some('i') => arg.format = ArgFormat::Int,
                Some('u') => arg.format = ArgFormat::Uint,
                Some('x') => arg.format = ArgFormat::Hex,
                Some('s') => arg.format = ArgFormat::Str,
                Some('c') => {
                    arg.format = ArgFormat::Char;
                    arg.size = 1;
                }
                Some('f') => arg.format = ArgFormat::Float,
                _ => return Err(bad("unknown argument format")),
            }
            let bits: String = chars.collect();
            if !bits.is_empty() {
                arg.size = match bits.as_str() {
                    "8" => 1,
                    "16" => 2,
                    "32" => 4,
                    "64" => 8,
                    _ => return Err(bad("argument size must be 8, 16, 32 or 64 bits")),
                };
            }
        }
        Ok(arg)
    }
}

impl fmt::Display for ArgSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index == 0 {
            write!(f, "retval")?;
        } else if self.fpreg {
            write!(f, "fparg{}", self.index)?;
        } else {
            write!(f, "arg{}", self.index)?;
        }
        write!(f, "/{}{}", self.format.letter(), self.size as u16 * 8)
    }
}

/// PMU event groups readable via a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmuGroup {
    Cycle,
    Cache,
    Branch,
}

impl PmuGroup {
    pub fn name(self) -> &'static str {
        match self {
            PmuGroup::Cycle => "pmu-cycle",
            PmuGroup::Cache => "pmu-cache",
            PmuGroup::Branch => "pmu-branch",
        }
    }

    /// Fixed event ids, shared with `events.txt`.
    pub fn event_id(self) -> u8 {
        match self {
            PmuGroup::Cycle => 1,
            PmuGroup::Cache => 2,
            PmuGroup::Branch => 3,
        }
    }
}

/// First event id handed out to user-defined (SDT) probes.
pub const USER_EVENT_BASE: u8 = 100;

/// One action attached to a pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Positive filter: trace this function and its subtree.
    Filter,
    /// Suppress this function and its subtree.
    Notrace,
    /// Limit recording below this frame to N further levels.
    Depth(u16),
    /// Record this frame only if it ran at least this many nanoseconds.
    Time(u64),
    /// Record this frame only if its stack frame is at least this large.
    Size(u64),
    Args(Vec<ArgSpec>),
    Retval(ArgSpec),
    /// Flush and detach the session once this frame returns.
    Finish,
    /// Stop recording on this thread for the duration of the frame.
    Disable,
    /// Resume recording on this thread.
    Enable,
    /// Re-check the shadow stack against the real one.
    Recover,
    /// Turn recording on session-wide.
    TraceOn,
    /// Turn recording off session-wide.
    TraceOff,
    /// Read a PMU counter group on entry and exit.
    ReadPmu(PmuGroup),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Filter => write!(f, "filter"),
            Action::Notrace => write!(f, "notrace"),
            Action::Depth(n) => write!(f, "depth={n}"),
            Action::Time(ns) => write!(f, "time={ns}ns"),
            Action::Size(n) => write!(f, "size={n}"),
            Action::Args(args) => {
                let mut first = true;
                for a in args {
                    if !first {
                        write!(f, ",")?;
                    }
                    write!(f, "{a}")?;
                    first = false;
                }
                Ok(())
            }
            Action::Retval(r) => write!(f, "{r}"),
            Action::Finish => write!(f, "finish"),
            Action::Disable => write!(f, "disable"),
            Action::Enable => write!(f, "enable"),
            Action::Recover => write!(f, "recover"),
            Action::TraceOn => write!(f, "trace-on"),
            Action::TraceOff => write!(f, "trace-off"),
            Action::ReadPmu(g) => write!(f, "read={}", g.name()),
        }
    }
}

/// Which option surface a spec string came from; decides the action
/// implied by a bare pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecKind {
    Filter,
    Trigger,
    Argument,
    Retval,
}

/// One compiled spec token: a pattern plus its actions.
#[derive(Debug, Clone)]
pub struct FilterItem {
    pub pattern: Pattern,
    pub actions: Vec<Action>,
}

impl fmt::Display for FilterItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.actions == [Action::Notrace] {
            return write!(f, "!{}", self.pattern.raw());
        }
        if self.actions == [Action::Filter] {
            return write!(f, "{}", self.pattern.raw());
        }
        write!(f, "{}@", self.pattern.raw())?;
        let mut first = true;
        for a in &self.actions {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{a}")?;
            first = false;
        }
        Ok(())
    }
}

fn parse_duration_spec(s: &str, spec: &str) -> Result<u64, FormatError> {
    if let Ok(ns) = s.parse::<u64>() {
        return Ok(ns);
    }
    humantime::parse_duration(s)
        .map(|d: Duration| d.as_nanos() as u64)
        .map_err(|_| FormatError::BadSpec {
            spec: spec.to_string(),
            reason: format!("bad time value `{s}`"),
        })
}

/// Parse a standalone size value with an optional k/m/g suffix.
pub fn parse_size_value(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    parse_size_spec(s, s).ok()
}

fn parse_size_spec(s: &str, spec: &str) -> Result<u64, FormatError> {
    let bad = || FormatError::BadSpec {
        spec: spec.to_string(),
        reason: format!("bad size value `{s}`"),
    };
    let (digits, mult) = match s.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&s[..s.len() - 1], 1u64 << 10),
        Some(b'm') | Some(b'M') => (&s[..s.len() - 1], 1 << 20),
        Some(b'g') | Some(b'G') => (&s[..s.len() - 1], 1 << 30),
        _ => (s, 1),
    };
    digits.parse::<u64>().map(|n| n * mult).map_err(|_| bad())
}

fn parse_actions(list: &str, spec: &str) -> Result<Vec<Action>, FormatError> {
    let bad = |reason: String| FormatError::BadSpec {
        spec: spec.to_string(),
        reason,
    };
    let mut actions = Vec::new();
    let mut args = Vec::new();
    for tok in list.split(',').filter(|t| !t.is_empty()) {
        // `>=` is accepted as a synonym for `=` in comparisons.
        let (key, value) = match tok.split_once(">=").or_else(|| tok.split_once('=')) {
            Some((k, v)) => (k, Some(v)),
            None => (tok, None),
        };
        match (key, value) {
            ("depth", Some(v)) => {
                let n: u16 = v.parse().map_err(|_| bad(format!("bad depth `{v}`")))?;
                actions.push(Action::Depth(n));
            }
            ("time", Some(v)) => actions.push(Action::Time(parse_duration_spec(v, spec)?)),
            ("size", Some(v)) => actions.push(Action::Size(parse_size_spec(v, spec)?)),
            ("read", Some(v)) => {
                let group = match v {
                    "cycle" | "pmu-cycle" => PmuGroup::Cycle,
                    "cache" | "pmu-cache" => PmuGroup::Cache,
                    "branch" | "pmu-branch" => PmuGroup::Branch,
                    other => return Err(bad(format!("unknown pmu group `{other}`"))),
                };
                actions.push(Action::ReadPmu(group));
            }
            ("filter", None) => actions.push(Action::Filter),
            ("notrace", None) => actions.push(Action::Notrace),
            ("finish", None) => actions.push(Action::Finish),
            ("disable", None) => actions.push(Action::Disable),
            ("enable", None) => actions.push(Action::Enable),
            ("recover", None) => actions.push(Action::Recover),
            ("traceon", None) | ("trace-on", None) => actions.push(Action::TraceOn),
            ("traceoff", None) | ("trace-off", None) => actions.push(Action::TraceOff),
            _ if key.starts_with("arg") || key.starts_with("fparg") || key.starts_with("retval") => {
                let a = ArgSpec::parse(tok, spec)?;
                if a.index == 0 {
                    actions.push(Action::Retval(a));
                } else {
                    args.push(a);
                }
            }
            _ => return Err(bad(format!("unknown action `{tok}`"))),
        }
    }
    if !args.is_empty() {
        actions.push(Action::Args(args));
    }
    Ok(actions)
}

/// Parse one `;`-separated spec string.
pub fn parse_spec_list(
    input: &str,
    kind: SpecKind,
    ptype: PatternType,
) -> Result<Vec<FilterItem>, FormatError> {
    let mut items = Vec::new();
    for token in input.split(';').map(str::trim).filter(|t| !t.is_empty()) {
        let (negated, token) = match token.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, token),
        };
        let (pattern_str, action_str) = match token.split_once('@') {
            Some((p, a)) => (p, Some(a)),
            None => (token, None),
        };
        if pattern_str.is_empty() {
            return Err(FormatError::BadSpec {
                spec: token.to_string(),
                reason: "empty pattern".to_string(),
            });
        }
        let pattern = Pattern::new(pattern_str, ptype)?;

        let mut actions = match action_str {
            Some(list) => parse_actions(list, token)?,
            None => Vec::new(),
        };
        if negated {
            actions.retain(|a| *a != Action::Filter);
            actions.insert(0, Action::Notrace);
        } else if actions.is_empty() {
            // A bare token takes its meaning from the option surface.
            match kind {
                SpecKind::Filter | SpecKind::Trigger => actions.push(Action::Filter),
                SpecKind::Argument => {
                    return Err(FormatError::BadSpec {
                        spec: token.to_string(),
                        reason: "argument spec needs an argN list".to_string(),
                    })
                }
                SpecKind::Retval => actions.push(Action::Retval(ArgSpec::retval())),
            }
        }
        items.push(FilterItem { pattern, actions });
    }
    Ok(items)
}

/// One `provider:event` pattern from the event option.
#[derive(Debug, Clone)]
pub struct EventSpec {
    pub provider: Pattern,
    pub event: Pattern,
}

/// Parse the event spec string. Entries carrying an `@kernel` suffix are
/// silently skipped; kernel events are handled elsewhere.
pub fn parse_event_specs(input: &str) -> Result<Vec<EventSpec>, FormatError> {
    let mut specs = Vec::new();
    for token in input.split(';').map(str::trim).filter(|t| !t.is_empty()) {
        let Some((provider, event)) = token.split_once(':') else {
            return Err(FormatError::BadSpec {
                spec: token.to_string(),
                reason: "event spec must be provider:event".to_string(),
            });
        };
        if event.contains("@kernel") {
            continue;
        }
        specs.push(EventSpec {
            provider: Pattern::new(provider, PatternType::Glob)?,
            event: Pattern::new(event, PatternType::Glob)?,
        });
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(s: &str, kind: SpecKind) -> FilterItem {
        parse_spec_list(s, kind, PatternType::Regex)
            .unwrap()
            .remove(0)
    }

    #[test]
    fn bare_filter_pattern() {
        let item = parse_one("foo", SpecKind::Filter);
        assert!(item.pattern.matches("foo"));
        assert!(!item.pattern.matches("foobar"));
        assert_eq!(item.actions, vec![Action::Filter]);
    }

    #[test]
    fn negated_pattern() {
        let item = parse_one("!bar", SpecKind::Filter);
        assert_eq!(item.actions, vec![Action::Notrace]);
    }

    #[test]
    fn trigger_with_actions() {
        let item = parse_one("main@depth=3,time=10us,finish", SpecKind::Trigger);
        assert_eq!(
            item.actions,
            vec![
                Action::Depth(3),
                Action::Time(10_000),
                Action::Finish,
            ]
        );
    }

    #[test]
    fn time_comparison_synonym() {
        let item = parse_one("g@time>=1ms", SpecKind::Trigger);
        assert_eq!(item.actions, vec![Action::Time(1_000_000)]);
    }

    #[test]
    fn argument_spec() {
        let item = parse_one("baz@arg1/i32,arg2/s", SpecKind::Argument);
        let Action::Args(args) = &item.actions[0] else {
            panic!("expected args action");
        };
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].index, 1);
        assert_eq!(args[0].format, ArgFormat::Int);
        assert_eq!(args[0].size, 4);
        assert_eq!(args[1].format, ArgFormat::Str);
    }

    #[test]
    fn retval_spec() {
        let item = parse_one("calc", SpecKind::Retval);
        assert_eq!(item.actions, vec![Action::Retval(ArgSpec::retval())]);

        let item = parse_one("calc@retval/x32", SpecKind::Retval);
        let Action::Retval(r) = &item.actions[0] else {
            panic!()
        };
        assert_eq!(r.format, ArgFormat::Hex);
        assert_eq!(r.size, 4);
    }

    #[test]
    fn glob_patterns() {
        let items = parse_spec_list("str_*", SpecKind::Filter, PatternType::Glob).unwrap();
        assert!(items[0].pattern.matches("str_copy"));
        assert!(!items[0].pattern.matches("my_str_copy"));
    }

    #[test]
    fn regex_falls_back_to_literal() {
        let items = parse_spec_list("a+b", SpecKind::Filter, PatternType::Regex).unwrap();
        // `+` makes it a real regex.
        assert!(items[0].pattern.matches("aab"));
        let items = parse_spec_list("plain_name", SpecKind::Filter, PatternType::Regex).unwrap();
        assert!(items[0].pattern.matches("plain_name"));
        assert!(!items[0].pattern.matches("Xplain_nameX"));
    }

    #[test]
    fn multiple_tokens() {
        let items =
            parse_spec_list("foo;!bar;baz@depth=2", SpecKind::Filter, PatternType::Regex).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].actions, vec![Action::Notrace]);
        assert_eq!(items[2].actions, vec![Action::Depth(2)]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_spec_list("foo@bogus=1", SpecKind::Trigger, PatternType::Regex).is_err());
        assert!(parse_spec_list("@depth=1", SpecKind::Trigger, PatternType::Regex).is_err());
        assert!(parse_spec_list("foo@arg0", SpecKind::Argument, PatternType::Regex).is_err());
    }

    #[test]
    fn display_round_trip() {
        for spec in [
            "foo",
            "!bar",
            "main@depth=3,finish",
            "g@time=1000000ns",
            "baz@arg1/i32,arg2/s64",
            "calc@retval/x32",
            "work@read=pmu-cycle",
        ] {
            let items = parse_spec_list(spec, SpecKind::Trigger, PatternType::Regex).unwrap();
            let printed = items
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(";");
            let reparsed = parse_spec_list(&printed, SpecKind::Trigger, PatternType::Regex).unwrap();
            assert_eq!(items.len(), reparsed.len());
            for (a, b) in items.iter().zip(&reparsed) {
                assert_eq!(a.pattern.raw(), b.pattern.raw());
                assert_eq!(a.actions, b.actions);
            }
        }
    }

    #[test]
    fn event_specs() {
        let specs = parse_event_specs("libfoo:init;*:cleanup;bad").err();
        assert!(specs.is_some());
        let specs = parse_event_specs("libfoo:init;*:cleanup").unwrap();
        assert_eq!(specs.len(), 2);
        assert!(specs[0].provider.matches("libfoo"));
        assert!(specs[1].provider.matches("anything"));
        assert!(specs[1].event.matches("cleanup"));
        // Kernel-side events are not ours to arm.
        let specs = parse_event_specs("sched:sched_switch@kernel").unwrap();
        assert!(specs.is_empty());
    }
}
