use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "fgtrace",
    version,
    about = r#"
fgtrace traces function calls of unmodified binaries on Linux.

EXAMPLES:
    # Record a trace and print it:
    fgtrace live ./yourcommand yourargs

    # Record into a directory for later analysis:
    fgtrace record -d mytrace.data -- ./yourcommand yourargs
    fgtrace replay -d mytrace.data

    # Show hot functions:
    fgtrace report -d mytrace.data
"#
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Record a trace of the given command.
    Record(RecordArgs),

    /// Print a recorded trace as a call graph.
    Replay(ReplayArgs),

    /// Record and immediately replay.
    Live(LiveArgs),

    /// Summarize function runtimes.
    Report(ReportArgs),

    /// Show information about a recorded trace.
    Info(DataArgs),

    /// Print raw records.
    Dump(DumpArgs),

    /// Receive traces over the network (not built into this binary).
    Recv(RecvArgs),

    /// Render a call graph (not built into this binary).
    Graph(DataArgs),

    /// Run a script over a trace (not built into this binary).
    Script(ScriptArgs),

    /// Interactive trace browser (not built into this binary).
    Tui(DataArgs),
}

#[derive(Debug, Args, Clone)]
pub struct TraceOptions {
    /// Only trace functions matching PATTERN. Prefix with ! to exclude.
    #[arg(short = 'F', long = "filter", value_name = "PATTERN")]
    pub filter: Vec<String>,

    /// Set triggers on functions: FUNC@action,action,...
    #[arg(short = 'T', long = "trigger", value_name = "FUNC@ACTIONS")]
    pub trigger: Vec<String>,

    /// Record function arguments: FUNC@argN/fmt,...
    #[arg(short = 'A', long = "argument", value_name = "FUNC@ARGS")]
    pub argument: Vec<String>,

    /// Record return values: FUNC or FUNC@retval/fmt.
    #[arg(short = 'R', long = "retval", value_name = "FUNC")]
    pub retval: Vec<String>,

    /// Enable events: provider:event, glob-matched against SDT probes.
    #[arg(short = 'E', long = "event", value_name = "EVENT")]
    pub event: Vec<String>,

    /// Dynamically patch functions matching PATTERN.
    #[arg(short = 'P', long = "patch", value_name = "PATTERN")]
    pub patch: Vec<String>,

    /// Limit the trace to DEPTH nested calls.
    #[arg(short = 'D', long = "depth", value_name = "DEPTH")]
    pub depth: Option<u16>,

    /// Only record functions running at least this long (e.g. 10us).
    #[arg(short = 't', long = "time-filter", value_name = "TIME")]
    pub time_filter: Option<String>,

    /// Only record functions at least this large (e.g. 4k).
    #[arg(long = "size-filter", value_name = "SIZE")]
    pub size_filter: Option<String>,

    /// Set shadow stack limit (default: 1024).
    #[arg(long = "max-stack", value_name = "DEPTH")]
    pub max_stack: Option<usize>,

    /// Per-thread ring buffer size (default: 128k).
    #[arg(short = 'b', long = "buffer", value_name = "SIZE")]
    pub buffer: Option<String>,

    /// Pattern matching policy: literal, regex or glob.
    #[arg(long = "match", value_name = "TYPE", default_value = "regex")]
    pub match_type: String,

    /// Start with tracing disabled; enable with a trigger or signal.
    #[arg(long = "disable")]
    pub disable: bool,

    /// Do not hook library calls through the PLT.
    #[arg(long = "no-libcall")]
    pub no_libcall: bool,

    /// Trigger an action when a signal arrives: SIG@action.
    #[arg(long = "signal", value_name = "SIG@ACTION")]
    pub signal: Vec<String>,

    /// Debug log filter passed to the traced process.
    #[arg(long = "debug-domain", value_name = "FILTER")]
    pub debug_domain: Option<String>,

    /// Size of the kernel tracing buffer (accepted for compatibility).
    #[arg(long = "kernel-buffer", value_name = "SIZE", hide = true)]
    pub kernel_buffer: Option<String>,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    /// Directory to write the trace into.
    #[arg(short = 'd', long = "data", value_name = "DIR", default_value = "fgtrace.data")]
    pub dir: PathBuf,

    #[command(flatten)]
    pub trace: TraceOptions,

    /// Keep the recorder pid as the target's parent across exec.
    #[arg(long = "keep-pid")]
    pub keep_pid: bool,

    /// Run the recorder with real-time (FIFO) priority.
    #[arg(long = "rt-prio", value_name = "PRIO")]
    pub rt_prio: Option<i32>,

    /// Explicit path to the engine library to preload.
    #[arg(long = "libmcount", value_name = "PATH")]
    pub libmcount: Option<PathBuf>,

    /// The command to trace.
    #[arg(required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args, Clone)]
pub struct DataArgs {
    /// Directory holding the recorded trace.
    #[arg(short = 'd', long = "data", value_name = "DIR", default_value = "fgtrace.data")]
    pub dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Only replay these task ids.
    #[arg(long = "tid", value_name = "TID", value_delimiter = ',')]
    pub tid: Vec<u32>,

    /// Hide records shorter than this duration.
    #[arg(short = 't', long = "time-filter", value_name = "TIME")]
    pub time_filter: Option<String>,

    /// Limit output to DEPTH nested calls.
    #[arg(short = 'D', long = "depth", value_name = "DEPTH")]
    pub depth: Option<u16>,
}

#[derive(Debug, Args)]
pub struct LiveArgs {
    #[command(flatten)]
    pub trace: TraceOptions,

    /// Explicit path to the engine library to preload.
    #[arg(long = "libmcount", value_name = "PATH")]
    pub libmcount: Option<PathBuf>,

    /// The command to trace.
    #[arg(required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Sort by: total, self or call.
    #[arg(short = 's', long = "sort", value_name = "KEY", default_value = "total")]
    pub sort: String,
}

#[derive(Debug, Args)]
pub struct DumpArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Dump records of this task only.
    #[arg(long = "tid", value_name = "TID")]
    pub tid: Option<u32>,
}

#[allow(unused)]
#[derive(Debug, Args)]
pub struct RecvArgs {
    /// Port to listen on.
    #[arg(long = "port", default_value = "8090")]
    pub port: u16,

    #[command(flatten)]
    pub data: DataArgs,
}

#[allow(unused)]
#[derive(Debug, Args)]
pub struct ScriptArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Script file to run.
    #[arg(short = 'S', long = "script", value_name = "FILE")]
    pub script: Option<PathBuf>,
}

impl TraceOptions {
    /// Join repeated options into the `;`-separated spec strings the
    /// engine understands.
    pub fn joined(&self, which: Which) -> String {
        let list = match which {
            Which::Filter => &self.filter,
            Which::Trigger => &self.trigger,
            Which::Argument => &self.argument,
            Which::Retval => &self.retval,
            Which::Event => &self.event,
            Which::Patch => &self.patch,
            Which::Signal => &self.signal,
        };
        list.join(";")
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Which {
    Filter,
    Trigger,
    Argument,
    Retval,
    Event,
    Patch,
    Signal,
}
