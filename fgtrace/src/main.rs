mod cli;
mod data;
mod dump;
mod error;
mod info;
mod recorder;
mod replay;
mod report;

use clap::Parser;
use cli::{Action, DataArgs, LiveArgs, Opt, RecordArgs, ReplayArgs};
use error::TraceError;

fn main() {
    env_logger::init();

    let opt = parse_with_default_opts();
    let result = match opt.action {
        Action::Record(args) => recorder::record(&args),
        Action::Replay(args) => replay::replay(&args).map(|()| 0),
        Action::Live(args) => run_live(args),
        Action::Report(args) => report::report(&args).map(|()| 0),
        Action::Info(args) => info::show_info(&args.dir).map(|()| 0),
        Action::Dump(args) => dump::dump(&args).map(|()| 0),
        Action::Recv(_) => Err(TraceError::Unsupported("recv")),
        Action::Graph(_) => Err(TraceError::Unsupported("graph")),
        Action::Script(_) => Err(TraceError::Unsupported("script")),
        Action::Tui(_) => Err(TraceError::Unsupported("tui")),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("fgtrace: {err}");
            std::process::exit(1);
        }
    }
}

/// Record into a scratch directory and replay it right away.
fn run_live(args: LiveArgs) -> Result<i32, TraceError> {
    let scratch = tempfile::Builder::new().prefix("fgtrace-live-").tempdir()?;
    let dir = scratch.path().join("fgtrace.data");
    let record_args = RecordArgs {
        dir: dir.clone(),
        trace: args.trace,
        keep_pid: false,
        rt_prio: None,
        libmcount: args.libmcount,
        command: args.command,
    };
    let outcome = recorder::record_into(&record_args, &dir)?;

    let replay_args = ReplayArgs {
        data: DataArgs { dir },
        tid: Vec::new(),
        time_filter: None,
        depth: None,
    };
    match replay::replay(&replay_args) {
        Ok(()) => {}
        Err(TraceError::EmptyTrace(_)) => {
            eprintln!("fgtrace: no trace data; is the target instrumented?");
        }
        Err(err) => return Err(err),
    }
    Ok(outcome.exit_status.unwrap_or(0))
}

/// Re-parse the command line with the trace directory's `default.opts`
/// injected after the subcommand, so recorded defaults apply to the
/// analysis commands while explicit options still win.
fn parse_with_default_opts() -> Opt {
    let opt = Opt::parse();
    let Action::Replay(replay_args) = &opt.action else {
        return opt;
    };
    let path = replay_args.data.dir.join("default.opts");
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return opt;
    };
    let Some(tokens) = shlex::split(contents.trim()) else {
        return opt;
    };
    if tokens.is_empty() {
        return opt;
    }

    let argv: Vec<String> = std::env::args().collect();
    if argv.len() < 2 {
        return opt;
    }
    let mut merged = vec![argv[0].clone(), argv[1].clone()];
    merged.extend(tokens);
    merged.extend(argv[2..].iter().cloned());
    match Opt::try_parse_from(&merged) {
        Ok(merged_opt) => merged_opt,
        Err(err) => {
            log::warn!("ignoring {}: {err}", path.display());
            opt
        }
    }
}
