use crate::dir::DirOptions;
use crate::lock::{AcquireMode, LockOptions};
use crate::util::{parse_mode, parse_seconds, resolve_group, resolve_user};

use anyhow::Result;
use log::LevelFilter;
use structopt::clap::crate_version;
use structopt::StructOpt;

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Lock files are readable by everyone and writable by the owning user and
/// group, so that group members can take over a lock left behind.
pub const DEFAULT_LOCK_MODE: u32 = 0o664;
const DEFAULT_LOCK_MODE_STR: &str = "664";

pub const DEFAULT_DIR_MODE: u32 = 0o775;
const DEFAULT_DIR_MODE_STR: &str = "775";

/// Initial delay between attempts while waiting for a held lock.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shorter poll intervals are raised to this, a zero interval would spin.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Upper bound for the backoff while blocking on a held lock.
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, StructOpt)]
#[structopt(
    about = "Hold a PID lock file to keep a program from running more than once.",
    long_version = crate_version!(),
)]
pub struct Opt {
    // The number of occurrences of the `v/verbose` flag
    /// Verbose mode (-v, -vv, -vvv, etc.)
    #[structopt(
        short = "v",
        long = "verbose",
        parse(from_occurrences),
        conflicts_with = "quiet",
        global = true
    )]
    pub verbose: u8,

    /// Quiet mode (no warnings or informative messages, only errors)
    #[structopt(short = "q", long = "quiet", conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Run a command while holding the lock
    Run(RunOpt),

    /// Report whether the lock is held and by which process
    Status(StatusOpt),

    /// Create a directory for lock files shared by several users
    Mkdir(MkdirOpt),
}

#[derive(Debug, StructOpt)]
pub struct RunOpt {
    /// Wait for the lock to become free instead of failing
    #[structopt(short = "w", long = "wait", conflicts_with = "timeout")]
    pub wait: bool,

    /// Wait at most this long for the lock to become free
    #[structopt(short = "t", long = "timeout", value_name = "seconds", parse(try_from_str = parse_seconds))]
    pub timeout: Option<Duration>,

    /// Permission bits (octal) for a newly created lock file
    #[structopt(long = "mode", default_value = DEFAULT_LOCK_MODE_STR, parse(try_from_str = parse_mode))]
    pub mode: u32,

    /// Group (name or id) to give the lock file
    #[structopt(long = "group", value_name = "group", parse(try_from_str = resolve_group))]
    pub group: Option<u32>,

    /// Leave the lock file in place when the command finishes
    #[structopt(long = "keep")]
    pub keep: bool,

    /// The lock file
    #[structopt(parse(from_os_str))]
    pub pid_file: PathBuf,

    /// The command to run, after `--`
    #[structopt(name = "COMMAND", required = true, last = true, parse(from_os_str))]
    pub command: Vec<OsString>,
}

impl RunOpt {
    pub fn lock_options(&self) -> LockOptions {
        let mode = match (self.wait, self.timeout) {
            (_, Some(timeout)) => AcquireMode::Timeout(timeout),
            (true, None) => AcquireMode::Blocking,
            (false, None) => AcquireMode::NonBlocking,
        };

        LockOptions::default()
            .with_mode(mode)
            .with_create_mode(self.mode)
            .with_group(self.group)
            .with_unlink_on_drop(!self.keep)
    }
}

#[derive(Debug, StructOpt)]
pub struct StatusOpt {
    /// Print the status as JSON
    #[structopt(long = "json")]
    pub json: bool,

    /// The lock file
    #[structopt(parse(from_os_str))]
    pub pid_file: PathBuf,
}

#[derive(Debug, StructOpt)]
pub struct MkdirOpt {
    /// Permission bits (octal) for the new directory
    #[structopt(long = "mode", default_value = DEFAULT_DIR_MODE_STR, parse(try_from_str = parse_mode))]
    pub mode: u32,

    /// User (name or id) to give the directory
    #[structopt(long = "uid", value_name = "user", parse(try_from_str = resolve_user))]
    pub uid: Option<u32>,

    /// Group (name or id) to give the directory
    #[structopt(long = "gid", value_name = "group", parse(try_from_str = resolve_group))]
    pub gid: Option<u32>,

    /// Create missing parent directories as well
    #[structopt(short = "p", long = "parents")]
    pub parents: bool,

    /// The directory to create
    #[structopt(parse(from_os_str))]
    pub path: PathBuf,
}

impl MkdirOpt {
    pub fn dir_options(&self) -> DirOptions {
        DirOptions {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            parents: self.parents,
            exist_ok: true,
        }
    }
}

fn log_without_target(
    out: fern::FormatCallback,
    message: &std::fmt::Arguments,
    record: &log::Record,
) {
    out.finish(format_args!(
        "{} {}: {}",
        chrono::Local::now().format("%Y/%m/%d %H:%M:%S"),
        record.level(),
        message,
    ))
}

fn log_with_target(out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record) {
    out.finish(format_args!(
        "{} {} [{}] {}",
        chrono::Local::now().format("%Y/%m/%d %H:%M:%S"),
        record.level(),
        record.target(),
        message,
    ))
}

fn log_levels(opt: &Opt) -> (LevelFilter, LevelFilter) {
    if opt.quiet {
        (LevelFilter::Error, LevelFilter::Error)
    } else {
        match opt.verbose {
            0 => (LevelFilter::Warn, LevelFilter::Warn),
            1 => (LevelFilter::Info, LevelFilter::Warn),
            2 => (LevelFilter::Debug, LevelFilter::Warn),
            3 => (LevelFilter::Trace, LevelFilter::Warn),
            4 => (LevelFilter::Trace, LevelFilter::Info),
            5 => (LevelFilter::Trace, LevelFilter::Debug),
            _ => (LevelFilter::Trace, LevelFilter::Trace),
        }
    }
}

/// Parse the command line and set up logging. Log output goes to stderr,
/// stdout belongs to `status` and to the command we run.
pub fn configure() -> Result<Opt> {
    let opt = Opt::from_args();

    let (own_log_level, other_log_level) = log_levels(&opt);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            if own_log_level <= LevelFilter::Debug {
                log_without_target(out, message, record)
            } else {
                log_with_target(out, message, record)
            }
        })
        .level(other_log_level)
        .level_for("pidfilelock", own_log_level)
        .chain(std::io::stderr())
        .apply()?;

    Ok(opt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Opt {
        Opt::from_iter_safe(std::iter::once("pidfilelock").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn run_with_timeout() {
        let opt = parse(&["-vv", "run", "--timeout", "1.5", "/run/x.pid", "--", "sleep", "1"]);
        assert_eq!(log_levels(&opt), (LevelFilter::Debug, LevelFilter::Warn));

        match opt.command {
            Command::Run(run) => {
                let options = run.lock_options();
                assert_eq!(options.mode, AcquireMode::Timeout(Duration::from_millis(1500)));
                assert_eq!(options.create_mode, DEFAULT_LOCK_MODE);
                assert_eq!(run.pid_file, PathBuf::from("/run/x.pid"));
                assert_eq!(run.command, vec![OsString::from("sleep"), OsString::from("1")]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn run_defaults_to_non_blocking() {
        match parse(&["run", "--mode", "0o660", "--group", "50", "x.pid", "--", "true"]).command {
            Command::Run(run) => {
                let options = run.lock_options();
                assert_eq!(options.mode, AcquireMode::NonBlocking);
                assert_eq!(options.create_mode, 0o660);
                assert_eq!(options.group, Some(50));
                assert!(options.unlink_on_drop);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn names_are_resolved() {
        match parse(&["run", "--group", "root", "--keep", "x.pid", "--", "true"]).command {
            Command::Run(run) => {
                let options = run.lock_options();
                assert_eq!(options.group, Some(0));
                assert!(!options.unlink_on_drop);
            }
            other => panic!("unexpected command {:?}", other),
        }
        match parse(&["mkdir", "--uid", "root", "--gid", "root", "/run/locks"]).command {
            Command::Mkdir(mkdir) => {
                assert_eq!(mkdir.uid, Some(0));
                assert_eq!(mkdir.gid, Some(0));
            }
            other => panic!("unexpected command {:?}", other),
        }

        let args = ["pidfilelock", "run", "--group", "no-such-group-pidfilelock", "x.pid", "--", "true"];
        assert!(Opt::from_iter_safe(args.iter()).is_err());
    }

    #[test]
    fn run_needs_a_command() {
        let args = ["pidfilelock", "run", "x.pid"];
        assert!(Opt::from_iter_safe(args.iter()).is_err());
    }

    #[test]
    fn wait_conflicts_with_timeout() {
        let args = ["pidfilelock", "run", "--wait", "--timeout", "1", "x.pid", "--", "true"];
        assert!(Opt::from_iter_safe(args.iter()).is_err());
    }

    #[test]
    fn mkdir_options() {
        match parse(&["mkdir", "-p", "--gid", "20", "/run/locks"]).command {
            Command::Mkdir(mkdir) => {
                let options = mkdir.dir_options();
                assert_eq!(options.mode, DEFAULT_DIR_MODE);
                assert_eq!(options.gid, Some(20));
                assert!(options.parents);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn quiet_only_logs_errors() {
        let opt = parse(&["-q", "status", "x.pid"]);
        assert_eq!(log_levels(&opt), (LevelFilter::Error, LevelFilter::Error));
    }
}
