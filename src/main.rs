use anyhow::{anyhow, Context, Result};

use log::{debug, error, warn};
use pidfilelock::{
    config::{configure, Command, MkdirOpt, Opt, RunOpt, StatusOpt},
    inspect, mklockdir, PidLock,
};

use std::convert::TryFrom;
use std::os::unix::process::ExitStatusExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

fn main() {
    match configure_and_try_main() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:?}", err);
            std::process::exit(1);
        }
    }
}

fn configure_and_try_main() -> Result<i32> {
    try_main(configure()?)
}

fn try_main(opt: Opt) -> Result<i32> {
    match opt.command {
        Command::Run(run) => run_locked(&run),
        Command::Status(status) => print_status(&status),
        Command::Mkdir(mkdir) => make_dir(&mkdir),
    }
}

fn run_locked(opt: &RunOpt) -> Result<i32> {
    let (program, args) = opt
        .command
        .split_first()
        .ok_or_else(|| anyhow!("No command given"))?;

    // Dropping the handle on any way out releases the lock, and removes the
    // file unless --keep is given.
    let mut handle = PidLock::new(&opt.pid_file)
        .with_options(opt.lock_options())
        .acquire()
        .with_context(|| {
            format!(
                "Cannot lock using lockfile {:?} (tip: use --wait or --timeout to wait for it)",
                opt.pid_file
            )
        })?;

    // On SIGINT or SIGTERM the command is asked to stop. We keep holding the
    // lock until it has exited, so no second instance starts alongside it.
    let child_pid = Arc::new(AtomicU32::new(0));
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let child_pid = child_pid.clone();
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
            match child_pid.load(Ordering::SeqCst) {
                0 => warn!("Signal caught, not starting the command"),
                pid => {
                    warn!("Signal caught, stopping PID {}", pid);
                    terminate(pid);
                }
            }
        })
        .context("Error setting signal handler")?;
    }

    if interrupted.load(Ordering::SeqCst) {
        return Ok(1);
    }

    debug!("Running {:?} holding {:?}", opt.command, opt.pid_file);
    let mut child = std::process::Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("Cannot run {:?}", program))?;
    child_pid.store(child.id(), Ordering::SeqCst);
    // The signal arrived while we were starting the command.
    if interrupted.load(Ordering::SeqCst) {
        terminate(child.id());
    }

    let status = child.wait().with_context(|| format!("Cannot wait for {:?}", program))?;
    debug!("{:?} exited: {}", program, status);

    handle
        .release(!opt.keep)
        .with_context(|| format!("Cannot release lockfile {:?}", opt.pid_file))?;

    Ok(status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1))
}

fn terminate(pid: u32) {
    if let Ok(pid) = libc::pid_t::try_from(pid) {
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            error!("Cannot stop PID {}: {}", pid, std::io::Error::last_os_error());
        }
    }
}

fn print_status(opt: &StatusOpt) -> Result<i32> {
    let status = inspect(&opt.pid_file).with_context(|| format!("Cannot inspect lockfile {:?}", opt.pid_file))?;
    if opt.json {
        println!("{}", serde_json::to_string(&status)?);
    } else {
        println!("{}", status);
    }
    Ok(0)
}

fn make_dir(opt: &MkdirOpt) -> Result<i32> {
    mklockdir(&opt.path, &opt.dir_options())
        .with_context(|| format!("Cannot create lock directory {:?}", opt.path))?;
    Ok(0)
}
