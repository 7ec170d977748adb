//! Process liveness checks.
//!
//! A PID found in a lock file is only a hint. Checking it against the
//! process table cannot tell a recycled PID from the original holder, so a
//! dead holder whose PID was reused by an unrelated process looks alive.
//! The kernel lock remains authoritative either way.

use std::convert::TryFrom;
use std::io;

pub trait LivenessProbe: Send + Sync {
    /// Does `pid` currently refer to a running process?
    fn is_alive(&self, pid: u32) -> bool;
}

impl<F> LivenessProbe for F
where
    F: Fn(u32) -> bool + Send + Sync,
{
    fn is_alive(&self, pid: u32) -> bool {
        self(pid)
    }
}

/// Probes the process table by sending signal 0, which performs the
/// existence and permission checks of `kill(2)` without delivering anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessTableProbe;

impl LivenessProbe for ProcessTableProbe {
    fn is_alive(&self, pid: u32) -> bool {
        // 0 and negative values address process groups, not a process.
        let pid = match libc::pid_t::try_from(pid) {
            Ok(pid) if pid > 0 => pid,
            _ => return false,
        };

        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }

        match io::Error::last_os_error().raw_os_error() {
            // Exists, but belongs to another user.
            Some(libc::EPERM) => true,
            _ => false,
        }
    }
}
