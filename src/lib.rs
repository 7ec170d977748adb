#[macro_use]
extern crate log;

pub mod config;
pub mod dir;
pub mod error;
pub mod lock;
pub mod probe;
pub mod store;
pub mod util;

pub use crate::dir::{mklockdir, DirOptions};
pub use crate::error::LockError;
pub use crate::lock::{
    inspect, opportunistic, read_pid, AcquireMode, LockOptions, LockState, LockStatus, Opportunistic, PidLock,
    PidLockHandle,
};
pub use crate::probe::{LivenessProbe, ProcessTableProbe};
