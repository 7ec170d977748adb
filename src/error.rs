//! The closed set of errors reported by the lock file operations.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    /// The directory or the lock file is not writable by us.
    #[error("permission denied for lock file {path:?}")]
    PermissionDenied { path: PathBuf },

    /// Some live process holds the lock.
    #[error("lock file {path:?} is held by {}", Holder(.pid))]
    AlreadyLocked { path: PathBuf, pid: Option<u32> },

    #[error("I/O error on lock file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The lock file does not contain a single decimal PID.
    #[error("lock file {path:?} has invalid content {content:?}")]
    InvalidContent { path: PathBuf, content: String },

    #[error("timed out after {waited:?} waiting for lock file {path:?}")]
    Timeout { path: PathBuf, waited: Duration },
}

pub type Result<T> = std::result::Result<T, LockError>;

impl LockError {
    /// Translate an OS error into the taxonomy. Only the store layer calls this.
    pub(crate) fn from_io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::PermissionDenied => LockError::PermissionDenied { path },
            _ => LockError::Io { path, source: err },
        }
    }

    pub fn is_already_locked(&self) -> bool {
        matches!(self, LockError::AlreadyLocked { .. })
    }

    /// The holder PID, if this error reports a held lock with known content.
    pub fn holder(&self) -> Option<u32> {
        match self {
            LockError::AlreadyLocked { pid, .. } => *pid,
            _ => None,
        }
    }
}

struct Holder<'a>(&'a Option<u32>);

impl fmt::Display for Holder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            Some(pid) => write!(f, "process {}", pid),
            None => write!(f, "an unidentified process"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_errors_are_classified() {
        let err = LockError::from_io("/x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, LockError::PermissionDenied { .. }));

        let err = LockError::from_io("/x", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, LockError::Io { .. }));
    }

    #[test]
    fn already_locked_names_the_holder() {
        let err = LockError::AlreadyLocked { path: "/run/x.pid".into(), pid: Some(42) };
        assert!(err.to_string().contains("process 42"));
        assert_eq!(err.holder(), Some(42));

        let err = LockError::AlreadyLocked { path: "/run/x.pid".into(), pid: None };
        assert!(err.to_string().contains("unidentified"));
        assert!(err.is_already_locked());
    }
}
