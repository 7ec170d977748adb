//! Preparing a directory that lock files of several users can share.

use crate::config::DEFAULT_DIR_MODE;
use crate::error::{LockError, Result};

use std::fs::{DirBuilder, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::Path;

const STICKY_BIT: u32 = 0o1000;

#[derive(Clone, Debug)]
pub struct DirOptions {
    pub mode: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Also create missing parent directories.
    pub parents: bool,
    /// Succeed if the directory already exists.
    pub exist_ok: bool,
}

impl Default for DirOptions {
    fn default() -> Self {
        DirOptions { mode: DEFAULT_DIR_MODE, uid: None, gid: None, parents: false, exist_ok: true }
    }
}

/// Create a directory to keep lock files in.
///
/// Anyone who should be able to take a lock needs write access here. The
/// mode is applied to a newly created directory regardless of the umask.
/// With the sticky bit set, users cannot replace lock files left behind by
/// other users, which is logged as a warning.
pub fn mklockdir(path: impl AsRef<Path>, options: &DirOptions) -> Result<()> {
    let path = path.as_ref();

    if path.is_dir() {
        if !options.exist_ok {
            return Err(LockError::from_io(path, io::Error::from(io::ErrorKind::AlreadyExists)));
        }
    } else {
        match DirBuilder::new().recursive(options.parents).mode(options.mode).create(path) {
            Ok(()) => {
                debug!("Created lock directory {:?}", path);
                std::fs::set_permissions(path, Permissions::from_mode(options.mode))
                    .map_err(|err| LockError::from_io(path, err))?;
            }
            // Someone else was quicker.
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && options.exist_ok && path.is_dir() => {}
            Err(err) => return Err(LockError::from_io(path, err)),
        }
    }

    if options.uid.is_some() || options.gid.is_some() {
        std::os::unix::fs::chown(path, options.uid, options.gid)
            .map_err(|err| LockError::from_io(path, err))?;
    }

    let meta = std::fs::metadata(path).map_err(|err| LockError::from_io(path, err))?;
    if meta.mode() & STICKY_BIT != 0 {
        warn!(
            "Lock directory {:?} has the sticky bit set, lock files of other users cannot be replaced",
            path
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_with_dir;

    #[test]
    fn mode_is_applied_despite_umask() {
        test_with_dir("dir_mode_is_applied_despite_umask", |dir| {
            let path = dir.join("locks");
            mklockdir(&path, &DirOptions { mode: 0o775, ..Default::default() }).unwrap();
            assert_eq!(std::fs::metadata(&path).unwrap().mode() & 0o7777, 0o775);
        })
    }

    #[test]
    fn existing_directory() {
        test_with_dir("dir_existing_directory", |dir| {
            let path = dir.join("locks");
            mklockdir(&path, &DirOptions::default()).unwrap();
            mklockdir(&path, &DirOptions::default()).unwrap();

            let strict = DirOptions { exist_ok: false, ..Default::default() };
            assert!(matches!(mklockdir(&path, &strict), Err(LockError::Io { .. })));
        })
    }

    #[test]
    fn parents_are_optional() {
        test_with_dir("dir_parents_are_optional", |dir| {
            let path = dir.join("run").join("locks");
            assert!(mklockdir(&path, &DirOptions::default()).is_err());

            mklockdir(&path, &DirOptions { parents: true, ..Default::default() }).unwrap();
            assert!(path.is_dir());
        })
    }

    #[test]
    fn lock_can_be_taken_in_created_directory() {
        test_with_dir("dir_lock_can_be_taken_in_created_directory", |dir| {
            let path = dir.join("locks");
            let gid = unsafe { libc::getegid() };
            mklockdir(&path, &DirOptions { gid: Some(gid), ..Default::default() }).unwrap();
            assert_eq!(std::fs::metadata(&path).unwrap().gid(), gid);

            let handle = crate::lock::PidLock::new(path.join("daemon.pid")).acquire().unwrap();
            assert!(handle.is_acquired());
        })
    }
}
