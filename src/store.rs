//! Low level access to the lock file on disk.
//!
//! Every OS error is translated into [`LockError`] here, the protocol in
//! `lock.rs` never handles a raw `io::Error`.

use crate::error::{LockError, Result};

use fs2::FileExt;

use std::fs::{File, OpenOptions, Permissions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// An open lock file. Owns the descriptor the advisory lock is attached to.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: Option<File>,
    writable: bool,
}

impl LockFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// False when the file belongs to someone else and could only be opened
    /// for reading.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| LockError::Io {
            path: self.path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "lock file handle is closed"),
        })
    }

    fn io_err(&self, err: io::Error) -> LockError {
        LockError::from_io(&self.path, err)
    }
}

/// Open the lock file for writing, creating it with `mode` if it is absent.
///
/// An existing file we may not write to is opened read-only instead: taking
/// the advisory lock does not need write access, and the lock holder
/// replaces such a file with its own.
pub fn open_or_create(path: &Path, mode: u32) -> Result<LockFile> {
    let res = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(mode)
        .open(path);

    match res {
        Ok(file) => Ok(LockFile { path: path.to_path_buf(), file: Some(file), writable: true }),
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => match File::open(path) {
            Ok(file) => {
                debug!("Lock file {:?} is not writable by us, opened read-only", path);
                Ok(LockFile { path: path.to_path_buf(), file: Some(file), writable: false })
            }
            // Nothing to open, so it was the directory that refused the create.
            Err(_) => Err(LockError::from_io(path, err)),
        },
        Err(err) => Err(LockError::from_io(path, err)),
    }
}

/// Open an existing lock file for reading, `None` if there is no such file.
pub fn open_read_only(path: &Path) -> Result<Option<LockFile>> {
    match File::open(path) {
        Ok(file) => Ok(Some(LockFile { path: path.to_path_buf(), file: Some(file), writable: false })),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(LockError::from_io(path, err)),
    }
}

/// Try to take the exclusive advisory lock without blocking. Returns false
/// if another open file description holds it.
pub fn try_lock_exclusive(lock_file: &LockFile) -> Result<bool> {
    match FileExt::try_lock_exclusive(lock_file.file()?) {
        Ok(()) => Ok(true),
        Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(false),
        Err(err) => Err(lock_file.io_err(err)),
    }
}

/// Read the raw content. The lock does not need to be held for this.
pub fn read_content(lock_file: &LockFile) -> Result<Vec<u8>> {
    let mut file = lock_file.file()?;
    let mut buf = Vec::new();
    file.seek(SeekFrom::Start(0)).map_err(|err| lock_file.io_err(err))?;
    file.read_to_end(&mut buf).map_err(|err| lock_file.io_err(err))?;
    Ok(buf)
}

/// Replace the content with `pid` and a newline, flushed to disk. Callers
/// must hold the exclusive lock on `lock_file`.
pub fn write_content(lock_file: &LockFile, pid: u32) -> Result<()> {
    write_pid(lock_file.file()?, pid).map_err(|err| lock_file.io_err(err))
}

fn write_pid(mut file: &File, pid: u32) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(format!("{}\n", pid).as_bytes())?;
    file.sync_all()
}

/// Release the lock and close the descriptor. Closing an already closed
/// lock file does nothing.
pub fn unlock_and_close(lock_file: &mut LockFile) -> Result<()> {
    match lock_file.file.take() {
        Some(file) => {
            let res = FileExt::unlock(&file);
            drop(file);
            res.map_err(|err| lock_file.io_err(err))
        }
        None => Ok(()),
    }
}

/// Unlink the lock file. A file that is already gone is not an error.
pub fn remove(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(LockError::from_io(path, err)),
    }
}

/// Does the path still name the inode we have open? It does not once a
/// releasing holder unlinked it, or someone else created a new file there.
pub fn same_file(lock_file: &LockFile) -> Result<bool> {
    let ours = lock_file.file()?.metadata().map_err(|err| lock_file.io_err(err))?;
    match std::fs::metadata(&lock_file.path) {
        Ok(linked) => Ok(ours.dev() == linked.dev() && ours.ino() == linked.ino()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(lock_file.io_err(err)),
    }
}

/// Set the permission bits, bypassing the umask applied at creation. Only
/// does anything for files owned by the effective user.
pub fn set_permissions(lock_file: &LockFile, mode: u32) -> Result<()> {
    let file = lock_file.file()?;
    let meta = file.metadata().map_err(|err| lock_file.io_err(err))?;
    if meta.uid() != effective_uid() || meta.mode() & 0o7777 == mode {
        return Ok(());
    }
    file.set_permissions(Permissions::from_mode(mode))
        .map_err(|err| lock_file.io_err(err))
}

/// Owner and group of the open file.
pub fn owner(lock_file: &LockFile) -> Result<(u32, u32)> {
    let meta = lock_file.file()?.metadata().map_err(|err| lock_file.io_err(err))?;
    Ok((meta.uid(), meta.gid()))
}

pub fn effective_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Change the group of the file. Does nothing if it already has `gid`, as
/// only the owner may call `fchown` even for an unchanged group.
pub fn set_group(lock_file: &LockFile, gid: u32) -> Result<()> {
    let (_, current) = owner(lock_file)?;
    if current == gid {
        return Ok(());
    }
    std::os::unix::fs::fchown(lock_file.file()?, None, Some(gid))
        .map_err(|err| lock_file.io_err(err))
}

/// Parse lock file content: a positive decimal PID, surrounding whitespace
/// (the trailing newline) allowed.
pub fn parse_content(path: &Path, content: &[u8]) -> Result<u32> {
    let invalid = || LockError::InvalidContent {
        path: path.to_path_buf(),
        content: String::from_utf8_lossy(content).into_owned(),
    };

    let text = std::str::from_utf8(content).map_err(|_| invalid())?.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    match text.parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_with_dir;

    #[test]
    fn write_then_read_content() {
        test_with_dir("store_write_then_read_content", |dir| {
            let path = dir.join("test.pid");
            let lock_file = open_or_create(&path, 0o644).unwrap();
            assert!(lock_file.is_writable());
            assert!(try_lock_exclusive(&lock_file).unwrap());

            std::fs::write(&path, "something much longer than a pid").unwrap();
            write_content(&lock_file, 1234).unwrap();

            assert_eq!(read_content(&lock_file).unwrap(), b"1234\n");
            assert_eq!(std::fs::read_to_string(&path).unwrap(), "1234\n");
        })
    }

    #[test]
    fn second_description_is_contended() {
        test_with_dir("store_second_description_is_contended", |dir| {
            let path = dir.join("test.pid");
            let mut first = open_or_create(&path, 0o644).unwrap();
            let second = open_or_create(&path, 0o644).unwrap();

            assert!(try_lock_exclusive(&first).unwrap());
            assert!(!try_lock_exclusive(&second).unwrap());

            unlock_and_close(&mut first).unwrap();
            assert!(first.is_closed());
            assert!(try_lock_exclusive(&second).unwrap());
        })
    }

    #[test]
    fn unlock_and_close_is_idempotent() {
        test_with_dir("store_unlock_and_close_is_idempotent", |dir| {
            let mut lock_file = open_or_create(&dir.join("test.pid"), 0o644).unwrap();
            unlock_and_close(&mut lock_file).unwrap();
            unlock_and_close(&mut lock_file).unwrap();
            assert!(matches!(try_lock_exclusive(&lock_file), Err(LockError::Io { .. })));
        })
    }

    #[test]
    fn removed_file_is_no_longer_the_same() {
        test_with_dir("store_removed_file_is_no_longer_the_same", |dir| {
            let path = dir.join("test.pid");
            let lock_file = open_or_create(&path, 0o644).unwrap();
            assert!(same_file(&lock_file).unwrap());

            remove(&path).unwrap();
            assert!(!same_file(&lock_file).unwrap());
            remove(&path).unwrap();

            let _recreated = open_or_create(&path, 0o644).unwrap();
            assert!(!same_file(&lock_file).unwrap());
        })
    }

    #[test]
    fn missing_file_opens_as_none() {
        test_with_dir("store_missing_file_opens_as_none", |dir| {
            assert!(open_read_only(&dir.join("absent.pid")).unwrap().is_none());
        })
    }

    #[test]
    fn permissions_ignore_umask() {
        test_with_dir("store_permissions_ignore_umask", |dir| {
            let path = dir.join("test.pid");
            let lock_file = open_or_create(&path, 0o664).unwrap();
            set_permissions(&lock_file, 0o664).unwrap();
            let mode = std::fs::metadata(&path).unwrap().mode() & 0o7777;
            assert_eq!(mode, 0o664);
        })
    }

    #[test]
    fn parse_accepts_a_single_pid() {
        let path = Path::new("test.pid");
        assert_eq!(parse_content(path, b"42").unwrap(), 42);
        assert_eq!(parse_content(path, b"42\n").unwrap(), 42);
        assert_eq!(parse_content(path, b" 42 \n").unwrap(), 42);

        let bad_inputs: [&[u8]; 9] =
            [b"", b"\n", b"0\n", b"-1", b"+1", b"12 34", b"abc", b"99999999999", b"\xff"];
        for bad in bad_inputs.iter() {
            assert!(
                matches!(parse_content(path, *bad), Err(LockError::InvalidContent { .. })),
                "accepted {:?}",
                bad
            );
        }
    }
}
