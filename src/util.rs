use anyhow::{anyhow, Result};

use std::ffi::CString;
use std::io;
use std::time::Duration;

//----------------------------------------------------------------------------
//------------ Argument Parsing ----------------------------------------------
//----------------------------------------------------------------------------

/// Parse permission bits written in octal, with or without a leading `0o`.
pub fn parse_mode(s: &str) -> Result<u32> {
    let digits = s.trim_start_matches("0o");
    let mode = u32::from_str_radix(digits, 8).map_err(|err| anyhow!("Invalid mode {:?}: {}", s, err))?;
    if mode > 0o7777 {
        return Err(anyhow!("Invalid mode {:?}: more than 12 permission bits", s));
    }
    Ok(mode)
}

/// Parse a non-negative, possibly fractional, number of seconds.
pub fn parse_seconds(s: &str) -> Result<Duration> {
    let secs: f64 = s.parse().map_err(|err| anyhow!("Invalid number of seconds {:?}: {}", s, err))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(anyhow!("Invalid number of seconds {:?}", s));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Parse a user given by name or numeric id.
pub fn resolve_user(s: &str) -> Result<u32> {
    if let Ok(uid) = s.parse::<u32>() {
        return Ok(uid);
    }
    let name = CString::new(s)?;
    let mut buf = vec![0 as libc::c_char; 1024];
    loop {
        let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut found: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwnam_r(name.as_ptr(), &mut passwd, buf.as_mut_ptr(), buf.len(), &mut found)
        };
        match rc {
            0 if found.is_null() => return Err(anyhow!("No such user {:?}", s)),
            0 => return Ok(passwd.pw_uid),
            libc::ERANGE if buf.len() < MAX_LOOKUP_BUFFER => buf.resize(buf.len() * 2, 0),
            _ => return Err(anyhow!("Cannot look up user {:?}: {}", s, io::Error::from_raw_os_error(rc))),
        }
    }
}

/// Parse a group given by name or numeric id.
pub fn resolve_group(s: &str) -> Result<u32> {
    if let Ok(gid) = s.parse::<u32>() {
        return Ok(gid);
    }
    let name = CString::new(s)?;
    let mut buf = vec![0 as libc::c_char; 1024];
    loop {
        let mut group: libc::group = unsafe { std::mem::zeroed() };
        let mut found: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe {
            libc::getgrnam_r(name.as_ptr(), &mut group, buf.as_mut_ptr(), buf.len(), &mut found)
        };
        match rc {
            0 if found.is_null() => return Err(anyhow!("No such group {:?}", s)),
            0 => return Ok(group.gr_gid),
            libc::ERANGE if buf.len() < MAX_LOOKUP_BUFFER => buf.resize(buf.len() * 2, 0),
            _ => return Err(anyhow!("Cannot look up group {:?}: {}", s, io::Error::from_raw_os_error(rc))),
        }
    }
}

// Groups with many members need large buffers.
const MAX_LOOKUP_BUFFER: usize = 1 << 20;

//----------------------------------------------------------------------------
//------------ Test Support --------------------------------------------------
//----------------------------------------------------------------------------
#[cfg(test)]
use std::path::PathBuf;

#[cfg(test)]
const TEST_BASE_DIR: &str = "./test";

#[cfg(test)]
/// Create a test dir for a test so it can keep state there. If the dir is
/// present it will be delete first. Any failures will result in panics and
/// a failed test.
pub fn create_test_dir(test_name: &str) -> PathBuf {
    let path = PathBuf::from(format!("{}/{}", TEST_BASE_DIR, test_name));
    if path.exists() {
        std::fs::remove_dir_all(&path).unwrap();
    }
    std::fs::create_dir_all(&path).unwrap();
    path
}

#[cfg(test)]
pub fn remove_test_dir(test_name: &str) {
    let path = PathBuf::from(format!("{}/{}", TEST_BASE_DIR, test_name));
    std::fs::remove_dir_all(path).unwrap();
}

#[cfg(test)]
pub fn test_with_dir<F>(test_name: &str, op: F)
where
    F: FnOnce(PathBuf),
{
    let path = create_test_dir(test_name);

    op(path);

    remove_test_dir(test_name);
}

#[cfg(test)]
pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// The ids of `nobody`, used when root needs a second, unprivileged user.
#[cfg(test)]
pub const UNPRIVILEGED_ID: u32 = 65534;

#[cfg(test)]
/// Like `test_with_dir`, but in a world writable directory under the system
/// temp dir, which `UNPRIVILEGED_ID` can reach as well.
pub fn test_with_shared_dir<F>(test_name: &str, op: F)
where
    F: FnOnce(PathBuf),
{
    use std::os::unix::fs::PermissionsExt;

    let path = std::env::temp_dir().join("pidfilelock-test").join(test_name);
    if path.exists() {
        std::fs::remove_dir_all(&path).unwrap();
    }
    std::fs::create_dir_all(&path).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777)).unwrap();

    op(path.clone());

    std::fs::remove_dir_all(path).unwrap();
}

#[cfg(test)]
/// Run `op` without root privileges. When running as root, `op` runs on a
/// thread whose effective ids are `UNPRIVILEGED_ID` and which has no
/// supplementary groups. Linux keeps credentials per thread, so the raw
/// syscalls leave the other test threads alone. The libc wrappers would
/// change all threads.
pub fn as_unprivileged<F, T>(op: F) -> T
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    if !running_as_root() {
        return op();
    }
    std::thread::scope(|scope| {
        scope
            .spawn(|| {
                drop_thread_privileges(UNPRIVILEGED_ID, UNPRIVILEGED_ID);
                op()
            })
            .join()
            .unwrap()
    })
}

#[cfg(all(test, target_os = "linux"))]
fn drop_thread_privileges(uid: u32, gid: u32) {
    let keep = -1 as libc::c_long;
    unsafe {
        assert_eq!(libc::syscall(libc::SYS_setgroups, 0 as libc::c_long, std::ptr::null::<libc::gid_t>()), 0);
        assert_eq!(libc::syscall(libc::SYS_setresgid, keep, gid as libc::c_long, keep), 0);
        assert_eq!(libc::syscall(libc::SYS_setresuid, keep, uid as libc::c_long, keep), 0);
        assert_eq!(libc::geteuid(), uid);
    }
}

#[cfg(all(test, not(target_os = "linux")))]
fn drop_thread_privileges(_uid: u32, _gid: u32) {
    panic!("dropping privileges for a single thread needs Linux");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn modes_are_octal() {
        assert_eq!(parse_mode("664").unwrap(), 0o664);
        assert_eq!(parse_mode("0o2775").unwrap(), 0o2775);
        assert!(parse_mode("8").is_err());
        assert!(parse_mode("17777").is_err());
    }

    #[test]
    fn seconds_may_be_fractional() {
        assert_eq!(parse_seconds("1.5").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_seconds("0").unwrap(), Duration::from_secs(0));
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("soon").is_err());
    }

    #[test]
    fn users_and_groups_by_name_or_id() {
        assert_eq!(resolve_user("root").unwrap(), 0);
        assert_eq!(resolve_group("root").unwrap(), 0);
        assert_eq!(resolve_user("1234").unwrap(), 1234);
        assert_eq!(resolve_group("1234").unwrap(), 1234);
        assert!(resolve_user("no-such-user-pidfilelock").is_err());
        assert!(resolve_group("no-such-group-pidfilelock").is_err());
        assert!(resolve_group("nul\0byte").is_err());
    }

    #[test]
    fn unprivileged_thread_cannot_write_root_files() {
        test_with_shared_dir("util_unprivileged_thread_cannot_write_root_files", |dir| {
            let path = dir.join("owned");
            std::fs::write(&path, "").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o444)).unwrap();

            let denied = as_unprivileged(|| std::fs::OpenOptions::new().write(true).open(&path).is_err());
            assert!(denied);
            if running_as_root() {
                assert!(std::fs::OpenOptions::new().write(true).open(&path).is_ok());
            }
        })
    }
}
