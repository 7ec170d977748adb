//! The PID lock protocol.
//!
//! Whether a lock is held is decided by the kernel: a lock file is held
//! while some open file description has an exclusive `flock(2)` on it. The
//! PID written into the file only identifies the holder for humans and
//! tools. It is written after the kernel lock is obtained, so while the lock
//! is held the content names the holder.
//!
//! A holder that dies without releasing leaves its PID behind, but the
//! kernel drops its lock together with its descriptors, so the next
//! acquirer simply succeeds and overwrites the content.

use crate::config::{
    DEFAULT_LOCK_MODE, DEFAULT_MAX_POLL_INTERVAL, DEFAULT_POLL_INTERVAL, MIN_POLL_INTERVAL,
};
use crate::error::{LockError, Result};
use crate::probe::{LivenessProbe, ProcessTableProbe};
use crate::store::{self, LockFile};

use retry::delay::jitter;
use retry::OperationResult;
use serde::Serialize;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How long `acquire` may wait for a held lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireMode {
    /// Fail with `AlreadyLocked` straight away.
    NonBlocking,
    /// Poll until the lock is ours.
    Blocking,
    /// Poll until the lock is ours or the duration has passed.
    Timeout(Duration),
}

impl Default for AcquireMode {
    fn default() -> Self {
        AcquireMode::NonBlocking
    }
}

#[derive(Clone, Debug)]
pub struct LockOptions {
    pub mode: AcquireMode,

    /// Permission bits of a newly created lock file. Everybody who should be
    /// able to take the lock needs write access to the file, and to the
    /// directory so that files of other users can be replaced.
    pub create_mode: u32,

    /// Group to give the lock file once acquired. A file owned by someone
    /// else with a different group is replaced, as only its owner may change
    /// the group.
    pub group: Option<u32>,

    /// The PID written to the lock file.
    pub holder_pid: u32,

    /// First delay between attempts in the waiting modes. `Timeout` keeps
    /// polling at this rate, `Blocking` backs off up to `max_poll_interval`.
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,

    /// Remove the file when a handle is dropped without being released.
    pub unlink_on_drop: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions {
            mode: AcquireMode::default(),
            create_mode: DEFAULT_LOCK_MODE,
            group: None,
            holder_pid: std::process::id(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
            unlink_on_drop: false,
        }
    }
}

impl LockOptions {
    pub fn with_mode(mut self, mode: AcquireMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_create_mode(mut self, create_mode: u32) -> Self {
        self.create_mode = create_mode;
        self
    }

    pub fn with_group(mut self, group: Option<u32>) -> Self {
        self.group = group;
        self
    }

    pub fn with_holder_pid(mut self, holder_pid: u32) -> Self {
        self.holder_pid = holder_pid;
        self
    }

    /// Sets the first delay between attempts, at least `MIN_POLL_INTERVAL`.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self.max_poll_interval = self.max_poll_interval.max(self.poll_interval);
        self
    }

    pub fn with_unlink_on_drop(mut self, unlink_on_drop: bool) -> Self {
        self.unlink_on_drop = unlink_on_drop;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Acquired,
    Released,
}

/// What `inspect` found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum LockStatus {
    Free,
    /// `pid` is `None` if the holder has not (yet) written valid content.
    #[serde(rename = "held")]
    HeldBy { pid: Option<u32> },
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockStatus::Free => write!(f, "free"),
            LockStatus::HeldBy { pid: Some(pid) } => write!(f, "held by {}", pid),
            LockStatus::HeldBy { pid: None } => write!(f, "held by an unidentified process"),
        }
    }
}

//------------ PidLockHandle -------------------------------------------------

/// An acquired lock. Dropping it releases the kernel lock; call
/// [`release`](Self::release) to also remove the file or to see errors.
#[derive(Debug)]
pub struct PidLockHandle {
    path: PathBuf,
    lock_file: LockFile,
    holder_pid: u32,
    state: LockState,
    unlink_on_drop: bool,
}

impl PidLockHandle {
    fn open(path: &Path, options: &LockOptions) -> Result<Self> {
        Ok(PidLockHandle {
            path: path.to_path_buf(),
            lock_file: store::open_or_create(path, options.create_mode)?,
            holder_pid: options.holder_pid,
            state: LockState::Unlocked,
            unlink_on_drop: options.unlink_on_drop,
        })
    }

    /// Called with the kernel lock held on the file at `path`.
    fn take_ownership(&mut self, options: &LockOptions) -> Result<()> {
        store::set_permissions(&self.lock_file, options.create_mode)?;
        if let Some(gid) = options.group {
            store::set_group(&self.lock_file, gid)?;
        }
        store::write_content(&self.lock_file, self.holder_pid)?;
        self.state = LockState::Acquired;
        debug!("Lock file {:?} acquired for PID {}", self.path, self.holder_pid);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn holder_pid(&self) -> u32 {
        self.holder_pid
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_acquired(&self) -> bool {
        self.state == LockState::Acquired
    }

    /// Give up the lock, removing the file first if `unlink` is set. The
    /// handle ends up `Released` even if this fails. Releasing a released
    /// handle does nothing.
    pub fn release(&mut self, unlink: bool) -> Result<()> {
        if self.state != LockState::Acquired {
            return Ok(());
        }
        self.state = LockState::Released;

        // Unlink while still holding the lock, a waiter that opened this
        // inode notices the unlink once it gets the lock.
        let removed = if unlink { store::remove(&self.path) } else { Ok(()) };
        let closed = store::unlock_and_close(&mut self.lock_file);
        debug!("Lock file {:?} released (unlinked: {})", self.path, unlink);
        removed.and(closed)
    }
}

impl Drop for PidLockHandle {
    fn drop(&mut self) {
        if let Err(err) = self.release(self.unlink_on_drop) {
            warn!("Failed to release lock file {:?}: {}", self.path, err);
        }
    }
}

//------------ PidLock -------------------------------------------------------

/// Acquires the lock file at one path.
pub struct PidLock {
    path: PathBuf,
    options: LockOptions,
    probe: Box<dyn LivenessProbe>,
}

impl fmt::Debug for PidLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PidLock")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish()
    }
}

impl PidLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PidLock {
            path: path.into(),
            options: LockOptions::default(),
            probe: Box::new(ProcessTableProbe),
        }
    }

    pub fn with_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_probe(mut self, probe: impl LivenessProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Take the lock, waiting as configured by the acquire mode.
    pub fn acquire(&self) -> Result<PidLockHandle> {
        match self.options.mode {
            AcquireMode::NonBlocking => self.try_acquire(),
            AcquireMode::Blocking => self.acquire_blocking(),
            AcquireMode::Timeout(timeout) => self.acquire_with_timeout(timeout),
        }
    }

    /// One acquisition attempt, never waits.
    pub fn try_acquire(&self) -> Result<PidLockHandle> {
        loop {
            let mut handle = PidLockHandle::open(&self.path, &self.options)?;

            if !store::try_lock_exclusive(&handle.lock_file)? {
                self.contend(&handle.lock_file)?;
            }

            if !store::same_file(&handle.lock_file)? {
                debug!("Lock file {:?} was replaced before we locked it, trying again", self.path);
                continue;
            }

            if self.must_replace(&handle.lock_file)? {
                // We hold the lock, so nobody else relies on this file.
                debug!("Lock file {:?} cannot be made ours, replacing it", self.path);
                store::remove(&self.path)?;
                continue;
            }

            handle.take_ownership(&self.options)?;
            return Ok(handle);
        }
    }

    /// A file we cannot write, or whose group we would have to change without
    /// owning it.
    fn must_replace(&self, lock_file: &LockFile) -> Result<bool> {
        if !lock_file.is_writable() {
            return Ok(true);
        }
        match self.options.group {
            Some(gid) => {
                let (uid, current) = store::owner(lock_file)?;
                Ok(current != gid && uid != store::effective_uid())
            }
            None => Ok(false),
        }
    }

    /// Someone holds the kernel lock. Returns `Ok` only if we got the lock
    /// after all, which happens when the holder went away just now.
    fn contend(&self, lock_file: &LockFile) -> Result<()> {
        let content = store::read_content(lock_file)?;
        match store::parse_content(&self.path, &content) {
            Ok(pid) if self.probe.is_alive(pid) => {
                return Err(self.already_locked(Some(pid)));
            }
            Ok(pid) => debug!("Holder {} of lock file {:?} is gone, trying once more", pid, self.path),
            Err(err) => debug!("{}, trying once more", err),
        }

        if store::try_lock_exclusive(lock_file)? {
            return Ok(());
        }

        let pid = store::read_content(lock_file)
            .and_then(|content| store::parse_content(&self.path, &content))
            .ok();
        Err(self.already_locked(pid))
    }

    fn already_locked(&self, pid: Option<u32>) -> LockError {
        LockError::AlreadyLocked { path: self.path.clone(), pid }
    }

    fn acquire_blocking(&self) -> Result<PidLockHandle> {
        let initial = self.poll_interval();
        let delays = backoff(initial, self.options.max_poll_interval.max(initial)).map(jitter);
        self.poll(delays, None)
    }

    fn acquire_with_timeout(&self, timeout: Duration) -> Result<PidLockHandle> {
        // A timeout too long to represent never expires.
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => return self.acquire_blocking(),
        };
        let poll_interval = self.poll_interval();
        // Never sleep past the deadline.
        let delays = std::iter::repeat_with(move || {
            poll_interval.min(deadline.saturating_duration_since(Instant::now()))
        });

        self.poll(delays, Some((deadline, timeout)))
    }

    fn poll_interval(&self) -> Duration {
        self.options.poll_interval.max(MIN_POLL_INTERVAL)
    }

    fn poll<I>(&self, delays: I, deadline: Option<(Instant, Duration)>) -> Result<PidLockHandle>
    where
        I: IntoIterator<Item = Duration>,
    {
        let mut announced = false;
        let res = retry::retry(delays, || match self.try_acquire() {
            Ok(handle) => OperationResult::Ok(handle),
            Err(err) if err.is_already_locked() => match deadline {
                Some((deadline, waited)) if Instant::now() >= deadline => {
                    OperationResult::Err(LockError::Timeout { path: self.path.clone(), waited })
                }
                _ => {
                    if !announced {
                        info!("Waiting for lock file {:?}: {}", self.path, err);
                        announced = true;
                    }
                    OperationResult::Retry(err)
                }
            },
            Err(err) => OperationResult::Err(err),
        });

        res.map_err(|err| match err {
            retry::Error::Operation { error, .. } => error,
            retry::Error::Internal(msg) => LockError::Io {
                path: self.path.clone(),
                source: io::Error::new(io::ErrorKind::Other, msg),
            },
        })
    }
}

/// Delays doubling from `initial` up to `max`.
fn backoff(initial: Duration, max: Duration) -> impl Iterator<Item = Duration> {
    std::iter::successors(Some(initial), move |delay| {
        Some(delay.checked_mul(2).map_or(max, |next| next.min(max)))
    })
}

//------------ Inspection ----------------------------------------------------

/// Report whether the lock at `path` is held, and by whom, without taking
/// it for longer than a single non-blocking attempt.
pub fn inspect(path: impl AsRef<Path>) -> Result<LockStatus> {
    let path = path.as_ref();
    let lock_file = match store::open_read_only(path)? {
        Some(lock_file) => lock_file,
        None => return Ok(LockStatus::Free),
    };
    let lock_file = scopeguard::guard(lock_file, |mut lock_file| {
        let _ = store::unlock_and_close(&mut lock_file);
    });

    if store::try_lock_exclusive(&lock_file)? {
        return Ok(LockStatus::Free);
    }

    let content = store::read_content(&lock_file)?;
    Ok(LockStatus::HeldBy { pid: store::parse_content(path, &content).ok() })
}

/// The PID stored at `path`, if there is a file. Says nothing about whether
/// the lock is held, use [`inspect`] for that.
pub fn read_pid(path: impl AsRef<Path>) -> Result<Option<u32>> {
    let path = path.as_ref();
    match store::open_read_only(path)? {
        Some(lock_file) => store::parse_content(path, &store::read_content(&lock_file)?).map(Some),
        None => Ok(None),
    }
}

/// Outcome of [`opportunistic`].
#[derive(Debug)]
pub enum Opportunistic {
    /// We are the instance that should do the work.
    Acquired(PidLockHandle),
    /// Another instance is running and can be talked to instead.
    Running(Option<u32>),
}

/// Either become the single running instance or learn which one is.
pub fn opportunistic(lock: &PidLock) -> Result<Opportunistic> {
    match lock.try_acquire() {
        Ok(handle) => Ok(Opportunistic::Acquired(handle)),
        Err(LockError::AlreadyLocked { pid, .. }) => Ok(Opportunistic::Running(pid)),
        Err(err) => Err(err),
    }
}
