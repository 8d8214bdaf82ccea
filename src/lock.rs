//! Single-instance lock scoped to a configuration directory.
//!
//! # File Layout
//!
//! ```text
//! {config_dir}/
//!   midibridge.lock      # exclusively locked while a daemon runs; holds its PID
//! ```
//!
//! The lock is an OS-level advisory lock on an open file (`flock` on Unix,
//! a share-nothing open on Windows), so it disappears with the process
//! even after a crash. The file itself is left in place; only the lock
//! matters.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::constants::LOCK_RETRY_INTERVAL;
use crate::error::BridgeError;

/// Lock file name inside the configuration directory.
pub const LOCK_FILE_NAME: &str = "midibridge.lock";

/// Held exclusive lock. Released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    // Never read; keeping the descriptor open is what holds the lock.
    _file: File,
}

impl InstanceLock {
    /// Lock file path for `dir`.
    pub fn lock_path(dir: &Path) -> PathBuf {
        dir.join(LOCK_FILE_NAME)
    }

    /// Try once to take the lock.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InstanceLockHeld`] if another process (or another
    /// handle in this process) holds it; [`BridgeError::Io`] otherwise.
    pub fn acquire(dir: &Path) -> Result<Self, BridgeError> {
        let path = Self::lock_path(dir);
        let mut file = match open_exclusive(&path) {
            Ok(file) => file,
            Err(e) if is_contention(&e) => return Err(BridgeError::InstanceLockHeld { path }),
            Err(e) => return Err(BridgeError::Io(e)),
        };

        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        log::info!("[Lock] Acquired {} (pid={})", path.display(), std::process::id());
        Ok(Self { path, _file: file })
    }

    /// Keep trying until the previous holder lets go or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`BridgeError::LockReleaseTimeout`] when the lock is still held at the
    /// deadline.
    pub async fn acquire_with_timeout(dir: &Path, timeout: Duration) -> Result<Self, BridgeError> {
        // None: the deadline is past what the clock can represent.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match Self::acquire(dir) {
                Err(BridgeError::InstanceLockHeld { path }) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(BridgeError::LockReleaseTimeout { path, timeout });
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    /// Path of the held lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// PID recorded by the current or last holder.
pub fn read_owner_pid(dir: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(InstanceLock::lock_path(dir)).ok()?;
    contents.trim().parse().ok()
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Whether a process with `pid` exists.
#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn open_exclusive(path: &Path) -> std::io::Result<File> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(file)
}

#[cfg(windows)]
fn open_exclusive(path: &Path) -> std::io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .share_mode(0)
        .open(path)
}

#[cfg(unix)]
fn is_contention(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == Some(libc::EWOULDBLOCK)
        || e.raw_os_error() == Some(libc::EAGAIN)
}

#[cfg(windows)]
fn is_contention(e: &std::io::Error) -> bool {
    const ERROR_SHARING_VIOLATION: i32 = 32;
    const ERROR_LOCK_VIOLATION: i32 = 33;
    matches!(e.raw_os_error(), Some(ERROR_SHARING_VIOLATION | ERROR_LOCK_VIOLATION))
}
