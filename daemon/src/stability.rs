//! Waiting for a scanner to finish writing a file.
//!
//! A file counts as stable once it can be opened for read/write and
//! exclusively locked. The probe is repeated on a fixed interval, without
//! limit unless a maximum wait is configured.
//!
//! Outside Windows an open writer that takes no advisory lock is invisible to
//! the probe, so there the file must also keep the same size and modification
//! time across one poll interval.
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use fs2::FileExt;
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct StabilityPolicy {
    pub poll_interval: Duration,
    /// `None` waits indefinitely.
    pub max_wait: Option<Duration>,
}

impl Default for StabilityPolicy {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: None,
        }
    }
}

/// Result of a single probe.
#[derive(Debug)]
pub enum Probe {
    Free,
    /// Another process still has the file open or locked.
    Held,
    Missing,
    Inaccessible(io::Error),
}

/// Outcome of waiting for a file.
#[derive(Debug)]
pub enum Stability {
    Ready,
    /// The file disappeared while waiting (moved or deleted by someone else).
    Vanished,
    TimedOut,
    Inaccessible(io::Error),
}

/// Tries to take the file exclusively and releases it immediately.
pub fn probe(path: &Path) -> Probe {
    let file = match open_exclusive(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Probe::Missing,
        Err(e) if is_sharing_violation(&e) => return Probe::Held,
        Err(e) => return Probe::Inaccessible(e),
    };
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Probe::Free
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || is_sharing_violation(&e) => Probe::Held,
        Err(e) => Probe::Inaccessible(e),
    }
}

/// Blocks the calling thread until `path` is free, gone, inaccessible, or the
/// policy's maximum wait has passed.
pub fn wait_until_unlocked(path: &Path, policy: &StabilityPolicy) -> Stability {
    let started = Instant::now();
    let mut last_seen: Option<Fingerprint> = None;
    loop {
        match probe(path) {
            Probe::Free if !REQUIRE_QUIET_INTERVAL => return Stability::Ready,
            Probe::Free => match Fingerprint::of(path) {
                Ok(seen) if last_seen.as_ref() == Some(&seen) => return Stability::Ready,
                Ok(seen) => last_seen = Some(seen),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Stability::Vanished,
                Err(e) => return Stability::Inaccessible(e),
            },
            Probe::Missing => return Stability::Vanished,
            Probe::Inaccessible(e) => return Stability::Inaccessible(e),
            Probe::Held => last_seen = None,
        }
        if policy
            .max_wait
            .is_some_and(|max| started.elapsed() >= max)
        {
            return Stability::TimedOut;
        }
        debug!("{} is still in use; retrying", path.display());
        thread::sleep(policy.poll_interval);
    }
}

/// Share mode 0 already refuses files another process has open.
const REQUIRE_QUIET_INTERVAL: bool = !cfg!(windows);

/// Size and modification time, compared between two free probes.
#[derive(Debug, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

impl Fingerprint {
    fn of(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

#[cfg(windows)]
fn open_exclusive(path: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;
    OpenOptions::new()
        .read(true)
        .write(true)
        .share_mode(0)
        .open(path)
}

#[cfg(not(windows))]
fn open_exclusive(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION on Windows.
fn is_sharing_violation(e: &io::Error) -> bool {
    cfg!(windows) && matches!(e.raw_os_error(), Some(32) | Some(33))
}
