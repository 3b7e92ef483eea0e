use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::exec::host_root_path;
use crate::IscsiError;

const LOCK_POLL: Duration = Duration::from_millis(100);

/// Host-wide mutual exclusion for every mutating lifecycle call.
///
/// The lock is held for as long as the returned guard lives.
pub trait HostLock {
    type Guard;

    fn lock(&self) -> Result<Self::Guard>;
}

/// `flock(2)` on a file inside the host mount namespace.
#[derive(Debug, Clone)]
pub struct NsFileLock {
    path: PathBuf,
    timeout: Duration,
}

impl NsFileLock {
    /// `lock_file` is resolved relative to the host root behind `host_proc`
    pub fn new<P: AsRef<Path>, L: AsRef<Path>>(host_proc: P, lock_file: L, timeout: Duration) -> Self {
        let lock_file = lock_file.as_ref();
        let relative = lock_file.strip_prefix("/").unwrap_or(lock_file);
        NsFileLock {
            path: host_root_path(host_proc).join(relative),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("open lock file {}", self.path.display()))?;
        Ok(file)
    }
}

impl HostLock for NsFileLock {
    type Guard = Flock<File>;

    fn lock(&self) -> Result<Flock<File>> {
        let deadline = Instant::now() + self.timeout;
        let mut file = self.open()?;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(guard) => {
                    log::debug!("acquired lock {}", self.path.display());
                    return Ok(guard);
                }
                Err((f, Errno::EWOULDBLOCK)) => file = f,
                Err((_, errno)) => {
                    return Err(IscsiError::Io(errno.into()))
                        .with_context(|| format!("lock {}", self.path.display()))
                }
            }

            if Instant::now() >= deadline {
                anyhow::bail!(IscsiError::LockTimeout(
                    self.path.to_string_lossy().to_string(),
                    self.timeout
                ))
            }
            thread::sleep(LOCK_POLL);
        }
    }
}
