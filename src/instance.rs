//! Single-instance enforcement via PID file

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Held PID file; removed on drop
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

impl InstanceLock {
    /// Take the lock at `path`
    ///
    /// A PID file left behind by a dead process is removed first.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if a live process holds the lock
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            match read_pid(&path) {
                Some(pid) if pid != std::process::id() && is_alive(pid) => {
                    return Err(Error::AlreadyRunning(pid));
                }
                holder => {
                    tracing::debug!(pid = ?holder, path = %path.display(), "removing stale pid file");
                    std::fs::remove_file(&path)?;
                }
            }
        }

        // create_new maps to O_CREAT | O_EXCL
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    Error::AlreadyRunning(read_pid(&path).unwrap_or_default())
                } else {
                    Error::Io(e)
                }
            })?;

        let pid = std::process::id();
        write!(file, "{pid}")?;

        tracing::debug!(pid, path = %path.display(), "instance lock acquired");
        Ok(Self { path, pid })
    }

    /// Path of the PID file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Leave the file alone if another process has since replaced it
        if read_pid(&self.path) == Some(self.pid) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(error = %e, path = %self.path.display(), "failed to remove pid file");
            }
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal None only checks that the process exists; EPERM means it does
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn is_alive(_pid: u32) -> bool {
    false
}
