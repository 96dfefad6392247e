// Single-instance guard backed by a PID file
// Also implements `--signal stop` against the recorded process

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::error::PidFileError;

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// SIGTERM was sent to the recorded process
    Stopped(i32),
    /// The PID file named a dead process and was removed
    StaleRemoved,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PidFileError + '_ {
    move |source| PidFileError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Read the PID recorded in `path`
pub fn read_pid(path: &Path) -> Result<i32, PidFileError> {
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    text.trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| PidFileError::Invalid {
            path: path.display().to_string(),
        })
}

/// Whether a process with this PID exists
pub fn is_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence and permission
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Held for the lifetime of the process; removes the file on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Record the current PID in `path`.
    ///
    /// Fails if the file names a live process. A file left behind by a dead
    /// process is replaced.
    pub fn acquire(path: impl Into<PathBuf>, name: &str) -> Result<Self, PidFileError> {
        let path = path.into();

        if path.exists() {
            match read_pid(&path) {
                Ok(pid) if is_running(pid) => {
                    return Err(PidFileError::AlreadyRunning {
                        name: name.to_string(),
                        pid,
                    })
                }
                _ => {
                    info!("{}.pid exists but process isn't running. Removing obsolete PID file", name);
                    fs::remove_file(&path).map_err(io_error(&path))?;
                }
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(&path))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(io_error(&path))?;
        write!(file, "{}", std::process::id()).map_err(io_error(&path))?;

        Ok(PidFile { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            error!("Can't remove {} ({})", self.path.display(), e);
        }
    }
}

/// Send SIGTERM to the process recorded in `path`
pub fn stop_running(path: &Path, name: &str) -> Result<StopOutcome, PidFileError> {
    if !path.exists() {
        return Err(PidFileError::NotRunning {
            name: name.to_string(),
        });
    }

    let pid = read_pid(path)?;
    if is_running(pid) && unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        info!("Stopping {}: PID {}", name, pid);
        return Ok(StopOutcome::Stopped(pid));
    }

    fs::remove_file(path).map_err(io_error(path))?;
    Ok(StopOutcome::StaleRemoved)
}
