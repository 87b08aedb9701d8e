use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::RalphError;
use crate::fs_util::write_atomic;

pub(crate) const PID_FILE_NAME: &str = ".ralph.pid";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopSignal {
    /// SIGTERM; the supervisor finishes its current wait and exits.
    Terminate,
    /// SIGKILL.
    Kill,
}

impl StopSignal {
    fn raw(self) -> i32 {
        match self {
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }
}

/// How long `stop` waits for the signalled process to disappear.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StopPolicy {
    pub(crate) interval: Duration,
    pub(crate) attempts: u32,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            attempts: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopOutcome {
    Stopped { pid: i32 },
    StillRunning { pid: i32 },
}

/// Advisory record of the supervisor PID for one working directory.
///
/// Nothing here is a lock: two processes racing through `write` can both
/// succeed, and the later writer owns the record.
#[derive(Clone, Debug)]
pub(crate) struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub(crate) fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(PID_FILE_NAME),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn write(&self) -> Result<(), RalphError> {
        match self.read() {
            Ok(pid) if is_process_alive(pid) => return Err(RalphError::AlreadyRunning(pid)),
            Ok(_) => self.remove()?,
            Err(RalphError::NotRunning) if self.path.exists() => self.remove()?,
            Err(RalphError::NotRunning) => {}
            Err(err) => return Err(err),
        }

        let pid = std::process::id();
        write_atomic(&self.path, pid.to_string().as_bytes()).map_err(|err| {
            RalphError::io(format!("Failed to write {}", self.path.display()), err)
        })
    }

    pub(crate) fn read(&self) -> Result<i32, RalphError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(RalphError::NotRunning)
            }
            Err(err) => {
                return Err(RalphError::io(
                    format!("Failed to read {}", self.path.display()),
                    err,
                ))
            }
        };
        match content.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(pid),
            _ => Err(RalphError::NotRunning),
        }
    }

    /// Never fails; an unreadable record or dead process reads as `(false, 0)`.
    pub(crate) fn is_running(&self) -> (bool, i32) {
        match self.read() {
            Ok(pid) if is_process_alive(pid) => (true, pid),
            _ => (false, 0),
        }
    }

    pub(crate) fn signal(&self, signal: StopSignal) -> Result<i32, RalphError> {
        let pid = self.read()?;
        if !is_process_alive(pid) {
            self.remove()?;
            return Err(RalphError::NotRunning);
        }
        send_signal(pid, signal.raw())?;
        Ok(pid)
    }

    pub(crate) fn remove(&self) -> Result<(), RalphError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(RalphError::io(
                format!("Failed to remove {}", self.path.display()),
                err,
            )),
        }
    }

    /// Signals the recorded process and polls until it is gone or the policy
    /// bound runs out. The record is removed once the process has exited.
    pub(crate) fn stop(
        &self,
        signal: StopSignal,
        policy: StopPolicy,
    ) -> Result<StopOutcome, RalphError> {
        let pid = self.signal(signal)?;
        for _ in 0..policy.attempts {
            thread::sleep(policy.interval);
            if !is_process_alive(pid) {
                self.remove()?;
                return Ok(StopOutcome::Stopped { pid });
            }
        }
        Ok(StopOutcome::StillRunning { pid })
    }
}

/// Signal-0 liveness check; any failure (including EPERM) counts as dead.
#[cfg(unix)]
pub(crate) fn is_process_alive(pid: i32) -> bool {
    pid > 0 && unsafe { libc::kill(pid, 0) } == 0
}

#[cfg(not(unix))]
pub(crate) fn is_process_alive(_pid: i32) -> bool {
    false
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: i32) -> Result<(), RalphError> {
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let source = io::Error::last_os_error();
    if source.raw_os_error() == Some(libc::ESRCH) {
        return Err(RalphError::NotRunning);
    }
    Err(RalphError::Signal { pid, source })
}

#[cfg(not(unix))]
fn send_signal(pid: i32, _signal: i32) -> Result<(), RalphError> {
    Err(RalphError::Signal {
        pid,
        source: io::Error::new(io::ErrorKind::Unsupported, "signals need a unix host"),
    })
}
