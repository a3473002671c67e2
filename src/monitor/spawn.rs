//! Root Process Spawning
//!
//! Starts the monitored program and waits for its exit with a timeout.
//! On Linux the wait sleeps in the kernel on a pidfd; elsewhere it polls
//! `try_wait` in short naps bounded by the timeout.

use std::collections::BTreeMap;
use std::io;
use std::process::{Child, Command, ExitStatus};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use super::error::{MonitorError, Result};

/// How the root process terminated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
}

impl ExitOutcome {
    /// Returns true for a clean zero exit.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Handle on the running root process.
pub trait ProcessHandle {
    /// OS process identifier.
    fn pid(&self) -> u32;

    /// Waits at most `timeout` for the process to exit, reaping it if so.
    ///
    /// Returns `Ok(None)` when the timeout elapsed first. A zero timeout is
    /// a single non-blocking check.
    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitOutcome>>;
}

/// A spawned root process.
pub struct RootProcess {
    child: Child,
    #[cfg(target_os = "linux")]
    pidfd: Option<std::os::fd::OwnedFd>,
}

impl RootProcess {
    /// Spawns `command` with `overlay` merged over the inherited environment.
    pub fn spawn(command: &[String], overlay: &BTreeMap<String, String>) -> Result<Self> {
        let (program, args) = command.split_first().ok_or(MonitorError::EmptyCommand)?;

        let child = Command::new(program)
            .args(args)
            .envs(overlay)
            .spawn()
            .map_err(|source| MonitorError::Spawn {
                program: program.clone(),
                source,
            })?;

        debug!("Spawned {:?} as pid {}", command, child.id());

        Ok(Self {
            #[cfg(target_os = "linux")]
            pidfd: pidfd::open(child.id()),
            child,
        })
    }

    /// Kills and reaps the process, used when monitoring itself failed.
    pub fn terminate(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_none() {
            self.child.kill()?;
            self.child.wait()?;
        }
        Ok(())
    }

    /// Polls `try_wait`, napping between checks until `timeout` elapses.
    fn wait_by_polling(&mut self, timeout: Duration) -> io::Result<Option<ExitOutcome>> {
        const NAP: Duration = Duration::from_millis(2);

        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status.into()));
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(NAP.min(deadline - now));
        }
    }
}

impl ProcessHandle for RootProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    #[cfg(target_os = "linux")]
    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitOutcome>> {
        let Some(fd) = self.pidfd.as_ref() else {
            return self.wait_by_polling(timeout);
        };

        if pidfd::wait_readable(fd, timeout)? {
            // Readable means exited; this reaps it
            Ok(self.child.try_wait()?.map(ExitOutcome::from))
        } else {
            Ok(None)
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitOutcome>> {
        self.wait_by_polling(timeout)
    }
}

#[cfg(target_os = "linux")]
mod pidfd {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::time::Duration;

    use log::debug;

    /// Opens a pidfd for `pid`, or `None` on kernels older than 5.3.
    pub(super) fn open(pid: u32) -> Option<OwnedFd> {
        let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) };
        if ret < 0 {
            debug!(
                "pidfd_open unavailable ({}); falling back to polling",
                io::Error::last_os_error()
            );
            return None;
        }
        // SAFETY: the syscall returned a fresh descriptor we now own
        Some(unsafe { OwnedFd::from_raw_fd(ret as i32) })
    }

    /// Blocks until the pidfd is readable (process exited) or `timeout` elapses.
    ///
    /// An interrupted poll reports "not ready"; the caller's loop retries.
    pub(super) fn wait_readable(fd: &OwnedFd, timeout: Duration) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        // Round up so a sub-millisecond remainder does not become a 0 ms spin
        let millis = timeout.as_micros().div_ceil(1000).min(libc::c_int::MAX as u128) as libc::c_int;

        let ret = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        Ok(ret > 0 && pollfd.revents & libc::POLLIN != 0)
    }
}
