//! Graceful-then-forceful termination of supervised processes by PID.

use crate::heartbeat::pid::pid_alive;
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("signalling pid {pid} failed: {reason}")]
    Signal { pid: u32, reason: String },
}

/// Shuts down the process with the given PID: SIGTERM first, then SIGKILL
/// once the grace window has elapsed without the process exiting.
pub struct ProcessTerminator {
    pid: u32,
}

impl ProcessTerminator {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    #[cfg(target_family = "unix")]
    pub fn shutdown(&self, grace: Duration) -> Result<(), TerminateError> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM).map_err(|err| {
            TerminateError::Signal {
                pid: self.pid,
                reason: err.to_string(),
            }
        })?;

        if self.exits_within(grace) {
            return Ok(());
        }
        self.kill()
    }

    /// Immediate SIGKILL without a grace window.
    #[cfg(target_family = "unix")]
    pub fn kill(&self) -> Result<(), TerminateError> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL).map_err(|err| {
            TerminateError::Signal {
                pid: self.pid,
                reason: err.to_string(),
            }
        })
    }

    #[cfg(target_family = "windows")]
    pub fn shutdown(&self, _grace: Duration) -> Result<(), TerminateError> {
        unimplemented!("windows processes can't be shut down")
    }

    #[cfg(target_family = "windows")]
    pub fn kill(&self) -> Result<(), TerminateError> {
        unimplemented!("windows processes can't be killed")
    }

    fn exits_within(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !pid_alive(self.pid) {
                return true;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        !pid_alive(self.pid)
    }
}
