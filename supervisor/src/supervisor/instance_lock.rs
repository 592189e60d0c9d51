//! Single-instance guard for the supervisor process itself.
//!
//! A PID file prevents two supervisors from racing over the same host's
//! agents. A file left behind by a dead process is overwritten.

use crate::heartbeat::pid::pid_alive;
use std::path::PathBuf;
use thiserror::Error;

const PID_FILE_NAME: &str = "centerfire-supervisor.pid";

#[derive(Debug, Error)]
pub enum InstanceLockError {
    #[error("another supervisor is already running with pid {0}")]
    AlreadyRunning(u32),
    #[error("cannot access pid file `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct InstanceLock {
    path: PathBuf,
}

impl Default for InstanceLock {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join(PID_FILE_NAME),
        }
    }
}

impl InstanceLock {
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Claims the lock for the current process, refusing while the
    /// recorded owner is still alive.
    pub fn acquire(&self) -> Result<(), InstanceLockError> {
        if let Some(owner) = self.current_owner()? {
            if owner != std::process::id() && pid_alive(owner) {
                return Err(InstanceLockError::AlreadyRunning(owner));
            }
        }
        std::fs::write(&self.path, std::process::id().to_string()).map_err(|source| {
            InstanceLockError::Io {
                path: self.path.display().to_string(),
                source,
            }
        })
    }

    fn current_owner(&self) -> Result<Option<u32>, InstanceLockError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(raw.trim().parse().ok()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(InstanceLockError::Io {
                path: self.path.display().to_string(),
                source,
            }),
        }
    }
}
