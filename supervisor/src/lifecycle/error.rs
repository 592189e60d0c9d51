use super::command::CommandError;
use crate::bus::BusError;
use crate::supervisor::error::{ErrorKind, ErrorRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("agent `{0}` is not present in the registry")]
    UnknownAgent(String),
    #[error("agent `{0}` already has a live instance")]
    SingletonCollision(String),
    #[error("agent `{0}` is not running")]
    NotRunning(String),
    #[error("agent `{0}` is not ephemeral")]
    NotEphemeral(String),
    #[error("agent `{0}` has no executable configured")]
    NoExecutable(String),
    #[error("critical dependencies failed for `{agent}`: {detail}")]
    DependencyUnavailable { agent: String, detail: String },
    #[error("could not spawn `{agent}`: {source}")]
    Spawn {
        agent: String,
        #[source]
        source: CommandError,
    },
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl LifecycleError {
    /// Maps onto the categorical error record surfaced to callers.
    pub fn to_record(&self) -> ErrorRecord {
        match self {
            LifecycleError::UnknownAgent(agent)
            | LifecycleError::SingletonCollision(agent)
            | LifecycleError::NotRunning(agent)
            | LifecycleError::NotEphemeral(agent)
            | LifecycleError::NoExecutable(agent) => {
                ErrorRecord::new(ErrorKind::LifecycleConflict, self.to_string())
                    .with_context(agent.clone())
            }
            LifecycleError::DependencyUnavailable { agent, .. } => {
                ErrorRecord::new(ErrorKind::DependencyUnavailable, self.to_string())
                    .with_context(agent.clone())
            }
            LifecycleError::Spawn { agent, .. } => {
                ErrorRecord::new(ErrorKind::SpawnFailure, self.to_string())
                    .with_context(agent.clone())
            }
            LifecycleError::Bus(_) => {
                ErrorRecord::new(ErrorKind::TransportFailure, self.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_kinds_follow_the_error_taxonomy() {
        assert_eq!(
            LifecycleError::SingletonCollision("a".into()).to_record().kind,
            ErrorKind::LifecycleConflict
        );
        assert_eq!(
            LifecycleError::DependencyUnavailable {
                agent: "a".into(),
                detail: "vector-db: down".into()
            }
            .to_record()
            .kind,
            ErrorKind::DependencyUnavailable
        );
        assert_eq!(
            LifecycleError::Bus(BusError::Disconnected("gone".into()))
                .to_record()
                .kind,
            ErrorKind::TransportFailure
        );
    }
}
