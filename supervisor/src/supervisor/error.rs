use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Top-level failures of the supervisor process itself.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("lost the bus connection")]
    BusLost,
    #[error("supervisor startup failed: {0}")]
    Startup(String),
}

/// Categorical error codes surfaced on the control plane and over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No contract, denied agent or denied action. Never retried.
    ContractViolation,
    /// A critical dependency failed all retries.
    DependencyUnavailable,
    /// Singleton collision, unknown agent, or a missing lifecycle target.
    LifecycleConflict,
    /// The process could not be launched.
    SpawnFailure,
    /// Bus or HTTP transport failure.
    TransportFailure,
}

/// Structured error record carried by response envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl Display for ErrorRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{:?}: {} ({context})", self.kind, self.detail),
            None => write!(f, "{:?}: {}", self.kind, self.detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let record = ErrorRecord::new(ErrorKind::DependencyUnavailable, "vector-db unreachable");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "dependency_unavailable");
        assert!(json.get("context").is_none());
    }

    #[test]
    fn context_round_trips() {
        let record = ErrorRecord::new(ErrorKind::LifecycleConflict, "collision")
            .with_context("AGT-NAMING-1");
        let json = serde_json::to_string(&record).unwrap();
        let back: ErrorRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
