//! Tracing subscriber setup for the supervisor process.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("invalid tracing filter: {0}")]
    Filter(String),
    #[error("could not install the tracing subscriber: {0}")]
    Init(String),
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TracingConfig {
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured
/// filter, matching the usual operator expectation.
pub fn try_init_tracing(config: TracingConfig) -> Result<(), TracingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&config.filter)?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| TracingError::Init(err.to_string()))
}

fn parse_filter(filter: &str) -> Result<EnvFilter, TracingError> {
    EnvFilter::try_new(filter).map_err(|err| TracingError::Filter(err.to_string()))
}
