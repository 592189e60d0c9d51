//! Supervisor configuration.
//!
//! Loaded from an optional YAML file merged with `CF_SUPERVISOR`-prefixed
//! environment variables. Durations accept humanized strings ("30s", "2m").

use super::defaults::{
    DEFAULT_DISCOVERY_PORT, DEFAULT_FORWARD_TIMEOUT, DEFAULT_GATEWAY_BASE_PORT,
    DEFAULT_GATEWAY_PORT_SPAN, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT,
    DEFAULT_RESTART_DELAY, DEFAULT_SHUTDOWN_GRACE, DEFAULT_STALENESS_THRESHOLD,
};
use crate::registry::definition::AgentDefinition;
use config::{Config, Environment, File};
use duration_str::deserialize_duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "CF_SUPERVISOR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error loading the supervisor config: {0}")]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SupervisorConfig {
    /// Identity of this supervisor in shared records. Generated per process
    /// when unset.
    #[serde(default)]
    pub manager_id: Option<String>,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub dependencies: DependencyConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Grace window between SIGTERM and SIGKILL when stopping agents.
    #[serde(default)]
    pub shutdown_grace: ShutdownGrace,
    /// Extra agent definitions merged over the embedded catalog.
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

impl SupervisorConfig {
    /// Loads configuration from the given file (when present) merged with
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HeartbeatConfig {
    /// Monitor sweep period.
    #[serde(default)]
    pub interval: HeartbeatInterval,
    /// A running agent whose heartbeat is older than this is suspect.
    #[serde(default)]
    pub timeout: HeartbeatTimeout,
    /// Shared active-instance records older than this are purged when
    /// counting live instances.
    #[serde(default)]
    pub staleness_threshold: StalenessThreshold,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: HeartbeatInterval::default(),
            timeout: HeartbeatTimeout::default(),
            staleness_threshold: StalenessThreshold::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RestartConfig {
    /// Delay before the automatic dependency-validated restart.
    #[serde(default)]
    pub delay: RestartDelay,
    /// Consecutive automatic restarts attempted before giving up.
    #[serde(default = "default_restart_attempts")]
    pub max_attempts: usize,
}

fn default_restart_attempts() -> usize {
    3
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            delay: RestartDelay::default(),
            max_attempts: default_restart_attempts(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DependencyConfig {
    /// Stop probing on the first critical failure instead of producing a
    /// complete report.
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_discovery_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    /// First port probed; binding walks upward from here.
    #[serde(default = "default_gateway_base_port")]
    pub base_port: u16,
    #[serde(default = "default_gateway_port_span")]
    pub port_span: u16,
    /// Directory holding client contract YAML documents.
    #[serde(default = "default_contracts_dir")]
    pub contracts_dir: PathBuf,
    /// Bound on waiting for a correlated agent response.
    #[serde(default)]
    pub forward_timeout: ForwardTimeout,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            base_port: default_gateway_base_port(),
            port_span: default_gateway_port_span(),
            contracts_dir: default_contracts_dir(),
            forward_timeout: ForwardTimeout::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter, overridden by `RUST_LOG`.
    #[serde(default)]
    pub level: Option<String>,
    /// When set, supervised agents' stdout/stderr are appended to files in
    /// this directory.
    #[serde(default)]
    pub agent_log_dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_gateway_base_port() -> u16 {
    DEFAULT_GATEWAY_BASE_PORT
}

fn default_gateway_port_span() -> u16 {
    DEFAULT_GATEWAY_PORT_SPAN
}

fn default_contracts_dir() -> PathBuf {
    PathBuf::from("contracts")
}

macro_rules! duration_wrapper {
    ($(#[$doc:meta])* $name:ident, $default:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
        pub struct $name(#[serde(deserialize_with = "deserialize_duration")] Duration);

        impl Default for $name {
            fn default() -> Self {
                Self($default)
            }
        }

        impl From<$name> for Duration {
            fn from(value: $name) -> Duration {
                value.0
            }
        }

        impl From<Duration> for $name {
            fn from(value: Duration) -> Self {
                Self(value)
            }
        }
    };
}

duration_wrapper!(HeartbeatInterval, DEFAULT_HEARTBEAT_INTERVAL);
duration_wrapper!(HeartbeatTimeout, DEFAULT_HEARTBEAT_TIMEOUT);
duration_wrapper!(StalenessThreshold, DEFAULT_STALENESS_THRESHOLD);
duration_wrapper!(RestartDelay, DEFAULT_RESTART_DELAY);
duration_wrapper!(ForwardTimeout, DEFAULT_FORWARD_TIMEOUT);
duration_wrapper!(ShutdownGrace, DEFAULT_SHUTDOWN_GRACE);
