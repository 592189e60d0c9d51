use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

/// Immutable description of a known agent: what it is, how to launch it and
/// what it needs to be healthy. Held by the registry; running state lives in
/// the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: AgentKind,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Declared capability tags, surfaced through discovery.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub auto_shutdown: bool,
    /// Hard wall-clock bound for ephemeral instances. Zero means unlimited.
    #[serde(default)]
    pub max_runtime_seconds: u64,
    /// Persistent agents default to singleton; set to false for definitions
    /// that may run replicated.
    #[serde(default = "default_singleton")]
    pub singleton: bool,
    /// Probed in declaration order before the agent is started.
    #[serde(default)]
    pub dependencies: Vec<ServiceDependency>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    /// How to launch the agent. Definitions without an executable can only
    /// be registered externally via `register_running`.
    #[serde(default)]
    pub exec: Option<ExecSpec>,
}

fn default_singleton() -> bool {
    true
}

impl Default for AgentDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            kind: AgentKind::default(),
            working_dir: None,
            capabilities: Vec::new(),
            auto_shutdown: false,
            max_runtime_seconds: 0,
            singleton: default_singleton(),
            dependencies: Vec::new(),
            health_check: None,
            exec: None,
        }
    }
}

impl AgentDefinition {
    pub fn is_singleton(&self) -> bool {
        self.kind == AgentKind::Persistent && self.singleton
    }

    pub fn is_ephemeral(&self) -> bool {
        self.kind == AgentKind::Ephemeral
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    Persistent,
    Ephemeral,
}

impl Display for AgentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Persistent => write!(f, "persistent"),
            AgentKind::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

/// Command line used to spawn the agent process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecSpec {
    pub bin: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A named external resource whose availability is a precondition for
/// starting an agent. The meaning of `endpoint` depends on `kind`: a store
/// or HTTP address for infrastructure, an agent identifier for agents, a
/// container name for containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDependency {
    pub service: String,
    pub kind: DependencyKind,
    pub endpoint: String,
    #[serde(default = "default_critical")]
    pub critical: bool,
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
}

fn default_critical() -> bool {
    true
}

fn default_retry_count() -> usize {
    3
}

fn default_retry_delay() -> u64 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Infrastructure,
    Agent,
    Container,
}

/// Periodic validation settings for infrastructure dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_count")]
    pub retries: usize,
}

fn default_health_interval() -> u64 {
    60
}

fn default_health_timeout() -> u64 {
    5
}
