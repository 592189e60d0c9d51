//! Client access contracts.
//!
//! YAML documents loaded once from a configured directory at gateway
//! startup, keyed by client id. Deny precedes allow; the `*` action admits
//! every action on its agent. Rate limits are parsed but not enforced.

use crate::supervisor::error::{ErrorKind, ErrorRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const WILDCARD_ACTION: &str = "*";

#[derive(Debug, Error)]
pub enum ContractLoadError {
    #[error("cannot read contracts directory `{0}`: {1}")]
    Directory(String, std::io::Error),
}

/// Authorization failures; every variant maps to `ContractViolation`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContractError {
    #[error("no contract for client `{0}`")]
    MissingContract(String),
    #[error("agent `{agent}` is forbidden for client `{client_id}`")]
    ForbiddenAgent { client_id: String, agent: String },
    #[error("agent `{agent}` is not in the contract of client `{client_id}`")]
    AgentNotAllowed { client_id: String, agent: String },
    #[error("action not permitted for this agent")]
    ActionNotAllowed {
        client_id: String,
        agent: String,
        action: String,
    },
}

impl ContractError {
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord::new(ErrorKind::ContractViolation, self.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientContract {
    pub client_id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub access_permissions: AccessPermissions,
    #[serde(default)]
    pub rate_limits: Option<RateLimits>,
    #[serde(default)]
    pub security: Option<SecuritySettings>,
    #[serde(default)]
    pub protocol: Option<ProtocolSettings>,
    #[serde(default)]
    pub monitoring: Option<MonitoringSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessPermissions {
    #[serde(default)]
    pub allowed_agents: HashMap<String, AgentPermission>,
    #[serde(default)]
    pub forbidden_agents: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentPermission {
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default)]
    pub requests_per_minute: u32,
    #[serde(default)]
    pub burst_limit: u32,
    #[serde(default)]
    pub concurrent_requests: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub authentication: Option<String>,
    #[serde(default)]
    pub authorization: Option<String>,
    #[serde(default)]
    pub require_https: bool,
    #[serde(default)]
    pub cors_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSettings {
    #[serde(default)]
    pub request_format: Option<String>,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSettings {
    #[serde(default)]
    pub log_requests: bool,
    #[serde(default)]
    pub log_responses: bool,
    #[serde(default)]
    pub track_usage_metrics: bool,
}

impl ClientContract {
    /// Authorizes one (agent, action) pair. Deny list first, then the
    /// allow map, then the per-agent action list.
    pub fn authorize(&self, agent: &str, action: &str) -> Result<(), ContractError> {
        if self
            .access_permissions
            .forbidden_agents
            .iter()
            .any(|forbidden| forbidden == agent)
        {
            return Err(ContractError::ForbiddenAgent {
                client_id: self.client_id.clone(),
                agent: agent.to_string(),
            });
        }

        let permission = self
            .access_permissions
            .allowed_agents
            .get(agent)
            .ok_or_else(|| ContractError::AgentNotAllowed {
                client_id: self.client_id.clone(),
                agent: agent.to_string(),
            })?;

        if permission
            .actions
            .iter()
            .any(|allowed| allowed == action || allowed == WILDCARD_ACTION)
        {
            Ok(())
        } else {
            Err(ContractError::ActionNotAllowed {
                client_id: self.client_id.clone(),
                agent: agent.to_string(),
                action: action.to_string(),
            })
        }
    }

    pub fn allowed_agents(&self) -> Vec<&str> {
        self.access_permissions
            .allowed_agents
            .keys()
            .map(String::as_str)
            .collect()
    }

    /// Per-contract forwarding timeout, falling back to the gateway default.
    pub fn forward_timeout(&self, default: Duration) -> Duration {
        self.protocol
            .as_ref()
            .and_then(|protocol| protocol.timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

/// All contracts known to the gateway, immutable after load.
#[derive(Debug, Default)]
pub struct ContractStore {
    contracts: HashMap<String, ClientContract>,
}

impl ContractStore {
    /// Loads every `.yaml`/`.yml` document in `dir`. Unreadable documents
    /// are skipped with a warning so one bad file cannot take the gateway
    /// down; a missing directory yields an empty store.
    pub fn load_dir(dir: &Path) -> Result<Self, ContractLoadError> {
        let mut contracts = HashMap::new();
        if !dir.exists() {
            warn!("contracts directory `{}` does not exist", dir.display());
            return Ok(Self { contracts });
        }

        let entries = std::fs::read_dir(dir)
            .map_err(|err| ContractLoadError::Directory(dir.display().to_string(), err))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(|err| err.to_string())
                .and_then(|raw| {
                    serde_yaml::from_str::<ClientContract>(&raw).map_err(|err| err.to_string())
                }) {
                Ok(contract) => {
                    info!(
                        client_id = %contract.client_id,
                        agents = contract.access_permissions.allowed_agents.len(),
                        "loaded client contract"
                    );
                    contracts.insert(contract.client_id.clone(), contract);
                }
                Err(err) => {
                    warn!("skipping unreadable contract `{}`: {err}", path.display());
                }
            }
        }
        Ok(Self { contracts })
    }

    pub fn from_contracts(contracts: impl IntoIterator<Item = ClientContract>) -> Self {
        Self {
            contracts: contracts
                .into_iter()
                .map(|contract| (contract.client_id.clone(), contract))
                .collect(),
        }
    }

    pub fn get(&self, client_id: &str) -> Result<&ClientContract, ContractError> {
        self.contracts
            .get(client_id)
            .ok_or_else(|| ContractError::MissingContract(client_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}
