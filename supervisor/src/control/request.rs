//! Typed request envelopes for the manager channel.
//!
//! Every message carries a `request_type` discriminator and explicit
//! per-variant fields; unknown discriminators fail decoding instead of
//! being key-probed.

use crate::registry::definition::AgentDefinition;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum ManagerRequest {
    StartAgent {
        agent_name: String,
        #[serde(default)]
        session_data: Option<Value>,
        #[serde(default)]
        dependency_check: Option<bool>,
        #[serde(default)]
        force_restart: Option<bool>,
        #[serde(default)]
        request_id: Option<String>,
    },
    StopAgent {
        agent_name: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    RestartAgent {
        agent_name: String,
        #[serde(default)]
        session_data: Option<Value>,
        #[serde(default)]
        request_id: Option<String>,
    },
    ListAgents {
        #[serde(default)]
        request_id: Option<String>,
    },
    AgentStatus {
        agent_name: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    CheckCollisions {
        #[serde(default)]
        request_id: Option<String>,
    },
    CheckAgentCollision {
        agent_name: String,
        /// PID of the booting agent asking about itself.
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        request_id: Option<String>,
    },
    RegisterRunning {
        agent_name: String,
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        service_type: Option<String>,
        #[serde(default)]
        endpoints: Option<HashMap<String, String>>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
    },
    UnregisterRunning {
        agent_name: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    Heartbeat {
        agent_name: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    SessionRestore {
        session_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    RegisterAgent {
        agent_def: AgentDefinition,
        #[serde(default)]
        request_id: Option<String>,
    },
    ListRegistry {
        #[serde(default)]
        request_id: Option<String>,
    },
    GetAgentDefinition {
        agent_name: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    SpawnEphemeral {
        agent_name: String,
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        task_data: Option<Value>,
        #[serde(default)]
        request_id: Option<String>,
    },
    CheckDependencies {
        agent_name: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    ValidateServiceHealth {
        agent_name: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    RestartWithDependencies {
        agent_name: String,
        #[serde(default)]
        force_restart: Option<bool>,
        #[serde(default)]
        request_id: Option<String>,
    },
}

impl ManagerRequest {
    /// The wire-level discriminator, for logs and worker thread names.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ManagerRequest::StartAgent { .. } => "start_agent",
            ManagerRequest::StopAgent { .. } => "stop_agent",
            ManagerRequest::RestartAgent { .. } => "restart_agent",
            ManagerRequest::ListAgents { .. } => "list_agents",
            ManagerRequest::AgentStatus { .. } => "agent_status",
            ManagerRequest::CheckCollisions { .. } => "check_collisions",
            ManagerRequest::CheckAgentCollision { .. } => "check_agent_collision",
            ManagerRequest::RegisterRunning { .. } => "register_running",
            ManagerRequest::UnregisterRunning { .. } => "unregister_running",
            ManagerRequest::Heartbeat { .. } => "heartbeat",
            ManagerRequest::SessionRestore { .. } => "session_restore",
            ManagerRequest::RegisterAgent { .. } => "register_agent",
            ManagerRequest::ListRegistry { .. } => "list_registry",
            ManagerRequest::GetAgentDefinition { .. } => "get_agent_definition",
            ManagerRequest::SpawnEphemeral { .. } => "spawn_ephemeral",
            ManagerRequest::CheckDependencies { .. } => "check_dependencies",
            ManagerRequest::ValidateServiceHealth { .. } => "validate_service_health",
            ManagerRequest::RestartWithDependencies { .. } => "restart_with_dependencies",
        }
    }

    /// Requests that may block on probes, spawns or grace windows, and are
    /// therefore dispatched to worker threads.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            ManagerRequest::StartAgent { .. }
                | ManagerRequest::StopAgent { .. }
                | ManagerRequest::RestartAgent { .. }
                | ManagerRequest::SpawnEphemeral { .. }
                | ManagerRequest::CheckDependencies { .. }
                | ManagerRequest::ValidateServiceHealth { .. }
                | ManagerRequest::RestartWithDependencies { .. }
                | ManagerRequest::SessionRestore { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn decodes_start_agent_with_options() {
        let request: ManagerRequest = serde_json::from_str(
            r#"{
                "request_type": "start_agent",
                "agent_name": "AGT-NAMING-1",
                "dependency_check": false,
                "force_restart": true,
                "request_id": "r1"
            }"#,
        )
        .unwrap();
        assert_matches!(request, ManagerRequest::StartAgent {
            agent_name,
            dependency_check: Some(false),
            force_restart: Some(true),
            request_id: Some(request_id),
            ..
        } => {
            assert_eq!(agent_name, "AGT-NAMING-1");
            assert_eq!(request_id, "r1");
        });
    }

    #[test]
    fn decodes_minimal_heartbeat() {
        let request: ManagerRequest = serde_json::from_str(
            r#"{"request_type":"heartbeat","agent_name":"AGT-NAMING-1"}"#,
        )
        .unwrap();
        assert_matches!(request, ManagerRequest::Heartbeat { request_id: None, .. });
        assert!(!request.is_blocking());
    }

    #[test]
    fn unknown_discriminator_fails() {
        let result =
            serde_json::from_str::<ManagerRequest>(r#"{"request_type":"frobnicate"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn missing_discriminator_fails() {
        let result = serde_json::from_str::<ManagerRequest>(r#"{"agent_name":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn register_agent_embeds_a_definition() {
        let request: ManagerRequest = serde_json::from_str(
            r#"{
                "request_type": "register_agent",
                "agent_def": {"name": "AGT-NEW-1", "kind": "ephemeral", "max_runtime_seconds": 60}
            }"#,
        )
        .unwrap();
        assert_matches!(request, ManagerRequest::RegisterAgent { agent_def, .. } => {
            assert_eq!(agent_def.name, "AGT-NEW-1");
            assert!(agent_def.is_ephemeral());
        });
    }

    #[test]
    fn blocking_classification() {
        let start: ManagerRequest = serde_json::from_str(
            r#"{"request_type":"start_agent","agent_name":"a"}"#,
        )
        .unwrap();
        let list: ManagerRequest =
            serde_json::from_str(r#"{"request_type":"list_agents"}"#).unwrap();
        assert!(start.is_blocking());
        assert!(!list.is_blocking());
    }
}
