//! Running-instance state and the records replicated to the shared store.

use crate::registry::definition::{AgentDefinition, AgentKind};
use crate::utils::time::unix_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// Mutable per-instance state held in the lifecycle manager's arena.
/// Timers and reapers reference instances by name, never by pointer.
#[derive(Debug, Clone)]
pub struct AgentProcess {
    /// Unique instance name: the agent name for persistent agents,
    /// `{agent}_{task_id}` for ephemeral ones.
    pub instance: String,
    pub agent: String,
    pub kind: AgentKind,
    pub definition: AgentDefinition,
    pub pid: u32,
    pub running: bool,
    pub started_at: SystemTime,
    pub last_heartbeat: SystemTime,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    /// False for instances registered via `register_running`, whose
    /// processes are owned by someone else.
    pub supervised: bool,
}

impl AgentProcess {
    pub fn status_view(&self) -> AgentStatusView {
        AgentStatusView {
            instance: self.instance.clone(),
            agent: self.agent.clone(),
            kind: self.kind,
            pid: self.pid,
            running: self.running,
            started_at: unix_timestamp(self.started_at),
            last_heartbeat: unix_timestamp(self.last_heartbeat),
            session_id: self.session_id.clone(),
            task_id: self.task_id.clone(),
        }
    }
}

/// Snapshot of one instance, serialized into control-plane responses and
/// discovery payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusView {
    pub instance: String,
    pub agent: String,
    pub kind: AgentKind,
    pub pid: u32,
    pub running: bool,
    pub started_at: i64,
    pub last_heartbeat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Entry of the shared `centerfire:agents:active:{agent}` hash, keyed by
/// `{manager_id}-{agent}`. Refreshed on every heartbeat; peers purge entries
/// whose heartbeat crossed the staleness threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveInstanceRecord {
    pub instance_id: String,
    pub agent: String,
    pub manager_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub started_at: i64,
    pub last_heartbeat: i64,
}

/// JSON blob at `centerfire:agents:running:{agent}` with a 24-hour TTL:
/// agent-submitted registration metadata merged with manager timestamps.
/// Lets discovery survive a supervisor restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningAgentRecord {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub endpoints: HashMap<String, String>,
    #[serde(default)]
    pub manager_id: String,
    pub registered_at: i64,
    pub last_heartbeat: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_view_reflects_process() {
        let now = SystemTime::now();
        let process = AgentProcess {
            instance: "AGT-CLEANUP-1_t1".to_string(),
            agent: "AGT-CLEANUP-1".to_string(),
            kind: AgentKind::Ephemeral,
            definition: AgentDefinition::default(),
            pid: 4242,
            running: true,
            started_at: now,
            last_heartbeat: now,
            session_id: None,
            task_id: Some("t1".to_string()),
            supervised: true,
        };

        let view = process.status_view();
        assert_eq!(view.instance, "AGT-CLEANUP-1_t1");
        assert_eq!(view.pid, 4242);
        assert_eq!(view.task_id.as_deref(), Some("t1"));
        assert_eq!(view.started_at, unix_timestamp(now));
    }

    #[test]
    fn active_record_json_field_names() {
        let record = ActiveInstanceRecord {
            instance_id: "01HVX".to_string(),
            agent: "AGT-NAMING-1".to_string(),
            manager_id: "mgr-1".to_string(),
            session_id: Some("s1".to_string()),
            started_at: 100,
            last_heartbeat: 200,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["manager_id"], "mgr-1");
        assert_eq!(json["last_heartbeat"], 200);
    }

    #[test]
    fn running_record_tolerates_sparse_payloads() {
        let record: RunningAgentRecord = serde_json::from_str(
            r#"{"agent":"AGT-NAMING-1","registered_at":1,"last_heartbeat":1}"#,
        )
        .unwrap();
        assert_eq!(record.pid, None);
        assert!(record.endpoints.is_empty());
    }
}
