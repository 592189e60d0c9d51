//! Channel names, store keys, environment variables and default timings.

use std::time::Duration;

// Control plane channels.
pub const MANAGER_REQUEST_CHANNEL: &str = "centerfire:agent:manager";
pub const MANAGER_RESPONSE_CHANNEL: &str = "centerfire:agent:manager:responses";

/// Per-agent response channel used for collision handshake replies.
pub fn agent_response_channel(agent: &str) -> String {
    format!("centerfire:agent:manager:response:{agent}")
}

// Gateway forwarding topics.
pub fn agent_request_topic(agent: &str) -> String {
    format!("agent.{agent}.request")
}

pub fn agent_response_topic(agent: &str) -> String {
    format!("agent.{agent}.response")
}

// Shared store keys.
pub fn active_instances_key(agent: &str) -> String {
    format!("centerfire:agents:active:{agent}")
}

pub fn active_instance_field(manager_id: &str, agent: &str) -> String {
    format!("{manager_id}-{agent}")
}

pub fn running_agent_key(agent: &str) -> String {
    format!("centerfire:agents:running:{agent}")
}

pub fn session_key(session_id: &str) -> String {
    format!("centerfire.dev.sessions:{session_id}")
}

/// Observability stream carrying lifecycle events; readers are external.
pub const EVENTS_STREAM: &str = "centerfire:agents:events";

// Environment variables injected into spawned agents.
pub const ENV_SESSION_ID: &str = "SESSION_ID";
pub const ENV_RESTORE_CONTEXT: &str = "RESTORE_CONTEXT";
pub const ENV_AGENT_TYPE: &str = "AGENT_TYPE";
pub const ENV_TASK_ID: &str = "TASK_ID";
pub const ENV_TASK_DATA: &str = "TASK_DATA";

// Timings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);
/// Active-instance records with heartbeats older than this are purged when
/// counting live instances across supervisors.
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(30);
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);
pub const RUNNING_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// HTTP facets.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8380;
pub const DEFAULT_GATEWAY_BASE_PORT: u16 = 8090;
/// Number of consecutive ports probed when binding the gateway facet.
pub const DEFAULT_GATEWAY_PORT_SPAN: u16 = 16;
