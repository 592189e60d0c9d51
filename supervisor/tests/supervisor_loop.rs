//! End-to-end tests driving a live supervisor loop over a shared bus:
//! control-plane lifecycle, the collision handshake, ephemeral runtime
//! bounds and the automatic dependency-validated restart.

use centerfire_supervisor::bus::in_memory::InMemoryBus;
use centerfire_supervisor::bus::{BusAdapter, BusSubscription};
use centerfire_supervisor::event::ApplicationEvent;
use centerfire_supervisor::event::channel::{EventPublisher, pub_sub};
use centerfire_supervisor::registry::definition::{AgentDefinition, AgentKind, ExecSpec};
use centerfire_supervisor::supervisor::config::{
    DiscoveryConfig, GatewayConfig, HeartbeatConfig, RestartConfig, SupervisorConfig,
};
use centerfire_supervisor::supervisor::defaults::{
    MANAGER_REQUEST_CHANNEL, MANAGER_RESPONSE_CHANNEL, agent_response_channel,
};
use centerfire_supervisor::supervisor::run::SupervisorRunner;
use serde_json::Value;
use serial_test::serial;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

struct TestSupervisor {
    bus: Arc<InMemoryBus>,
    responses: BusSubscription,
    stop_publisher: EventPublisher<ApplicationEvent>,
    thread: Option<JoinHandle<()>>,
}

impl TestSupervisor {
    fn start(agents: Vec<AgentDefinition>) -> Self {
        let config = SupervisorConfig {
            manager_id: Some("mgr-e2e".to_string()),
            heartbeat: HeartbeatConfig {
                // A fast sweep so dead agents are noticed within a test run.
                interval: Duration::from_millis(500).into(),
                timeout: Duration::from_secs(1).into(),
                staleness_threshold: Duration::from_secs(30).into(),
            },
            restart: RestartConfig {
                delay: Duration::from_millis(200).into(),
                max_attempts: 2,
            },
            discovery: DiscoveryConfig {
                enabled: false,
                ..Default::default()
            },
            gateway: GatewayConfig {
                enabled: false,
                ..Default::default()
            },
            shutdown_grace: Duration::from_secs(1).into(),
            agents,
            ..Default::default()
        };

        let bus = Arc::new(InMemoryBus::new());
        let responses = bus.subscribe(MANAGER_RESPONSE_CHANNEL).unwrap();
        let (stop_publisher, stop_consumer) = pub_sub();
        let runner = SupervisorRunner::with_bus(config, bus.clone(), stop_consumer).unwrap();
        let thread = std::thread::spawn(move || {
            runner.run().unwrap();
        });

        Self {
            bus,
            responses,
            stop_publisher,
            thread: Some(thread),
        }
    }

    fn request(&self, payload: &str) {
        self.bus
            .publish(MANAGER_REQUEST_CHANNEL, payload.as_bytes())
            .unwrap();
    }

    /// Next response correlated by request id, skipping events and other
    /// callers' traffic.
    fn await_response(&self, request_id: &str) -> Value {
        self.await_matching(|value| {
            value.get("request_id").and_then(Value::as_str) == Some(request_id)
        })
    }

    /// Next lifecycle event with the given name.
    fn await_event(&self, event: &str) -> Value {
        self.await_matching(|value| value.get("event").and_then(Value::as_str) == Some(event))
    }

    fn await_matching(&self, matches: impl Fn(&Value) -> bool) -> Value {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let remaining = deadline
                .checked_duration_since(std::time::Instant::now())
                .expect("timed out waiting for a bus message");
            let message = self
                .responses
                .recv_timeout(remaining)
                .unwrap()
                .expect("response channel went quiet");
            let value: Value = serde_json::from_slice(&message.payload).unwrap();
            if matches(&value) {
                return value;
            }
        }
    }
}

impl Drop for TestSupervisor {
    fn drop(&mut self) {
        let _ = self.stop_publisher.publish(ApplicationEvent::StopRequested);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn sleeper(name: &str) -> AgentDefinition {
    AgentDefinition {
        name: name.to_string(),
        exec: Some(ExecSpec {
            bin: "sleep".to_string(),
            args: vec!["30".to_string()],
            env: HashMap::new(),
        }),
        ..Default::default()
    }
}

fn cleanup_task(max_runtime_seconds: u64) -> AgentDefinition {
    AgentDefinition {
        name: "AGT-CLEANUP-1".to_string(),
        kind: AgentKind::Ephemeral,
        max_runtime_seconds,
        exec: Some(ExecSpec {
            bin: "sleep".to_string(),
            args: vec!["30".to_string()],
            env: HashMap::new(),
        }),
        ..Default::default()
    }
}

#[test]
#[serial]
fn lifecycle_round_trip_over_the_control_plane() {
    let supervisor = TestSupervisor::start(vec![sleeper("AGT-NAMING-1")]);

    supervisor.request(
        r#"{"request_type":"start_agent","agent_name":"AGT-NAMING-1","request_id":"r1"}"#,
    );
    let started = supervisor.await_response("r1");
    assert_eq!(started["success"], true);
    let first_pid = started["data"]["agent"]["pid"].as_u64().unwrap();
    assert!(first_pid > 0);

    supervisor.request(r#"{"request_type":"list_agents","request_id":"r2"}"#);
    let listing = supervisor.await_response("r2");
    assert_eq!(listing["data"]["count"], 1);

    supervisor.request(
        r#"{"request_type":"heartbeat","agent_name":"AGT-NAMING-1","request_id":"r3"}"#,
    );
    assert_eq!(supervisor.await_response("r3")["success"], true);

    supervisor.request(
        r#"{"request_type":"stop_agent","agent_name":"AGT-NAMING-1","request_id":"r4"}"#,
    );
    assert_eq!(supervisor.await_response("r4")["success"], true);

    // Start again: a fresh instance with a fresh pid.
    supervisor.request(
        r#"{"request_type":"start_agent","agent_name":"AGT-NAMING-1","request_id":"r5"}"#,
    );
    let restarted = supervisor.await_response("r5");
    assert_eq!(restarted["success"], true);
    assert_ne!(restarted["data"]["agent"]["pid"].as_u64().unwrap(), first_pid);
}

#[test]
#[serial]
fn collision_handshake_admits_exactly_one_instance() {
    let supervisor = TestSupervisor::start(vec![sleeper("AGT-NAMING-1")]);
    let handshakes = supervisor
        .bus
        .subscribe(&agent_response_channel("AGT-NAMING-1"))
        .unwrap();

    // Two would-be instances register; the supervisor's own pid stands in
    // for a live process, a reaped child's pid for the loser.
    let live_pid = std::process::id();
    supervisor.request(&format!(
        r#"{{"request_type":"register_running","agent_name":"AGT-NAMING-1","pid":{live_pid},"request_id":"reg1"}}"#,
    ));
    assert_eq!(supervisor.await_response("reg1")["success"], true);
    supervisor.request(&format!(
        r#"{{"request_type":"register_running","agent_name":"AGT-NAMING-1","pid":{},"request_id":"reg2"}}"#,
        live_pid + 1
    ));
    // The second registration does not displace the first.
    let second = supervisor.await_response("reg2");
    assert_eq!(second["data"]["agent"]["pid"].as_u64().unwrap() as u32, live_pid);

    // First instance asks about itself: no collision.
    supervisor.request(&format!(
        r#"{{"request_type":"check_agent_collision","agent_name":"AGT-NAMING-1","pid":{live_pid}}}"#,
    ));
    let reply = handshakes
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .expect("handshake reply");
    let reply: Value = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(reply["collision"], false);

    // Second instance must self-terminate.
    supervisor.request(&format!(
        r#"{{"request_type":"check_agent_collision","agent_name":"AGT-NAMING-1","pid":{}}}"#,
        live_pid + 1
    ));
    let reply = handshakes
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .expect("handshake reply");
    let reply: Value = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(reply["collision"], true);
}

#[test]
#[serial]
fn ephemeral_instances_are_killed_at_their_runtime_bound() {
    let supervisor = TestSupervisor::start(vec![cleanup_task(1)]);

    supervisor.request(
        r#"{"request_type":"spawn_ephemeral","agent_name":"AGT-CLEANUP-1","task_id":"t1","request_id":"r1"}"#,
    );
    let spawned = supervisor.await_response("r1");
    assert_eq!(spawned["success"], true);
    assert_eq!(spawned["data"]["agent"]["instance"], "AGT-CLEANUP-1_t1");

    // The timeout event precedes the completion event.
    let timeout = supervisor.await_event("ephemeral_timeout");
    assert_eq!(timeout["agent"], "AGT-CLEANUP-1");
    assert_eq!(timeout["task_id"], "t1");
    assert_eq!(timeout["max_runtime"], 1);

    let completed = supervisor.await_event("ephemeral_completed");
    assert_eq!(completed["instance"], "AGT-CLEANUP-1_t1");

    // The instance is gone from the local map.
    supervisor.request(r#"{"request_type":"list_agents","request_id":"r2"}"#);
    assert_eq!(supervisor.await_response("r2")["data"]["count"], 0);
}

#[test]
#[serial]
fn dead_agent_is_purged_and_restarted_with_a_fresh_pid() {
    let supervisor = TestSupervisor::start(vec![sleeper("AGT-NAMING-1")]);

    // An externally registered agent whose process is already gone.
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();
    supervisor.request(&format!(
        r#"{{"request_type":"register_running","agent_name":"AGT-NAMING-1","pid":{dead_pid},"request_id":"reg"}}"#,
    ));
    assert_eq!(supervisor.await_response("reg")["success"], true);

    // The sweep notices the stale heartbeat, confirms the pid is dead,
    // purges the record and schedules the dependency-validated restart.
    let alert = supervisor.await_event("agent_dead");
    assert_eq!(alert["agent"], "AGT-NAMING-1");

    let restarted = supervisor.await_event("agent_restarted");
    assert_eq!(restarted["agent"], "AGT-NAMING-1");

    supervisor.request(
        r#"{"request_type":"agent_status","agent_name":"AGT-NAMING-1","request_id":"r1"}"#,
    );
    let status = supervisor.await_response("r1");
    assert_eq!(status["success"], true);
    let new_pid = status["data"]["agent"]["pid"].as_u64().unwrap() as u32;
    assert_ne!(new_pid, dead_pid);
    assert!(new_pid > 0);
}

#[test]
#[serial]
fn fresh_heartbeats_suppress_the_automatic_restart() {
    let supervisor = TestSupervisor::start(vec![sleeper("AGT-NAMING-1")]);

    supervisor.request(
        r#"{"request_type":"start_agent","agent_name":"AGT-NAMING-1","request_id":"r1"}"#,
    );
    let started = supervisor.await_response("r1");
    let pid = started["data"]["agent"]["pid"].as_u64().unwrap();

    // Keep heartbeating for a few sweep periods; the pid must not change.
    for i in 0..4 {
        std::thread::sleep(Duration::from_millis(400));
        supervisor.request(&format!(
            r#"{{"request_type":"heartbeat","agent_name":"AGT-NAMING-1","request_id":"hb{i}"}}"#,
        ));
        supervisor.await_response(&format!("hb{i}"));
    }

    supervisor.request(
        r#"{"request_type":"agent_status","agent_name":"AGT-NAMING-1","request_id":"r2"}"#,
    );
    let status = supervisor.await_response("r2");
    assert_eq!(status["data"]["agent"]["pid"].as_u64().unwrap(), pid);
}
