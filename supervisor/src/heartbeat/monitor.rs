//! The periodic heartbeat sweep.
//!
//! Runs on the supervisor loop's ticker. A record is only acted on when
//! both signals agree: the heartbeat is stale *and* the PID probe confirms
//! the process is gone. A live process with a stale heartbeat is logged and
//! left alone.

use super::pid::pid_alive;
use crate::lifecycle::manager::LifecycleManager;
use crate::registry::definition::AgentKind;
use std::time::Duration;
use tracing::{debug, warn};

pub struct HeartbeatMonitor {
    heartbeat_timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self { heartbeat_timeout }
    }

    /// One sweep over the running map. Returns the persistent agents that
    /// were purged, i.e. the candidates for an automatic restart.
    pub fn sweep(&self, manager: &LifecycleManager) -> Vec<String> {
        let mut restart_candidates = Vec::new();
        for (instance, pid) in manager.collect_stale(self.heartbeat_timeout) {
            if pid != 0 && pid_alive(pid) {
                debug!(%instance, pid, "heartbeat stale but pid is alive, leaving intact");
                continue;
            }
            let Some(process) = manager.purge_dead(&instance) else {
                continue;
            };
            if process.kind == AgentKind::Persistent {
                restart_candidates.push(process.agent);
            } else {
                warn!(agent = %process.agent, %instance, "ephemeral instance died silently");
            }
        }
        restart_candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusAdapter;
    use crate::bus::in_memory::InMemoryBus;
    use crate::dependency::checker::DependencyChecker;
    use crate::event::LifecycleEvent;
    use crate::event::channel::{EventConsumer, pub_sub};
    use crate::lifecycle::manager::LifecycleSettings;
    use crate::registry::AgentRegistry;
    use crate::registry::definition::AgentDefinition;
    use crate::supervisor::defaults::running_agent_key;
    use std::collections::HashMap;
    use std::sync::Arc;

    const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

    fn manager() -> (Arc<LifecycleManager>, EventConsumer<LifecycleEvent>, Arc<InMemoryBus>) {
        let bus = Arc::new(InMemoryBus::new());
        let registry = Arc::new(AgentRegistry::from_definitions([AgentDefinition {
            name: "AGT-NAMING-1".to_string(),
            ..Default::default()
        }]));
        let (publisher, consumer) = pub_sub();
        let manager = LifecycleManager::new(
            registry,
            bus.clone(),
            DependencyChecker::new(bus.clone(), HEARTBEAT_TIMEOUT, false),
            "mgr-test".to_string(),
            LifecycleSettings {
                shutdown_grace: Duration::from_secs(1),
                heartbeat_timeout: HEARTBEAT_TIMEOUT,
                staleness_threshold: Duration::from_secs(30),
                agent_log_dir: None,
            },
            publisher,
        );
        (Arc::new(manager), consumer, bus)
    }

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn fresh_heartbeats_are_left_alone() {
        let (manager, _events, _bus) = manager();
        manager
            .register_running("AGT-NAMING-1", Some(dead_pid()), None, None, HashMap::new(), None)
            .unwrap();

        let monitor = HeartbeatMonitor::new(HEARTBEAT_TIMEOUT);
        assert!(monitor.sweep(&manager).is_empty());
        assert_eq!(manager.agents_count(), 1);
    }

    #[test]
    fn stale_heartbeat_with_dead_pid_purges_and_nominates_restart() {
        let (manager, _events, bus) = manager();
        manager
            .register_running("AGT-NAMING-1", Some(dead_pid()), None, None, HashMap::new(), None)
            .unwrap();
        assert!(bus.get(&running_agent_key("AGT-NAMING-1")).unwrap().is_some());

        // Sweep with a zero timeout: every heartbeat is stale.
        let monitor = HeartbeatMonitor::new(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(10));
        let candidates = monitor.sweep(&manager);

        assert_eq!(candidates, vec!["AGT-NAMING-1".to_string()]);
        assert_eq!(manager.agents_count(), 0);
        assert!(bus.get(&running_agent_key("AGT-NAMING-1")).unwrap().is_none());
    }

    #[test]
    #[tracing_test::traced_test]
    fn stale_heartbeat_with_live_pid_is_not_purged() {
        let (manager, _events, _bus) = manager();
        manager
            .register_running(
                "AGT-NAMING-1",
                Some(std::process::id()),
                None,
                None,
                HashMap::new(),
                None,
            )
            .unwrap();

        let monitor = HeartbeatMonitor::new(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(10));
        assert!(monitor.sweep(&manager).is_empty());
        assert_eq!(manager.agents_count(), 1);
        assert!(tracing_test::internal::logs_with_scope_contain(
            "centerfire_supervisor::heartbeat::monitor",
            "heartbeat stale but pid is alive",
        ));
    }
}
