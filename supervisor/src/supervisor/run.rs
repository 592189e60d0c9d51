//! Builds and wires every supervisor component from the configuration.

use super::Supervisor;
use super::config::SupervisorConfig;
use super::defaults::MANAGER_REQUEST_CHANNEL;
use super::error::SupervisorError;
use crate::bus::BusAdapter;
use crate::bus::in_memory::InMemoryBus;
use crate::control::ControlPlane;
use crate::dependency::checker::DependencyChecker;
use crate::discovery::{DiscoveryState, discovery_server};
use crate::event::ApplicationEvent;
use crate::event::channel::{EventConsumer, pub_sub};
use crate::gateway::contracts::ContractStore;
use crate::gateway::server::{GatewayState, gateway_server};
use crate::heartbeat::monitor::HeartbeatMonitor;
use crate::httpd::{HttpServerRunner, StartedHttpServer};
use crate::lifecycle::manager::{LifecycleManager, LifecycleSettings};
use crate::registry::AgentRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info};
use ulid::Ulid;

/// Owns the fully wired supervisor. Construction starts the HTTP facets;
/// `run` enters the event loop.
pub struct SupervisorRunner {
    supervisor: Supervisor,
}

impl SupervisorRunner {
    pub fn new(
        config: SupervisorConfig,
        application_event_consumer: EventConsumer<ApplicationEvent>,
    ) -> Result<Self, SupervisorError> {
        Self::with_bus(config, Arc::new(InMemoryBus::new()), application_event_consumer)
    }

    /// Wires the supervisor onto a caller-provided bus. This is how tests
    /// (and embedders bringing their own store) share the coordination
    /// surface with the supervisor.
    pub fn with_bus(
        config: SupervisorConfig,
        bus: Arc<dyn BusAdapter>,
        application_event_consumer: EventConsumer<ApplicationEvent>,
    ) -> Result<Self, SupervisorError> {
        let manager_id = config
            .manager_id
            .clone()
            .unwrap_or_else(|| format!("mgr-{}", Ulid::new()));
        info!(%manager_id, "initializing the supervisor");

        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .map_err(|err| SupervisorError::Startup(err.to_string()))?,
        );

        let registry = Arc::new(
            AgentRegistry::with_builtin(config.agents.clone())
                .map_err(|err| SupervisorError::Startup(err.to_string()))?,
        );

        let heartbeat_timeout: Duration = config.heartbeat.timeout.into();
        let checker = DependencyChecker::new(
            bus.clone(),
            heartbeat_timeout,
            config.dependencies.fail_fast,
        );

        let (lifecycle_publisher, lifecycle_consumer) = pub_sub();
        let manager = Arc::new(LifecycleManager::new(
            registry,
            bus.clone(),
            checker,
            manager_id,
            LifecycleSettings {
                shutdown_grace: config.shutdown_grace.into(),
                heartbeat_timeout,
                staleness_threshold: config.heartbeat.staleness_threshold.into(),
                agent_log_dir: config.logging.agent_log_dir.clone(),
            },
            lifecycle_publisher.clone(),
        ));

        let request_subscription = bus
            .subscribe(MANAGER_REQUEST_CHANNEL)
            .map_err(|err| SupervisorError::Startup(err.to_string()))?;
        let control = ControlPlane::new(bus.clone(), manager.clone());
        let monitor = HeartbeatMonitor::new(heartbeat_timeout);

        let discovery = start_discovery(&config, &runtime, &manager)?;
        let gateway = start_gateway(&config, &runtime, &bus, &manager)?;

        Ok(Self {
            supervisor: Supervisor::new(
                manager,
                control,
                monitor,
                request_subscription,
                lifecycle_consumer,
                lifecycle_publisher,
                application_event_consumer,
                config.heartbeat.interval.into(),
                config.restart.clone(),
                discovery,
                gateway,
            ),
        })
    }

    pub fn run(self) -> Result<(), SupervisorError> {
        self.supervisor.run()
    }
}

fn start_discovery(
    config: &SupervisorConfig,
    runtime: &Arc<Runtime>,
    manager: &Arc<LifecycleManager>,
) -> Result<Option<StartedHttpServer>, SupervisorError> {
    if !config.discovery.enabled {
        debug!("discovery facet is disabled");
        return Ok(None);
    }
    let discovery_config = config.discovery.clone();
    let state = DiscoveryState::new(manager.clone());
    let started = HttpServerRunner::new("discovery server", runtime.clone(), move || {
        discovery_server(&discovery_config, state)
    })
    .start()
    .map_err(|err| SupervisorError::Startup(err.to_string()))?;
    Ok(Some(started))
}

fn start_gateway(
    config: &SupervisorConfig,
    runtime: &Arc<Runtime>,
    bus: &Arc<dyn BusAdapter>,
    manager: &Arc<LifecycleManager>,
) -> Result<Option<StartedHttpServer>, SupervisorError> {
    if !config.gateway.enabled {
        debug!("gateway facet is disabled");
        return Ok(None);
    }
    let contracts = ContractStore::load_dir(&config.gateway.contracts_dir)
        .map_err(|err| SupervisorError::Startup(err.to_string()))?;
    info!(contracts = contracts.len(), "gateway contracts loaded");

    let gateway_config = config.gateway.clone();
    let state = GatewayState::new(
        Arc::new(contracts),
        bus.clone(),
        manager.clone(),
        gateway_config.forward_timeout.into(),
    );
    let started = HttpServerRunner::new("gateway server", runtime.clone(), move || {
        gateway_server(&gateway_config, state)
    })
    .start()
    .map_err(|err| SupervisorError::Startup(err.to_string()))?;
    Ok(Some(started))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::config::{DiscoveryConfig, GatewayConfig};
    use serial_test::serial;

    #[test]
    #[serial]
    fn wires_and_shuts_down_cleanly() {
        let config = SupervisorConfig {
            manager_id: Some("mgr-wiring-test".to_string()),
            discovery: DiscoveryConfig {
                enabled: true,
                host: "127.0.0.1".to_string(),
                // Port zero: bind whatever is free.
                port: 0,
            },
            gateway: GatewayConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let (publisher, consumer) = pub_sub();
        let runner = SupervisorRunner::new(config, consumer).unwrap();

        // Ask the loop to stop before it even starts: run() must return
        // promptly and release everything.
        publisher.publish(ApplicationEvent::StopRequested).unwrap();
        runner.run().unwrap();
    }

    #[test]
    #[serial]
    fn gateway_scans_past_occupied_ports() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();

        let config = SupervisorConfig {
            discovery: DiscoveryConfig {
                enabled: false,
                ..Default::default()
            },
            gateway: GatewayConfig {
                enabled: true,
                host: "127.0.0.1".to_string(),
                base_port: taken,
                port_span: 8,
                ..Default::default()
            },
            ..Default::default()
        };
        let (publisher, consumer) = pub_sub();
        let runner = SupervisorRunner::new(config, consumer).unwrap();
        let port = runner
            .supervisor
            ._gateway
            .as_ref()
            .map(StartedHttpServer::port)
            .unwrap();
        assert!(port > taken);

        publisher.publish(ApplicationEvent::StopRequested).unwrap();
        runner.run().unwrap();
    }
}
