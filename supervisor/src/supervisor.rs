//! Supervisor core: configuration, wiring and the main event loop.

pub mod config;
pub mod defaults;
pub mod error;
pub mod instance_lock;
pub mod run;

use crate::bus::BusSubscription;
use crate::control::ControlPlane;
use crate::event::channel::{EventConsumer, EventPublisher};
use crate::event::{ApplicationEvent, LifecycleEvent};
use crate::heartbeat::monitor::HeartbeatMonitor;
use crate::httpd::StartedHttpServer;
use crate::lifecycle::manager::{LifecycleManager, RestartOutcome};
use crate::registry::definition::AgentKind;
use crate::supervisor::config::RestartConfig;
use crate::utils::threads::spawn_named_thread;
use crossbeam::channel::tick;
use crossbeam::select;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The supervisor event loop. Owns the control-plane subscription, the
/// lifecycle event channel fed by reapers and timers, and the heartbeat
/// ticker. All lifecycle mutations funnel through the shared
/// [`LifecycleManager`].
pub struct Supervisor {
    manager: Arc<LifecycleManager>,
    control: ControlPlane,
    monitor: HeartbeatMonitor,
    request_subscription: BusSubscription,
    lifecycle_consumer: EventConsumer<LifecycleEvent>,
    lifecycle_publisher: EventPublisher<LifecycleEvent>,
    application_event_consumer: EventConsumer<ApplicationEvent>,
    heartbeat_interval: Duration,
    restart: RestartConfig,
    // HTTP facets are stopped on drop; keep them alive for the loop's
    // lifetime.
    _discovery: Option<StartedHttpServer>,
    _gateway: Option<StartedHttpServer>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        manager: Arc<LifecycleManager>,
        control: ControlPlane,
        monitor: HeartbeatMonitor,
        request_subscription: BusSubscription,
        lifecycle_consumer: EventConsumer<LifecycleEvent>,
        lifecycle_publisher: EventPublisher<LifecycleEvent>,
        application_event_consumer: EventConsumer<ApplicationEvent>,
        heartbeat_interval: Duration,
        restart: RestartConfig,
        discovery: Option<StartedHttpServer>,
        gateway: Option<StartedHttpServer>,
    ) -> Self {
        Self {
            manager,
            control,
            monitor,
            request_subscription,
            lifecycle_consumer,
            lifecycle_publisher,
            application_event_consumer,
            heartbeat_interval,
            restart,
            _discovery: discovery,
            _gateway: gateway,
        }
    }

    /// Runs the event loop until a stop is requested or the bus is lost.
    /// Bus loss is fatal: the process manager restarts us and state is
    /// reconstructed from the store.
    pub fn run(mut self) -> Result<(), error::SupervisorError> {
        info!("supervisor event loop started");
        let heartbeat_ticker = tick(self.heartbeat_interval);
        // Consecutive automatic restart attempts per agent, reset on a
        // successful restart.
        let mut restart_attempts: HashMap<String, usize> = HashMap::new();

        let exit = loop {
            select! {
                recv(self.request_subscription.receiver()) -> message => {
                    match message {
                        Ok(message) => self.control.dispatch(&message.payload),
                        Err(_) => {
                            error!("control-plane channel lost, shutting down");
                            break Err(error::SupervisorError::BusLost);
                        }
                    }
                },
                recv(self.lifecycle_consumer.as_ref()) -> event => {
                    match event {
                        Ok(event) => self.handle_lifecycle_event(event, &mut restart_attempts),
                        Err(_) => {
                            debug!("lifecycle channel closed");
                            break Ok(());
                        }
                    }
                },
                recv(heartbeat_ticker) -> _ => {
                    for agent in self.monitor.sweep(&self.manager) {
                        self.schedule_restart(agent, &mut restart_attempts);
                    }
                },
                recv(self.application_event_consumer.as_ref()) -> _ => {
                    info!("stop requested, shutting down supervisor");
                    break Ok(());
                },
            }
        };

        // Shutdown order: HTTP facets first (bounded drain), then the
        // supervised agents, then the bus goes away with the last owner.
        drop(self._gateway.take());
        drop(self._discovery.take());
        self.manager.stop_all();
        info!("supervisor event loop finished");
        exit
    }

    fn handle_lifecycle_event(
        &self,
        event: LifecycleEvent,
        restart_attempts: &mut HashMap<String, usize>,
    ) {
        match event {
            LifecycleEvent::AgentExited {
                instance,
                agent,
                kind,
                session_id,
                task_id,
                exit_code,
            } => {
                let tracked = self.manager.handle_exit(
                    &instance,
                    &agent,
                    kind,
                    session_id,
                    task_id,
                    exit_code,
                );
                // Untracked exits were removed by an explicit stop; only
                // unexpected persistent exits get the automatic restart.
                if tracked && kind == AgentKind::Persistent {
                    self.schedule_restart(agent, restart_attempts);
                }
            }
            LifecycleEvent::EphemeralTimedOut {
                instance,
                agent,
                task_id,
                max_runtime_seconds,
            } => {
                self.manager
                    .emit_ephemeral_timeout(&instance, &agent, &task_id, max_runtime_seconds);
            }
            LifecycleEvent::RestartDue { agent, attempt } => {
                self.run_automatic_restart(&agent, attempt, restart_attempts);
            }
        }
    }

    fn schedule_restart(&self, agent: String, restart_attempts: &mut HashMap<String, usize>) {
        let attempt = *restart_attempts
            .entry(agent.clone())
            .and_modify(|n| *n += 1)
            .or_insert(1);
        if attempt > self.restart.max_attempts {
            warn!(
                %agent,
                attempts = attempt - 1,
                "automatic restart budget exhausted, giving up"
            );
            self.manager.emit_restart_abandoned(&agent, attempt - 1);
            return;
        }

        let delay: Duration = self.restart.delay.into();
        info!(%agent, attempt, delay_secs = delay.as_secs(), "scheduling automatic restart");
        let publisher = self.lifecycle_publisher.clone();
        spawn_named_thread(format!("restart timer {agent}"), move || {
            std::thread::sleep(delay);
            let _ = publisher
                .publish(LifecycleEvent::RestartDue { agent, attempt })
                .inspect_err(|err| error!("cannot publish restart-due event: {err}"));
        });
    }

    fn run_automatic_restart(
        &self,
        agent: &str,
        attempt: usize,
        restart_attempts: &mut HashMap<String, usize>,
    ) {
        info!(%agent, attempt, "running automatic restart");
        match self.manager.restart_with_dependencies(agent, false) {
            Ok(RestartOutcome::Restarted(status)) => {
                restart_attempts.remove(agent);
                info!(%agent, pid = status.pid, "automatic restart succeeded");
                self.manager.emit_restart_outcome(agent, attempt, true, None);
            }
            Ok(RestartOutcome::DependenciesFailed(reports)) => {
                let detail = reports
                    .iter()
                    .map(|report| report.service.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                warn!(%agent, failed = %detail, "automatic restart blocked by dependencies");
                self.manager
                    .emit_restart_outcome(agent, attempt, false, Some(detail));
            }
            Err(err) => {
                warn!(%agent, error = %err, "automatic restart failed");
                self.manager
                    .emit_restart_outcome(agent, attempt, false, Some(err.to_string()));
            }
        }
    }
}
