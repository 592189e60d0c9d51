//! The pub/sub control plane: decodes typed request envelopes from the
//! manager channel and dispatches them to lifecycle, registry and
//! dependency handlers.

pub mod request;
pub mod response;

use crate::bus::BusAdapter;
use crate::lifecycle::manager::{LifecycleManager, RestartOutcome, StartOptions};
use crate::supervisor::defaults::{MANAGER_RESPONSE_CHANNEL, agent_response_channel, session_key};
use crate::supervisor::error::{ErrorKind, ErrorRecord};
use crate::utils::threads::spawn_named_thread;
use crate::utils::time::now_unix_timestamp;
use request::ManagerRequest;
use response::ManagerResponse;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Decodes and dispatches one control-plane message at a time. Requests are
/// decoded in arrival order; lifecycle-heavy handlers run on named worker
/// threads so the receive loop keeps draining.
#[derive(Clone)]
pub struct ControlPlane {
    bus: Arc<dyn BusAdapter>,
    manager: Arc<LifecycleManager>,
}

impl ControlPlane {
    pub fn new(bus: Arc<dyn BusAdapter>, manager: Arc<LifecycleManager>) -> Self {
        Self { bus, manager }
    }

    pub fn dispatch(&self, payload: &[u8]) {
        let request = match serde_json::from_slice::<ManagerRequest>(payload) {
            Ok(request) => request,
            Err(err) => {
                // Unknown or malformed request types are logged and dropped.
                warn!(
                    payload = %String::from_utf8_lossy(payload),
                    "unsupported manager request: {err}"
                );
                return;
            }
        };
        debug!(request = ?request.kind_name(), "dispatching manager request");
        self.handle(request);
    }

    fn handle(&self, request: ManagerRequest) {
        match request {
            // Quick queries answer inline.
            ManagerRequest::ListAgents { request_id } => {
                let agents = self.manager.snapshot();
                self.respond(ManagerResponse::ok(
                    json!({ "agents": agents, "count": agents.len() }),
                    request_id,
                ));
            }
            ManagerRequest::AgentStatus {
                agent_name,
                request_id,
            } => match self.manager.status(&agent_name) {
                Some(status) => {
                    self.respond(ManagerResponse::ok(json!({ "agent": status }), request_id))
                }
                None => self.respond(ManagerResponse::err(
                    ErrorRecord::new(
                        ErrorKind::LifecycleConflict,
                        format!("agent `{agent_name}` is not running"),
                    ),
                    request_id,
                )),
            },
            ManagerRequest::CheckCollisions { request_id } => {
                let mut liveness = serde_json::Map::new();
                for name in self.manager.registry().singleton_set() {
                    let running = self.manager.is_agent_running(&name).unwrap_or(false);
                    liveness.insert(name, Value::Bool(running));
                }
                self.respond(ManagerResponse::ok(
                    json!({ "singletons": liveness }),
                    request_id,
                ));
            }
            ManagerRequest::CheckAgentCollision {
                agent_name,
                pid,
                request_id,
            } => {
                let collision = self.manager.collision_check(&agent_name, pid);
                self.reply_to_agent(
                    &agent_name,
                    json!({
                        "agent_name": agent_name,
                        "collision": collision,
                        "request_id": request_id,
                        "timestamp": now_unix_timestamp(),
                    }),
                );
            }
            ManagerRequest::Heartbeat {
                agent_name,
                request_id,
            } => match self.manager.heartbeat(&agent_name) {
                // Heartbeats are chatty; only correlated ones get an ack.
                Ok(()) => {
                    if request_id.is_some() {
                        self.respond(ManagerResponse::ok(
                            json!({ "agent": agent_name }),
                            request_id,
                        ));
                    }
                }
                Err(err) => self.respond(ManagerResponse::err(err.to_record(), request_id)),
            },
            ManagerRequest::RegisterRunning {
                agent_name,
                pid,
                port,
                service_type,
                endpoints,
                session_id,
                request_id,
            } => {
                let result = self.manager.register_running(
                    &agent_name,
                    pid,
                    port,
                    service_type,
                    endpoints.unwrap_or_default(),
                    session_id,
                );
                self.respond(match result {
                    Ok(view) => ManagerResponse::ok(json!({ "agent": view }), request_id),
                    Err(err) => ManagerResponse::err(err.to_record(), request_id),
                });
            }
            ManagerRequest::UnregisterRunning {
                agent_name,
                request_id,
            } => {
                self.respond(match self.manager.unregister_running(&agent_name) {
                    Ok(()) => ManagerResponse::ok(json!({ "agent": agent_name }), request_id),
                    Err(err) => ManagerResponse::err(err.to_record(), request_id),
                });
            }
            ManagerRequest::RegisterAgent {
                agent_def,
                request_id,
            } => {
                let name = agent_def.name.clone();
                self.manager.registry().register(agent_def);
                self.respond(ManagerResponse::ok(json!({ "registered": name }), request_id));
            }
            ManagerRequest::ListRegistry { request_id } => {
                let definitions = self.manager.registry().list();
                self.respond(ManagerResponse::ok(
                    json!({ "definitions": definitions, "count": definitions.len() }),
                    request_id,
                ));
            }
            ManagerRequest::GetAgentDefinition {
                agent_name,
                request_id,
            } => match self.manager.registry().lookup(&agent_name) {
                Some(definition) => self.respond(ManagerResponse::ok(
                    json!({ "definition": definition }),
                    request_id,
                )),
                None => self.respond(ManagerResponse::err(
                    ErrorRecord::new(
                        ErrorKind::LifecycleConflict,
                        format!("agent `{agent_name}` is not present in the registry"),
                    ),
                    request_id,
                )),
            },

            // Everything below may block on probes, spawns or grace
            // windows: run on a worker thread.
            other => {
                let plane = self.clone();
                let name = other.kind_name();
                spawn_named_thread(format!("handler {name}"), move || {
                    plane.handle_blocking(other)
                });
            }
        }
    }

    fn handle_blocking(&self, request: ManagerRequest) {
        match request {
            ManagerRequest::StartAgent {
                agent_name,
                session_data,
                dependency_check,
                force_restart,
                request_id,
            } => {
                let opts = StartOptions {
                    session_data,
                    dependency_check: dependency_check.unwrap_or(true),
                    force: force_restart.unwrap_or(false),
                    ..Default::default()
                };
                self.respond(match self.manager.start(&agent_name, opts) {
                    Ok(view) => ManagerResponse::ok(json!({ "agent": view }), request_id),
                    Err(err) => ManagerResponse::err(err.to_record(), request_id),
                });
            }
            ManagerRequest::StopAgent {
                agent_name,
                request_id,
            } => {
                self.respond(match self.manager.stop(&agent_name) {
                    Ok(()) => ManagerResponse::ok(json!({ "stopped": agent_name }), request_id),
                    Err(err) => ManagerResponse::err(err.to_record(), request_id),
                });
            }
            ManagerRequest::RestartAgent {
                agent_name,
                session_data,
                request_id,
            } => {
                let opts = StartOptions {
                    session_data,
                    ..Default::default()
                };
                self.respond(match self.manager.restart(&agent_name, opts) {
                    Ok(view) => ManagerResponse::ok(json!({ "agent": view }), request_id),
                    Err(err) => ManagerResponse::err(err.to_record(), request_id),
                });
            }
            ManagerRequest::SpawnEphemeral {
                agent_name,
                task_id,
                task_data,
                request_id,
            } => {
                let result = self.manager.spawn_ephemeral(&agent_name, task_id, task_data);
                self.respond(match result {
                    Ok(view) => ManagerResponse::ok(json!({ "agent": view }), request_id),
                    Err(err) => ManagerResponse::err(err.to_record(), request_id),
                });
            }
            ManagerRequest::CheckDependencies {
                agent_name,
                request_id,
            } => {
                self.respond(match self.manager.check_dependencies(&agent_name) {
                    Ok(result) => ManagerResponse::ok(
                        json!({
                            "agent": agent_name,
                            "healthy": result.all_critical_healthy(),
                            "dependencies": result.reports,
                        }),
                        request_id,
                    ),
                    Err(err) => ManagerResponse::err(err.to_record(), request_id),
                });
            }
            ManagerRequest::ValidateServiceHealth {
                agent_name,
                request_id,
            } => {
                // Same sweep as check_dependencies, narrowed to the
                // infrastructure services backing the agent.
                self.respond(match self.manager.check_dependencies(&agent_name) {
                    Ok(result) => {
                        let services: Vec<_> = result
                            .reports
                            .iter()
                            .filter(|report| {
                                self.manager
                                    .registry()
                                    .lookup(&agent_name)
                                    .map(|def| {
                                        def.dependencies.iter().any(|dep| {
                                            dep.service == report.service
                                                && dep.kind
                                                    == crate::registry::definition::DependencyKind::Infrastructure
                                        })
                                    })
                                    .unwrap_or(false)
                            })
                            .cloned()
                            .collect();
                        let healthy = services
                            .iter()
                            .all(|report| report.healthy || !report.critical);
                        ManagerResponse::ok(
                            json!({
                                "agent": agent_name,
                                "healthy": healthy,
                                "services": services,
                            }),
                            request_id,
                        )
                    }
                    Err(err) => ManagerResponse::err(err.to_record(), request_id),
                });
            }
            ManagerRequest::RestartWithDependencies {
                agent_name,
                force_restart,
                request_id,
            } => {
                let force = force_restart.unwrap_or(false);
                self.respond(
                    match self.manager.restart_with_dependencies(&agent_name, force) {
                        Ok(RestartOutcome::Restarted(view)) => {
                            ManagerResponse::ok(json!({ "agent": view }), request_id)
                        }
                        Ok(RestartOutcome::DependenciesFailed(reports)) => {
                            ManagerResponse::err(
                                ErrorRecord::new(
                                    ErrorKind::DependencyUnavailable,
                                    format!(
                                        "critical dependencies failed for `{agent_name}`"
                                    ),
                                )
                                .with_context(agent_name.clone()),
                                request_id,
                            )
                            .with_data(json!({ "failures": reports }))
                        }
                        Err(err) => ManagerResponse::err(err.to_record(), request_id),
                    },
                );
            }
            ManagerRequest::SessionRestore {
                session_id,
                request_id,
            } => {
                self.respond(self.restore_session(&session_id, request_id));
            }
            other => {
                // Inline requests never reach the worker path.
                error!(request = ?other.kind_name(), "request routed to the wrong handler");
            }
        }
    }

    /// Loads the session payload from the shared store and restarts every
    /// listed agent with the restore flag set.
    fn restore_session(&self, session_id: &str, request_id: Option<String>) -> ManagerResponse {
        let raw = match self.bus.get(&session_key(session_id)) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return ManagerResponse::err(
                    ErrorRecord::new(
                        ErrorKind::LifecycleConflict,
                        format!("session `{session_id}` not found"),
                    ),
                    request_id,
                );
            }
            Err(err) => {
                return ManagerResponse::err(
                    ErrorRecord::new(ErrorKind::TransportFailure, err.to_string()),
                    request_id,
                );
            }
        };

        let payload: Value = match serde_json::from_slice(&raw) {
            Ok(payload) => payload,
            Err(err) => {
                return ManagerResponse::err(
                    ErrorRecord::new(
                        ErrorKind::TransportFailure,
                        format!("unreadable session payload: {err}"),
                    ),
                    request_id,
                );
            }
        };

        let agents: Vec<String> = payload
            .get("agents")
            .and_then(Value::as_array)
            .map(|agents| {
                agents
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut outcomes = serde_json::Map::new();
        for agent in &agents {
            let opts = StartOptions {
                session_id: Some(session_id.to_string()),
                session_data: Some(payload.clone()),
                restore: true,
                ..Default::default()
            };
            let outcome = match self.manager.restart(agent, opts) {
                Ok(view) => json!({ "restarted": true, "pid": view.pid }),
                Err(err) => json!({ "restarted": false, "error": err.to_record() }),
            };
            outcomes.insert(agent.clone(), outcome);
        }

        ManagerResponse::ok(
            json!({ "session_id": session_id, "agents": outcomes }),
            request_id,
        )
    }

    fn respond(&self, response: ManagerResponse) {
        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(err) => {
                error!("cannot serialize manager response: {err}");
                return;
            }
        };
        let _ = self
            .bus
            .publish(MANAGER_RESPONSE_CHANNEL, &payload)
            .inspect_err(|err| error!("cannot publish manager response: {err}"));
    }

    fn reply_to_agent(&self, agent: &str, payload: Value) {
        let channel = agent_response_channel(agent);
        let _ = self
            .bus
            .publish(&channel, payload.to_string().as_bytes())
            .inspect_err(|err| error!("cannot publish on `{channel}`: {err}"));
    }

    #[cfg(test)]
    pub(crate) fn handle_sync(&self, payload: &[u8]) {
        // Test hook: run blocking handlers on the caller thread so tests
        // don't race worker startup.
        match serde_json::from_slice::<ManagerRequest>(payload) {
            Ok(request) if request.is_blocking() => self.handle_blocking(request),
            Ok(request) => self.handle(request),
            Err(err) => warn!("unsupported manager request: {err}"),
        }
    }
}
