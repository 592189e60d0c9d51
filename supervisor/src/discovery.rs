//! Read-only service discovery facet on the fixed supervisor port.
//!
//! Serves live state from the agents arena merged with the shared running
//! records (ports and endpoint URLs contributed by registering agents).

use crate::httpd::BoundServer;
use crate::lifecycle::manager::LifecycleManager;
use crate::lifecycle::process::AgentStatusView;
use crate::supervisor::config::DiscoveryConfig;
use crate::utils::time::now_unix_timestamp;
use actix_web::{App, HttpResponse, HttpServer, web};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const WORKERS: usize = 2;

#[derive(Clone)]
pub struct DiscoveryState {
    manager: Arc<LifecycleManager>,
}

impl DiscoveryState {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self { manager }
    }
}

/// One discoverable service: a running agent that published an endpoint
/// surface through its registration.
#[derive(Debug, Clone, Serialize)]
struct ServiceView {
    agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    endpoints: HashMap<String, String>,
    last_heartbeat: i64,
}

/// Builds the bound discovery server; the caller hosts it via the shared
/// HTTP runner.
pub fn discovery_server(
    config: &DiscoveryConfig,
    state: DiscoveryState,
) -> std::io::Result<BoundServer> {
    let data = web::Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/", web::get().to(index))
            .route("/api/health", web::get().to(health))
            .route("/api/services", web::get().to(services))
            .route("/api/services/{name}", web::get().to(service))
            .route("/api/agents", web::get().to(agents))
            .route("/api/agents/{name}", web::get().to(agent))
    })
    .workers(WORKERS)
    .bind((config.host.as_str(), config.port))?;
    let port = server.addrs().first().map(|addr| addr.port()).unwrap_or(config.port);
    Ok((server.run(), port))
}

async fn index(state: web::Data<DiscoveryState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "service": "centerfire-supervisor",
        "manager_id": state.manager.manager_id(),
        "endpoints": [
            "/api/health",
            "/api/services",
            "/api/services/{name}",
            "/api/agents",
            "/api/agents/{name}",
        ],
    }))
}

async fn health(state: web::Data<DiscoveryState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "manager_id": state.manager.manager_id(),
        "agents_count": state.manager.agents_count(),
        "timestamp": now_unix_timestamp(),
    }))
}

async fn agents(state: web::Data<DiscoveryState>) -> HttpResponse {
    let agents: Vec<AgentStatusView> = state.manager.snapshot();
    HttpResponse::Ok().json(json!({ "count": agents.len(), "agents": agents }))
}

async fn agent(state: web::Data<DiscoveryState>, path: web::Path<String>) -> HttpResponse {
    let name = path.into_inner();
    match state.manager.status(&name) {
        Some(status) => {
            let record = state.manager.running_record(&status.agent);
            HttpResponse::Ok().json(json!({ "agent": status, "registration": record }))
        }
        None => not_found(&name),
    }
}

async fn services(state: web::Data<DiscoveryState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "services": service_map(&state.manager) }))
}

async fn service(state: web::Data<DiscoveryState>, path: web::Path<String>) -> HttpResponse {
    let name = path.into_inner();
    match service_map(&state.manager).remove(&name) {
        Some(view) => HttpResponse::Ok().json(view),
        None => not_found(&name),
    }
}

/// The discoverable subset of running agents: those whose registration
/// contributed a port or endpoint map.
fn service_map(manager: &LifecycleManager) -> BTreeMap<String, ServiceView> {
    manager
        .snapshot()
        .into_iter()
        .filter_map(|status| {
            let record = manager.running_record(&status.agent)?;
            if record.port.is_none() && record.endpoints.is_empty() {
                return None;
            }
            Some((
                status.agent.clone(),
                ServiceView {
                    agent: status.agent,
                    service_type: record.service_type,
                    port: record.port,
                    endpoints: record.endpoints,
                    last_heartbeat: record.last_heartbeat,
                },
            ))
        })
        .collect()
}

fn not_found(name: &str) -> HttpResponse {
    HttpResponse::NotFound().json(json!({
        "error": format!("`{name}` not found"),
        "timestamp": now_unix_timestamp(),
    }))
}
