//! The gateway HTTP facet.
//!
//! Stateless per request apart from the ephemeral subscription used to
//! collect the correlated reply: authorize against the caller's contract,
//! publish the forwarded envelope on `agent.{agent}.request`, then wait on
//! `agent.{agent}.response` for the message carrying our request id.

use super::contracts::{ContractError, ContractStore};
use crate::bus::{BusAdapter, BusSubscription};
use crate::httpd::BoundServer;
use crate::lifecycle::manager::LifecycleManager;
use crate::supervisor::config::GatewayConfig;
use crate::supervisor::defaults::{agent_request_topic, agent_response_topic};
use crate::supervisor::error::{ErrorKind, ErrorRecord};
use crate::utils::time::now_unix_timestamp;
use actix_web::http::Method;
use actix_web::middleware::DefaultHeaders;
use actix_web::{App, HttpRequest, HttpResponse, HttpServer, web};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use ulid::Ulid;

const WORKERS: usize = 2;
const CLIENT_ID_HEADER: &str = "X-Client-ID";

#[derive(Clone)]
pub struct GatewayState {
    contracts: Arc<ContractStore>,
    bus: Arc<dyn BusAdapter>,
    manager: Arc<LifecycleManager>,
    default_timeout: Duration,
}

impl GatewayState {
    pub fn new(
        contracts: Arc<ContractStore>,
        bus: Arc<dyn BusAdapter>,
        manager: Arc<LifecycleManager>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            contracts,
            bus,
            manager,
            default_timeout,
        }
    }
}

/// Uniform gateway envelope.
#[derive(Debug, Serialize)]
struct GatewayResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    timestamp: i64,
}

impl GatewayResponse {
    fn ok(data: Value, request_id: Option<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            request_id,
            timestamp: now_unix_timestamp(),
        }
    }

    fn err(error: ErrorRecord, request_id: Option<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            request_id,
            timestamp: now_unix_timestamp(),
        }
    }
}

/// Builds the bound gateway server, walking the port range upward from the
/// configured base port until a bind succeeds.
pub fn gateway_server(config: &GatewayConfig, state: GatewayState) -> std::io::Result<BoundServer> {
    let data = web::Data::new(state);
    let span = config.port_span.max(1);
    let mut last_err = None;

    for port in config.base_port..config.base_port.saturating_add(span) {
        let data = data.clone();
        let bind_result = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                // CORS is permissive by default.
                .wrap(
                    DefaultHeaders::new()
                        .add(("Access-Control-Allow-Origin", "*"))
                        .add(("Access-Control-Allow-Methods", "GET, POST, OPTIONS"))
                        .add((
                            "Access-Control-Allow-Headers",
                            "Content-Type, X-Client-ID, Authorization",
                        )),
                )
                .route("/api/agents/available", web::get().to(available))
                .service(
                    web::resource("/api/agents/{agent}/{action}")
                        .route(web::post().to(forward))
                        .route(web::method(Method::OPTIONS).to(preflight)),
                )
                .route("/api/contracts/{client_id}", web::get().to(contract_metadata))
                .route("/api/health", web::get().to(health))
                .default_service(web::to(preflight_or_not_found))
        })
        .workers(WORKERS)
        .bind((config.host.as_str(), port));

        match bind_result {
            Ok(server) => {
                if port != config.base_port {
                    debug!("gateway bound on fallback port {port}");
                }
                return Ok((server.run(), port));
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrInUse, "empty gateway port range")
    }))
}

/// Pre-flight requests return 200 immediately.
async fn preflight() -> HttpResponse {
    HttpResponse::Ok().finish()
}

async fn preflight_or_not_found(req: HttpRequest) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        return HttpResponse::Ok().finish();
    }
    HttpResponse::NotFound().json(GatewayResponse::err(
        ErrorRecord::new(ErrorKind::TransportFailure, "no such endpoint"),
        None,
    ))
}

/// `X-Client-ID` header, `client_id` query parameter, or bearer credential.
fn client_id_of(req: &HttpRequest, query: &HashMap<String, String>) -> Option<String> {
    if let Some(header) = req.headers().get(CLIENT_ID_HEADER) {
        if let Ok(value) = header.to_str() {
            return Some(value.to_string());
        }
    }
    if let Some(value) = query.get("client_id") {
        return Some(value.clone());
    }
    req.headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn contract_denial(err: &ContractError) -> HttpResponse {
    let status = match err {
        ContractError::MissingContract(_) => actix_web::http::StatusCode::UNAUTHORIZED,
        _ => actix_web::http::StatusCode::FORBIDDEN,
    };
    HttpResponse::build(status).json(GatewayResponse::err(err.to_record(), None))
}

async fn forward(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    query: web::Query<HashMap<String, String>>,
    body: web::Bytes,
    state: web::Data<GatewayState>,
) -> HttpResponse {
    let (agent, action) = path.into_inner();

    let Some(client_id) = client_id_of(&req, &query) else {
        return HttpResponse::Unauthorized().json(GatewayResponse::err(
            ErrorRecord::new(ErrorKind::ContractViolation, "missing client id"),
            None,
        ));
    };

    let contract = match state.contracts.get(&client_id) {
        Ok(contract) => contract,
        Err(err) => return contract_denial(&err),
    };
    if let Err(err) = contract.authorize(&agent, &action) {
        warn!(%client_id, %agent, %action, "contract denial: {err}");
        return contract_denial(&err);
    }

    let params: Value = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(params) => params,
            Err(err) => {
                return HttpResponse::BadRequest().json(GatewayResponse::err(
                    ErrorRecord::new(
                        ErrorKind::ContractViolation,
                        format!("request body is not JSON: {err}"),
                    ),
                    None,
                ));
            }
        }
    };

    let request_id = Ulid::new().to_string();
    let envelope = json!({
        "action": action,
        "params": params,
        "client_id": client_id,
        "request_id": request_id,
    });

    // Subscribe before publishing so the reply cannot slip past us.
    let subscription = match state.bus.subscribe(&agent_response_topic(&agent)) {
        Ok(subscription) => subscription,
        Err(err) => {
            return HttpResponse::InternalServerError().json(GatewayResponse::err(
                ErrorRecord::new(ErrorKind::TransportFailure, err.to_string()),
                Some(request_id),
            ));
        }
    };
    if let Err(err) = state
        .bus
        .publish(&agent_request_topic(&agent), envelope.to_string().as_bytes())
    {
        return HttpResponse::InternalServerError().json(GatewayResponse::err(
            ErrorRecord::new(ErrorKind::TransportFailure, err.to_string()),
            Some(request_id),
        ));
    }

    let timeout = contract.forward_timeout(state.default_timeout);
    let correlation_id = request_id.clone();
    let reply = web::block(move || wait_for_correlated(&subscription, &correlation_id, timeout))
        .await
        .unwrap_or(None);

    match reply {
        Some(reply) => HttpResponse::Ok().json(GatewayResponse::ok(reply, Some(request_id))),
        None => HttpResponse::ServiceUnavailable().json(GatewayResponse::err(
            ErrorRecord::new(
                ErrorKind::TransportFailure,
                format!("timed out waiting for a response from `{agent}`"),
            )
            .with_context(agent),
            Some(request_id),
        )),
    }
}

/// Drains the response topic until the message carrying `request_id`
/// arrives or the deadline passes. Other callers' replies are skipped, the
/// broadcast delivers them to their own subscriptions as well.
fn wait_for_correlated(
    subscription: &BusSubscription,
    request_id: &str,
    timeout: Duration,
) -> Option<Value> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        let message = match subscription.recv_timeout(remaining) {
            Ok(Some(message)) => message,
            Ok(None) | Err(_) => return None,
        };
        match serde_json::from_slice::<Value>(&message.payload) {
            Ok(value) if value.get("request_id").and_then(Value::as_str) == Some(request_id) => {
                return Some(value);
            }
            Ok(_) => continue,
            Err(err) => {
                debug!("skipping non-JSON agent response: {err}");
                continue;
            }
        }
    }
}

/// Live discovery intersected with the caller's allow map.
async fn available(
    req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
    state: web::Data<GatewayState>,
) -> HttpResponse {
    let Some(client_id) = client_id_of(&req, &query) else {
        return HttpResponse::Unauthorized().json(GatewayResponse::err(
            ErrorRecord::new(ErrorKind::ContractViolation, "missing client id"),
            None,
        ));
    };
    let contract = match state.contracts.get(&client_id) {
        Ok(contract) => contract,
        Err(err) => return contract_denial(&err),
    };

    let live: Vec<String> = state
        .manager
        .snapshot()
        .into_iter()
        .filter(|status| status.running)
        .map(|status| status.agent)
        .collect();
    let mut agents: Vec<&str> = contract
        .allowed_agents()
        .into_iter()
        .filter(|agent| live.iter().any(|name| name == agent))
        .collect();
    agents.sort_unstable();

    HttpResponse::Ok().json(GatewayResponse::ok(
        json!({ "agents": agents, "count": agents.len() }),
        None,
    ))
}

async fn contract_metadata(
    path: web::Path<String>,
    state: web::Data<GatewayState>,
) -> HttpResponse {
    let client_id = path.into_inner();
    match state.contracts.get(&client_id) {
        Ok(contract) => {
            let allowed: HashMap<&String, &Vec<String>> = contract
                .access_permissions
                .allowed_agents
                .iter()
                .map(|(agent, permission)| (agent, &permission.actions))
                .collect();
            HttpResponse::Ok().json(GatewayResponse::ok(
                json!({
                    "client_id": contract.client_id,
                    "version": contract.version,
                    "description": contract.description,
                    "allowed_agents": allowed,
                    "forbidden_agents": contract.access_permissions.forbidden_agents,
                }),
                None,
            ))
        }
        Err(err) => contract_denial(&err),
    }
}

async fn health(state: web::Data<GatewayState>) -> HttpResponse {
    HttpResponse::Ok().json(GatewayResponse::ok(
        json!({
            "status": "ok",
            "agents_count": state.manager.agents_count(),
            "contracts_loaded": state.contracts.len(),
            "timestamp": now_unix_timestamp(),
        }),
        None,
    ))
}
