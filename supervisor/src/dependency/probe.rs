use crate::bus::BusAdapter;
use crate::registry::definition::ServiceDependency;
use std::net::{TcpStream, ToSocketAddrs};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("`{0}` is unreachable: {1}")]
    Unreachable(String, String),
    #[error("`{0}` responded but is not healthy: {1}")]
    Unhealthy(String, String),
    #[error("cannot probe `{0}`: {1}")]
    Unsupported(String, String),
}

/// A single liveness probe attempt against one declared dependency.
/// Implementations must be cheap to retry; the checker owns the retry loop.
#[cfg_attr(test, mockall::automock)]
pub trait DependencyProbe: Send + Sync {
    /// Returns a human-readable detail string on success.
    fn probe(&self, dependency: &ServiceDependency) -> Result<String, ProbeError>;
}

/// Read-only view of the locally running agents, used to probe
/// agent-kind dependencies.
pub trait RunningAgentsView: Send + Sync {
    fn running_instance(&self, agent: &str) -> Option<RunningInstanceProbe>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunningInstanceProbe {
    pub pid: u32,
    pub last_heartbeat: SystemTime,
}

/// Probes infrastructure endpoints. The endpoint string is declarative:
/// `bus` pings the coordination store, `http(s)://...` expects a 2xx
/// response, anything else is treated as a `host:port` TCP connect target.
pub struct InfrastructureProbe {
    bus: Arc<dyn BusAdapter>,
    http: reqwest::blocking::Client,
    connect_timeout: Duration,
}

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

impl InfrastructureProbe {
    pub fn new(bus: Arc<dyn BusAdapter>) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(DEFAULT_PROBE_TIMEOUT)
            .connect_timeout(DEFAULT_PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            bus,
            http,
            connect_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl DependencyProbe for InfrastructureProbe {
    fn probe(&self, dependency: &ServiceDependency) -> Result<String, ProbeError> {
        let service = dependency.service.clone();
        let endpoint = dependency.endpoint.as_str();

        if endpoint == "bus" {
            return self
                .bus
                .ping()
                .map(|_| "bus ping ok".to_string())
                .map_err(|err| ProbeError::Unreachable(service, err.to_string()));
        }

        if let Ok(url) = Url::parse(endpoint) {
            if url.scheme() == "http" || url.scheme() == "https" {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .map_err(|err| ProbeError::Unreachable(service.clone(), err.to_string()))?;
                let status = response.status();
                if status.is_success() {
                    return Ok(format!("HTTP {status}"));
                }
                return Err(ProbeError::Unhealthy(
                    service,
                    format!("HTTP status {status}"),
                ));
            }
        }

        // Bare `host:port`, e.g. an analytics store without an HTTP surface.
        let address = endpoint
            .to_socket_addrs()
            .map_err(|err| ProbeError::Unsupported(service.clone(), err.to_string()))?
            .next()
            .ok_or_else(|| {
                ProbeError::Unsupported(service.clone(), "endpoint resolved to nothing".into())
            })?;
        TcpStream::connect_timeout(&address, self.connect_timeout)
            .map(|_| format!("TCP connect to {address} ok"))
            .map_err(|err| ProbeError::Unreachable(service, err.to_string()))
    }
}

/// Probes the container runtime for a named container; only a `running`
/// state passes.
pub struct ContainerProbe {
    runtime_bin: String,
}

impl ContainerProbe {
    pub fn new() -> Self {
        Self {
            runtime_bin: "docker".to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_runtime(runtime_bin: impl Into<String>) -> Self {
        Self {
            runtime_bin: runtime_bin.into(),
        }
    }
}

impl Default for ContainerProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyProbe for ContainerProbe {
    fn probe(&self, dependency: &ServiceDependency) -> Result<String, ProbeError> {
        let service = dependency.service.clone();
        let output = Command::new(&self.runtime_bin)
            .args(["inspect", "--format", "{{.State.Status}}"])
            .arg(&dependency.endpoint)
            .output()
            .map_err(|err| ProbeError::Unreachable(service.clone(), err.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProbeError::Unreachable(service, stderr));
        }

        let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(container = %dependency.endpoint, %state, "container probe");
        if state == "running" {
            Ok(format!("container state {state}"))
        } else {
            Err(ProbeError::Unhealthy(
                service,
                format!("container state {state}"),
            ))
        }
    }
}
