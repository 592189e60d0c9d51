//! Shared runner for the supervisor's HTTP facets.
//!
//! Each facet (discovery, gateway) builds an actix server via a factory
//! closure; the runner hosts it on a named OS thread driving the shared
//! tokio runtime, reports bind success or failure over a startup channel,
//! and stops the server handle when the started facet is dropped.

use crate::utils::threads::spawn_named_thread;
use actix_web::dev::{Server, ServerHandle};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::{debug, error, info};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("`{0}` failed to bind: {1}")]
    Bind(String, String),
    #[error("`{0}` did not report startup within {1:?}")]
    StartupTimeout(String, Duration),
    #[error("`{0}` startup channel closed unexpectedly")]
    StartupChannelClosed(String),
}

/// Factory result: the built server plus the port it actually bound.
pub type BoundServer = (Server, u16);

pub struct HttpServerRunner {
    name: String,
    runtime: Arc<Runtime>,
    factory: Box<dyn FnOnce() -> std::io::Result<BoundServer> + Send + 'static>,
}

#[derive(Debug)]
pub struct StartedHttpServer {
    name: String,
    port: u16,
    handle: ServerHandle,
    runtime: Arc<Runtime>,
    thread: Option<JoinHandle<()>>,
}

impl HttpServerRunner {
    pub fn new(
        name: impl Into<String>,
        runtime: Arc<Runtime>,
        factory: impl FnOnce() -> std::io::Result<BoundServer> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            runtime,
            factory: Box::new(factory),
        }
    }

    /// Spawns the server thread and waits for it to bind.
    pub fn start(self) -> Result<StartedHttpServer, HttpServerError> {
        let (startup_publisher, startup_consumer) = mpsc::channel();

        let name = self.name.clone();
        let runtime = self.runtime.clone();
        let factory = self.factory;
        let thread = spawn_named_thread(self.name.clone(), move || {
            runtime.block_on(async move {
                let (server, port) = match factory() {
                    Ok(bound) => bound,
                    Err(err) => {
                        let _ = startup_publisher.send(Err(err.to_string()));
                        return;
                    }
                };
                let _ = startup_publisher.send(Ok((server.handle(), port)));
                if let Err(err) = server.await {
                    error!("`{name}` server terminated with error: {err}");
                }
            });
        });

        let (handle, port) = startup_consumer
            .recv_timeout(STARTUP_TIMEOUT)
            .map_err(|err| match err {
                mpsc::RecvTimeoutError::Timeout => {
                    HttpServerError::StartupTimeout(self.name.clone(), STARTUP_TIMEOUT)
                }
                mpsc::RecvTimeoutError::Disconnected => {
                    HttpServerError::StartupChannelClosed(self.name.clone())
                }
            })?
            .map_err(|reason| HttpServerError::Bind(self.name.clone(), reason))?;

        info!("`{}` listening on port {port}", self.name);
        Ok(StartedHttpServer {
            name: self.name,
            port,
            handle,
            runtime: self.runtime,
            thread: Some(thread),
        })
    }
}

impl StartedHttpServer {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for StartedHttpServer {
    fn drop(&mut self) {
        debug!("stopping `{}`", self.name);
        self.runtime.block_on(self.handle.stop(true));
        if let Some(thread) = self.thread.take() {
            let _ = thread
                .join()
                .inspect_err(|_| error!("`{}` server thread panicked", self.name));
        }
        debug!("`{}` stopped", self.name);
    }
}
