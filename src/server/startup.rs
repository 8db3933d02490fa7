//! Testable server startup and shutdown.
//!
//! [`run_server`] binds the gateway on the configured address (ephemeral
//! ports supported for tests), initializes registered modules, and returns
//! a [`ServerHandle`]. Shutting the handle down stops the listener, fans
//! `shutdown_all` out across the registry under a bounded deadline, and
//! awaits the server task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{build_router, AuthConfig, GatewayState, API_PREFIX};
use crate::module::RegistryError;
use crate::plugins::PluginManager;
use crate::ratelimit::RateLimitState;

/// Deadline for module shutdown fan-out.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Startup errors.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Everything needed to start a gateway server.
pub struct ServerConfig {
    pub manager: Arc<PluginManager>,
    pub bind_address: SocketAddr,
    pub auth: AuthConfig,
    pub rate_limit: Option<RateLimitState>,
    /// Per-module configuration sections, keyed by module name.
    pub module_configs: Map<String, Value>,
    /// When false (tests), registered modules are not initialized at
    /// startup; they can still be driven directly.
    pub initialize_modules: bool,
}

impl ServerConfig {
    /// Minimal config for integration tests: loopback ephemeral port, no
    /// auth, no rate limiting, no module initialization.
    pub fn for_testing(manager: Arc<PluginManager>) -> Self {
        ServerConfig {
            manager,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            auth: AuthConfig::default(),
            rate_limit: None,
            module_configs: Map::new(),
            initialize_modules: false,
        }
    }
}

/// Handle to a running gateway server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    manager: Arc<PluginManager>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL of the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    /// Graceful shutdown: stop accepting, shut modules down under the
    /// deadline, await the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        let registry = self.manager.registry().clone();
        match tokio::time::timeout(SHUTDOWN_DEADLINE, registry.shutdown_all()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // Partial failures are logged and the process still exits.
                error!(error = %e, "module shutdown reported failures");
            }
            Err(_) => {
                warn!(
                    deadline_secs = SHUTDOWN_DEADLINE.as_secs(),
                    "module shutdown exceeded deadline"
                );
            }
        }

        match self.server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "server error during shutdown"),
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!(error = %e, "server task failed"),
        }
        info!("gateway server stopped");
    }
}

/// Bind, mount routes for already-registered modules, optionally
/// initialize them, and start serving.
pub async fn run_server(config: ServerConfig) -> Result<ServerHandle, StartupError> {
    let manager = config.manager;
    let registry = manager.registry().clone();

    registry.register_routes_all(manager.routes(), API_PREFIX)?;

    if config.initialize_modules {
        registry.initialize_all(&config.module_configs).await?;
    }

    let state = GatewayState {
        manager: manager.clone(),
    };
    let app = build_router(state, config.auth, config.rate_limit);

    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .map_err(|source| StartupError::Bind {
            addr: config.bind_address,
            source,
        })?;
    let local_addr = listener.local_addr().map_err(|source| StartupError::Bind {
        addr: config.bind_address,
        source,
    })?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
    });

    info!(addr = %local_addr, "gateway server listening");

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        manager,
        server_task,
    })
}
