//! Standalone runner: serve a single module as its own HTTP server.
//!
//! Used by plugin binaries built from gateway modules and by operators who
//! want to exercise a module without the full gateway. The runner
//! initializes the module, mounts its routes at the root alongside
//! `/health` and `/info`, serves until SIGTERM or Ctrl+C, and shuts the
//! module down on the way out.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};

use crate::module::Module;

/// Errors raised while running a module standalone.
#[derive(Error, Debug)]
pub enum StandaloneError {
    #[error("module '{0}' does not support standalone mode")]
    Unsupported(String),

    #[error("module error: {0}")]
    Module(#[from] crate::module::ModuleError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// Serves one module detached from the gateway.
pub struct StandaloneRunner {
    module: Arc<dyn Module>,
}

impl StandaloneRunner {
    pub fn new(module: Arc<dyn Module>) -> Self {
        StandaloneRunner { module }
    }

    /// Initialize the module and serve it on `port` until a termination
    /// signal arrives.
    pub async fn run(&self, port: u16) -> Result<(), StandaloneError> {
        if !self.module.can_run_standalone() {
            return Err(StandaloneError::Unsupported(self.module.name().to_string()));
        }

        self.module.initialize(None).await?;

        let app = self.build_router()?;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| StandaloneError::Bind { addr, source })?;

        info!(
            module = %self.module.name(),
            addr = %addr,
            "standalone module server listening"
        );

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(StandaloneError::Serve);

        if let Err(e) = self.module.shutdown().await {
            error!(module = %self.module.name(), error = %e, "module shutdown failed");
        }
        info!(module = %self.module.name(), "standalone module server stopped");

        result
    }

    fn build_router(&self) -> Result<Router, StandaloneError> {
        let routes = self.module.routes()?;
        let service = Router::new()
            .route("/health", get(health_handler))
            .route("/info", get(info_handler))
            .with_state(self.module.clone());

        Ok(routes.merge(service))
    }
}

async fn health_handler(State(module): State<Arc<dyn Module>>) -> impl IntoResponse {
    match module.health().await {
        Ok(health) => (StatusCode::OK, Json(health)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "unhealthy", "error": e.to_string() })),
        ),
    }
}

async fn info_handler(State(module): State<Arc<dyn Module>>) -> Json<Value> {
    let mut info = json!({
        "name": module.name(),
        "version": module.version(),
        "description": module.description(),
        "standalone": module.can_run_standalone(),
    });

    if let Some(metadata) = module.metadata() {
        if let Ok(meta_value) = serde_json::to_value(metadata) {
            info["metadata"] = meta_value;
        }
    }

    Json(info)
}

/// Resolve on SIGTERM (Unix) or Ctrl+C.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutdown: ctrl-c"),
                _ = sigterm.recv() => info!("shutdown: SIGTERM"),
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown: ctrl-c");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown: ctrl-c");
}
