//! Gateway HTTP server.
//!
//! Assembles the routing surface:
//!
//! - `/health` — aggregated module health
//! - `/api/v1/plugins/*` — plugin management (bearer-token protected)
//! - `/api/v1/:module/*rest` — dynamic dispatch into hosted modules
//!
//! Rate limiting wraps the whole surface when enabled. Static routes win
//! over the `:module` capture, so the management API is never shadowed by
//! a plugin named `plugins`.

pub mod api;
pub mod auth;
pub mod startup;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::Request;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};

use crate::module::{ModuleRegistry, RouteTable};
use crate::plugins::PluginManager;
use crate::ratelimit::{rate_limit_middleware, RateLimitState};

pub use api::{ApiState, InstallRequest, InstallResponse, ListInstalledResponse, RemoveResponse};
pub use auth::{bearer_auth_middleware, timing_safe_eq, AuthConfig};
pub use startup::{run_server, ServerConfig, ServerHandle};

/// Path prefix modules are mounted beneath.
pub const API_PREFIX: &str = "/api/v1";

/// Shared state for the gateway-level handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub manager: Arc<PluginManager>,
}

impl GatewayState {
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        self.manager.registry()
    }

    pub fn route_table(&self) -> &Arc<RouteTable> {
        self.manager.routes()
    }
}

/// Build the complete gateway router.
pub fn build_router(
    state: GatewayState,
    auth: AuthConfig,
    rate_limit: Option<RateLimitState>,
) -> Router {
    let management = api::plugin_api_router(ApiState {
        manager: state.manager.clone(),
    })
    .layer(from_fn_with_state(auth, bearer_auth_middleware));

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route(
            &format!("{API_PREFIX}/:module"),
            any(module_dispatch_root),
        )
        .route(
            &format!("{API_PREFIX}/:module/*rest"),
            any(module_dispatch),
        )
        .with_state(state)
        .nest(&format!("{API_PREFIX}/plugins"), management);

    if let Some(rate_limit) = rate_limit {
        router = router.layer(from_fn_with_state(rate_limit, rate_limit_middleware));
    }

    router
}

/// GET /health — every module's probe plus an overall verdict.
async fn health_handler(State(state): State<GatewayState>) -> Response {
    Json(state.registry().health_report().await).into_response()
}

async fn module_dispatch_root(
    State(state): State<GatewayState>,
    Path(module): Path<String>,
    request: Request<Body>,
) -> Response {
    state.route_table().dispatch(&module, "/", request).await
}

async fn module_dispatch(
    State(state): State<GatewayState>,
    Path((module, rest)): Path<(String, String)>,
    request: Request<Body>,
) -> Response {
    state.route_table().dispatch(&module, &rest, request).await
}
