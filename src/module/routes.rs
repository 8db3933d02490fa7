//! Dynamic route table for hosted modules.
//!
//! Axum routers are immutable once a server starts serving, but plugins can
//! be installed while the gateway runs. The route table bridges the two: the
//! gateway mounts one dispatch handler at `<prefix>/:module/*rest` and
//! resolves the target subrouter here per request, so a module mounted after
//! startup is reachable immediately and an unmounted one stops resolving.

use std::collections::HashMap;

use axum::body::Body;
use axum::http::{Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Router;
use parking_lot::RwLock;
use serde_json::json;
use tower::util::ServiceExt;
use tracing::debug;

/// Name-keyed table of module subrouters.
#[derive(Default)]
pub struct RouteTable {
    routers: RwLock<HashMap<String, Router>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount (or replace) the subrouter for a module.
    pub fn mount(&self, name: &str, router: Router) {
        self.routers.write().insert(name.to_string(), router);
        debug!(module = %name, "module routes mounted");
    }

    /// Drop a module's subrouter. Requests to it start returning 404.
    pub fn unmount(&self, name: &str) {
        self.routers.write().remove(name);
        debug!(module = %name, "module routes unmounted");
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routers.read().contains_key(name)
    }

    pub fn mounted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch a request to the named module's subrouter, rewriting the
    /// URI so handlers see a path relative to the module mount point.
    pub async fn dispatch(&self, name: &str, rest: &str, mut request: Request<Body>) -> Response {
        let router = match self.routers.read().get(name) {
            Some(router) => router.clone(),
            None => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({
                        "success": false,
                        "message": format!("no module mounted at '{name}'"),
                    })),
                )
                    .into_response();
            }
        };

        let relative = if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        };
        let rewritten = match request.uri().query() {
            Some(query) => format!("{relative}?{query}"),
            None => relative,
        };
        match rewritten.parse::<Uri>() {
            Ok(uri) => *request.uri_mut() = uri,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "success": false,
                        "message": "unroutable request path",
                    })),
                )
                    .into_response();
            }
        }

        match router.oneshot(request).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    fn table_with_echo() -> RouteTable {
        let table = RouteTable::new();
        table.mount(
            "echo",
            Router::new().route("/ping", get(|| async { "pong" })),
        );
        table
    }

    #[tokio::test]
    async fn dispatches_to_mounted_router() {
        let table = table_with_echo();
        let request = Request::builder()
            .uri("/api/v1/echo/ping")
            .body(Body::empty())
            .unwrap();

        let response = table.dispatch("echo", "ping", request).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_module_is_404() {
        let table = table_with_echo();
        let request = Request::builder()
            .uri("/api/v1/ghost/ping")
            .body(Body::empty())
            .unwrap();

        let response = table.dispatch("ghost", "ping", request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unmount_removes_routes() {
        let table = table_with_echo();
        assert!(table.contains("echo"));
        table.unmount("echo");
        assert!(!table.contains("echo"));
        assert!(table.mounted().is_empty());
    }

    #[tokio::test]
    async fn query_strings_survive_rewrite() {
        let table = RouteTable::new();
        table.mount(
            "q",
            Router::new().route(
                "/search",
                get(|axum::extract::RawQuery(q): axum::extract::RawQuery| async move {
                    q.unwrap_or_default()
                }),
            ),
        );

        let request = Request::builder()
            .uri("/api/v1/q/search?term=x")
            .body(Body::empty())
            .unwrap();
        let response = table.dispatch("q", "search", request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"term=x");
    }
}
