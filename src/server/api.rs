//! Plugin management API.
//!
//! Mounted under `/api/v1/plugins`:
//!
//! - `POST /install` — `{url, auto_load}`; downloads a package and, with
//!   `auto_load`, loads and registers it. 60 s wall-clock budget per call.
//! - `GET /installed` — installed archive filenames.
//! - `DELETE /remove` — `{filename}`; unlinks an installed archive.
//!
//! Responses use a uniform `{success, message, ...}` envelope; error kinds
//! map onto status codes (bad input 400, name conflicts 409, missing
//! files 404, everything else 500).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::plugins::{InstallError, LoaderError, ManagerError, PluginManager};

/// Wall-clock budget for one install call, download included.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared state for the management handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<PluginManager>,
}

/// Build the management subrouter (callers nest it under
/// `/api/v1/plugins`).
pub fn plugin_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/install", post(install_handler))
        .route("/installed", get(installed_handler))
        .route("/remove", delete(remove_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct InstallRequest {
    pub url: String,
    #[serde(default)]
    pub auto_load: bool,
}

#[derive(Debug, Serialize)]
pub struct InstallResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListInstalledResponse {
    pub success: bool,
    pub message: String,
    pub plugins: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveRequest {
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct RemoveResponse {
    pub success: bool,
    pub message: String,
}

/// Status code for a failed manager operation, by error kind.
fn error_status(err: &ManagerError) -> StatusCode {
    match err {
        ManagerError::Install(install) => match install {
            InstallError::InvalidUrl { .. } | InstallError::FilenameRejected { .. } => {
                StatusCode::BAD_REQUEST
            }
            InstallError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        ManagerError::Load(load) => match load {
            LoaderError::NameConflict(_) => StatusCode::CONFLICT,
            LoaderError::NotFound(_) | LoaderError::NotLoaded(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        ManagerError::Registry(registry) => match registry {
            crate::module::RegistryError::AlreadyRegistered(_) => StatusCode::CONFLICT,
            crate::module::RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

async fn install_handler(
    State(state): State<ApiState>,
    Json(request): Json<InstallRequest>,
) -> Response {
    info!(url = %request.url, auto_load = request.auto_load, "plugin install requested");

    if request.auto_load {
        let work = state.manager.install_and_load(&request.url);
        match tokio::time::timeout(INSTALL_TIMEOUT, work).await {
            Ok(Ok(name)) => (
                StatusCode::OK,
                Json(InstallResponse {
                    success: true,
                    message: "plugin installed and loaded".to_string(),
                    plugin_name: Some(name),
                }),
            )
                .into_response(),
            Ok(Err(e)) => install_error_response(&request.url, e),
            Err(_) => install_timeout_response(&request.url),
        }
    } else {
        let work = state.manager.install_from_url(&request.url);
        match tokio::time::timeout(INSTALL_TIMEOUT, work).await {
            Ok(Ok(_path)) => (
                StatusCode::OK,
                Json(InstallResponse {
                    success: true,
                    message: "plugin installed".to_string(),
                    plugin_name: None,
                }),
            )
                .into_response(),
            Ok(Err(e)) => install_error_response(&request.url, e),
            Err(_) => install_timeout_response(&request.url),
        }
    }
}

fn install_error_response(url: &str, e: ManagerError) -> Response {
    error!(url = %url, error = %e, "plugin install failed");
    (
        error_status(&e),
        Json(InstallResponse {
            success: false,
            message: format!("plugin install failed: {e}"),
            plugin_name: None,
        }),
    )
        .into_response()
}

fn install_timeout_response(url: &str) -> Response {
    error!(url = %url, "plugin install timed out");
    (
        StatusCode::GATEWAY_TIMEOUT,
        Json(InstallResponse {
            success: false,
            message: "plugin install timed out; partial downloads are not rolled back, retry is safe"
                .to_string(),
            plugin_name: None,
        }),
    )
        .into_response()
}

async fn installed_handler(State(state): State<ApiState>) -> Response {
    match state.manager.list_installed().await {
        Ok(plugins) => (
            StatusCode::OK,
            Json(ListInstalledResponse {
                success: true,
                message: "installed plugins listed".to_string(),
                plugins,
            }),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to list installed plugins");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ListInstalledResponse {
                    success: false,
                    message: format!("failed to list installed plugins: {e}"),
                    plugins: Vec::new(),
                }),
            )
                .into_response()
        }
    }
}

async fn remove_handler(
    State(state): State<ApiState>,
    Json(request): Json<RemoveRequest>,
) -> Response {
    info!(filename = %request.filename, "plugin remove requested");

    match state.manager.remove_installed(&request.filename).await {
        Ok(()) => (
            StatusCode::OK,
            Json(RemoveResponse {
                success: true,
                message: "plugin removed".to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!(filename = %request.filename, error = %e, "plugin remove failed");
            (
                error_status(&e),
                Json(RemoveResponse {
                    success: false,
                    message: format!("plugin remove failed: {e}"),
                }),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ModuleRegistry, RouteTable};
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::util::ServiceExt;

    fn api(dir: &tempfile::TempDir) -> Router {
        let manager = PluginManager::new(
            dir.path().join("plugins"),
            Arc::new(ModuleRegistry::new()),
            Arc::new(RouteTable::new()),
        )
        .unwrap();
        plugin_api_router(ApiState {
            manager: Arc::new(manager),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn installed_is_empty_initially() {
        let dir = tempdir().unwrap();
        let response = api(&dir)
            .oneshot(
                Request::builder()
                    .uri("/installed")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert!(body["plugins"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn install_rejects_invalid_url_with_400() {
        let dir = tempdir().unwrap();
        let response = api(&dir)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/install")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"url": "ftp://host/svc_linux_v1.0.0.vkp"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn remove_missing_is_404() {
        let dir = tempdir().unwrap();
        let response = api(&dir)
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/remove")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"filename": "ghost_linux_v1.0.0.vkp"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn remove_deletes_installed_archive() {
        let dir = tempdir().unwrap();
        let app = api(&dir);
        let vpks = dir.path().join("plugins/vpks");
        std::fs::write(vpks.join("svc_linux_v1.0.0.vkp"), b"x").unwrap();

        let request = || {
            Request::builder()
                .method("DELETE")
                .uri("/remove")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"filename": "svc_linux_v1.0.0.vkp"}"#))
                .unwrap()
        };

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!vpks.join("svc_linux_v1.0.0.vkp").exists());

        // Second removal: the file is gone.
        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
