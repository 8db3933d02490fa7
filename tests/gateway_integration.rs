//! Gateway integration tests.
//!
//! Spin up a real gateway on an ephemeral port plus a second local HTTP
//! server handing out `.vkp` packages, then drive the management API the
//! way an operator would: install, replace, list, remove.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;

use vkgate::module::{ModuleRegistry, RouteTable};
use vkgate::plugins::PluginManager;
use vkgate::ratelimit::{MemoryRateLimiter, RateLimitState};
use vkgate::server::{run_server, AuthConfig, ServerConfig, ServerHandle};
use vkgate::vkp::{self, PluginMetadata};

/// Serve every file in `dir` at `/<filename>`; returns the base URL.
async fn serve_packages(dir: PathBuf) -> (String, tokio::task::JoinHandle<()>) {
    async fn file_handler(
        State(dir): State<Arc<PathBuf>>,
        AxumPath(filename): AxumPath<String>,
    ) -> impl IntoResponse {
        match std::fs::read(dir.join(&filename)) {
            Ok(bytes) => (StatusCode::OK, bytes).into_response(),
            Err(_) => (StatusCode::NOT_FOUND, Vec::<u8>::new()).into_response(),
        }
    }

    let app = Router::new()
        .route("/:filename", get(file_handler))
        .with_state(Arc::new(dir));

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), task)
}

fn build_package(dir: &Path, filename: &str, name: &str, version: &str) -> PathBuf {
    let binary = dir.join(format!("{name}-{version}.bin"));
    std::fs::write(&binary, b"#!/bin/sh\nsleep 30\n").unwrap();

    let mut meta = PluginMetadata::new(name, version);
    meta.description = format!("{name} test plugin");

    let out = dir.join(filename);
    vkp::write_package(&out, &binary, &meta, &[]).unwrap();
    out
}

async fn start_gateway(state_root: &Path) -> ServerHandle {
    let manager = Arc::new(
        PluginManager::new(
            state_root.to_path_buf(),
            Arc::new(ModuleRegistry::new()),
            Arc::new(RouteTable::new()),
        )
        .unwrap(),
    );
    run_server(ServerConfig::for_testing(manager)).await.unwrap()
}

#[tokio::test]
async fn install_list_replace_remove_lifecycle() {
    let packages = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();

    build_package(
        packages.path(),
        "svc_linux_amd64_v1.0.0.vkp",
        "svc",
        "1.0.0",
    );
    build_package(
        packages.path(),
        "svc_linux_amd64_v1.0.1.vkp",
        "svc",
        "1.0.1",
    );

    let (package_base, _server) = serve_packages(packages.path().to_path_buf()).await;
    let gateway = start_gateway(state.path()).await;
    let base = gateway.base_url();
    let client = reqwest::Client::new();

    // Install v1.0.0.
    let response = client
        .post(format!("{base}/api/v1/plugins/install"))
        .json(&json!({ "url": format!("{package_base}/svc_linux_amd64_v1.0.0.vkp") }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let vpks = state.path().join("vpks");
    assert!(vpks.join("svc_linux_amd64_v1.0.0.vkp").exists());

    // Listed.
    let body: Value = client
        .get(format!("{base}/api/v1/plugins/installed"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["plugins"], json!(["svc_linux_amd64_v1.0.0.vkp"]));

    // Installing v1.0.1 evicts v1.0.0.
    let response = client
        .post(format!("{base}/api/v1/plugins/install"))
        .json(&json!({ "url": format!("{package_base}/svc_linux_amd64_v1.0.1.vkp") }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(!vpks.join("svc_linux_amd64_v1.0.0.vkp").exists());
    assert!(vpks.join("svc_linux_amd64_v1.0.1.vkp").exists());

    // Remove succeeds once, then 404s.
    let remove = || {
        client
            .delete(format!("{base}/api/v1/plugins/remove"))
            .json(&json!({ "filename": "svc_linux_amd64_v1.0.1.vkp" }))
            .send()
    };
    assert_eq!(remove().await.unwrap().status(), reqwest::StatusCode::OK);
    assert!(!vpks.join("svc_linux_amd64_v1.0.1.vkp").exists());
    assert_eq!(
        remove().await.unwrap().status(),
        reqwest::StatusCode::NOT_FOUND
    );

    gateway.shutdown().await;
}

#[tokio::test]
async fn install_with_auto_load_registers_and_routes() {
    let packages = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();

    build_package(
        packages.path(),
        "echo_linux_amd64_v1.0.0.vkp",
        "echo",
        "1.0.0",
    );

    let (package_base, _server) = serve_packages(packages.path().to_path_buf()).await;
    let gateway = start_gateway(state.path()).await;
    let base = gateway.base_url();
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/api/v1/plugins/install"))
        .json(&json!({
            "url": format!("{package_base}/echo_linux_amd64_v1.0.0.vkp"),
            "auto_load": true,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["plugin_name"], "echo");

    assert!(gateway.manager().registry().contains("echo"));
    assert_eq!(gateway.manager().loader().list(), vec!["echo"]);

    // The proxy route is live but the plugin was never initialized, so it
    // has no endpoint to forward to yet.
    let response = client
        .get(format!("{base}/api/v1/echo/anything"))
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.status(),
        reqwest::StatusCode::SERVICE_UNAVAILABLE
    );

    // A second auto-load of the same plugin name conflicts.
    let response = client
        .post(format!("{base}/api/v1/plugins/install"))
        .json(&json!({
            "url": format!("{package_base}/echo_linux_amd64_v1.0.0.vkp"),
            "auto_load": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

    gateway.shutdown().await;
}

#[tokio::test]
async fn download_failure_surfaces_as_500() {
    let packages = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();

    let (package_base, _server) = serve_packages(packages.path().to_path_buf()).await;
    let gateway = start_gateway(state.path()).await;
    let client = reqwest::Client::new();

    // The package server will 404 this filename.
    let response = client
        .post(format!("{}/api/v1/plugins/install", gateway.base_url()))
        .json(&json!({ "url": format!("{package_base}/ghost_linux_amd64_v1.0.0.vkp") }))
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.status(),
        reqwest::StatusCode::INTERNAL_SERVER_ERROR
    );

    gateway.shutdown().await;
}

#[tokio::test]
async fn bearer_auth_protects_management_surface() {
    let state = TempDir::new().unwrap();
    let manager = Arc::new(
        PluginManager::new(
            state.path().to_path_buf(),
            Arc::new(ModuleRegistry::new()),
            Arc::new(RouteTable::new()),
        )
        .unwrap(),
    );
    let mut config = ServerConfig::for_testing(manager);
    config.auth = AuthConfig::with_token("s3cret");
    let gateway = run_server(config).await.unwrap();
    let base = gateway.base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/api/v1/plugins/installed"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let response = client
        .get(format!("{base}/api/v1/plugins/installed"))
        .bearer_auth("s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    // Health stays open.
    let response = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    gateway.shutdown().await;
}

#[tokio::test]
async fn rate_limit_rejects_over_quota_requests() {
    let state = TempDir::new().unwrap();
    let manager = Arc::new(
        PluginManager::new(
            state.path().to_path_buf(),
            Arc::new(ModuleRegistry::new()),
            Arc::new(RouteTable::new()),
        )
        .unwrap(),
    );
    let mut config = ServerConfig::for_testing(manager);
    config.rate_limit = Some(RateLimitState::new(Arc::new(MemoryRateLimiter::new(
        2,
        std::time::Duration::from_secs(60),
    ))));
    let gateway = run_server(config).await.unwrap();
    let base = gateway.base_url();
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let response = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }

    let response = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(
        response.status(),
        reqwest::StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok()),
        Some("0")
    );

    gateway.shutdown().await;
}
