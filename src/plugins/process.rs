//! Subprocess plugin supervisor.
//!
//! A [`PluginProcess`] owns an extracted plugin binary and, once
//! initialized, its child process. The binary is started with
//! `--mode=gateway` and is expected to print a single JSON line on stdout
//! announcing its local HTTP endpoint:
//!
//! ```text
//! {"listen":"127.0.0.1:49152"}
//! ```
//!
//! The supervisor's stdout reader publishes that address on a watch
//! channel; the proxy route answers 503 until it arrives. Shutdown sends
//! SIGTERM and escalates to SIGKILL when the child outlives the grace
//! period. Standalone mode (`--mode=standalone --port=N`) runs the binary
//! as its own HTTP server and blocks until it exits.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::module::{Module, ModuleError};
use crate::vkp::PluginMetadata;

/// How long a child gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// Cap on proxied request bodies (32 MB).
const MAX_PROXY_BODY: usize = 32 * 1024 * 1024;

/// Announce line a plugin prints on stdout once its endpoint is up.
#[derive(Debug, Deserialize)]
struct ListenAnnounce {
    listen: String,
}

/// Shared state for the proxy route.
#[derive(Debug)]
struct ProxyState {
    plugin_name: String,
    listen_rx: watch::Receiver<Option<String>>,
    client: reqwest::Client,
}

/// Supervisor for one extracted plugin binary.
#[derive(Debug)]
pub struct PluginProcess {
    source: PathBuf,
    extract_dir: PathBuf,
    exec_path: PathBuf,
    metadata: PluginMetadata,
    child: Mutex<Option<Child>>,
    listen_tx: watch::Sender<Option<String>>,
    proxy: Arc<ProxyState>,
}

impl PluginProcess {
    /// Wrap an extracted plugin. `source` is the archive it came from,
    /// `extract_dir` the directory owning the unpacked files.
    pub fn new(source: PathBuf, extract_dir: PathBuf, metadata: PluginMetadata) -> Self {
        let exec_path = extract_dir.join(crate::vkp::BINARY_MEMBER);
        let (listen_tx, listen_rx) = watch::channel(None);

        let proxy = Arc::new(ProxyState {
            plugin_name: metadata.name.clone(),
            listen_rx,
            client: reqwest::Client::new(),
        });

        PluginProcess {
            source,
            extract_dir,
            exec_path,
            metadata,
            child: Mutex::new(None),
            listen_tx,
            proxy,
        }
    }

    /// Path of the archive this plugin was loaded from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Extraction directory owned by the loader.
    pub fn extract_dir(&self) -> &Path {
        &self.extract_dir
    }

    pub fn exec_path(&self) -> &Path {
        &self.exec_path
    }

    /// The announced local endpoint, when the plugin has reported one.
    pub fn listen_addr(&self) -> Option<String> {
        self.proxy.listen_rx.borrow().clone()
    }

    /// Run the binary detached (`--mode=standalone --port=N`) and block
    /// until it exits. The child's exit status is the result.
    pub async fn run_standalone(&self, port: u16) -> Result<std::process::ExitStatus, ModuleError> {
        if !self.can_run_standalone() {
            return Err(ModuleError::StandaloneUnsupported(
                self.metadata.name.clone(),
            ));
        }

        info!(plugin = %self.metadata.name, port, "running plugin standalone");
        Command::new(&self.exec_path)
            .arg("--mode=standalone")
            .arg(format!("--port={port}"))
            .status()
            .await
            .map_err(|e| ModuleError::SpawnFailed(e.to_string()))
    }

    /// Terminate the child, escalating to SIGKILL after `grace`. Safe to
    /// call when no child is running.
    pub async fn stop(&self, grace: Duration) -> Result<(), ModuleError> {
        let mut slot = self.child.lock().await;
        let Some(mut child) = slot.take() else {
            return Ok(());
        };
        drop(slot);

        if let Some(pid) = child.id() {
            send_sigterm(pid);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(plugin = %self.metadata.name, %status, "plugin process exited");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    return Err(ModuleError::Shutdown(e.to_string()));
                }
                Err(_) => {
                    warn!(
                        plugin = %self.metadata.name,
                        grace_secs = grace.as_secs(),
                        "plugin ignored SIGTERM; killing"
                    );
                }
            }
        }

        child
            .kill()
            .await
            .map_err(|e| ModuleError::Shutdown(e.to_string()))?;
        Ok(())
    }

    /// Spawn the stdout reader that waits for the listen announce line and
    /// then drains the rest of the stream at debug level.
    fn spawn_announce_reader(&self, stdout: tokio::process::ChildStdout) {
        let listen_tx = self.listen_tx.clone();
        let plugin_name = self.metadata.name.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut announced = false;

            while let Ok(Some(line)) = lines.next_line().await {
                if !announced {
                    if let Ok(announce) = serde_json::from_str::<ListenAnnounce>(&line) {
                        info!(
                            plugin = %plugin_name,
                            listen = %announce.listen,
                            "plugin announced its endpoint"
                        );
                        let _ = listen_tx.send(Some(announce.listen));
                        announced = true;
                        continue;
                    }
                }
                debug!(plugin = %plugin_name, line = %line, "plugin stdout");
            }
        });
    }
}

#[async_trait]
impl Module for PluginProcess {
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn version(&self) -> &str {
        &self.metadata.version
    }

    fn description(&self) -> &str {
        &self.metadata.description
    }

    /// Start the plugin binary in gateway mode. Returns as soon as the
    /// child is spawned; readiness is signalled separately through the
    /// stdout announce line.
    async fn initialize(&self, _config: Option<&Value>) -> Result<(), ModuleError> {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(ModuleError::Init(format!(
                "plugin '{}' is already running",
                self.metadata.name
            )));
        }

        let mut child = Command::new(&self.exec_path)
            .arg("--mode=gateway")
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| ModuleError::SpawnFailed(e.to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            self.spawn_announce_reader(stdout);
        }

        info!(
            plugin = %self.metadata.name,
            pid = child.id().unwrap_or_default(),
            "plugin process started"
        );
        *slot = Some(child);
        Ok(())
    }

    fn routes(&self) -> Result<Router, ModuleError> {
        // A single catch-all: the fallback matches every method and path
        // under the module's mount point.
        let proxy = self.proxy.clone();
        Ok(Router::new().fallback(move |request: Request<Body>| {
            let proxy = proxy.clone();
            async move { proxy_handler(proxy, request).await }
        }))
    }

    async fn health(&self) -> Result<Value, ModuleError> {
        let mut slot = self.child.lock().await;
        let Some(child) = slot.as_mut() else {
            return Ok(json!({ "status": "stopped" }));
        };

        match child.try_wait() {
            Ok(Some(status)) => Ok(json!({
                "status": "unhealthy",
                "error": format!("process exited with {status}"),
            })),
            Ok(None) => {
                let pid = child.id().unwrap_or_default();
                if process_alive(pid) {
                    Ok(json!({ "status": "healthy", "pid": pid }))
                } else {
                    Ok(json!({
                        "status": "unhealthy",
                        "error": "process does not answer signals",
                    }))
                }
            }
            Err(e) => Ok(json!({ "status": "unhealthy", "error": e.to_string() })),
        }
    }

    async fn shutdown(&self) -> Result<(), ModuleError> {
        self.stop(TERM_GRACE).await
    }

    fn metadata(&self) -> Option<&PluginMetadata> {
        Some(&self.metadata)
    }

    fn can_run_standalone(&self) -> bool {
        self.metadata.standalone
    }
}

/// Forward a request to the plugin's announced endpoint.
async fn proxy_handler(proxy: Arc<ProxyState>, request: Request<Body>) -> Response {
    let Some(listen) = proxy.listen_rx.borrow().clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "success": false,
                "message": format!("plugin '{}' has not announced an endpoint yet", proxy.plugin_name),
            })),
        )
            .into_response();
    };

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let target = format!("http://{listen}{path_and_query}");

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_PROXY_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "success": false, "message": e.to_string() })),
            )
                .into_response();
        }
    };

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            return (
                StatusCode::METHOD_NOT_ALLOWED,
                Json(json!({ "success": false, "message": "unsupported method" })),
            )
                .into_response();
        }
    };

    let mut upstream = proxy.client.request(method, &target);
    for (name, value) in &parts.headers {
        if name == axum::http::header::HOST || name == axum::http::header::CONTENT_LENGTH {
            continue;
        }
        upstream = upstream.header(name.as_str(), value.as_bytes());
    }

    let response = match upstream.body(body.to_vec()).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(
                plugin = %proxy.plugin_name,
                target = %target,
                error = %e,
                "plugin proxy request failed"
            );
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "success": false,
                    "message": format!("plugin '{}' is unreachable", proxy.plugin_name),
                })),
            )
                .into_response();
        }
    };

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        if name == reqwest::header::TRANSFER_ENCODING || name == reqwest::header::CONNECTION {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "success": false, "message": e.to_string() })),
            )
                .into_response();
        }
    };

    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // Termination is best-effort; a dead pid is fine.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

/// Liveness probe: signal 0 reports whether the pid still exists.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    pid != 0 && unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
