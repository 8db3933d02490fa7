//! The pluggable-unit contract.
//!
//! Everything the gateway can host — statically compiled modules and
//! subprocess-supervised plugins alike — satisfies the [`Module`] trait.
//! The registry (see [`registry`]) fans lifecycle calls out across the
//! registered set and never distinguishes between the two shapes.

pub mod registry;
pub mod routes;

use async_trait::async_trait;
use axum::Router;
use serde_json::Value;
use thiserror::Error;

use crate::vkp::PluginMetadata;

pub use registry::{ModuleInfo, ModuleRegistry, RegistryError};
pub use routes::RouteTable;

/// Errors surfaced by individual module lifecycle calls.
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("failed to spawn plugin process: {0}")]
    SpawnFailed(String),

    #[error("initialization failed: {0}")]
    Init(String),

    #[error("route registration failed: {0}")]
    Routes(String),

    #[error("health probe failed: {0}")]
    Unhealthy(String),

    #[error("shutdown failed: {0}")]
    Shutdown(String),

    #[error("module '{0}' does not support standalone mode")]
    StandaloneUnsupported(String),
}

/// The capability set every hosted unit exposes.
///
/// `routes` returns an axum subrouter that the gateway nests beneath a
/// path prefix derived from the module name; handlers therefore see paths
/// relative to that prefix.
#[async_trait]
pub trait Module: Send + Sync {
    /// Stable identifier; doubles as the registry key and route prefix.
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn description(&self) -> &str;

    /// Bring the module up. `config` is the free-form section keyed by the
    /// module name in the gateway configuration, when present.
    async fn initialize(&self, config: Option<&Value>) -> Result<(), ModuleError>;

    /// Build the module's route tree, rooted at its mount point.
    fn routes(&self) -> Result<Router, ModuleError>;

    /// Probe the module. Healthy modules return a JSON object describing
    /// their state; failures are reported as errors.
    async fn health(&self) -> Result<Value, ModuleError>;

    /// Tear the module down. Must be safe to call on a module that was
    /// never initialized.
    async fn shutdown(&self) -> Result<(), ModuleError>;

    /// Package metadata, for dynamically loaded plugins.
    fn metadata(&self) -> Option<&PluginMetadata> {
        None
    }

    /// Whether the module can run detached as its own HTTP server.
    fn can_run_standalone(&self) -> bool {
        false
    }
}
