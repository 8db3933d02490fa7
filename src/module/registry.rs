//! Module registry and lifecycle fan-out.
//!
//! The registry keeps hosted modules addressable by unique name and fans
//! lifecycle calls across them:
//!
//! - `initialize_all` runs in dependency order (declared `dependencies` in
//!   plugin metadata are topologically sorted; registration order breaks
//!   ties) and stops at the first failure without rolling back modules that
//!   already came up — callers invoke `shutdown_all` to clean up.
//! - `register_routes_all` mounts each module's subrouter beneath
//!   `<prefix>/<name>` on a [`RouteTable`] and aborts naming the offender;
//!   already-mounted routes stay mounted.
//! - `health_all` probes every module and never short-circuits.
//! - `shutdown_all` walks modules in reverse registration order, keeps
//!   going through failures, and reports them all at once.
//!
//! The lock is held only around map reads and flag updates, never across
//! an await.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use super::routes::RouteTable;
use super::{Module, ModuleError};

/// Registry-level errors.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("module '{0}' already registered")]
    AlreadyRegistered(String),

    #[error("module '{0}' not found")]
    NotFound(String),

    #[error("dependency cycle among modules: {0}")]
    DependencyCycle(String),

    #[error("failed to initialize module '{name}': {source}")]
    Initialize { name: String, source: ModuleError },

    #[error("failed to register routes for module '{name}': {source}")]
    Routes { name: String, source: ModuleError },

    #[error("shutdown errors: {0}")]
    ShutdownPartial(String),
}

/// Snapshot of a registered module, as listed over the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub initialized: bool,
}

struct Entry {
    name: String,
    module: Arc<dyn Module>,
    initialized: bool,
}

/// Name-keyed module registry preserving registration order.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under `name`. Names are unique and case-sensitive;
    /// re-registering is an error, never an overwrite.
    pub fn register(&self, name: &str, module: Arc<dyn Module>) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.name == name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        entries.push(Entry {
            name: name.to_string(),
            module,
            initialized: false,
        });
        info!(module = %name, "module registered");
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();
        let index = entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        entries.remove(index);
        info!(module = %name, "module unregistered");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.module.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().iter().any(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// List registered modules in registration order.
    pub fn list(&self) -> Vec<ModuleInfo> {
        self.entries
            .read()
            .iter()
            .map(|e| ModuleInfo {
                name: e.name.clone(),
                version: e.module.version().to_string(),
                description: e.module.description().to_string(),
                initialized: e.initialized,
            })
            .collect()
    }

    /// Initialize every module, honoring declared dependencies.
    ///
    /// `configs` maps module names to their free-form configuration value.
    /// Stops at the first failure; modules already initialized stay up.
    pub async fn initialize_all(&self, configs: &Map<String, Value>) -> Result<(), RegistryError> {
        let ordered = self.initialization_order()?;

        for (name, module) in ordered {
            if let Err(source) = module.initialize(configs.get(&name)).await {
                return Err(RegistryError::Initialize { name, source });
            }
            self.mark_initialized(&name);
            info!(module = %name, "module initialized");
        }

        Ok(())
    }

    /// Mount every module's routes on `table` beneath `<prefix>/<name>`.
    /// Aborts at the first failure; earlier mounts are left in place.
    pub fn register_routes_all(
        &self,
        table: &RouteTable,
        prefix: &str,
    ) -> Result<(), RegistryError> {
        let snapshot: Vec<(String, Arc<dyn Module>)> = self
            .entries
            .read()
            .iter()
            .map(|e| (e.name.clone(), e.module.clone()))
            .collect();

        for (name, module) in snapshot {
            let router = module
                .routes()
                .map_err(|source| RegistryError::Routes {
                    name: name.clone(),
                    source,
                })?;
            table.mount(&name, router);
            info!(module = %name, mount = %format!("{prefix}/{name}"), "module routes registered");
        }

        Ok(())
    }

    /// Probe every module. Per-module results; no short-circuit.
    pub async fn health_all(&self) -> Vec<(String, Result<Value, ModuleError>)> {
        let snapshot: Vec<(String, Arc<dyn Module>)> = self
            .entries
            .read()
            .iter()
            .map(|e| (e.name.clone(), e.module.clone()))
            .collect();

        let mut results = Vec::with_capacity(snapshot.len());
        for (name, module) in snapshot {
            let result = module.health().await;
            results.push((name, result));
        }
        results
    }

    /// Aggregate health of every module plus an `overall_status` verdict.
    pub async fn health_report(&self) -> Value {
        let mut report = Map::new();
        let mut all_healthy = true;

        for (name, result) in self.health_all().await {
            match result {
                Ok(health) => {
                    report.insert(name, health);
                }
                Err(e) => {
                    all_healthy = false;
                    report.insert(
                        name,
                        json!({ "status": "unhealthy", "error": e.to_string() }),
                    );
                }
            }
        }

        report.insert(
            "overall_status".to_string(),
            Value::String(if all_healthy { "healthy" } else { "unhealthy" }.to_string()),
        );
        Value::Object(report)
    }

    /// Shut every module down, in reverse registration order. Failures are
    /// collected rather than short-circuiting; the combined error lists
    /// them all.
    pub async fn shutdown_all(&self) -> Result<(), RegistryError> {
        let snapshot: Vec<(String, Arc<dyn Module>)> = self
            .entries
            .read()
            .iter()
            .rev()
            .map(|e| (e.name.clone(), e.module.clone()))
            .collect();

        let mut failures = Vec::new();
        for (name, module) in snapshot {
            match module.shutdown().await {
                Ok(()) => {
                    self.mark_uninitialized(&name);
                    info!(module = %name, "module shut down");
                }
                Err(e) => {
                    error!(module = %name, error = %e, "module shutdown failed");
                    failures.push(format!("module '{name}': {e}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::ShutdownPartial(failures.join("; ")))
        }
    }

    fn mark_initialized(&self, name: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.name == name) {
            entry.initialized = true;
        }
    }

    fn mark_uninitialized(&self, name: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.name == name) {
            entry.initialized = false;
        }
    }

    /// Order modules for initialization: a topological sort over declared
    /// dependencies, stable with respect to registration order. Edges to
    /// names that are not registered are ignored — the registry trusts the
    /// caller's registration set.
    fn initialization_order(&self) -> Result<Vec<(String, Arc<dyn Module>)>, RegistryError> {
        let entries = self.entries.read();

        let index_of: HashMap<&str, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.as_str(), i))
            .collect();

        // in_degree counts registered dependencies only.
        let mut in_degree = vec![0usize; entries.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];

        for (i, entry) in entries.iter().enumerate() {
            let deps = entry
                .module
                .metadata()
                .map(|m| m.dependencies.as_slice())
                .unwrap_or(&[]);
            for dep in deps {
                match index_of.get(dep.as_str()) {
                    Some(&dep_index) if dep_index != i => {
                        in_degree[i] += 1;
                        dependents[dep_index].push(i);
                    }
                    Some(_) => {
                        warn!(module = %entry.name, "module lists itself as a dependency; ignoring");
                    }
                    None => {
                        warn!(
                            module = %entry.name,
                            dependency = %dep,
                            "declared dependency is not registered; ignoring"
                        );
                    }
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..entries.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut ordered = Vec::with_capacity(entries.len());

        while let Some(i) = queue.pop_front() {
            ordered.push((entries[i].name.clone(), entries[i].module.clone()));
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if ordered.len() != entries.len() {
            let stuck: Vec<&str> = entries
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, e)| e.name.as_str())
                .collect();
            return Err(RegistryError::DependencyCycle(stuck.join(", ")));
        }

        Ok(ordered)
    }
}
