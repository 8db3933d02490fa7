//! Plugin loader: unpack installed archives into supervised plugins.
//!
//! Loading a `.vkp` extracts it under `<root>/temp/<basename>_extracted`,
//! parses the embedded `plugin.json`, marks the binary executable, and
//! publishes a [`PluginProcess`] under its metadata name. The loader owns
//! extraction directories: they are removed on unload, not on shutdown.
//!
//! The map lock is held only around lookups and the final publish —
//! extraction and metadata parsing run without it, and the name conflict
//! check is repeated at publish time.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use super::process::PluginProcess;
use crate::module::Module;
use crate::vkp::{self, PluginMetadata};

/// Errors raised while loading or unloading plugins.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("plugin file not found: {0}")]
    NotFound(String),

    #[error("unsupported plugin format '{0}' (expected .vkp)")]
    UnsupportedFormat(String),

    #[error("bad plugin archive {path}: {message}")]
    BadArchive { path: String, message: String },

    #[error("bad plugin metadata in {path}: {message}")]
    BadMetadata { path: String, message: String },

    #[error("plugin '{0}' is already loaded")]
    NameConflict(String),

    #[error("plugin '{0}' is not loaded")]
    NotLoaded(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> LoaderError {
    LoaderError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Loads `.vkp` packages and tracks the resulting supervisors by name.
pub struct PluginLoader {
    plugin_root: PathBuf,
    plugins: RwLock<HashMap<String, Arc<PluginProcess>>>,
}

impl PluginLoader {
    /// Create a loader rooted at `plugin_root`; extraction scratch lives
    /// under `<plugin_root>/temp/`.
    pub fn new(plugin_root: impl Into<PathBuf>) -> Self {
        PluginLoader {
            plugin_root: plugin_root.into(),
            plugins: RwLock::new(HashMap::new()),
        }
    }

    pub fn plugin_root(&self) -> &Path {
        &self.plugin_root
    }

    /// Load the package at `path` and publish it under its metadata name.
    pub fn load(&self, path: &Path) -> Result<Arc<PluginProcess>, LoaderError> {
        if !path.exists() {
            return Err(LoaderError::NotFound(path.display().to_string()));
        }

        match path.extension().and_then(|e| e.to_str()) {
            Some("vkp") => {}
            other => {
                return Err(LoaderError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_string(),
                ));
            }
        }

        info!(path = %path.display(), "loading plugin package");

        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LoaderError::NotFound(path.display().to_string()))?;
        let extract_dir = self
            .plugin_root
            .join("temp")
            .join(format!("{basename}_extracted"));

        vkp::extract_package(path, &extract_dir).map_err(|e| LoaderError::BadArchive {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let metadata = match self.read_metadata(&extract_dir) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.discard_scratch(&extract_dir);
                return Err(e);
            }
        };

        let binary = extract_dir.join(vkp::BINARY_MEMBER);
        if !binary.exists() {
            self.discard_scratch(&extract_dir);
            return Err(LoaderError::BadArchive {
                path: path.display().to_string(),
                message: format!("archive has no '{}' member", vkp::BINARY_MEMBER),
            });
        }
        mark_executable(&binary)?;

        let process = Arc::new(PluginProcess::new(
            path.to_path_buf(),
            extract_dir.clone(),
            metadata,
        ));
        let name = process.name().to_string();

        {
            let mut plugins = self.plugins.write();
            if plugins.contains_key(&name) {
                // The loaded plugin may share its extraction directory with
                // the conflicting one (same archive basename), so the
                // directory must not be removed here.
                warn!(plugin = %name, "plugin name conflict; extraction directory left in place");
                return Err(LoaderError::NameConflict(name));
            }
            plugins.insert(name.clone(), process.clone());
        }

        info!(
            plugin = %name,
            version = %process.version(),
            path = %path.display(),
            "plugin loaded"
        );
        Ok(process)
    }

    /// Unload a plugin: terminate its child if any, remove the extraction
    /// directory, and drop the map entry.
    pub async fn unload(&self, name: &str) -> Result<(), LoaderError> {
        let process = {
            let mut plugins = self.plugins.write();
            plugins
                .remove(name)
                .ok_or_else(|| LoaderError::NotLoaded(name.to_string()))?
        };

        // Termination failures do not block the unload.
        if let Err(e) = process.stop(Duration::from_secs(2)).await {
            warn!(plugin = %name, error = %e, "failed to stop plugin process");
        }

        let extract_dir = process.extract_dir();
        if let Err(e) = fs::remove_dir_all(extract_dir) {
            warn!(
                plugin = %name,
                dir = %extract_dir.display(),
                error = %e,
                "failed to remove plugin extraction directory"
            );
        }

        info!(plugin = %name, "plugin unloaded");
        Ok(())
    }

    /// Names of every loaded plugin, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginProcess>> {
        self.plugins.read().get(name).cloned()
    }

    /// Remove a failed load's extraction scratch, unless a loaded plugin
    /// owns that directory (re-load of the same archive basename).
    fn discard_scratch(&self, extract_dir: &Path) {
        let in_use = self
            .plugins
            .read()
            .values()
            .any(|p| p.extract_dir() == extract_dir);
        if !in_use {
            let _ = fs::remove_dir_all(extract_dir);
        }
    }

    fn read_metadata(&self, extract_dir: &Path) -> Result<PluginMetadata, LoaderError> {
        let metadata_path = extract_dir.join(vkp::METADATA_MEMBER);
        let raw = fs::read(&metadata_path).map_err(|e| LoaderError::BadMetadata {
            path: metadata_path.display().to_string(),
            message: e.to_string(),
        })?;

        let metadata: PluginMetadata =
            serde_json::from_slice(&raw).map_err(|e| LoaderError::BadMetadata {
                path: metadata_path.display().to_string(),
                message: e.to_string(),
            })?;

        metadata.validate().map_err(|e| LoaderError::BadMetadata {
            path: metadata_path.display().to_string(),
            message: e.to_string(),
        })?;

        Ok(metadata)
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<(), LoaderError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<(), LoaderError> {
    Ok(())
}
