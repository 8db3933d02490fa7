//! Plugin manager: the composition root of the plugin subsystem.
//!
//! Ties the installer, loader, module registry, and route table together
//! for the management surface. The manager itself holds no lock — each
//! component guards its own state, so nothing is held across downloads,
//! extraction, or subprocess work.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::installer::{InstallError, PackageInstaller};
use super::loader::{LoaderError, PluginLoader};
use crate::module::{Module, ModuleRegistry, RegistryError, RouteTable};

/// Errors surfaced by manager operations, tagged by the failing stage.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Load(#[from] LoaderError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Owns the plugin lifecycle from download to registration.
pub struct PluginManager {
    installer: PackageInstaller,
    loader: Arc<PluginLoader>,
    registry: Arc<ModuleRegistry>,
    routes: Arc<RouteTable>,
}

impl PluginManager {
    /// Build a manager rooted at `plugin_root`: installed archives live in
    /// `<root>/vpks/`, extraction scratch in `<root>/temp/`.
    pub fn new(
        plugin_root: impl Into<PathBuf>,
        registry: Arc<ModuleRegistry>,
        routes: Arc<RouteTable>,
    ) -> Result<Self, ManagerError> {
        let plugin_root = plugin_root.into();
        let installer = PackageInstaller::new(plugin_root.join("vpks"))?;
        let loader = Arc::new(PluginLoader::new(plugin_root));

        Ok(PluginManager {
            installer,
            loader,
            registry,
            routes,
        })
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn installer(&self) -> &PackageInstaller {
        &self.installer
    }

    /// Download a package without loading it.
    pub async fn install_from_url(&self, url: &str) -> Result<PathBuf, ManagerError> {
        let path = self.installer.install_from_url(url).await?;
        Ok(path)
    }

    /// Download, load, register, and mount a package in one shot. Returns
    /// the plugin name. A failure at any stage surfaces that stage's error;
    /// earlier stages are not rolled back (the archive stays installed).
    pub async fn install_and_load(&self, url: &str) -> Result<String, ManagerError> {
        let path = self.installer.install_from_url(url).await?;
        let process = self.loader.load(&path)?;
        let name = process.name().to_string();

        if let Err(e) = self.registry.register(&name, process.clone()) {
            // Keep loader and registry views consistent.
            if let Err(unload_err) = self.loader.unload(&name).await {
                warn!(plugin = %name, error = %unload_err, "rollback unload failed");
            }
            return Err(e.into());
        }

        match process.routes() {
            Ok(router) => self.routes.mount(&name, router),
            Err(e) => {
                warn!(plugin = %name, error = %e, "plugin routes unavailable");
            }
        }

        info!(plugin = %name, url = %url, "plugin installed and loaded");
        Ok(name)
    }

    /// Basenames of the installed package archives.
    pub async fn list_installed(&self) -> Result<Vec<String>, ManagerError> {
        let packages = self.installer.list().await?;
        Ok(packages)
    }

    /// Remove an installed package archive by filename.
    pub async fn remove_installed(&self, filename: &str) -> Result<(), ManagerError> {
        self.installer.remove(filename).await?;
        Ok(())
    }

    /// Unload a plugin and drop it from the registry and route table.
    pub async fn unload_plugin(&self, name: &str) -> Result<(), ManagerError> {
        self.routes.unmount(name);
        if let Err(e) = self.registry.unregister(name) {
            warn!(plugin = %name, error = %e, "plugin was not registered");
        }
        self.loader.unload(name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vkp::{self, PluginMetadata};
    use std::fs;
    use tempfile::tempdir;

    fn manager(root: &std::path::Path) -> PluginManager {
        PluginManager::new(
            root.to_path_buf(),
            Arc::new(ModuleRegistry::new()),
            Arc::new(RouteTable::new()),
        )
        .unwrap()
    }

    fn build_package(dir: &std::path::Path, filename: &str, name: &str) -> PathBuf {
        let binary = dir.join("plugin.bin");
        fs::write(&binary, b"#!/bin/sh\nsleep 30\n").unwrap();
        let vkp_path = dir.join(filename);
        vkp::write_package(&vkp_path, &binary, &PluginMetadata::new(name, "1.0.0"), &[]).unwrap();
        vkp_path
    }

    #[tokio::test]
    async fn list_installed_starts_empty() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir.path().join("plugins"));
        assert!(manager.list_installed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_installed_missing_is_install_error() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir.path().join("plugins"));
        let err = manager
            .remove_installed("ghost_linux_v1.0.0.vkp")
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Install(InstallError::NotFound(_))));
    }

    #[tokio::test]
    async fn load_and_unload_keep_views_consistent() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("plugins");
        let manager = manager(&root);

        // Place a package directly in the vpks dir and load it through the
        // loader path the install endpoint would take.
        let vkp_path = build_package(manager.installer().vpks_dir(), "svc_linux_v1.0.0.vkp", "svc");
        let process = manager.loader().load(&vkp_path).unwrap();
        manager
            .registry()
            .register("svc", process.clone())
            .unwrap();
        manager
            .routes()
            .mount("svc", process.routes().unwrap());

        assert!(manager.registry().contains("svc"));
        assert!(manager.routes().contains("svc"));

        manager.unload_plugin("svc").await.unwrap();
        assert!(!manager.registry().contains("svc"));
        assert!(!manager.routes().contains("svc"));
        assert!(manager.loader().get("svc").is_none());
    }
}
