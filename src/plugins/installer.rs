//! Package installer: download `.vkp` archives into the install directory.
//!
//! Filenames carry the versioning, so the installer can enforce "one
//! installed version per service" without opening the package body: before
//! writing a new archive it parses every installed filename and removes
//! prior versions of the same service. Names that do not match the
//! recommended convention are warned about but still accepted, which keeps
//! ad-hoc development packages installable.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use url::Url;

use crate::vkp::name::{is_recommended_name, parse_package_name, PackageName};

/// Default timeout for package downloads.
const DOWNLOAD_TIMEOUT_SECS: u64 = 30;

/// Errors raised by the installer.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("invalid plugin URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("rejected plugin filename '{filename}': {reason}")]
    FilenameRejected { filename: String, reason: String },

    #[error("download failed with HTTP status {status}")]
    DownloadStatus { status: u16 },

    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("failed to evict prior version '{filename}': {message}")]
    Eviction { filename: String, message: String },

    #[error("package file not found: {0}")]
    NotFound(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> InstallError {
    InstallError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Downloads and manages installed `.vkp` packages in a single directory.
pub struct PackageInstaller {
    vpks_dir: PathBuf,
    client: reqwest::Client,
}

impl PackageInstaller {
    /// Create an installer rooted at `vpks_dir`, creating it if missing.
    pub fn new(vpks_dir: impl Into<PathBuf>) -> Result<Self, InstallError> {
        let vpks_dir = vpks_dir.into();
        std::fs::create_dir_all(&vpks_dir).map_err(|e| io_err(&vpks_dir, e))?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .user_agent(concat!("vkgate-plugin-installer/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(PackageInstaller { vpks_dir, client })
    }

    pub fn vpks_dir(&self) -> &Path {
        &self.vpks_dir
    }

    /// Download the package at `url` into the install directory, evicting
    /// any prior versions of the same service first. Returns the local
    /// path of the installed archive.
    pub async fn install_from_url(&self, url: &str) -> Result<PathBuf, InstallError> {
        info!(url = %url, "installing plugin package");

        let parsed = Url::parse(url).map_err(|e| InstallError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(InstallError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        if parsed.host_str().map(|h| h.is_empty()).unwrap_or(true) {
            return Err(InstallError::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".to_string(),
            });
        }

        let filename = parsed
            .path_segments()
            .and_then(|segments| segments.last())
            .unwrap_or("")
            .to_string();
        if filename.is_empty() {
            return Err(InstallError::FilenameRejected {
                filename,
                reason: "URL has no trailing path component".to_string(),
            });
        }
        if !filename.ends_with(".vkp") {
            return Err(InstallError::FilenameRejected {
                filename,
                reason: "package filename must end in .vkp".to_string(),
            });
        }

        if !is_recommended_name(&filename) {
            warn!(
                filename = %filename,
                expected = "<service>_<platform>_<version>.vkp",
                "package filename does not match the recommended format"
            );
        }

        match parse_package_name(&filename) {
            Ok(incoming) => self.evict_prior_versions(&incoming).await?,
            Err(e) => {
                warn!(
                    filename = %filename,
                    error = %e,
                    "cannot parse package filename; skipping version eviction"
                );
            }
        }

        let dest = self.vpks_dir.join(&filename);
        if fs::try_exists(&dest).await.unwrap_or(false) {
            warn!(path = %dest.display(), "package file already exists; overwriting");
        }

        self.download_to(url, &dest).await?;

        info!(url = %url, path = %dest.display(), "plugin package installed");
        Ok(dest)
    }

    /// Basenames of every installed `.vkp`, sorted.
    pub async fn list(&self) -> Result<Vec<String>, InstallError> {
        let mut entries = fs::read_dir(&self.vpks_dir)
            .await
            .map_err(|e| io_err(&self.vpks_dir, e))?;

        let mut packages = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err(&self.vpks_dir, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".vkp") {
                packages.push(name.to_string());
            }
        }

        packages.sort();
        Ok(packages)
    }

    /// Remove an installed package by filename.
    pub async fn remove(&self, filename: &str) -> Result<(), InstallError> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return Err(InstallError::FilenameRejected {
                filename: filename.to_string(),
                reason: "filename must not contain path separators".to_string(),
            });
        }

        let path = self.vpks_dir.join(filename);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(InstallError::NotFound(filename.to_string()));
        }

        fs::remove_file(&path).await.map_err(|e| io_err(&path, e))?;
        info!(filename = %filename, "plugin package removed");
        Ok(())
    }

    /// Installed packages whose service matches `service`. Any filename in
    /// the install directory that fails to parse aborts the scan — version
    /// eviction must not silently skip files it cannot reason about.
    pub async fn find_by_service(&self, service: &str) -> Result<Vec<PackageName>, InstallError> {
        let mut matches = Vec::new();
        for filename in self.list().await? {
            let parsed =
                parse_package_name(&filename).map_err(|e| InstallError::Eviction {
                    filename: filename.clone(),
                    message: e.to_string(),
                })?;
            if parsed.service == service {
                matches.push(parsed);
            }
        }
        Ok(matches)
    }

    /// Remove every installed package with the same service but a
    /// different filename than `incoming`.
    async fn evict_prior_versions(&self, incoming: &PackageName) -> Result<(), InstallError> {
        for existing in self.find_by_service(&incoming.service).await? {
            if existing.filename == incoming.filename {
                continue;
            }

            info!(
                service = %incoming.service,
                old_version = %existing.version,
                new_version = %incoming.version,
                old_filename = %existing.filename,
                "evicting prior package version"
            );

            let path = self.vpks_dir.join(&existing.filename);
            fs::remove_file(&path)
                .await
                .map_err(|e| InstallError::Eviction {
                    filename: existing.filename.clone(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn download_to(&self, url: &str, dest: &Path) -> Result<(), InstallError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(InstallError::DownloadStatus {
                status: status.as_u16(),
            });
        }

        let mut out = fs::File::create(dest).await.map_err(|e| io_err(dest, e))?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = fs::remove_file(dest).await;
                    return Err(InstallError::Download(e));
                }
            };
            if let Err(e) = out.write_all(&chunk).await {
                let _ = fs::remove_file(dest).await;
                return Err(io_err(dest, e));
            }
            written += chunk.len() as u64;
        }

        out.flush().await.map_err(|e| io_err(dest, e))?;
        info!(url = %url, path = %dest.display(), bytes = written, "package download complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn installer(dir: &tempfile::TempDir) -> PackageInstaller {
        PackageInstaller::new(dir.path().join("vpks")).unwrap()
    }

    #[tokio::test]
    async fn rejects_bad_urls() {
        let dir = tempdir().unwrap();
        let installer = installer(&dir);

        let err = installer
            .install_from_url("ftp://host/svc_linux_amd64_v1.0.0.vkp")
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::InvalidUrl { .. }));

        let err = installer.install_from_url("not a url").await.unwrap_err();
        assert!(matches!(err, InstallError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn rejects_non_vkp_filenames() {
        let dir = tempdir().unwrap();
        let installer = installer(&dir);

        let err = installer
            .install_from_url("http://host/plugin.tar.gz")
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::FilenameRejected { .. }));

        let err = installer.install_from_url("http://host/").await.unwrap_err();
        assert!(matches!(err, InstallError::FilenameRejected { .. }));
    }

    #[tokio::test]
    async fn list_returns_sorted_basenames() {
        let dir = tempdir().unwrap();
        let installer = installer(&dir);

        std::fs::write(installer.vpks_dir().join("b_linux_v1.0.0.vkp"), b"x").unwrap();
        std::fs::write(installer.vpks_dir().join("a_linux_v1.0.0.vkp"), b"x").unwrap();
        std::fs::write(installer.vpks_dir().join("notes.txt"), b"x").unwrap();

        assert_eq!(
            installer.list().await.unwrap(),
            vec!["a_linux_v1.0.0.vkp", "b_linux_v1.0.0.vkp"]
        );
    }

    #[tokio::test]
    async fn remove_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let installer = installer(&dir);

        let err = installer.remove("ghost_linux_v1.0.0.vkp").await.unwrap_err();
        assert!(matches!(err, InstallError::NotFound(_)));
    }

    #[tokio::test]
    async fn remove_rejects_path_separators() {
        let dir = tempdir().unwrap();
        let installer = installer(&dir);

        let err = installer.remove("../escape.vkp").await.unwrap_err();
        assert!(matches!(err, InstallError::FilenameRejected { .. }));
    }

    #[tokio::test]
    async fn remove_deletes_file() {
        let dir = tempdir().unwrap();
        let installer = installer(&dir);
        let path = installer.vpks_dir().join("svc_linux_v1.0.0.vkp");
        std::fs::write(&path, b"x").unwrap();

        installer.remove("svc_linux_v1.0.0.vkp").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn find_by_service_filters() {
        let dir = tempdir().unwrap();
        let installer = installer(&dir);
        std::fs::write(installer.vpks_dir().join("svc_linux_v1.0.0.vkp"), b"x").unwrap();
        std::fs::write(installer.vpks_dir().join("other_linux_v2.0.0.vkp"), b"x").unwrap();

        let found = installer.find_by_service("svc").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version, "v1.0.0");
    }

    #[tokio::test]
    async fn find_by_service_aborts_on_unparsable_neighbor() {
        let dir = tempdir().unwrap();
        let installer = installer(&dir);
        std::fs::write(installer.vpks_dir().join("svc_linux_v1.0.0.vkp"), b"x").unwrap();
        std::fs::write(installer.vpks_dir().join("malformed.vkp"), b"x").unwrap();

        let err = installer.find_by_service("svc").await.unwrap_err();
        assert!(matches!(err, InstallError::Eviction { .. }));
    }

    #[tokio::test]
    async fn eviction_removes_only_same_service_versions() {
        let dir = tempdir().unwrap();
        let installer = installer(&dir);
        std::fs::write(installer.vpks_dir().join("svc_linux_v1.0.0.vkp"), b"x").unwrap();
        std::fs::write(installer.vpks_dir().join("other_linux_v1.0.0.vkp"), b"x").unwrap();

        let incoming = parse_package_name("svc_linux_v1.0.1.vkp").unwrap();
        installer.evict_prior_versions(&incoming).await.unwrap();

        assert_eq!(
            installer.list().await.unwrap(),
            vec!["other_linux_v1.0.0.vkp"]
        );
    }
}
