//! Reading and writing `.vkp` archives (gzip-compressed ustar).
//!
//! Extraction materializes regular-file entries only; symlinks and device
//! nodes are skipped. Entry paths are validated before touching the
//! filesystem: anything absolute or containing `..` is rejected rather than
//! extracted.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType, Header};
use thiserror::Error;
use tracing::debug;

use super::PluginMetadata;

/// Archive member holding the plugin executable.
pub const BINARY_MEMBER: &str = "plugin";

/// Archive member holding the plugin metadata.
pub const METADATA_MEMBER: &str = "plugin.json";

/// Errors raised while reading or writing a package archive.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("failed to open package {path}: {source}")]
    Open {
        path: String,
        source: io::Error,
    },

    #[error("corrupt package {path}: {message}")]
    Corrupt { path: String, message: String },

    #[error("package entry '{0}' escapes the extraction directory")]
    PathTraversal(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: io::Error,
    },

    #[error("failed to serialize plugin metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Extract every regular-file member of `vkp_path` into `dest_dir`.
///
/// File modes recorded in the archive are preserved on Unix. The
/// destination directory is created if missing.
pub fn extract_package(vkp_path: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
    let file = File::open(vkp_path).map_err(|e| ArchiveError::Open {
        path: vkp_path.display().to_string(),
        source: e,
    })?;

    fs::create_dir_all(dest_dir).map_err(|e| ArchiveError::Write {
        path: dest_dir.display().to_string(),
        source: e,
    })?;

    let mut archive = Archive::new(GzDecoder::new(file));
    let entries = archive.entries().map_err(|e| ArchiveError::Corrupt {
        path: vkp_path.display().to_string(),
        message: source_message(e),
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| ArchiveError::Corrupt {
            path: vkp_path.display().to_string(),
            message: source_message(e),
        })?;

        if !entry.header().entry_type().is_file() {
            debug!(
                entry = %entry.path().map(|p| p.display().to_string()).unwrap_or_default(),
                "skipping non-regular archive entry"
            );
            continue;
        }

        let entry_path = entry
            .path()
            .map_err(|e| ArchiveError::Corrupt {
                path: vkp_path.display().to_string(),
                message: source_message(e),
            })?
            .into_owned();

        let relative = sanitize_entry_path(&entry_path)?;
        let target = dest_dir.join(&relative);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let mut out = File::create(&target).map_err(|e| ArchiveError::Write {
            path: target.display().to_string(),
            source: e,
        })?;
        io::copy(&mut entry, &mut out).map_err(|e| ArchiveError::Write {
            path: target.display().to_string(),
            source: e,
        })?;

        #[cfg(unix)]
        if let Ok(mode) = entry.header().mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode));
        }
    }

    Ok(())
}

/// Write a `.vkp` archive at `out_path` from a plugin binary, its metadata,
/// and any extra resource files (stored under their basenames).
pub fn write_package(
    out_path: &Path,
    binary_path: &Path,
    metadata: &PluginMetadata,
    extra_files: &[PathBuf],
) -> Result<(), ArchiveError> {
    let binary = fs::read(binary_path).map_err(|e| ArchiveError::Open {
        path: binary_path.display().to_string(),
        source: e,
    })?;

    let metadata_json = serde_json::to_vec_pretty(metadata)?;

    let out = File::create(out_path).map_err(|e| ArchiveError::Write {
        path: out_path.display().to_string(),
        source: e,
    })?;
    let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));

    append_member(&mut builder, out_path, BINARY_MEMBER, &binary, 0o755)?;
    append_member(&mut builder, out_path, METADATA_MEMBER, &metadata_json, 0o644)?;

    for extra in extra_files {
        let data = fs::read(extra).map_err(|e| ArchiveError::Open {
            path: extra.display().to_string(),
            source: e,
        })?;
        let member = extra
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArchiveError::Corrupt {
                path: extra.display().to_string(),
                message: "extra file has no usable basename".to_string(),
            })?;
        append_member(&mut builder, out_path, member, &data, 0o644)?;
    }

    let encoder = builder.into_inner().map_err(|e| ArchiveError::Write {
        path: out_path.display().to_string(),
        source: e,
    })?;
    encoder.finish().map_err(|e| ArchiveError::Write {
        path: out_path.display().to_string(),
        source: e,
    })?;

    Ok(())
}

fn append_member<W: io::Write>(
    builder: &mut Builder<W>,
    out_path: &Path,
    name: &str,
    data: &[u8],
    mode: u32,
) -> Result<(), ArchiveError> {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_cksum();

    builder
        .append_data(&mut header, name, data)
        .map_err(|e| ArchiveError::Write {
            path: out_path.display().to_string(),
            source: e,
        })
}

/// Reject entry paths that could land outside the extraction directory.
fn sanitize_entry_path(path: &Path) -> Result<PathBuf, ArchiveError> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::PathTraversal(path.display().to_string()));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ArchiveError::PathTraversal(path.display().to_string()));
    }
    Ok(clean)
}

fn source_message(e: io::Error) -> String {
    e.to_string()
}
