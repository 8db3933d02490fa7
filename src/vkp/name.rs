//! Installed-package filename convention.
//!
//! `<service>_<platform>_v<major>.<minor>.<patch>[suffix].vkp`, where the
//! platform may itself contain underscores (`linux_amd64`). Parsing walks
//! the underscore-separated parts right to left looking for the first part
//! that opens with a version token; everything before it up to the service
//! name is the platform.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Matches a part that opens with a version token (`v1.2.3`, `10.20.30-rc1`).
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v?[0-9]+\.[0-9]+\.[0-9]+").expect("version regex"));

/// The recommended full-filename shape. Non-matching names are warned about
/// but still accepted.
static RECOMMENDED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9-]+_[A-Za-z0-9_]+_v?[0-9]+\.[0-9]+\.[0-9]+.*\.vkp$")
        .expect("recommended filename regex")
});

/// Errors raised while parsing a package filename.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("package filename '{0}' must end in .vkp")]
    BadExtension(String),

    #[error("package filename '{0}' has too few parts (want <service>_<platform>_<version>.vkp)")]
    TooFewParts(String),

    #[error("package filename '{0}' carries no recognizable version token")]
    NoVersion(String),
}

/// Parsed components of an installed package filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageName {
    /// First underscore-delimited part; the uniqueness key in the install dir.
    pub service: String,
    /// Parts between the service and the version, rejoined with underscores.
    pub platform: String,
    /// The version token onward (includes any trailing suffix parts).
    pub version: String,
    /// The original filename.
    pub filename: String,
}

/// Whether a filename matches the recommended naming convention.
pub fn is_recommended_name(filename: &str) -> bool {
    RECOMMENDED_RE.is_match(filename)
}

/// Parse a `.vkp` filename into its service/platform/version components.
pub fn parse_package_name(filename: &str) -> Result<PackageName, NameError> {
    let stem = filename
        .strip_suffix(".vkp")
        .ok_or_else(|| NameError::BadExtension(filename.to_string()))?;

    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 3 {
        return Err(NameError::TooFewParts(filename.to_string()));
    }

    // Scan right to left: the version may carry suffix parts joined by
    // underscores, so the first match from the end wins.
    let version_index = parts
        .iter()
        .rposition(|part| VERSION_RE.is_match(part))
        .ok_or_else(|| NameError::NoVersion(filename.to_string()))?;

    if version_index == 0 {
        // The version token cannot double as the service name.
        return Err(NameError::TooFewParts(filename.to_string()));
    }

    Ok(PackageName {
        service: parts[0].to_string(),
        platform: parts[1..version_index].join("_"),
        version: parts[version_index..].join("_"),
        filename: filename.to_string(),
    })
}
