//! VKP package format
//!
//! A `.vkp` package is a gzip-compressed tar archive carrying at least two
//! members:
//!
//! - `plugin` — the plugin executable (marked executable on extraction)
//! - `plugin.json` — UTF-8 JSON metadata ([`PluginMetadata`])
//!
//! Additional members are treated as opaque resources and extracted
//! alongside. Non-regular entries (symlinks, devices) are skipped.
//!
//! Installed packages follow the filename convention
//! `<service>_<platform>_v<major>.<minor>.<patch>[suffix].vkp`, parsed by
//! [`name::parse_package_name`]. The convention is enforced by warning, not
//! rejection, so ad-hoc development packages still install.

pub mod archive;
pub mod name;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use archive::{extract_package, write_package, ArchiveError, BINARY_MEMBER, METADATA_MEMBER};
pub use name::{is_recommended_name, parse_package_name, NameError, PackageName};

/// Metadata errors raised when a `plugin.json` fails validation.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("plugin metadata is missing a name")]
    MissingName,

    #[error("plugin metadata for '{0}' is missing a version")]
    MissingVersion(String),
}

fn default_api_version() -> String {
    "v1".to_string()
}

/// Plugin metadata carried as `plugin.json` inside a package.
///
/// Unknown fields are preserved through the `extra` map so that packages
/// round-trip without losing forward-compatible additions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Unique plugin name; doubles as its registry key and route prefix.
    pub name: String,

    /// Plugin version string.
    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub author: String,

    #[serde(default)]
    pub license: String,

    /// Names of other modules this plugin expects to be initialized first.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Plugin API generation; defaults to `"v1"` when absent.
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default)]
    pub min_gateway_version: String,

    /// Whether the binary can run detached with `--mode=standalone`.
    #[serde(default)]
    pub standalone: bool,

    /// Free-form configuration schema, carried for display only.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config_schema: serde_json::Map<String, Value>,

    /// Unrecognized fields, preserved verbatim on round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PluginMetadata {
    /// Minimal metadata with the given name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        PluginMetadata {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            dependencies: Vec::new(),
            api_version: default_api_version(),
            min_gateway_version: String::new(),
            standalone: false,
            config_schema: serde_json::Map::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Validate the invariants every package must satisfy.
    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.name.trim().is_empty() {
            return Err(MetadataError::MissingName);
        }
        if self.version.trim().is_empty() {
            return Err(MetadataError::MissingVersion(self.name.clone()));
        }
        Ok(())
    }
}
