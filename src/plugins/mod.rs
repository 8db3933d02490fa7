//! Runtime plugin subsystem.
//!
//! Plugins arrive as `.vkp` archives — a gzip tar carrying an executable
//! and its `plugin.json` metadata. The pipeline:
//!
//! 1. [`installer`] downloads archives into the install directory and
//!    enforces one installed version per service.
//! 2. [`loader`] unpacks an archive, validates metadata, and wraps the
//!    binary in a supervisor.
//! 3. [`process`] supervises the binary as a child process and proxies
//!    gateway traffic to the endpoint it announces.
//! 4. [`manager`] composes the above with the module registry and route
//!    table for the management API.
//!
//! [`standalone`] additionally serves any module as its own HTTP server,
//! which is how plugin binaries implement `--mode=standalone`.

pub mod installer;
pub mod loader;
pub mod manager;
pub mod process;
pub mod standalone;

pub use installer::{InstallError, PackageInstaller};
pub use loader::{LoaderError, PluginLoader};
pub use manager::{ManagerError, PluginManager};
pub use process::PluginProcess;
pub use standalone::{StandaloneError, StandaloneRunner};
