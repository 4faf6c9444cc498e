//! Global configuration.
//!
//! Loaded from `$CASK_CONFIG` or `~/.cask/cask.yaml`. Every field has a
//! default, so a missing file is not an error. Command-line flags are merged
//! on top through [`ConfigFlags`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CaskError, Result};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "CASK_CONFIG";

/// Default namespace inside the store.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default snapshotter name.
pub const DEFAULT_SNAPSHOTTER: &str = "native";

/// Default lease expiration: 1 hour.
pub const DEFAULT_LEASE_EXPIRATION_SECS: u64 = 60 * 60;

/// Cask configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CaskConfig {
    /// Root directory of the content store, image records and snapshots
    pub data_root: PathBuf,

    /// Namespace inside the store
    pub namespace: String,

    /// Snapshotter used to unpack images
    pub snapshotter: String,

    /// Directories holding per-registry host settings (`<dir>/<host>/hosts.yaml`)
    pub hosts_dir: Vec<PathBuf>,

    /// Allow plain HTTP and unverified TLS when HTTPS fails
    pub insecure_registry: bool,

    /// Enable experimental features (cosign signing)
    pub experimental: bool,

    /// Debug logging
    pub debug: bool,

    /// IPFS API address (multiaddr or URL)
    pub ipfs_address: Option<String>,

    /// Lease expiration in seconds for multi-blob operations
    pub lease_expiration_secs: u64,
}

impl Default for CaskConfig {
    fn default() -> Self {
        let home = cask_home();
        Self {
            data_root: home.join("data"),
            namespace: DEFAULT_NAMESPACE.to_string(),
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            hosts_dir: vec![home.join("certs.d")],
            insecure_registry: false,
            experimental: false,
            debug: false,
            ipfs_address: None,
            lease_expiration_secs: DEFAULT_LEASE_EXPIRATION_SECS,
        }
    }
}

/// Command-line overrides. `None` leaves the file value in place.
#[derive(Debug, Clone, Default)]
pub struct ConfigFlags {
    pub data_root: Option<PathBuf>,
    pub namespace: Option<String>,
    pub snapshotter: Option<String>,
    pub hosts_dir: Vec<PathBuf>,
    pub insecure_registry: bool,
    pub experimental: bool,
    pub debug: bool,
}

impl CaskConfig {
    /// Load configuration from `$CASK_CONFIG`, else `~/.cask/cask.yaml`.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| cask_home().join("cask.yaml"));
        Self::load_from(&path)
    }

    /// Load configuration from a specific file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path).map_err(|e| {
            CaskError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: CaskConfig = serde_yaml::from_str(&data).map_err(|e| {
            CaskError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides.
    pub fn merge_flags(mut self, flags: ConfigFlags) -> Self {
        if let Some(root) = flags.data_root {
            self.data_root = root;
        }
        if let Some(ns) = flags.namespace {
            self.namespace = ns;
        }
        if let Some(sn) = flags.snapshotter {
            self.snapshotter = sn;
        }
        if !flags.hosts_dir.is_empty() {
            self.hosts_dir = flags.hosts_dir;
        }
        self.insecure_registry |= flags.insecure_registry;
        self.experimental |= flags.experimental;
        self.debug |= flags.debug;
        self
    }

    /// Check field values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty()
            || !self
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(CaskError::Config(format!(
                "invalid namespace \"{}\"",
                self.namespace
            )));
        }
        if self.snapshotter.is_empty() {
            return Err(CaskError::Config("snapshotter must not be empty".to_string()));
        }
        Ok(())
    }

    /// Root of the current namespace inside the data root.
    pub fn namespace_root(&self) -> PathBuf {
        self.data_root.join(&self.namespace)
    }

    /// Lease expiration as a `Duration`.
    pub fn lease_expiration(&self) -> Duration {
        Duration::from_secs(self.lease_expiration_secs)
    }
}

/// `~/.cask`, or `./.cask` when the home directory is unknown.
pub fn cask_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".cask"))
        .unwrap_or_else(|| PathBuf::from(".cask"))
}
