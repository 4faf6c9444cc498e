//! Per-registry host settings from the hosts directories.
//!
//! Each directory may hold `<host>/hosts.yaml` (or `_default/hosts.yaml`):
//!
//! ```yaml
//! plain_http: false
//! skip_verify: true
//! ca:
//!   - /etc/cask/certs.d/registry.local/ca.pem
//! ```
//!
//! The first directory with a matching file wins. Relative CA paths are
//! resolved against the host's directory.

use std::path::{Path, PathBuf};

use cask_core::error::{CaskError, Result};
use serde::{Deserialize, Serialize};

/// Settings for one registry host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub plain_http: bool,
    pub skip_verify: bool,
    pub ca: Vec<PathBuf>,
}

impl HostConfig {
    /// Load settings for `host` from `dirs`; defaults when nothing matches.
    pub fn load(dirs: &[PathBuf], host: &str) -> Result<Self> {
        let candidates = [host.to_string(), host.replace(':', "_"), "_default".to_string()];
        for dir in dirs {
            for name in &candidates {
                let host_dir = dir.join(name);
                let path = host_dir.join("hosts.yaml");
                if path.is_file() {
                    return Self::load_file(&path, &host_dir);
                }
            }
        }
        Ok(Self::default())
    }

    fn load_file(path: &Path, host_dir: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let mut config: HostConfig = serde_yaml::from_str(&data).map_err(|e| {
            CaskError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        for ca in &mut config.ca {
            if ca.is_relative() {
                *ca = host_dir.join(&*ca);
            }
        }
        tracing::debug!(path = %path.display(), "Loaded registry host config");
        Ok(config)
    }

    /// PEM bytes of every configured CA.
    pub fn ca_certificates(&self) -> Result<Vec<Vec<u8>>> {
        self.ca
            .iter()
            .map(|p| {
                std::fs::read(p).map_err(|e| {
                    CaskError::Config(format!("failed to read CA {}: {}", p.display(), e))
                })
            })
            .collect()
    }
}
