//! Registry credentials.
//!
//! Stored per registry at `~/.cask/auth/credentials.json`, written
//! atomically. Lookup falls back to `REGISTRY_USERNAME`/`REGISTRY_PASSWORD`
//! and then to anonymous access.

use std::collections::BTreeMap;
use std::path::PathBuf;

use cask_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::store::{load_json, save_json};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialEntry {
    username: String,
    password: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    registries: BTreeMap<String, CredentialEntry>,
}

/// Persistent per-registry credentials.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// `~/.cask/auth/credentials.json`.
    pub fn default_path() -> Self {
        Self::new(cask_core::config::cask_home().join("auth").join("credentials.json"))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store credentials, replacing any existing entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file: CredentialFile = load_json(&self.path)?;
        file.registries.insert(
            normalize_registry(registry),
            CredentialEntry {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        save_json(&self.path, &file)
    }

    /// `(username, password)` for a registry.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let file: CredentialFile = load_json(&self.path)?;
        Ok(file
            .registries
            .get(&normalize_registry(registry))
            .map(|e| (e.username.clone(), e.password.clone())))
    }

    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file: CredentialFile = load_json(&self.path)?;
        let removed = file.registries.remove(&normalize_registry(registry)).is_some();
        if removed {
            save_json(&self.path, &file)?;
        }
        Ok(removed)
    }
}

/// Docker Hub aliases share one entry.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    match r.as_str() {
        "docker.io" | "registry-1.docker.io" | "index.docker.io" => "index.docker.io".to_string(),
        _ => r,
    }
}

/// Credentials for one registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// `REGISTRY_USERNAME`/`REGISTRY_PASSWORD`, else anonymous.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(u), Some(p)) => Self::basic(u, p),
            _ => Self::anonymous(),
        }
    }

    /// The credential store entry, else the environment, else anonymous.
    pub fn lookup(store: &CredentialStore, registry: &str) -> Self {
        match store.get(registry) {
            Ok(Some((u, p))) => Self::basic(u, p),
            Ok(None) => Self::from_env(),
            Err(e) => {
                tracing::warn!(registry = %registry, error = %e, "Failed to read credential store");
                Self::from_env()
            }
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    pub(crate) fn to_oci(&self) -> oci_distribution::secrets::RegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => oci_distribution::secrets::RegistryAuth::Basic(u.clone(), p.clone()),
            _ => oci_distribution::secrets::RegistryAuth::Anonymous,
        }
    }
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
