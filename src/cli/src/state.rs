//! Container state as seen by image commands.
//!
//! Containers are tracked in `<data_root>/<namespace>/containers.json` by
//! whatever creates them. Image removal only reads the file: on every load,
//! records claiming to be running with a dead PID are treated as stopped.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cask_core::{CaskError, Result};
use cask_image::ops::{ContainerLookup, ContainerUse};
use cask_image::OpContext;
use serde::{Deserialize, Serialize};

/// File name of the container state inside a namespace directory.
pub const STATE_FILE: &str = "containers.json";

/// Metadata record for a single container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Image name or target digest the container was created from
    pub image: String,
    /// "created" | "running" | "stopped" | "dead"
    pub status: String,
    /// Init process PID (set when running)
    #[serde(default)]
    pub pid: Option<u32>,
}

impl ContainerRecord {
    fn is_running(&self) -> bool {
        self.status == "running" && self.pid.map(is_process_alive).unwrap_or(false)
    }
}

/// Read-only view of the container state file.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// State file of `namespace` under `data_root`.
    pub fn for_namespace(data_root: &Path, namespace: &str) -> Self {
        Self::new(data_root.join(namespace).join(STATE_FILE))
    }

    /// All records; a missing file means no containers.
    pub fn load(&self) -> Result<Vec<ContainerRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&data).map_err(|e| {
            CaskError::Config(format!("failed to parse {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl ContainerLookup for StateFile {
    async fn containers(&self, _ctx: &OpContext) -> Result<Vec<ContainerUse>> {
        Ok(self
            .load()?
            .into_iter()
            .map(|r| ContainerUse {
                running: r.is_running(),
                id: r.id,
                image: r.image,
            })
            .collect())
    }
}

/// Check if a process is alive by sending signal 0.
fn is_process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence and permission check.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
