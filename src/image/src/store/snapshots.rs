//! Native snapshotter: every snapshot is a plain directory tree.
//!
//! Preparing a snapshot copies its parent's tree, so each committed snapshot
//! is self-contained and can be removed independently of its children's
//! contents (the parent link is still tracked for GC and removal checks).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cask_core::error::{CaskError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{load_json, save_json, LeaseManager, Resource, Snapshotter};
use crate::context::OpContext;

/// Snapshot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Active,
    View,
    Committed,
}

/// Snapshot metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    pub kind: SnapshotKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Directory name under `snapshots/`.
    id: String,
}

/// Disk usage of a snapshot tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub size: u64,
    pub inodes: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataFile {
    snapshots: Vec<SnapshotInfo>,
}

/// Copy-based snapshotter rooted at `snapshots/native/`.
pub struct NativeSnapshotter {
    root: PathBuf,
    meta: RwLock<HashMap<String, SnapshotInfo>>,
    leases: Arc<dyn LeaseManager>,
}

impl NativeSnapshotter {
    pub const NAME: &'static str = "native";

    pub fn open(root: &Path, leases: Arc<dyn LeaseManager>) -> Result<Self> {
        let root = root.join("snapshots").join(Self::NAME);
        std::fs::create_dir_all(root.join("snapshots"))?;
        let file: MetadataFile = load_json(&root.join("metadata.json"))?;
        Ok(Self {
            meta: RwLock::new(file.snapshots.into_iter().map(|s| (s.name.clone(), s)).collect()),
            root,
            leases,
        })
    }

    fn tree(&self, id: &str) -> PathBuf {
        self.root.join("snapshots").join(id).join("fs")
    }

    fn save(&self, meta: &HashMap<String, SnapshotInfo>) -> Result<()> {
        let mut snapshots: Vec<SnapshotInfo> = meta.values().cloned().collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        save_json(&self.root.join("metadata.json"), &MetadataFile { snapshots })
    }

    async fn create(
        &self,
        ctx: &OpContext,
        key: &str,
        parent: Option<&str>,
        kind: SnapshotKind,
    ) -> Result<PathBuf> {
        ctx.check()?;
        let mut meta = self.meta.write().await;
        if meta.contains_key(key) {
            return Err(CaskError::AlreadyExists(format!("snapshot {key}")));
        }
        let parent_tree = match parent {
            Some(p) => {
                let info = meta
                    .get(p)
                    .ok_or_else(|| CaskError::not_found(format!("parent snapshot {p}")))?;
                if info.kind != SnapshotKind::Committed {
                    return Err(CaskError::invalid(format!(
                        "parent snapshot {p} is not committed"
                    )));
                }
                Some(self.tree(&info.id))
            }
            None => None,
        };

        let id = uuid::Uuid::new_v4().simple().to_string();
        let tree = self.tree(&id);
        let dst = tree.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dst)?;
            if let Some(src) = parent_tree {
                copy_tree(&src, &dst)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| CaskError::Other(format!("snapshot copy task failed: {e}")))??;

        let now = Utc::now();
        meta.insert(
            key.to_string(),
            SnapshotInfo {
                name: key.to_string(),
                parent: parent.map(str::to_string),
                kind,
                created_at: now,
                updated_at: now,
                labels: BTreeMap::new(),
                id,
            },
        );
        self.save(&meta)?;
        drop(meta);

        if let Some(lease) = ctx.lease() {
            self.leases
                .add_resource(ctx, lease, Resource::snapshot(Self::NAME, key))
                .await?;
        }
        tracing::debug!(key = %key, parent = ?parent, "Snapshot prepared");
        Ok(tree)
    }
}

#[async_trait]
impl Snapshotter for NativeSnapshotter {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn prepare(&self, ctx: &OpContext, key: &str, parent: Option<&str>) -> Result<PathBuf> {
        self.create(ctx, key, parent, SnapshotKind::Active).await
    }

    async fn view(&self, ctx: &OpContext, key: &str, parent: Option<&str>) -> Result<PathBuf> {
        self.create(ctx, key, parent, SnapshotKind::View).await
    }

    async fn commit(
        &self,
        ctx: &OpContext,
        name: &str,
        key: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<()> {
        ctx.check()?;
        let mut meta = self.meta.write().await;
        if meta.contains_key(name) {
            return Err(CaskError::AlreadyExists(format!("snapshot {name}")));
        }
        let mut info = meta
            .remove(key)
            .ok_or_else(|| CaskError::not_found(format!("snapshot {key}")))?;
        if info.kind != SnapshotKind::Active {
            let kind = info.kind;
            meta.insert(key.to_string(), info);
            return Err(CaskError::invalid(format!(
                "snapshot {key} is {kind:?}, only active snapshots can be committed"
            )));
        }
        info.name = name.to_string();
        info.kind = SnapshotKind::Committed;
        info.labels = labels;
        info.updated_at = Utc::now();
        meta.insert(name.to_string(), info);
        self.save(&meta)?;
        drop(meta);

        if let Some(lease) = ctx.lease() {
            self.leases
                .add_resource(ctx, lease, Resource::snapshot(Self::NAME, name))
                .await?;
        }
        tracing::debug!(name = %name, "Snapshot committed");
        Ok(())
    }

    async fn remove(&self, _ctx: &OpContext, key: &str) -> Result<()> {
        let mut meta = self.meta.write().await;
        if meta.values().any(|s| s.parent.as_deref() == Some(key)) {
            return Err(CaskError::invalid(format!("snapshot {key} has children")));
        }
        let info = meta
            .remove(key)
            .ok_or_else(|| CaskError::not_found(format!("snapshot {key}")))?;
        self.save(&meta)?;
        drop(meta);

        let dir = self.root.join("snapshots").join(&info.id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(key = %key, "Snapshot removed");
        Ok(())
    }

    async fn stat(&self, _ctx: &OpContext, key: &str) -> Result<SnapshotInfo> {
        self.meta
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| CaskError::not_found(format!("snapshot {key}")))
    }

    async fn list(&self, _ctx: &OpContext) -> Result<Vec<SnapshotInfo>> {
        let mut list: Vec<SnapshotInfo> = self.meta.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn usage(&self, ctx: &OpContext, key: &str) -> Result<Usage> {
        let tree = self.mounts(ctx, key).await?;
        tokio::task::spawn_blocking(move || tree_usage(&tree))
            .await
            .map_err(|e| CaskError::Other(format!("usage task failed: {e}")))?
            .map_err(Into::into)
    }

    async fn mounts(&self, _ctx: &OpContext, key: &str) -> Result<PathBuf> {
        let meta = self.meta.read().await;
        let info = meta
            .get(key)
            .ok_or_else(|| CaskError::not_found(format!("snapshot {key}")))?;
        Ok(self.tree(&info.id))
    }
}

/// Recursively copy `src` into `dst`, keeping symlinks and permissions.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let metadata = std::fs::symlink_metadata(&from)?;
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(&from)?, &to)?;
        } else if file_type.is_dir() {
            std::fs::create_dir_all(&to)?;
            copy_tree(&from, &to)?;
            std::fs::set_permissions(&to, metadata.permissions())?;
            std::fs::File::open(&to)?.set_modified(metadata.modified()?)?;
        } else if file_type.is_file() {
            std::fs::copy(&from, &to)?;
            // Differ compares mtimes; keep them stable across copies.
            std::fs::File::options()
                .write(true)
                .open(&to)?
                .set_modified(metadata.modified()?)?;
        }
    }
    Ok(())
}

fn tree_usage(root: &Path) -> std::io::Result<Usage> {
    let mut usage = Usage::default();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let metadata = std::fs::symlink_metadata(entry.path())?;
            usage.inodes += 1;
            if metadata.is_dir() {
                stack.push(entry.path());
            } else if metadata.is_file() {
                usage.size += metadata.len();
            }
        }
    }
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalLeaseManager;
    use cask_core::ErrorKind;
    use tempfile::TempDir;

    fn open(tmp: &TempDir) -> NativeSnapshotter {
        let leases = Arc::new(LocalLeaseManager::open(tmp.path()).unwrap());
        NativeSnapshotter::open(tmp.path(), leases).unwrap()
    }

    #[tokio::test]
    async fn test_prepare_commit_child() {
        let tmp = TempDir::new().unwrap();
        let sn = open(&tmp);
        let ctx = OpContext::new("default");

        let base = sn.prepare(&ctx, "extract-1", None).await.unwrap();
        std::fs::write(base.join("base.txt"), "base").unwrap();
        std::os::unix::fs::symlink("base.txt", base.join("link")).unwrap();
        sn.commit(&ctx, "chain-1", "extract-1", BTreeMap::new()).await.unwrap();
        assert_eq!(
            sn.stat(&ctx, "extract-1").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(sn.stat(&ctx, "chain-1").await.unwrap().kind, SnapshotKind::Committed);

        let child = sn.prepare(&ctx, "extract-2", Some("chain-1")).await.unwrap();
        assert_eq!(std::fs::read_to_string(child.join("base.txt")).unwrap(), "base");
        assert!(std::fs::symlink_metadata(child.join("link"))
            .unwrap()
            .file_type()
            .is_symlink());
        std::fs::write(child.join("child.txt"), "child").unwrap();
        sn.commit(&ctx, "chain-2", "extract-2", BTreeMap::new()).await.unwrap();

        let parent_tree = sn.mounts(&ctx, "chain-1").await.unwrap();
        assert!(!parent_tree.join("child.txt").exists());

        let usage = sn.usage(&ctx, "chain-2").await.unwrap();
        assert_eq!(usage.size, 9);
        assert_eq!(usage.inodes, 3);
    }

    #[tokio::test]
    async fn test_remove_refuses_parent() {
        let tmp = TempDir::new().unwrap();
        let sn = open(&tmp);
        let ctx = OpContext::new("default");
        sn.prepare(&ctx, "a", None).await.unwrap();
        sn.commit(&ctx, "p", "a", BTreeMap::new()).await.unwrap();
        sn.prepare(&ctx, "b", Some("p")).await.unwrap();

        assert_eq!(sn.remove(&ctx, "p").await.unwrap_err().kind(), ErrorKind::InvalidArgument);
        sn.remove(&ctx, "b").await.unwrap();
        sn.remove(&ctx, "p").await.unwrap();
        assert!(sn.list(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_errors() {
        let tmp = TempDir::new().unwrap();
        let sn = open(&tmp);
        let ctx = OpContext::new("default");
        assert_eq!(
            sn.prepare(&ctx, "x", Some("missing")).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        sn.prepare(&ctx, "x", None).await.unwrap();
        assert_eq!(
            sn.prepare(&ctx, "x", None).await.unwrap_err().kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            sn.prepare(&ctx, "y", Some("x")).await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[tokio::test]
    async fn test_leased_snapshots_recorded() {
        let tmp = TempDir::new().unwrap();
        let leases = Arc::new(LocalLeaseManager::open(tmp.path()).unwrap());
        let sn = NativeSnapshotter::open(tmp.path(), leases.clone()).unwrap();
        let ctx = OpContext::new("default");
        leases
            .create(&ctx, Some("l".to_string()), None, BTreeMap::new())
            .await
            .unwrap();
        let leased = ctx.with_lease("l");
        sn.prepare(&leased, "k", None).await.unwrap();
        sn.commit(&leased, "n", "k", BTreeMap::new()).await.unwrap();
        let resources = &leases.list(&ctx).await.unwrap()[0].resources;
        assert!(resources.contains(&Resource::snapshot("native", "n")));
    }
}
