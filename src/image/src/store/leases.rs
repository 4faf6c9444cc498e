//! Leases: scoped protection of a working set from garbage collection.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cask_core::error::{CaskError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{load_json, save_json, LeaseManager};
use crate::context::OpContext;

/// Kind of a leased resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Content,
    Snapshot,
}

/// A resource held by a lease. Snapshot ids are `<snapshotter>/<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub id: String,
}

impl Resource {
    pub fn content(digest: &str) -> Self {
        Self {
            kind: ResourceKind::Content,
            id: digest.to_string(),
        }
    }

    pub fn snapshot(snapshotter: &str, key: &str) -> Self {
        Self {
            kind: ResourceKind::Snapshot,
            id: format!("{snapshotter}/{key}"),
        }
    }
}

/// A lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseFile {
    leases: Vec<Lease>,
}

/// Lease manager persisting to `leases.json`.
pub struct LocalLeaseManager {
    path: PathBuf,
    leases: RwLock<HashMap<String, Lease>>,
}

impl LocalLeaseManager {
    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join("leases.json");
        let file: LeaseFile = load_json(&path)?;
        let leases = file.leases.into_iter().map(|l| (l.id.clone(), l)).collect();
        Ok(Self {
            path,
            leases: RwLock::new(leases),
        })
    }

    fn save(&self, leases: &HashMap<String, Lease>) -> Result<()> {
        let mut list: Vec<Lease> = leases.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        save_json(&self.path, &LeaseFile { leases: list })
    }
}

#[async_trait]
impl LeaseManager for LocalLeaseManager {
    async fn create(
        &self,
        _ctx: &OpContext,
        id: Option<String>,
        expiration: Option<Duration>,
        labels: BTreeMap<String, String>,
    ) -> Result<Lease> {
        let id = id.unwrap_or_else(|| format!("cask-{}", uuid::Uuid::new_v4().simple()));
        let mut leases = self.leases.write().await;
        if leases.contains_key(&id) {
            return Err(CaskError::AlreadyExists(format!("lease {id}")));
        }
        let now = Utc::now();
        let expires_at = expiration
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);
        let lease = Lease {
            id: id.clone(),
            created_at: now,
            expires_at,
            labels,
            resources: Vec::new(),
        };
        leases.insert(id.clone(), lease.clone());
        self.save(&leases)?;
        tracing::debug!(lease = %id, "Lease created");
        Ok(lease)
    }

    async fn delete(&self, _ctx: &OpContext, id: &str) -> Result<()> {
        let mut leases = self.leases.write().await;
        if leases.remove(id).is_none() {
            return Err(CaskError::not_found(format!("lease {id}")));
        }
        self.save(&leases)?;
        tracing::debug!(lease = %id, "Lease deleted");
        Ok(())
    }

    async fn list(&self, _ctx: &OpContext) -> Result<Vec<Lease>> {
        let leases = self.leases.read().await;
        let mut list: Vec<Lease> = leases.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn add_resource(&self, _ctx: &OpContext, id: &str, resource: Resource) -> Result<()> {
        let mut leases = self.leases.write().await;
        let lease = leases
            .get_mut(id)
            .ok_or_else(|| CaskError::not_found(format!("lease {id}")))?;
        if !lease.resources.contains(&resource) {
            lease.resources.push(resource);
            self.save(&leases)?;
        }
        Ok(())
    }
}

/// Holds a lease for the duration of a multi-step operation.
///
/// Call [`LeaseGuard::release`] on every exit path that can await. Dropping
/// an unreleased guard spawns a best-effort release on the current runtime.
pub struct LeaseGuard {
    manager: Arc<dyn LeaseManager>,
    ctx: OpContext,
    id: String,
    released: bool,
}

impl LeaseGuard {
    /// Create a lease and derive a context whose writes it covers.
    pub async fn acquire(
        manager: Arc<dyn LeaseManager>,
        ctx: &OpContext,
        expiration: Duration,
        owner: &str,
    ) -> Result<Self> {
        let mut labels = BTreeMap::new();
        labels.insert(crate::labels::LEASE_OWNER.to_string(), owner.to_string());
        let lease = manager.create(ctx, None, Some(expiration), labels).await?;
        Ok(Self {
            manager,
            ctx: ctx.with_lease(lease.id.clone()),
            id: lease.id,
            released: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Context carrying the lease.
    pub fn context(&self) -> &OpContext {
        &self.ctx
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let ctx = OpContext::new(self.ctx.namespace());
        self.manager.delete(&ctx, &self.id).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(lease = %self.id, "Lease not released; it will expire");
            return;
        };
        let manager = self.manager.clone();
        let ctx = OpContext::new(self.ctx.namespace());
        let id = std::mem::take(&mut self.id);
        handle.spawn(async move {
            if let Err(e) = manager.delete(&ctx, &id).await {
                tracing::debug!(lease = %id, error = %e, "Failed to release lease");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_list_delete() {
        let tmp = TempDir::new().unwrap();
        let manager = LocalLeaseManager::open(tmp.path()).unwrap();
        let ctx = OpContext::new("default");

        let lease = manager
            .create(&ctx, Some("l1".to_string()), None, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(lease.id, "l1");
        assert!(manager
            .create(&ctx, Some("l1".to_string()), None, BTreeMap::new())
            .await
            .is_err());

        manager
            .add_resource(&ctx, "l1", Resource::content("sha256:aa"))
            .await
            .unwrap();
        manager
            .add_resource(&ctx, "l1", Resource::content("sha256:aa"))
            .await
            .unwrap();
        let leases = manager.list(&ctx).await.unwrap();
        assert_eq!(leases[0].resources.len(), 1);

        manager.delete(&ctx, "l1").await.unwrap();
        assert!(manager.list(&ctx).await.unwrap().is_empty());
        assert!(manager.delete(&ctx, "l1").await.is_err());
    }

    #[tokio::test]
    async fn test_persisted_across_open() {
        let tmp = TempDir::new().unwrap();
        let ctx = OpContext::new("default");
        {
            let manager = LocalLeaseManager::open(tmp.path()).unwrap();
            manager
                .create(&ctx, Some("keep".to_string()), None, BTreeMap::new())
                .await
                .unwrap();
        }
        let manager = LocalLeaseManager::open(tmp.path()).unwrap();
        assert_eq!(manager.list(&ctx).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expiration() {
        let tmp = TempDir::new().unwrap();
        let manager = LocalLeaseManager::open(tmp.path()).unwrap();
        let ctx = OpContext::new("default");
        let lease = manager
            .create(&ctx, None, Some(Duration::from_secs(60)), BTreeMap::new())
            .await
            .unwrap();
        assert!(!lease.is_expired(Utc::now()));
        assert!(lease.is_expired(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[tokio::test]
    async fn test_guard_release() {
        let tmp = TempDir::new().unwrap();
        let manager: Arc<dyn LeaseManager> = Arc::new(LocalLeaseManager::open(tmp.path()).unwrap());
        let ctx = OpContext::new("default");

        let guard = LeaseGuard::acquire(manager.clone(), &ctx, Duration::from_secs(3600), "test")
            .await
            .unwrap();
        assert_eq!(guard.context().lease(), Some(guard.id()));
        assert_eq!(manager.list(&ctx).await.unwrap().len(), 1);
        guard.release().await.unwrap();
        assert!(manager.list(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guard_drop_releases() {
        let tmp = TempDir::new().unwrap();
        let manager: Arc<dyn LeaseManager> = Arc::new(LocalLeaseManager::open(tmp.path()).unwrap());
        let ctx = OpContext::new("default");
        {
            let _guard =
                LeaseGuard::acquire(manager.clone(), &ctx, Duration::from_secs(3600), "test")
                    .await
                    .unwrap();
        }
        for _ in 0..50 {
            if manager.list(&ctx).await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("lease was not released on drop");
    }
}
