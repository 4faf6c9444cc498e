//! The store client: every collaborator an image operation needs.

use std::sync::Arc;

use cask_core::error::{CaskError, Result};
use cask_core::CaskConfig;

use crate::context::OpContext;
use crate::remote::{CredentialStore, OciRemoteFactory, RemoteFactory};
use crate::store::{
    gc, ContentStore, Differ, GcReport, ImageService, LeaseGuard, LeaseManager, LocalContentStore,
    LocalDiffer, LocalImageService, LocalLeaseManager, NativeSnapshotter, Snapshotter,
};

/// Collaborators bound to one namespace.
#[derive(Clone)]
pub struct Client {
    config: CaskConfig,
    content: Arc<dyn ContentStore>,
    images: Arc<dyn ImageService>,
    leases: Arc<dyn LeaseManager>,
    snapshotter: Arc<dyn Snapshotter>,
    differ: Arc<dyn Differ>,
    remotes: Arc<dyn RemoteFactory>,
}

impl Client {
    /// Open the local stores under the configured namespace root.
    pub fn open(config: CaskConfig) -> Result<Self> {
        config.validate()?;
        if config.snapshotter != NativeSnapshotter::NAME {
            return Err(CaskError::Unsupported(format!(
                "snapshotter \"{}\" (only \"{}\" is available)",
                config.snapshotter,
                NativeSnapshotter::NAME
            )));
        }

        let root = config.namespace_root();
        std::fs::create_dir_all(&root)?;
        let leases: Arc<dyn LeaseManager> = Arc::new(LocalLeaseManager::open(&root)?);
        let content: Arc<dyn ContentStore> = Arc::new(LocalContentStore::open(&root, leases.clone())?);
        let images: Arc<dyn ImageService> = Arc::new(LocalImageService::open(&root)?);
        let snapshotter: Arc<dyn Snapshotter> = Arc::new(NativeSnapshotter::open(&root, leases.clone())?);
        let differ: Arc<dyn Differ> = Arc::new(LocalDiffer::new(content.clone()));
        let remotes: Arc<dyn RemoteFactory> = Arc::new(OciRemoteFactory::new(
            config.hosts_dir.clone(),
            CredentialStore::default_path(),
            config.insecure_registry,
        ));

        tracing::debug!(
            root = %root.display(),
            namespace = %config.namespace,
            snapshotter = %config.snapshotter,
            "Opened image store"
        );
        Ok(Self {
            config,
            content,
            images,
            leases,
            snapshotter,
            differ,
            remotes,
        })
    }

    /// Replace the registry access layer.
    pub fn with_remotes(mut self, remotes: Arc<dyn RemoteFactory>) -> Self {
        self.remotes = remotes;
        self
    }

    /// A fresh context in this client's namespace.
    pub fn context(&self) -> OpContext {
        OpContext::new(&self.config.namespace)
    }

    pub fn config(&self) -> &CaskConfig {
        &self.config
    }

    pub fn content(&self) -> &dyn ContentStore {
        self.content.as_ref()
    }

    pub fn content_arc(&self) -> Arc<dyn ContentStore> {
        self.content.clone()
    }

    pub fn images(&self) -> &dyn ImageService {
        self.images.as_ref()
    }

    pub fn leases(&self) -> &dyn LeaseManager {
        self.leases.as_ref()
    }

    pub fn snapshotter(&self) -> &dyn Snapshotter {
        self.snapshotter.as_ref()
    }

    pub fn snapshotter_name(&self) -> &str {
        self.snapshotter.name()
    }

    pub fn differ(&self) -> &dyn Differ {
        self.differ.as_ref()
    }

    pub fn remotes(&self) -> &dyn RemoteFactory {
        self.remotes.as_ref()
    }

    /// Acquire a lease with the configured expiration.
    pub async fn lease(&self, ctx: &OpContext, owner: &str) -> Result<LeaseGuard> {
        LeaseGuard::acquire(self.leases.clone(), ctx, self.config.lease_expiration(), owner).await
    }

    /// Acquire a lease with an explicit expiration.
    pub async fn lease_for(
        &self,
        ctx: &OpContext,
        owner: &str,
        expiration: std::time::Duration,
    ) -> Result<LeaseGuard> {
        LeaseGuard::acquire(self.leases.clone(), ctx, expiration, owner).await
    }

    /// Garbage-collect unreferenced blobs and snapshots.
    pub async fn gc(&self, ctx: &OpContext) -> Result<GcReport> {
        let report = gc::collect(
            ctx,
            self.content.as_ref(),
            self.images.as_ref(),
            self.leases.as_ref(),
            self.snapshotter.as_ref(),
        )
        .await?;
        tracing::debug!(
            blobs = report.blobs_removed,
            snapshots = report.snapshots_removed,
            bytes = report.bytes_reclaimed,
            "Garbage collection finished"
        );
        Ok(report)
    }
}
