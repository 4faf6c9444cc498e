//! Store collaborators: content, image records, leases, snapshots, diffs.
//!
//! Each collaborator is an async trait so a daemon-backed implementation can
//! stand in for the local one. The local implementations keep everything
//! under the namespace root:
//!
//! ```text
//! <data_root>/<namespace>/
//! ├── content/
//! │   ├── blobs/sha256/<hex>    (committed blobs)
//! │   ├── ingest/<ref>          (in-progress writes)
//! │   └── meta.json             (per-blob timestamps and labels)
//! ├── images.json               (image records)
//! ├── leases.json               (leases and their resources)
//! └── snapshots/<snapshotter>/  (snapshot metadata and trees)
//! ```

pub mod content;
pub mod differ;
pub mod gc;
pub mod images;
pub mod leases;
pub mod snapshots;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use cask_core::error::{CaskError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::OpContext;
use crate::descriptor::Descriptor;

pub use content::LocalContentStore;
pub use differ::LocalDiffer;
pub use gc::GcReport;
pub use images::{ImageFilter, ImageRecord, LocalImageService};
pub use leases::{Lease, LeaseGuard, LocalLeaseManager, Resource, ResourceKind};
pub use snapshots::{NativeSnapshotter, SnapshotInfo, SnapshotKind, Usage};

// ============================================================================
// Content store
// ============================================================================

/// Metadata of a committed blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub digest: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Content-addressed blob storage.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Blob metadata; `NotFound` if the blob is absent.
    async fn info(&self, ctx: &OpContext, digest: &str) -> Result<BlobInfo>;

    /// Merge (or with `replace`, set) labels. An empty value deletes a label.
    async fn update_labels(
        &self,
        ctx: &OpContext,
        digest: &str,
        labels: BTreeMap<String, String>,
        replace: bool,
    ) -> Result<BlobInfo>;

    /// All committed blobs.
    async fn walk(&self, ctx: &OpContext) -> Result<Vec<BlobInfo>>;

    /// Read a whole blob. `IntegrityError` if it is larger than `limit`.
    async fn read_blob(&self, ctx: &OpContext, digest: &str, limit: Option<u64>) -> Result<Vec<u8>>;

    /// Blocking reader over a blob, for use inside `spawn_blocking`.
    async fn open_blob(&self, ctx: &OpContext, digest: &str) -> Result<Box<dyn Read + Send>>;

    /// Start an ingest under `reference`.
    async fn writer(&self, ctx: &OpContext, reference: &str) -> Result<Box<dyn ContentWriter>>;

    async fn delete(&self, ctx: &OpContext, digest: &str) -> Result<()>;
}

/// An in-progress blob write.
#[async_trait]
pub trait ContentWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Digest of the bytes written so far.
    fn digest(&self) -> String;

    fn size(&self) -> u64;

    /// Verify digest and size, then make the blob visible. Committing a blob
    /// that already exists only merges labels.
    async fn commit(
        self: Box<Self>,
        expected_size: u64,
        expected_digest: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<BlobInfo>;
}

/// Write a whole in-memory blob and commit it against `desc`.
pub async fn write_blob(
    store: &dyn ContentStore,
    ctx: &OpContext,
    desc: &Descriptor,
    data: &[u8],
    labels: BTreeMap<String, String>,
) -> Result<BlobInfo> {
    if ctx.lease().is_none() {
        if let Ok(info) = store.info(ctx, &desc.digest).await {
            if labels.is_empty() {
                return Ok(info);
            }
            return store.update_labels(ctx, &desc.digest, labels, false).await;
        }
    }
    let mut writer = store.writer(ctx, &ingest_ref(&desc.digest)).await?;
    writer.write(data).await?;
    writer.commit(desc.size, &desc.digest, labels).await
}

/// Stream a file into the store and commit it against `desc`.
pub async fn write_file(
    store: &dyn ContentStore,
    ctx: &OpContext,
    desc: &Descriptor,
    path: &Path,
    labels: BTreeMap<String, String>,
) -> Result<BlobInfo> {
    use tokio::io::AsyncReadExt;

    if ctx.lease().is_none() {
        if let Ok(info) = store.info(ctx, &desc.digest).await {
            if labels.is_empty() {
                return Ok(info);
            }
            return store.update_labels(ctx, &desc.digest, labels, false).await;
        }
    }
    let mut file = tokio::fs::File::open(path).await?;
    let mut writer = store.writer(ctx, &ingest_ref(&desc.digest)).await?;
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n]).await?;
    }
    writer.commit(desc.size, &desc.digest, labels).await
}

/// Serialize `value` as JSON, store it, and return its descriptor.
pub async fn write_json<T: Serialize>(
    store: &dyn ContentStore,
    ctx: &OpContext,
    media_type: &str,
    value: &T,
    labels: BTreeMap<String, String>,
) -> Result<Descriptor> {
    let data = crate::manifest::to_vec(value)?;
    let desc = Descriptor::of(media_type, &data);
    write_blob(store, ctx, &desc, &data, labels).await?;
    Ok(desc)
}

/// Ingest reference for a blob write.
pub fn ingest_ref(digest: &str) -> String {
    format!("blob-{}", crate::digest::encoded(digest))
}

// ============================================================================
// Image records
// ============================================================================

/// Named image records.
#[async_trait]
pub trait ImageService: Send + Sync {
    async fn get(&self, ctx: &OpContext, name: &str) -> Result<ImageRecord>;

    /// Records matching any of `filters`; all records when `filters` is empty.
    async fn list(&self, ctx: &OpContext, filters: &[ImageFilter]) -> Result<Vec<ImageRecord>>;

    /// `AlreadyExists` if the name is taken.
    async fn create(&self, ctx: &OpContext, record: ImageRecord) -> Result<ImageRecord>;

    /// `NotFound` if the name is unknown.
    async fn update(&self, ctx: &OpContext, record: ImageRecord) -> Result<ImageRecord>;

    async fn delete(&self, ctx: &OpContext, name: &str) -> Result<()>;
}

/// Create `record`, or update it if the name already exists.
pub async fn create_or_update(
    images: &dyn ImageService,
    ctx: &OpContext,
    record: ImageRecord,
) -> Result<ImageRecord> {
    match images.create(ctx, record.clone()).await {
        Err(e) if e.is(cask_core::ErrorKind::AlreadyExists) => images.update(ctx, record).await,
        other => other,
    }
}

// ============================================================================
// Leases
// ============================================================================

/// Lease bookkeeping.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    async fn create(
        &self,
        ctx: &OpContext,
        id: Option<String>,
        expiration: Option<Duration>,
        labels: BTreeMap<String, String>,
    ) -> Result<Lease>;

    async fn delete(&self, ctx: &OpContext, id: &str) -> Result<()>;

    async fn list(&self, ctx: &OpContext) -> Result<Vec<Lease>>;

    async fn add_resource(&self, ctx: &OpContext, id: &str, resource: Resource) -> Result<()>;
}

// ============================================================================
// Snapshots
// ============================================================================

/// Materializes layer chains into directories.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    fn name(&self) -> &str;

    /// Create an active snapshot on top of `parent` and return its mount path.
    async fn prepare(&self, ctx: &OpContext, key: &str, parent: Option<&str>) -> Result<PathBuf>;

    /// Like `prepare`, but the snapshot is not meant to be committed.
    async fn view(&self, ctx: &OpContext, key: &str, parent: Option<&str>) -> Result<PathBuf>;

    /// Commit active snapshot `key` as `name`.
    async fn commit(
        &self,
        ctx: &OpContext,
        name: &str,
        key: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<()>;

    async fn remove(&self, ctx: &OpContext, key: &str) -> Result<()>;

    async fn stat(&self, ctx: &OpContext, key: &str) -> Result<SnapshotInfo>;

    async fn list(&self, ctx: &OpContext) -> Result<Vec<SnapshotInfo>>;

    /// Disk usage of the snapshot's own tree.
    async fn usage(&self, ctx: &OpContext, key: &str) -> Result<Usage>;

    /// Mount path of an existing snapshot.
    async fn mounts(&self, ctx: &OpContext, key: &str) -> Result<PathBuf>;
}

// ============================================================================
// Differ
// ============================================================================

/// Applies and computes layer diffs.
#[async_trait]
pub trait Differ: Send + Sync {
    /// Apply a layer onto `mount`; returns the layer's diff ID.
    async fn apply(&self, ctx: &OpContext, layer: &Descriptor, mount: &Path) -> Result<String>;

    /// Diff `upper` against `lower` into a gzip layer blob; returns the layer
    /// descriptor and its diff ID.
    async fn compare(
        &self,
        ctx: &OpContext,
        lower: &Path,
        upper: &Path,
        media_type: &str,
    ) -> Result<(Descriptor, String)>;
}

// ============================================================================
// Persistence helpers
// ============================================================================

/// Load a JSON document, or its default when the file does not exist.
pub(crate) fn load_json<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).map_err(|e| {
            CaskError::Serialization(format!("failed to parse {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Save a JSON document atomically (write tmp, rename).
pub(crate) fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
