//! Local content store.
//!
//! Blobs live at `content/blobs/<algo>/<hex>`. Writes go to
//! `content/ingest/` first and are renamed into place once the digest and
//! size check out. Timestamps and labels are kept in `content/meta.json`.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cask_core::error::{CaskError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::{load_json, save_json, BlobInfo, ContentStore, ContentWriter, LeaseManager, Resource};
use crate::context::OpContext;
use crate::digest::{self, Digester};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlobMeta {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetaFile {
    blobs: BTreeMap<String, BlobMeta>,
}

struct Inner {
    root: PathBuf,
    meta: RwLock<HashMap<String, BlobMeta>>,
    leases: Arc<dyn LeaseManager>,
}

/// Filesystem-backed content store.
#[derive(Clone)]
pub struct LocalContentStore {
    inner: Arc<Inner>,
}

impl LocalContentStore {
    /// Open (creating if needed) the content store under `root/content`.
    pub fn open(root: &Path, leases: Arc<dyn LeaseManager>) -> Result<Self> {
        let root = root.join("content");
        std::fs::create_dir_all(root.join("blobs").join(digest::CANONICAL_ALGORITHM))?;
        std::fs::create_dir_all(root.join("ingest"))?;
        let file: MetaFile = load_json(&root.join("meta.json"))?;
        Ok(Self {
            inner: Arc::new(Inner {
                meta: RwLock::new(file.blobs.into_iter().collect()),
                root,
                leases,
            }),
        })
    }

    /// Path of a committed blob.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        self.inner.blob_path(digest)
    }
}

impl Inner {
    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        digest::validate(digest)?;
        Ok(self
            .root
            .join("blobs")
            .join(digest::algorithm(digest))
            .join(digest::encoded(digest)))
    }

    fn save_meta(&self, meta: &HashMap<String, BlobMeta>) -> Result<()> {
        let file = MetaFile {
            blobs: meta.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        save_json(&self.root.join("meta.json"), &file)
    }

    async fn info(&self, digest: &str) -> Result<BlobInfo> {
        let path = self.blob_path(digest)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CaskError::not_found(format!("content {digest}")))
            }
            Err(e) => return Err(e.into()),
        };
        let meta = self.meta.read().await.get(digest).cloned();
        let (created_at, updated_at, labels) = match meta {
            Some(m) => (m.created_at, m.updated_at, m.labels),
            None => {
                let modified: DateTime<Utc> = metadata
                    .modified()
                    .map(DateTime::from)
                    .unwrap_or_else(|_| Utc::now());
                (modified, modified, BTreeMap::new())
            }
        };
        Ok(BlobInfo {
            digest: digest.to_string(),
            size: metadata.len(),
            created_at,
            updated_at,
            labels,
        })
    }

    async fn merge_labels(
        &self,
        digest: &str,
        labels: BTreeMap<String, String>,
        replace: bool,
    ) -> Result<()> {
        let mut meta = self.meta.write().await;
        let now = Utc::now();
        let entry = meta.entry(digest.to_string()).or_insert_with(|| BlobMeta {
            created_at: now,
            updated_at: now,
            labels: BTreeMap::new(),
        });
        if replace {
            entry.labels.clear();
        }
        for (k, v) in labels {
            if v.is_empty() {
                entry.labels.remove(&k);
            } else {
                entry.labels.insert(k, v);
            }
        }
        entry.updated_at = now;
        self.save_meta(&meta)
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn info(&self, _ctx: &OpContext, digest: &str) -> Result<BlobInfo> {
        self.inner.info(digest).await
    }

    async fn update_labels(
        &self,
        _ctx: &OpContext,
        digest: &str,
        labels: BTreeMap<String, String>,
        replace: bool,
    ) -> Result<BlobInfo> {
        // NotFound for absent blobs.
        self.inner.info(digest).await?;
        self.inner.merge_labels(digest, labels, replace).await?;
        self.inner.info(digest).await
    }

    async fn walk(&self, _ctx: &OpContext) -> Result<Vec<BlobInfo>> {
        let blobs = self.inner.root.join("blobs");
        let mut result = Vec::new();
        for algo_entry in std::fs::read_dir(&blobs)? {
            let algo_entry = algo_entry?;
            let algo = algo_entry.file_name().to_string_lossy().to_string();
            for blob in std::fs::read_dir(algo_entry.path())? {
                let blob = blob?;
                let digest = format!("{}:{}", algo, blob.file_name().to_string_lossy());
                if digest::validate(&digest).is_err() {
                    continue;
                }
                match self.inner.info(&digest).await {
                    Ok(info) => result.push(info),
                    Err(e) if e.is(cask_core::ErrorKind::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        result.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(result)
    }

    async fn read_blob(&self, ctx: &OpContext, digest: &str, limit: Option<u64>) -> Result<Vec<u8>> {
        let info = self.inner.info(digest).await?;
        if let Some(limit) = limit {
            if info.size > limit {
                return Err(CaskError::IntegrityError {
                    digest: digest.to_string(),
                    message: format!("blob size {} exceeds limit {}", info.size, limit),
                });
            }
        }
        let path = self.inner.blob_path(digest)?;
        ctx.run(async { Ok(tokio::fs::read(&path).await?) }).await
    }

    async fn open_blob(&self, _ctx: &OpContext, digest: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.inner.blob_path(digest)?;
        match std::fs::File::open(&path) {
            Ok(f) => Ok(Box::new(std::io::BufReader::new(f))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CaskError::not_found(format!("content {digest}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn writer(&self, ctx: &OpContext, reference: &str) -> Result<Box<dyn ContentWriter>> {
        ctx.check()?;
        let name: String = reference
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let path = self
            .inner
            .root
            .join("ingest")
            .join(format!("{}-{}", name, uuid::Uuid::new_v4().simple()));
        let file = tokio::fs::File::create(&path).await?;
        Ok(Box::new(LocalWriter {
            inner: self.inner.clone(),
            ctx: ctx.clone(),
            path,
            file: Some(file),
            digester: Digester::new(),
        }))
    }

    async fn delete(&self, _ctx: &OpContext, digest: &str) -> Result<()> {
        let path = self.inner.blob_path(digest)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CaskError::not_found(format!("content {digest}")))
            }
            Err(e) => return Err(e.into()),
        }
        let mut meta = self.inner.meta.write().await;
        if meta.remove(digest).is_some() {
            self.inner.save_meta(&meta)?;
        }
        tracing::debug!(digest = %digest, "Blob deleted");
        Ok(())
    }
}

struct LocalWriter {
    inner: Arc<Inner>,
    ctx: OpContext,
    path: PathBuf,
    file: Option<tokio::fs::File>,
    digester: Digester,
}

impl LocalWriter {
    async fn discard(&mut self) {
        self.file = None;
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

#[async_trait]
impl ContentWriter for LocalWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if let Err(e) = self.ctx.check() {
            self.discard().await;
            return Err(e);
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CaskError::Other("writer already closed".to_string()))?;
        file.write_all(data).await?;
        self.digester.update(data);
        Ok(())
    }

    fn digest(&self) -> String {
        self.digester.clone().finish().0
    }

    fn size(&self) -> u64 {
        self.digester.size()
    }

    async fn commit(
        mut self: Box<Self>,
        expected_size: u64,
        expected_digest: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<BlobInfo> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        let size = self.digester.size();
        let actual = if digest::algorithm(expected_digest) == digest::CANONICAL_ALGORITHM {
            self.digester.clone().finish().0
        } else {
            let data = tokio::fs::read(&self.path).await?;
            digest::digest_with_algorithm(digest::algorithm(expected_digest), &data)?
        };
        if size != expected_size || actual != expected_digest {
            self.discard().await;
            return Err(CaskError::IntegrityError {
                digest: expected_digest.to_string(),
                message: format!(
                    "unexpected commit digest {actual} or size {size} (expected size {expected_size})"
                ),
            });
        }

        let target = self.inner.blob_path(expected_digest)?;
        if tokio::fs::metadata(&target).await.is_ok() {
            self.discard().await;
        } else {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&self.path, &target).await?;
            tracing::debug!(digest = %expected_digest, size, "Blob committed");
        }
        self.inner.merge_labels(expected_digest, labels, false).await?;

        if let Some(lease) = self.ctx.lease() {
            self.inner
                .leases
                .add_resource(&self.ctx, lease, Resource::content(expected_digest))
                .await?;
        }
        self.inner.info(expected_digest).await
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
