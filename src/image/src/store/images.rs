//! Image records: named roots into the content graph.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cask_core::error::{CaskError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{load_json, save_json, ImageService};
use crate::context::OpContext;
use crate::descriptor::Descriptor;

/// A named image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub name: String,
    pub target: Descriptor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ImageRecord {
    /// New record; timestamps are assigned by the service.
    pub fn new(name: impl Into<String>, target: Descriptor) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            target,
            created_at: now,
            updated_at: now,
            labels: BTreeMap::new(),
        }
    }
}

/// A record filter. A list call returns the union of its filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageFilter {
    Name(String),
    TargetDigest(String),
    TargetDigestPrefix(String),
}

impl ImageFilter {
    pub fn matches(&self, record: &ImageRecord) -> bool {
        match self {
            ImageFilter::Name(name) => record.name == *name,
            ImageFilter::TargetDigest(digest) => record.target.digest == *digest,
            ImageFilter::TargetDigestPrefix(prefix) => record.target.digest.starts_with(prefix),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ImagesFile {
    images: Vec<ImageRecord>,
}

/// Image records persisted to `images.json`.
pub struct LocalImageService {
    path: PathBuf,
    records: RwLock<HashMap<String, ImageRecord>>,
}

impl LocalImageService {
    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join("images.json");
        let file: ImagesFile = load_json(&path)?;
        let records = file
            .images
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    fn save(&self, records: &HashMap<String, ImageRecord>) -> Result<()> {
        let mut images: Vec<ImageRecord> = records.values().cloned().collect();
        images.sort_by(|a, b| a.name.cmp(&b.name));
        save_json(&self.path, &ImagesFile { images })
    }
}

#[async_trait]
impl ImageService for LocalImageService {
    async fn get(&self, _ctx: &OpContext, name: &str) -> Result<ImageRecord> {
        self.records
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CaskError::not_found(format!("image \"{name}\"")))
    }

    async fn list(&self, _ctx: &OpContext, filters: &[ImageFilter]) -> Result<Vec<ImageRecord>> {
        let records = self.records.read().await;
        let mut list: Vec<ImageRecord> = records
            .values()
            .filter(|r| filters.is_empty() || filters.iter().any(|f| f.matches(r)))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn create(&self, ctx: &OpContext, mut record: ImageRecord) -> Result<ImageRecord> {
        ctx.check()?;
        let mut records = self.records.write().await;
        if records.contains_key(&record.name) {
            return Err(CaskError::AlreadyExists(format!("image \"{}\"", record.name)));
        }
        let now = Utc::now();
        record.created_at = now;
        record.updated_at = now;
        records.insert(record.name.clone(), record.clone());
        self.save(&records)?;
        tracing::debug!(name = %record.name, target = %record.target.digest, "Image record created");
        Ok(record)
    }

    async fn update(&self, ctx: &OpContext, mut record: ImageRecord) -> Result<ImageRecord> {
        ctx.check()?;
        let mut records = self.records.write().await;
        let existing = records
            .get(&record.name)
            .ok_or_else(|| CaskError::not_found(format!("image \"{}\"", record.name)))?;
        record.created_at = existing.created_at;
        record.updated_at = Utc::now();
        records.insert(record.name.clone(), record.clone());
        self.save(&records)?;
        tracing::debug!(name = %record.name, target = %record.target.digest, "Image record updated");
        Ok(record)
    }

    async fn delete(&self, _ctx: &OpContext, name: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if records.remove(name).is_none() {
            return Err(CaskError::not_found(format!("image \"{name}\"")));
        }
        self.save(&records)?;
        tracing::debug!(name = %name, "Image record deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media;
    use crate::store::create_or_update;
    use cask_core::ErrorKind;
    use tempfile::TempDir;

    fn record(name: &str, data: &[u8]) -> ImageRecord {
        ImageRecord::new(name, Descriptor::of(media::OCI_MANIFEST, data))
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let tmp = TempDir::new().unwrap();
        let service = LocalImageService::open(tmp.path()).unwrap();
        let ctx = OpContext::new("default");

        service.create(&ctx, record("docker.io/library/a:latest", b"a")).await.unwrap();
        let err = service
            .create(&ctx, record("docker.io/library/a:latest", b"b"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let got = service.get(&ctx, "docker.io/library/a:latest").await.unwrap();
        assert_eq!(got.target.digest, crate::digest::sha256_of(b"a"));

        service.delete(&ctx, "docker.io/library/a:latest").await.unwrap();
        assert_eq!(
            service.get(&ctx, "docker.io/library/a:latest").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_update_keeps_created_at() {
        let tmp = TempDir::new().unwrap();
        let service = LocalImageService::open(tmp.path()).unwrap();
        let ctx = OpContext::new("default");

        let created = service.create(&ctx, record("x:1", b"a")).await.unwrap();
        let updated = create_or_update(&service, &ctx, record("x:1", b"b")).await.unwrap();
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);
        assert_eq!(updated.target.digest, crate::digest::sha256_of(b"b"));

        assert_eq!(
            service.update(&ctx, record("y:1", b"a")).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_list_filters_union() {
        let tmp = TempDir::new().unwrap();
        let service = LocalImageService::open(tmp.path()).unwrap();
        let ctx = OpContext::new("default");
        service.create(&ctx, record("a:1", b"a")).await.unwrap();
        service.create(&ctx, record("a:2", b"a")).await.unwrap();
        service.create(&ctx, record("b:1", b"b")).await.unwrap();

        assert_eq!(service.list(&ctx, &[]).await.unwrap().len(), 3);

        let digest_a = crate::digest::sha256_of(b"a");
        let by_digest = service
            .list(&ctx, &[ImageFilter::TargetDigest(digest_a.clone())])
            .await
            .unwrap();
        assert_eq!(by_digest.len(), 2);

        let union = service
            .list(
                &ctx,
                &[
                    ImageFilter::Name("b:1".to_string()),
                    ImageFilter::TargetDigestPrefix(digest_a[..12].to_string()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(union.len(), 3);
    }

    #[tokio::test]
    async fn test_persisted_across_open() {
        let tmp = TempDir::new().unwrap();
        let ctx = OpContext::new("default");
        {
            let service = LocalImageService::open(tmp.path()).unwrap();
            service.create(&ctx, record("keep:1", b"k")).await.unwrap();
        }
        let service = LocalImageService::open(tmp.path()).unwrap();
        assert_eq!(service.get(&ctx, "keep:1").await.unwrap().name, "keep:1");
    }
}
