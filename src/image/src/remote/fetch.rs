//! Fetching a content graph into the local store.

use std::collections::BTreeMap;

use cask_core::error::Result;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt};

use super::Fetcher;
use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::graph::{child_gc_labels, Node};
use crate::platform::MatchComparer;
use crate::store::{write_blob, ContentStore};

/// Blobs fetched in parallel per manifest.
const FETCH_CONCURRENCY: usize = 3;

/// Progress of a graph fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// Already present locally.
    Exists(Descriptor),
    Downloading(Descriptor),
    Done(Descriptor),
}

/// Progress callback.
pub type Progress<'a> = &'a (dyn Fn(FetchEvent) + Send + Sync);

/// Fetch `root` and everything below it that `matcher` selects. Children
/// are committed before their parents; every parent carries GC reference
/// labels for its children, and every blob gets `labels`.
pub async fn fetch_graph(
    cs: &dyn ContentStore,
    ctx: &OpContext,
    fetcher: &dyn Fetcher,
    root: &Descriptor,
    matcher: &MatchComparer,
    labels: &BTreeMap<String, String>,
    progress: Progress<'_>,
) -> Result<()> {
    fetch_node(cs, ctx, fetcher, root.clone(), matcher, labels, progress).await
}

fn fetch_node<'a>(
    cs: &'a dyn ContentStore,
    ctx: &'a OpContext,
    fetcher: &'a dyn Fetcher,
    desc: Descriptor,
    matcher: &'a MatchComparer,
    labels: &'a BTreeMap<String, String>,
    progress: Progress<'a>,
) -> BoxFuture<'a, Result<()>> {
    async move {
        ctx.check()?;
        if !Node::has_children(&desc) {
            return fetch_leaf(cs, ctx, fetcher, &desc, labels, progress).await;
        }

        let data = match cs.info(ctx, &desc.digest).await {
            Ok(_) => {
                progress(FetchEvent::Exists(desc.clone()));
                cs.read_blob(ctx, &desc.digest, Some(crate::graph::MAX_JSON_BLOB)).await?
            }
            Err(e) if e.is(cask_core::ErrorKind::NotFound) => {
                progress(FetchEvent::Downloading(desc.clone()));
                fetcher.fetch(ctx, &desc).await?
            }
            Err(e) => return Err(e),
        };
        let node = Node::parse(&desc, &data)?;
        let children = node.children_for(matcher);

        futures::stream::iter(children.iter().cloned())
            .map(|child| fetch_node(cs, ctx, fetcher, child, matcher, labels, progress))
            .buffer_unordered(FETCH_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;

        let mut parent_labels = labels.clone();
        parent_labels.extend(child_gc_labels(&desc, &children));
        write_blob(cs, ctx, &desc, &data, parent_labels).await?;
        tracing::debug!(digest = %desc.digest, media_type = %desc.media_type, "Committed");
        progress(FetchEvent::Done(desc));
        Ok(())
    }
    .boxed()
}

async fn fetch_leaf(
    cs: &dyn ContentStore,
    ctx: &OpContext,
    fetcher: &dyn Fetcher,
    desc: &Descriptor,
    labels: &BTreeMap<String, String>,
    progress: Progress<'_>,
) -> Result<()> {
    match cs.info(ctx, &desc.digest).await {
        Ok(_) => {
            if !labels.is_empty() {
                cs.update_labels(ctx, &desc.digest, labels.clone(), false).await?;
            }
            progress(FetchEvent::Exists(desc.clone()));
            return Ok(());
        }
        Err(e) if e.is(cask_core::ErrorKind::NotFound) => {}
        Err(e) => return Err(e),
    }
    progress(FetchEvent::Downloading(desc.clone()));
    let data = fetcher.fetch(ctx, desc).await?;
    let mut writer = cs.writer(ctx, &crate::store::ingest_ref(&desc.digest)).await?;
    writer.write(&data).await?;
    writer.commit(desc.size, &desc.digest, labels.clone()).await?;
    tracing::debug!(digest = %desc.digest, size = desc.size, "Fetched blob");
    progress(FetchEvent::Done(desc.clone()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    use crate::labels;
    use crate::manifest::{new_index, new_manifest, ImageManifest, ManifestExt};
    use crate::media;
    use crate::platform::Platform;
    use crate::store::{LocalContentStore, LocalLeaseManager};

    #[derive(Default)]
    struct MapFetcher {
        blobs: HashMap<String, Vec<u8>>,
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Fetcher for MapFetcher {
        async fn fetch(&self, _ctx: &OpContext, desc: &Descriptor) -> Result<Vec<u8>> {
            self.fetched.lock().push(desc.digest.clone());
            self.blobs
                .get(&desc.digest)
                .cloned()
                .ok_or_else(|| cask_core::CaskError::not_found(desc.digest.clone()))
        }
    }

    impl MapFetcher {
        fn add(&mut self, media_type: &str, data: Vec<u8>) -> Descriptor {
            let desc = Descriptor::of(media_type, &data);
            self.blobs.insert(desc.digest.clone(), data);
            desc
        }
    }

    fn manifest_for(f: &mut MapFetcher, arch: &str) -> Descriptor {
        let config = f.add(
            media::OCI_CONFIG,
            format!(r#"{{"architecture":"{arch}","os":"linux","rootfs":{{"type":"layers","diff_ids":[]}}}}"#)
                .into_bytes(),
        );
        let layer = f.add(media::OCI_LAYER_GZIP, format!("layer-{arch}").into_bytes());
        let manifest = new_manifest(media::OCI_MANIFEST, &config, &[layer]).unwrap();
        f.add(media::OCI_MANIFEST, serde_json::to_vec(&manifest).unwrap())
            .with_platform(Some(Platform::parse(&format!("linux/{arch}")).unwrap()))
    }

    fn open(tmp: &TempDir) -> LocalContentStore {
        let leases = Arc::new(LocalLeaseManager::open(tmp.path()).unwrap());
        LocalContentStore::open(tmp.path(), leases).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_platform_subset_with_labels() {
        let tmp = TempDir::new().unwrap();
        let cs = open(&tmp);
        let ctx = OpContext::new("default");

        let mut f = MapFetcher::default();
        let amd = manifest_for(&mut f, "amd64");
        let arm = manifest_for(&mut f, "arm64");
        let index = new_index(media::OCI_INDEX, &[amd.clone(), arm.clone()]).unwrap();
        let root = f.add(media::OCI_INDEX, serde_json::to_vec(&index).unwrap());

        let matcher = MatchComparer::only(Platform::parse("linux/amd64").unwrap());
        let events = Mutex::new(Vec::new());
        let progress = |e: FetchEvent| events.lock().push(e);
        let source = BTreeMap::from([(labels::distribution_source_label("r.io"), "a/b".to_string())]);
        fetch_graph(&cs, &ctx, &f, &root, &matcher, &source, &progress)
            .await
            .unwrap();

        let root_info = cs.info(&ctx, &root.digest).await.unwrap();
        assert_eq!(
            root_info.labels.get(&format!("{}.m.0", labels::GC_REF_CONTENT)),
            Some(&amd.digest)
        );
        assert!(root_info.labels.contains_key(&labels::distribution_source_label("r.io")));
        assert!(cs.info(&ctx, &amd.digest).await.is_ok());
        assert!(cs.info(&ctx, &arm.digest).await.is_err());

        let amd_info = cs.info(&ctx, &amd.digest).await.unwrap();
        assert!(amd_info
            .labels
            .contains_key(&format!("{}.config", labels::GC_REF_CONTENT)));
        assert!(amd_info
            .labels
            .contains_key(&format!("{}.l.0", labels::GC_REF_CONTENT)));
        assert!(matches!(events.lock().last(), Some(FetchEvent::Done(d)) if d.digest == root.digest));
    }

    #[tokio::test]
    async fn test_fetch_skips_present_blobs() {
        let tmp = TempDir::new().unwrap();
        let cs = open(&tmp);
        let ctx = OpContext::new("default");

        let mut f = MapFetcher::default();
        let manifest = manifest_for(&mut f, "amd64");
        let matcher = MatchComparer::all();
        let none = BTreeMap::new();
        fetch_graph(&cs, &ctx, &f, &manifest, &matcher, &none, &|_| {})
            .await
            .unwrap();
        let first = f.fetched.lock().len();
        assert_eq!(first, 3);

        fetch_graph(&cs, &ctx, &f, &manifest, &matcher, &none, &|_| {})
            .await
            .unwrap();
        assert_eq!(f.fetched.lock().len(), first);
    }

    #[tokio::test]
    async fn test_fetch_missing_blob_fails() {
        let tmp = TempDir::new().unwrap();
        let cs = open(&tmp);
        let ctx = OpContext::new("default");

        let mut f = MapFetcher::default();
        let manifest = manifest_for(&mut f, "amd64");
        let m: ImageManifest = serde_json::from_slice(&f.blobs[&manifest.digest]).unwrap();
        f.blobs.remove(&m.layer_descriptors()[0].digest);

        let err = fetch_graph(&cs, &ctx, &f, &manifest, &MatchComparer::all(), &BTreeMap::new(), &|_| {})
            .await
            .unwrap_err();
        assert!(err.is(cask_core::ErrorKind::NotFound));
        assert!(cs.info(&ctx, &manifest.digest).await.is_err());
    }
}
