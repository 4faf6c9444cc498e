//! The content graph: manifests, indexes, configs and layers.
//!
//! Indexes point at manifests, manifests at one config and their layers.
//! Everything else is opaque to the walk. JSON nodes are read with a fixed
//! size ceiling so a hostile blob cannot exhaust memory.

use std::collections::{BTreeMap, HashSet, VecDeque};

use cask_core::error::{CaskError, Result};
use serde::de::DeserializeOwned;

use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::digest;
use crate::labels;
use crate::manifest::{ConfigExt, ImageConfiguration, ImageIndex, ImageManifest, IndexExt, ManifestExt};
use crate::media;
use crate::platform::{MatchComparer, Platform};
use crate::store::{ContentStore, Snapshotter};

/// Largest manifest, index or config this crate will parse.
pub const MAX_JSON_BLOB: u64 = 16 << 20;

/// A graph node, classified by media type.
#[derive(Debug, Clone)]
pub enum Node {
    Manifest(Descriptor, ImageManifest),
    Index(Descriptor, ImageIndex),
    Config(Descriptor),
    Layer(Descriptor),
    Opaque(Descriptor),
}

impl Node {
    /// Classify `desc`, parsing `data` when it is a manifest or index.
    pub fn parse(desc: &Descriptor, data: &[u8]) -> Result<Self> {
        let mt = desc.media_type.as_str();
        if media::is_manifest(mt) {
            Ok(Node::Manifest(desc.clone(), serde_json::from_slice(data)?))
        } else if media::is_index(mt) {
            Ok(Node::Index(desc.clone(), serde_json::from_slice(data)?))
        } else {
            Ok(Self::leaf(desc))
        }
    }

    /// Classify a descriptor whose bytes are never needed.
    pub fn leaf(desc: &Descriptor) -> Self {
        let mt = desc.media_type.as_str();
        if media::is_config(mt) {
            Node::Config(desc.clone())
        } else if media::is_layer(mt) {
            Node::Layer(desc.clone())
        } else {
            Node::Opaque(desc.clone())
        }
    }

    /// True if walking this descriptor requires reading its bytes.
    pub fn has_children(desc: &Descriptor) -> bool {
        media::is_manifest(&desc.media_type) || media::is_index(&desc.media_type)
    }

    /// Read and classify `desc` from the store.
    pub async fn load(cs: &dyn ContentStore, ctx: &OpContext, desc: &Descriptor) -> Result<Self> {
        if !Self::has_children(desc) {
            return Ok(Self::leaf(desc));
        }
        let data = cs.read_blob(ctx, &desc.digest, Some(MAX_JSON_BLOB)).await?;
        Self::parse(desc, &data)
    }

    pub fn descriptor(&self) -> &Descriptor {
        match self {
            Node::Manifest(d, _)
            | Node::Index(d, _)
            | Node::Config(d)
            | Node::Layer(d)
            | Node::Opaque(d) => d,
        }
    }

    /// Direct children: config then layers for a manifest, the manifests of
    /// an index, nothing otherwise.
    pub fn children(&self) -> Vec<Descriptor> {
        match self {
            Node::Manifest(_, m) => m.child_descriptors(),
            Node::Index(_, i) => i.manifest_descriptors(),
            _ => Vec::new(),
        }
    }

    /// Children an operation under `matcher` needs. Index entries without a
    /// platform are always kept.
    pub fn children_for(&self, matcher: &MatchComparer) -> Vec<Descriptor> {
        match self {
            Node::Index(_, i) => i
                .manifest_descriptors()
                .into_iter()
                .filter(|d| d.platform.as_ref().map_or(true, |p| matcher.matches(p)))
                .collect(),
            _ => self.children(),
        }
    }
}

/// Read a JSON document under the size ceiling.
pub async fn read_json<T: DeserializeOwned>(
    cs: &dyn ContentStore,
    ctx: &OpContext,
    desc: &Descriptor,
) -> Result<T> {
    let data = cs.read_blob(ctx, &desc.digest, Some(MAX_JSON_BLOB)).await?;
    serde_json::from_slice(&data).map_err(|e| {
        CaskError::Serialization(format!("failed to parse {} {}: {}", desc.media_type, desc.digest, e))
    })
}

/// Completeness of an image target under a platform filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Health {
    /// False when the root itself is missing.
    pub available: bool,
    pub required: Vec<Descriptor>,
    pub present: Vec<Descriptor>,
    pub missing: Vec<Descriptor>,
}

impl Health {
    pub fn is_complete(&self) -> bool {
        self.available && self.missing.is_empty()
    }
}

/// Walk the graph under `matcher` and sort every reachable descriptor into
/// present or missing. Children of a missing manifest are unknown and not
/// reported.
pub async fn check(
    cs: &dyn ContentStore,
    ctx: &OpContext,
    target: &Descriptor,
    matcher: &MatchComparer,
) -> Result<Health> {
    let mut health = Health {
        available: true,
        ..Default::default()
    };
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([target.clone()]);
    while let Some(desc) = queue.pop_front() {
        ctx.check()?;
        if !seen.insert(desc.digest.clone()) {
            continue;
        }
        health.required.push(desc.clone());
        match cs.info(ctx, &desc.digest).await {
            Ok(_) => {
                let node = Node::load(cs, ctx, &desc).await?;
                queue.extend(node.children_for(matcher));
                health.present.push(desc);
            }
            Err(e) if e.is(cask_core::ErrorKind::NotFound) => {
                if desc.digest == target.digest {
                    health.available = false;
                }
                health.missing.push(desc);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(health)
}

/// One platform-specific manifest of an image with its config.
#[derive(Debug, Clone)]
pub struct PlatformManifest {
    pub desc: Descriptor,
    pub manifest: ImageManifest,
    pub config_desc: Descriptor,
    pub config: ImageConfiguration,
    pub platform: Platform,
}

/// Every locally present manifest under `target` matching `matcher`, best
/// match first. A bare manifest target whose platform does not match is
/// `NotFound`.
pub async fn manifests_for(
    cs: &dyn ContentStore,
    ctx: &OpContext,
    target: &Descriptor,
    matcher: &MatchComparer,
) -> Result<Vec<PlatformManifest>> {
    let mut found: Vec<PlatformManifest> = Vec::new();
    let mut queue = VecDeque::from([(target.clone(), None::<Platform>)]);
    while let Some((desc, index_platform)) = queue.pop_front() {
        ctx.check()?;
        let is_root = desc.digest == target.digest;
        if media::is_index(&desc.media_type) {
            let index: ImageIndex = match read_json(cs, ctx, &desc).await {
                Ok(i) => i,
                Err(e) if !is_root && e.is(cask_core::ErrorKind::NotFound) => continue,
                Err(e) => return Err(e),
            };
            for child in index.manifest_descriptors() {
                if let Some(p) = &child.platform {
                    if !matcher.matches(p) {
                        continue;
                    }
                }
                let platform = child.platform.clone();
                queue.push_back((child, platform));
            }
        } else if media::is_manifest(&desc.media_type) {
            let manifest: ImageManifest = match read_json(cs, ctx, &desc).await {
                Ok(m) => m,
                Err(e) if !is_root && e.is(cask_core::ErrorKind::NotFound) => continue,
                Err(e) => return Err(e),
            };
            let config_desc = manifest.config_descriptor();
            let config: ImageConfiguration = match read_json(cs, ctx, &config_desc).await {
                Ok(c) => c,
                Err(e) if !is_root && e.is(cask_core::ErrorKind::NotFound) => continue,
                Err(e) => return Err(e),
            };
            let platform = index_platform
                .filter(|p| !p.os.is_empty())
                .unwrap_or_else(|| config.to_platform())
                .normalize();
            if !matcher.matches(&platform) {
                if is_root {
                    return Err(CaskError::not_found(format!(
                        "manifest {} for platform {}",
                        desc.digest,
                        matcher
                            .platforms()
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(",")
                    )));
                }
                continue;
            }
            found.push(PlatformManifest {
                config_desc,
                desc,
                manifest,
                config,
                platform,
            });
        } else if is_root {
            return Err(CaskError::Unsupported(format!(
                "unexpected target media type {}",
                desc.media_type
            )));
        }
    }
    found.sort_by(|a, b| {
        if matcher.less(&a.platform, &b.platform) {
            std::cmp::Ordering::Less
        } else if matcher.less(&b.platform, &a.platform) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    });
    Ok(found)
}

/// Sum of present blob sizes reachable from `target` under `matcher`.
pub async fn blob_size(
    cs: &dyn ContentStore,
    ctx: &OpContext,
    target: &Descriptor,
    matcher: &MatchComparer,
) -> Result<u64> {
    let health = check(cs, ctx, target, matcher).await?;
    Ok(health.present.iter().map(|d| d.size).sum())
}

/// Packed and unpacked size of one platform manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageSize {
    /// Manifest, config and layer blobs.
    pub packed: u64,
    /// Unpacked rootfs, zero when not unpacked.
    pub unpacked: u64,
}

/// Sizes of a platform manifest. The native snapshotter keeps each
/// snapshot self-contained, so the top of the chain holds the whole rootfs.
pub async fn image_size(
    sn: &dyn Snapshotter,
    ctx: &OpContext,
    pm: &PlatformManifest,
) -> Result<ImageSize> {
    let layers: u64 = pm.manifest.layer_descriptors().iter().map(|l| l.size).sum();
    let packed = pm.desc.size + pm.config_desc.size + layers;
    let unpacked = match digest::chain_id(pm.config.layer_diff_ids()) {
        Some(chain) => match sn.usage(ctx, &chain).await {
            Ok(u) => u.size,
            Err(e) if e.is(cask_core::ErrorKind::NotFound) => 0,
            Err(e) => return Err(e),
        },
        None => 0,
    };
    Ok(ImageSize { packed, unpacked })
}

/// GC reference labels a parent carries for `children`. For a manifest the
/// first child is the config.
pub fn child_gc_labels(parent: &Descriptor, children: &[Descriptor]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if media::is_manifest(&parent.media_type) {
        let mut iter = children.iter();
        if let Some(config) = iter.next() {
            out.insert(format!("{}.config", labels::GC_REF_CONTENT), config.digest.clone());
        }
        for (i, layer) in iter.enumerate() {
            out.insert(format!("{}.l.{}", labels::GC_REF_CONTENT, i), layer.digest.clone());
        }
    } else if media::is_index(&parent.media_type) {
        for (i, m) in children.iter().enumerate() {
            out.insert(format!("{}.m.{}", labels::GC_REF_CONTENT, i), m.digest.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{new_config, new_index, new_manifest};
    use crate::store::{write_blob, write_json, LocalContentStore, LocalLeaseManager};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> LocalContentStore {
        let leases = Arc::new(LocalLeaseManager::open(tmp.path()).unwrap());
        LocalContentStore::open(tmp.path(), leases).unwrap()
    }

    async fn image(
        cs: &LocalContentStore,
        ctx: &OpContext,
        arch: &str,
        layer: &[u8],
        write_layer: bool,
    ) -> Descriptor {
        let layer_desc = Descriptor::of(media::OCI_LAYER, layer);
        if write_layer {
            write_blob(cs, ctx, &layer_desc, layer, BTreeMap::new()).await.unwrap();
        }
        let mut config = new_config(&Platform::parse(&format!("linux/{arch}")).unwrap()).unwrap();
        config.replace_diff_ids(vec![layer_desc.digest.clone()]);
        let config_desc = write_json(cs, ctx, media::OCI_CONFIG, &config, BTreeMap::new())
            .await
            .unwrap();
        let manifest = new_manifest(media::OCI_MANIFEST, &config_desc, &[layer_desc]).unwrap();
        write_json(cs, ctx, media::OCI_MANIFEST, &manifest, BTreeMap::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_check_reports_missing_layer() {
        let tmp = TempDir::new().unwrap();
        let cs = store(&tmp);
        let ctx = OpContext::new("default");
        let target = image(&cs, &ctx, "amd64", b"layer", false).await;

        let health = check(&cs, &ctx, &target, &MatchComparer::all()).await.unwrap();
        assert!(health.available);
        assert_eq!(health.required.len(), 3);
        assert_eq!(health.present.len(), 2);
        assert_eq!(health.missing.len(), 1);
        assert_eq!(health.missing[0].digest, digest::sha256_of(b"layer"));
        assert!(!health.is_complete());
    }

    #[tokio::test]
    async fn test_check_missing_root() {
        let tmp = TempDir::new().unwrap();
        let cs = store(&tmp);
        let ctx = OpContext::new("default");
        let target = Descriptor::of(media::OCI_MANIFEST, b"absent");
        let health = check(&cs, &ctx, &target, &MatchComparer::all()).await.unwrap();
        assert!(!health.available);
        assert_eq!(health.missing, vec![target]);
    }

    #[tokio::test]
    async fn test_index_platform_filter() {
        let tmp = TempDir::new().unwrap();
        let cs = store(&tmp);
        let ctx = OpContext::new("default");
        let amd = image(&cs, &ctx, "amd64", b"amd", true).await;
        let arm = image(&cs, &ctx, "arm64", b"arm", false).await;
        let index = new_index(
            media::OCI_INDEX,
            &[
                amd.clone().with_platform(Some(Platform::parse("linux/amd64").unwrap())),
                arm.clone().with_platform(Some(Platform::parse("linux/arm64").unwrap())),
            ],
        )
        .unwrap();
        let target = write_json(&cs, &ctx, media::OCI_INDEX, &index, BTreeMap::new())
            .await
            .unwrap();

        let amd_only = MatchComparer::new(false, &["linux/amd64".to_string()]).unwrap();
        let health = check(&cs, &ctx, &target, &amd_only).await.unwrap();
        assert!(health.is_complete());

        let health = check(&cs, &ctx, &target, &MatchComparer::all()).await.unwrap();
        assert_eq!(health.missing.len(), 1);

        let pms = manifests_for(&cs, &ctx, &target, &MatchComparer::all()).await.unwrap();
        assert_eq!(pms.len(), 2);
        let arm_first = MatchComparer::new(false, &["linux/arm64,linux/amd64".to_string()]).unwrap();
        let pms = manifests_for(&cs, &ctx, &target, &arm_first).await.unwrap();
        assert_eq!(pms[0].platform.architecture, "arm64");
        assert_eq!(pms[1].desc.digest, amd.digest);
    }

    #[tokio::test]
    async fn test_manifest_platform_mismatch_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let cs = store(&tmp);
        let ctx = OpContext::new("default");
        let target = image(&cs, &ctx, "s390x", b"l", true).await;
        let matcher = MatchComparer::new(false, &["linux/amd64".to_string()]).unwrap();
        let err = manifests_for(&cs, &ctx, &target, &matcher).await.unwrap_err();
        assert_eq!(err.kind(), cask_core::ErrorKind::NotFound);
    }

    #[test]
    fn test_child_gc_labels() {
        let manifest = Descriptor::of(media::OCI_MANIFEST, b"m");
        let config = Descriptor::of(media::OCI_CONFIG, b"c");
        let l0 = Descriptor::of(media::OCI_LAYER, b"0");
        let labels = child_gc_labels(&manifest, &[config.clone(), l0.clone()]);
        assert_eq!(labels["containerd.io/gc.ref.content.config"], config.digest);
        assert_eq!(labels["containerd.io/gc.ref.content.l.0"], l0.digest);

        let index = Descriptor::of(media::OCI_INDEX, b"i");
        let labels = child_gc_labels(&index, &[manifest.clone()]);
        assert_eq!(labels["containerd.io/gc.ref.content.m.0"], manifest.digest);
    }

    #[test]
    fn test_node_children() {
        let config = Descriptor::of(media::OCI_CONFIG, b"c");
        let layer = Descriptor::of(media::DOCKER_LAYER_GZIP, b"l");
        let manifest = new_manifest(media::OCI_MANIFEST, &config, &[layer.clone()]).unwrap();
        let data = serde_json::to_vec(&manifest).unwrap();
        let node = Node::parse(&Descriptor::of(media::OCI_MANIFEST, &data), &data).unwrap();
        assert_eq!(node.children(), vec![config.clone(), layer.clone()]);
        assert!(matches!(Node::leaf(&config), Node::Config(_)));
        assert!(matches!(Node::leaf(&layer), Node::Layer(_)));
        assert!(matches!(
            Node::leaf(&Descriptor::of("application/x-unknown", b"")),
            Node::Opaque(_)
        ));
    }
}
