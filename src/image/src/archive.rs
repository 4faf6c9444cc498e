//! Image archives.
//!
//! Exported archives hold an OCI image layout (`oci-layout`, `index.json`,
//! `blobs/<alg>/<hex>`) plus a Docker `manifest.json` pointing into the same
//! blobs, so both OCI and Docker loaders accept them. Imports accept either
//! layout, including legacy Docker archives with `<id>/layer.tar` layers.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use cask_core::error::{CaskError, Result};
use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::compression::{self, Algorithm};
use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::digest::{self, Digester};
use crate::graph::{self, child_gc_labels, Node};
use crate::labels;
use crate::manifest::{new_index, new_manifest, ImageIndex, ImageManifest, IndexExt, ManifestExt};
use crate::media;
use crate::platform::MatchComparer;
use crate::reference::Reference;
use crate::store::{create_or_update, write_blob, write_file, ContentStore, ImageRecord};

pub const OCI_LAYOUT_FILE: &str = "oci-layout";
pub const INDEX_FILE: &str = "index.json";
pub const DOCKER_MANIFEST_FILE: &str = "manifest.json";
const OCI_LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciLayout {
    image_layout_version: String,
}

/// One entry of a Docker `manifest.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DockerManifestEntry {
    pub config: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
    #[serde(default)]
    pub layers: Vec<String>,
}

/// Path of a blob inside the layout.
pub fn blob_path(digest: &str) -> String {
    format!("blobs/{}/{}", digest::algorithm(digest), digest::encoded(digest))
}

// ============================================================================
// Export
// ============================================================================

/// Write `images` as one archive into `out`. Blobs shared between images
/// are written once.
pub async fn export<W: Write + Send>(
    client: &Client,
    ctx: &OpContext,
    images: &[ImageRecord],
    matcher: &MatchComparer,
    out: W,
) -> Result<W> {
    let cs = client.content();
    let mut blobs: BTreeMap<String, Descriptor> = BTreeMap::new();
    let mut index_entries = Vec::with_capacity(images.len());
    let mut docker: Vec<(String, DockerManifestEntry)> = Vec::new();

    for image in images {
        let health = graph::check(cs, ctx, &image.target, matcher).await?;
        if !health.is_complete() {
            return Err(CaskError::not_found(format!(
                "content of {} ({} blob(s) missing)",
                image.name,
                health.missing.len()
            )));
        }
        for desc in health.present {
            blobs.entry(desc.digest.clone()).or_insert(desc);
        }

        let mut entry = image.target.clone();
        entry.annotations = index_annotations(&image.name);
        index_entries.push(entry);

        let manifests = graph::manifests_for(cs, ctx, &image.target, matcher).await?;
        if let Some(pm) = manifests.first() {
            let tag = repo_tag(&image.name);
            match docker.iter_mut().find(|(d, _)| *d == pm.desc.digest) {
                Some((_, existing)) => existing.repo_tags.extend(tag),
                None => docker.push((
                    pm.desc.digest.clone(),
                    DockerManifestEntry {
                        config: blob_path(&pm.config_desc.digest),
                        repo_tags: tag.into_iter().collect(),
                        layers: pm
                            .manifest
                            .layer_descriptors()
                            .iter()
                            .map(|l| blob_path(&l.digest))
                            .collect(),
                    },
                )),
            }
        }
    }

    let mut builder = tar::Builder::new(out);
    append_json(
        &mut builder,
        OCI_LAYOUT_FILE,
        &OciLayout {
            image_layout_version: OCI_LAYOUT_VERSION.to_string(),
        },
    )?;
    for desc in blobs.values() {
        ctx.check()?;
        let reader = cs.open_blob(ctx, &desc.digest).await?;
        let mut header = file_header(desc.size);
        builder.append_data(&mut header, blob_path(&desc.digest), reader)?;
    }
    append_json(&mut builder, INDEX_FILE, &new_index(media::OCI_INDEX, &index_entries)?)?;
    let entries: Vec<DockerManifestEntry> = docker.into_iter().map(|(_, e)| e).collect();
    append_json(&mut builder, DOCKER_MANIFEST_FILE, &entries)?;

    tracing::debug!(images = images.len(), blobs = blobs.len(), "Exported archive");
    Ok(builder.into_inner()?)
}

fn index_annotations(name: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::from([(labels::ANNOTATION_IMAGE_NAME.to_string(), name.to_string())]);
    if let Some(tag) = Reference::parse(name).ok().and_then(|r| r.tag) {
        out.insert(labels::ANNOTATION_REF_NAME.to_string(), tag);
    }
    out
}

/// Familiar `name:tag` for `RepoTags`; digest-only names have none.
fn repo_tag(name: &str) -> Option<String> {
    let r = Reference::parse(name).ok()?;
    let tag = r.tag.clone()?;
    Some(format!("{}:{}", r.familiar_name(), tag))
}

fn file_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o444);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    header
}

fn append_json<W: Write, T: Serialize>(builder: &mut tar::Builder<W>, path: &str, value: &T) -> Result<()> {
    let data = crate::manifest::to_vec(value)?;
    let mut header = file_header(data.len() as u64);
    builder.append_data(&mut header, path, &data[..])?;
    Ok(())
}

// ============================================================================
// Import
// ============================================================================

/// Import an archive read from `reader`, compressed or not. Blobs are
/// verified against their digests; records are created once every blob is
/// committed. Callers hold a lease over `ctx`.
pub async fn import<R: Read + Send + 'static>(
    client: &Client,
    ctx: &OpContext,
    reader: R,
) -> Result<Vec<ImageRecord>> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().to_path_buf();
    let algorithm = tokio::task::spawn_blocking(move || -> io::Result<Algorithm> {
        let (algorithm, decoded) = compression::decompress(reader)?;
        let mut archive = tar::Archive::new(decoded);
        archive.set_preserve_permissions(false);
        archive.unpack(&root)?;
        Ok(algorithm)
    })
    .await
    .map_err(|e| CaskError::Other(format!("archive extraction task failed: {e}")))?
    .map_err(|e| CaskError::invalid(format!("failed to read archive: {e}")))?;
    tracing::debug!(compression = %algorithm, "Extracted archive");

    let root = dir.path();
    let records = if root.join(INDEX_FILE).is_file() {
        import_oci(client, ctx, root).await?
    } else if root.join(DOCKER_MANIFEST_FILE).is_file() {
        import_docker(client, ctx, root).await?
    } else {
        return Err(CaskError::invalid(format!(
            "unrecognized archive: neither {INDEX_FILE} nor {DOCKER_MANIFEST_FILE} found"
        )));
    };
    Ok(records)
}

async fn import_oci(client: &Client, ctx: &OpContext, root: &Path) -> Result<Vec<ImageRecord>> {
    let cs = client.content();
    let blobs = root.join("blobs");
    if blobs.is_dir() {
        for algo in std::fs::read_dir(&blobs)? {
            let algo = algo?;
            if !algo.file_type()?.is_dir() {
                continue;
            }
            let algo_name = algo.file_name().to_string_lossy().to_string();
            for blob in std::fs::read_dir(algo.path())? {
                let blob = blob?;
                ctx.check()?;
                let hex = blob.file_name().to_string_lossy().to_string();
                let digest = format!("{algo_name}:{hex}");
                digest::validate(&digest)?;
                let size = blob.metadata()?.len();
                let desc = Descriptor::new("application/octet-stream", digest, size);
                write_file(cs, ctx, &desc, &blob.path(), BTreeMap::new()).await?;
            }
        }
    }

    let index: ImageIndex = serde_json::from_slice(&std::fs::read(root.join(INDEX_FILE))?)?;
    let docker_tags = read_docker_manifest(root)
        .map(|entries| docker_tags_by_config(&entries))
        .unwrap_or_default();

    let mut records = Vec::new();
    for (i, entry) in index.manifest_descriptors().iter().enumerate() {
        label_graph(cs, ctx, entry).await?;
        let mut target = entry.clone();
        target.annotations.remove(labels::ANNOTATION_IMAGE_NAME);
        target.annotations.remove(labels::ANNOTATION_REF_NAME);
        target.platform = None;

        let names = match oci_entry_name(entry) {
            Some(name) => vec![name],
            None => docker_names_for(cs, ctx, entry, &docker_tags).await,
        };
        let names = if names.is_empty() {
            vec![entry.digest.clone()]
        } else {
            names
        };
        for name in names {
            tracing::debug!(index = i, name = %name, digest = %entry.digest, "Importing image");
            let record = create_or_update(client.images(), ctx, ImageRecord::new(name, target.clone())).await?;
            records.push(record);
        }
    }
    Ok(records)
}

/// Name of an `index.json` entry from its annotations.
fn oci_entry_name(entry: &Descriptor) -> Option<String> {
    if let Some(name) = entry.annotation(labels::ANNOTATION_IMAGE_NAME) {
        return Some(name.to_string());
    }
    let ref_name = entry.annotation(labels::ANNOTATION_REF_NAME)?;
    if ref_name.contains('/') || ref_name.contains(':') {
        return Reference::parse_normalized(ref_name).ok().map(|r| r.to_string());
    }
    None
}

fn read_docker_manifest(root: &Path) -> Option<Vec<DockerManifestEntry>> {
    let data = std::fs::read(root.join(DOCKER_MANIFEST_FILE)).ok()?;
    serde_json::from_slice(&data).ok()
}

/// RepoTags keyed by config digest, for layouts whose `index.json` lacks names.
fn docker_tags_by_config(entries: &[DockerManifestEntry]) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in entries {
        let Some(hex) = entry.config.rsplit('/').next() else {
            continue;
        };
        let hex = hex.trim_end_matches(".json");
        out.entry(format!("sha256:{hex}"))
            .or_default()
            .extend(entry.repo_tags.iter().cloned());
    }
    out
}

async fn docker_names_for(
    cs: &dyn ContentStore,
    ctx: &OpContext,
    entry: &Descriptor,
    tags: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
    if tags.is_empty() || !media::is_manifest(&entry.media_type) {
        return Vec::new();
    }
    let Ok(manifest) = graph::read_json::<ImageManifest>(cs, ctx, entry).await else {
        return Vec::new();
    };
    tags.get(&manifest.config_descriptor().digest)
        .map(|t| normalize_tags(t))
        .unwrap_or_default()
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .filter_map(|t| match Reference::parse_normalized(t) {
            Ok(r) => Some(r.to_string()),
            Err(e) => {
                tracing::warn!(tag = %t, error = %e, "Skipping invalid RepoTag");
                None
            }
        })
        .collect()
}

/// Attach GC reference labels to every present parent under `root`.
async fn label_graph(cs: &dyn ContentStore, ctx: &OpContext, root: &Descriptor) -> Result<()> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([root.clone()]);
    while let Some(desc) = queue.pop_front() {
        if !seen.insert(desc.digest.clone()) || !Node::has_children(&desc) {
            continue;
        }
        let node = match Node::load(cs, ctx, &desc).await {
            Ok(node) => node,
            Err(e) if desc.digest != root.digest && e.is(cask_core::ErrorKind::NotFound) => continue,
            Err(e) => return Err(e),
        };
        let children = node.children();
        let present: Vec<Descriptor> = {
            let mut out = Vec::with_capacity(children.len());
            for child in &children {
                if cs.info(ctx, &child.digest).await.is_ok() {
                    out.push(child.clone());
                }
            }
            out
        };
        if !present.is_empty() {
            cs.update_labels(ctx, &desc.digest, child_gc_labels(&desc, &children), false)
                .await?;
        }
        queue.extend(present);
    }
    Ok(())
}

async fn import_docker(client: &Client, ctx: &OpContext, root: &Path) -> Result<Vec<ImageRecord>> {
    let cs = client.content();
    let entries: Vec<DockerManifestEntry> =
        serde_json::from_slice(&std::fs::read(root.join(DOCKER_MANIFEST_FILE))?)?;

    let mut records = Vec::new();
    for entry in &entries {
        ctx.check()?;
        let config_path = archive_path(root, &entry.config)?;
        let config_data = std::fs::read(&config_path)?;
        let config = Descriptor::of(media::DOCKER_CONFIG, &config_data);
        write_blob(cs, ctx, &config, &config_data, BTreeMap::new()).await?;

        let mut layers = Vec::with_capacity(entry.layers.len());
        for layer in &entry.layers {
            let path = archive_path(root, layer)?;
            let desc = layer_descriptor(&path)?;
            write_file(cs, ctx, &desc, &path, BTreeMap::new()).await?;
            layers.push(desc);
        }

        let manifest = new_manifest(media::DOCKER_MANIFEST, &config, &layers)?;
        let data = crate::manifest::to_vec(&manifest)?;
        let target = Descriptor::of(media::DOCKER_MANIFEST, &data);
        let children: Vec<Descriptor> = std::iter::once(config).chain(layers).collect();
        write_blob(cs, ctx, &target, &data, child_gc_labels(&target, &children)).await?;

        let mut names = normalize_tags(&entry.repo_tags);
        if names.is_empty() {
            names.push(target.digest.clone());
        }
        let unique: BTreeSet<String> = names.into_iter().collect();
        for name in unique {
            let record = create_or_update(client.images(), ctx, ImageRecord::new(name, target.clone())).await?;
            records.push(record);
        }
    }
    Ok(records)
}

/// Descriptor of a layer file, typed by its compression.
fn layer_descriptor(path: &Path) -> Result<Descriptor> {
    let mut file = std::fs::File::open(path)?;
    let mut head = [0u8; 6];
    let n = file.read(&mut head)?;
    let media_type = match Algorithm::detect(&head[..n]) {
        Algorithm::Uncompressed => media::DOCKER_LAYER,
        Algorithm::Gzip => media::DOCKER_LAYER_GZIP,
        Algorithm::Zstd => media::DOCKER_LAYER_ZSTD,
        other => {
            return Err(CaskError::Unsupported(format!(
                "{other} compressed layer {}",
                path.display()
            )))
        }
    };
    let mut file = std::fs::File::open(path)?;
    let mut digester = Digester::new();
    io::copy(&mut file, &mut digester)?;
    let (digest, size) = digester.finish();
    Ok(Descriptor::new(media_type, digest, size))
}

/// Resolve a path named inside the archive, refusing escapes.
fn archive_path(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = Path::new(rel);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(CaskError::invalid(format!(
            "archive path {} escapes the archive",
            rel.display()
        )));
    }
    Ok(root.join(rel))
}
