//! Image conversion.
//!
//! A conversion rewrites an image bottom-up: every layer passes through a
//! [`LayerConvertFunc`], configs get new diff IDs where the uncompressed
//! content changed, and manifests and indexes are rebuilt around the new
//! children. Unchanged subtrees keep their original descriptors.

pub mod estargz;
mod toc;
pub mod uncompress;
pub mod zstd;
pub mod zstdchunked;

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use cask_core::error::{CaskError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::client::Client;
use crate::compression;
use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::digest::{DigestingReader, DigestingWriter};
use crate::graph::{child_gc_labels, Node, MAX_JSON_BLOB};
use crate::labels;
use crate::manifest::{
    patch_diff_ids, ConfigExt, ImageConfiguration, ImageIndex, ImageManifest, IndexExt, ManifestExt,
};
use crate::media;
use crate::platform::MatchComparer;
use crate::store::{create_or_update, write_blob, write_file, ContentStore, ImageRecord};

pub use estargz::{EstargzConverter, EstargzOptions};
pub use uncompress::Uncompress;
pub use zstd::ZstdConverter;
pub use zstdchunked::{ZstdChunkedConverter, ZstdChunkedOptions};

/// Converts one layer. `None` leaves the layer unchanged.
#[async_trait]
pub trait LayerConvertFunc: Send + Sync {
    async fn convert(
        &self,
        cs: &dyn ContentStore,
        ctx: &OpContext,
        desc: &Descriptor,
    ) -> Result<Option<Descriptor>>;
}

/// `compose(f, g)(d) = g(f(d) or d)`.
pub struct Compose {
    first: Arc<dyn LayerConvertFunc>,
    second: Arc<dyn LayerConvertFunc>,
}

impl Compose {
    pub fn new(first: Arc<dyn LayerConvertFunc>, second: Arc<dyn LayerConvertFunc>) -> Self {
        Self { first, second }
    }
}

#[async_trait]
impl LayerConvertFunc for Compose {
    async fn convert(
        &self,
        cs: &dyn ContentStore,
        ctx: &OpContext,
        desc: &Descriptor,
    ) -> Result<Option<Descriptor>> {
        let first = self.first.convert(cs, ctx, desc).await?;
        let input = first.clone().unwrap_or_else(|| desc.clone());
        Ok(self.second.convert(cs, ctx, &input).await?.or(first))
    }
}

/// Rewrites Docker schema 2 layer media types to their OCI counterparts.
/// The blob itself is untouched.
pub struct DockerToOci;

#[async_trait]
impl LayerConvertFunc for DockerToOci {
    async fn convert(
        &self,
        _cs: &dyn ContentStore,
        _ctx: &OpContext,
        desc: &Descriptor,
    ) -> Result<Option<Descriptor>> {
        let media_type = media::docker_to_oci(&desc.media_type);
        if media_type == desc.media_type {
            return Ok(None);
        }
        Ok(Some(Descriptor {
            media_type,
            ..desc.clone()
        }))
    }
}

/// Post-processing after the converted image record exists. May create one
/// extra record.
#[async_trait]
pub trait Finalize: Send + Sync {
    async fn finalize(
        &self,
        client: &Client,
        ctx: &OpContext,
        target: &str,
        converted: &Descriptor,
    ) -> Result<Option<ImageRecord>>;
}

/// What a conversion does.
#[derive(Clone)]
pub struct ConvertOptions {
    pub matcher: MatchComparer,
    /// Rewrite Docker schema 2 media types to OCI.
    pub docker_to_oci: bool,
    pub layer: Option<Arc<dyn LayerConvertFunc>>,
    pub finalize: Option<Arc<dyn Finalize>>,
}

impl ConvertOptions {
    pub fn new(matcher: MatchComparer) -> Self {
        Self {
            matcher,
            docker_to_oci: false,
            layer: None,
            finalize: None,
        }
    }

    /// The function applied to every layer. With `docker_to_oci` the
    /// media-type rewrite runs first, so `layer` only sees OCI types.
    pub fn layer_func(&self) -> Option<Arc<dyn LayerConvertFunc>> {
        match (&self.layer, self.docker_to_oci) {
            (Some(f), true) => Some(Arc::new(Compose::new(Arc::new(DockerToOci), f.clone()))),
            (Some(f), false) => Some(f.clone()),
            (None, true) => Some(Arc::new(DockerToOci)),
            (None, false) => None,
        }
    }
}

/// Result of [`convert`].
#[derive(Debug, Clone)]
pub struct Converted {
    pub image: ImageRecord,
    /// Record created by the finalize hook.
    pub extra: Option<ImageRecord>,
}

/// Convert `source` into the record `target`. Runs under its own lease;
/// the target record is written after all of its content.
pub async fn convert(
    client: &Client,
    ctx: &OpContext,
    target: &str,
    source: &ImageRecord,
    opts: &ConvertOptions,
) -> Result<Converted> {
    let lease = client.lease(ctx, "convert").await?;
    let result = convert_leased(client, lease.context(), target, source, opts).await;
    lease.release().await?;
    result
}

async fn convert_leased(
    client: &Client,
    ctx: &OpContext,
    target: &str,
    source: &ImageRecord,
    opts: &ConvertOptions,
) -> Result<Converted> {
    let state = ConvertState {
        cs: client.content(),
        ctx,
        opts,
        layer: opts.layer_func(),
        layers: Mutex::new(HashMap::new()),
    };
    let root = state.convert_node(source.target.clone(), true).await?;

    let mut record = ImageRecord::new(target, root.clone());
    record.labels = source.labels.clone();
    let image = create_or_update(client.images(), ctx, record).await?;
    tracing::info!(
        source = %source.name,
        target = %target,
        digest = %root.digest,
        "Converted image"
    );

    let extra = match &opts.finalize {
        Some(f) => f.finalize(client, ctx, target, &root).await?,
        None => None,
    };
    Ok(Converted { image, extra })
}

struct ConvertState<'a> {
    cs: &'a dyn ContentStore,
    ctx: &'a OpContext,
    opts: &'a ConvertOptions,
    layer: Option<Arc<dyn LayerConvertFunc>>,
    /// Converted layers by source digest.
    layers: Mutex<HashMap<String, Option<Descriptor>>>,
}

impl<'a> ConvertState<'a> {
    fn convert_node(&'a self, desc: Descriptor, is_root: bool) -> BoxFuture<'a, Result<Descriptor>> {
        async move {
            self.ctx.check()?;
            let node = Node::load(self.cs, self.ctx, &desc).await?;
            match node {
                Node::Index(desc, index) => self.convert_index(desc, index).await,
                Node::Manifest(desc, manifest) => self.convert_manifest(desc, manifest).await,
                _ if is_root => Err(CaskError::Unsupported(format!(
                    "cannot convert {} target",
                    desc.media_type
                ))),
                _ => Ok(desc),
            }
        }
        .boxed()
    }

    async fn convert_index(&'a self, desc: Descriptor, mut index: ImageIndex) -> Result<Descriptor> {
        let selected = Node::Index(desc.clone(), index.clone()).children_for(&self.opts.matcher);
        let mut changed = selected.len() != index.manifests().len();
        let mut manifests = Vec::with_capacity(selected.len());
        for child in selected {
            let mut converted = self.convert_node(child.clone(), false).await?;
            converted.platform = child.platform.clone();
            converted.annotations = merge(&child.annotations, &converted.annotations);
            changed |= converted.digest != child.digest || converted.media_type != child.media_type;
            manifests.push(converted);
        }

        let media_type = self.target_type(&desc.media_type);
        if !changed && media_type == desc.media_type {
            return Ok(desc);
        }
        index.rebuild(&media_type, &manifests)?;
        self.write_parent(&media_type, &index, &manifests, &desc).await
    }

    async fn convert_manifest(&'a self, desc: Descriptor, mut manifest: ImageManifest) -> Result<Descriptor> {
        let old_config = manifest.config_descriptor();
        let raw_config = self.cs.read_blob(self.ctx, &old_config.digest, Some(MAX_JSON_BLOB)).await?;
        let config: ImageConfiguration = serde_json::from_slice(&raw_config)?;
        let mut diff_ids = config.layer_diff_ids().to_vec();
        let mut changed = false;
        let mut diff_ids_changed = false;
        let old_layers = manifest.layer_descriptors();
        let mut layers = Vec::with_capacity(old_layers.len());

        for (i, layer) in old_layers.iter().enumerate() {
            let new = match self.convert_layer(layer).await? {
                Some(new) if new.digest != layer.digest => {
                    let diff_id = diff_id_of(self.cs, self.ctx, &new).await?;
                    if let Some(old) = diff_ids.get_mut(i) {
                        if *old != diff_id {
                            *old = diff_id;
                            diff_ids_changed = true;
                        }
                    }
                    new
                }
                Some(new) => new,
                None => layer.clone(),
            };
            changed |= new != *layer;
            layers.push(new);
        }

        // The config is rewritten on its raw JSON; a media-type change alone
        // keeps the blob.
        let config_type = self.target_type(&old_config.media_type);
        let config_desc = if diff_ids_changed {
            changed = true;
            let data = patch_diff_ids(&raw_config, &diff_ids)?;
            let new = Descriptor::of(config_type, &data);
            write_blob(self.cs, self.ctx, &new, &data, BTreeMap::new()).await?;
            new
        } else if config_type != old_config.media_type {
            changed = true;
            Descriptor {
                media_type: config_type,
                ..old_config
            }
        } else {
            old_config
        };

        let media_type = self.target_type(&desc.media_type);
        if !changed && media_type == desc.media_type {
            return Ok(desc);
        }
        manifest.rebuild(&media_type, &config_desc, &layers)?;
        let children = manifest.child_descriptors();
        self.write_parent(&media_type, &manifest, &children, &desc).await
    }

    async fn convert_layer(&self, layer: &Descriptor) -> Result<Option<Descriptor>> {
        let Some(func) = &self.layer else {
            return Ok(None);
        };
        let cached = self.layers.lock().get(&layer.digest).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }
        let converted = func.convert(self.cs, self.ctx, layer).await?;
        if let Some(new) = &converted {
            tracing::debug!(from = %layer.digest, to = %new.digest, "Converted layer");
        }
        self.layers
            .lock()
            .insert(layer.digest.clone(), converted.clone());
        Ok(converted)
    }

    fn target_type(&self, media_type: &str) -> String {
        if self.opts.docker_to_oci {
            media::docker_to_oci(media_type)
        } else {
            media_type.to_string()
        }
    }

    async fn write_parent<T: serde::Serialize>(
        &self,
        media_type: &str,
        value: &T,
        children: &[Descriptor],
        original: &Descriptor,
    ) -> Result<Descriptor> {
        let data = crate::manifest::to_vec(value)?;
        let mut desc = Descriptor::of(media_type, &data);
        desc.annotations = original.annotations.clone();
        desc.platform = original.platform.clone();
        write_blob(self.cs, self.ctx, &desc, &data, child_gc_labels(&desc, children)).await?;
        Ok(desc)
    }
}

fn merge(base: &BTreeMap<String, String>, over: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = base.clone();
    out.extend(over.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

/// Diff ID of a layer: its `containerd.io/uncompressed` label, its own
/// digest when uncompressed, else the digest of its decompressed bytes.
pub async fn diff_id_of(cs: &dyn ContentStore, ctx: &OpContext, desc: &Descriptor) -> Result<String> {
    let info = cs.info(ctx, &desc.digest).await?;
    if let Some(diff_id) = info.labels.get(labels::UNCOMPRESSED) {
        return Ok(diff_id.clone());
    }
    if media::compression(&desc.media_type) == media::Compression::Uncompressed
        && !media::is_encrypted(&desc.media_type)
    {
        return Ok(desc.digest.clone());
    }

    let blob = cs.open_blob(ctx, &desc.digest).await?;
    let diff_id = ctx
        .run(async {
            tokio::task::spawn_blocking(move || {
                let (_, reader) = compression::decompress(blob)?;
                DigestingReader::new(reader).finish()
            })
            .await
            .map_err(|e| CaskError::Other(format!("digest task failed: {e}")))?
            .map_err(CaskError::from)
        })
        .await?
        .0;
    cs.update_labels(
        ctx,
        &desc.digest,
        BTreeMap::from([(labels::UNCOMPRESSED.to_string(), diff_id.clone())]),
        false,
    )
    .await?;
    Ok(diff_id)
}

/// What a blocking rewrite reports besides the bytes it wrote.
pub(crate) struct Rewrite {
    /// Digest of the rewritten layer's uncompressed stream.
    pub diff_id: String,
    pub annotations: BTreeMap<String, String>,
    /// Side output, e.g. an external table of contents.
    pub extra: Option<Vec<u8>>,
}

impl Rewrite {
    pub fn plain(diff_id: String) -> Self {
        Self {
            diff_id,
            annotations: BTreeMap::new(),
            extra: None,
        }
    }
}

/// Output of a blocking layer rewrite, staged in a temp file.
pub(crate) struct RewrittenLayer {
    pub file: tempfile::NamedTempFile,
    pub digest: String,
    pub size: u64,
    pub rewrite: Rewrite,
}

/// Run `rewrite` over the decompressed bytes of `src` on the blocking pool
/// and stage its output in a temp file.
pub(crate) async fn rewrite_layer<F>(
    cs: &dyn ContentStore,
    ctx: &OpContext,
    src: &Descriptor,
    rewrite: F,
) -> Result<RewrittenLayer>
where
    F: FnOnce(Box<dyn Read + Send>, &mut DigestingWriter<std::fs::File>) -> std::io::Result<Rewrite>
        + Send
        + 'static,
{
    let blob = cs.open_blob(ctx, &src.digest).await?;
    let digest = src.digest.clone();
    ctx.run(async move {
        tokio::task::spawn_blocking(move || {
            let (_, reader) = compression::decompress(blob)?;
            let file = tempfile::NamedTempFile::new()?;
            let mut writer = DigestingWriter::new(file.reopen()?);
            let rewrite = rewrite(reader, &mut writer)?;
            let (_, digest, size) = writer.finish();
            Ok::<_, std::io::Error>(RewrittenLayer {
                file,
                digest,
                size,
                rewrite,
            })
        })
        .await
        .map_err(|e| CaskError::Other(format!("convert task failed: {e}")))?
        .map_err(|e| CaskError::IntegrityError {
            digest,
            message: format!("failed to convert layer: {e}"),
        })
    })
    .await
}

/// Annotations describing one specific layer encoding. They never survive
/// a rewrite.
const FORMAT_ANNOTATIONS: &[&str] = &[
    labels::ESTARGZ_TOC_DIGEST,
    labels::ESTARGZ_UNCOMPRESSED_SIZE,
    labels::ZSTD_CHUNKED_MANIFEST_CHECKSUM,
    labels::ZSTD_CHUNKED_MANIFEST_POSITION,
];

/// Commit a rewritten layer with the `containerd.io/uncompressed` label and
/// return its descriptor. Source annotations are kept under the new ones.
pub(crate) async fn commit_layer(
    cs: &dyn ContentStore,
    ctx: &OpContext,
    src: &Descriptor,
    media_type: String,
    layer: RewrittenLayer,
) -> Result<Descriptor> {
    let mut desc = Descriptor::new(media_type, layer.digest, layer.size);
    let mut annotations = src.annotations.clone();
    annotations.retain(|k, _| !FORMAT_ANNOTATIONS.contains(&k.as_str()));
    desc.annotations = merge(&annotations, &layer.rewrite.annotations);
    desc.urls = src.urls.clone();
    let blob_labels = BTreeMap::from([(labels::UNCOMPRESSED.to_string(), layer.rewrite.diff_id)]);
    write_file(cs, ctx, &desc, layer.file.path(), blob_labels).await?;
    Ok(desc)
}

/// True for layers a format converter can read.
pub(crate) fn convertible(desc: &Descriptor) -> bool {
    media::is_layer(&desc.media_type) && !media::is_encrypted(&desc.media_type)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::graph::read_json;
    use crate::manifest::{new_config, new_manifest};
    use crate::platform::Platform;
    use crate::store::write_json;

    pub(crate) fn layer_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn test_client(tmp: &TempDir) -> Client {
        Client::open(cask_core::CaskConfig {
            data_root: tmp.path().to_path_buf(),
            hosts_dir: Vec::new(),
            ..Default::default()
        })
        .unwrap()
    }

    /// Store a Docker schema 2 image with gzip layers and return its record.
    pub(crate) async fn docker_image(
        client: &Client,
        ctx: &OpContext,
        name: &str,
        layers: &[Vec<u8>],
    ) -> ImageRecord {
        let mut descs = Vec::new();
        let mut diff_ids = Vec::new();
        for tar in layers {
            let gz = compression::gzip_all(tar).unwrap();
            let desc = Descriptor::of(media::DOCKER_LAYER_GZIP, &gz);
            write_blob(client.content(), ctx, &desc, &gz, BTreeMap::new()).await.unwrap();
            diff_ids.push(crate::digest::sha256_of(tar));
            descs.push(desc);
        }
        let mut config = new_config(&Platform::host()).unwrap();
        config.replace_diff_ids(diff_ids);
        let config_desc = write_json(client.content(), ctx, media::DOCKER_CONFIG, &config, BTreeMap::new())
            .await
            .unwrap();
        let mut children = vec![config_desc.clone()];
        children.extend(descs.iter().cloned());
        let manifest = new_manifest(media::DOCKER_MANIFEST, &config_desc, &descs).unwrap();
        let data = crate::manifest::to_vec(&manifest).unwrap();
        let target = Descriptor::of(media::DOCKER_MANIFEST, &data);
        let gc = crate::graph::child_gc_labels(&target, &children);
        write_blob(client.content(), ctx, &target, &data, gc).await.unwrap();
        let record = ImageRecord::new(name, target);
        client.images().create(ctx, record).await.unwrap()
    }

    /// A stored manifest with its config, as store descriptors.
    pub(crate) struct Loaded {
        pub config_desc: Descriptor,
        pub layers: Vec<Descriptor>,
        pub config: ImageConfiguration,
    }

    impl Loaded {
        pub fn diff_ids(&self) -> &[String] {
            self.config.layer_diff_ids()
        }
    }

    pub(crate) async fn load_manifest(client: &Client, ctx: &OpContext, desc: &Descriptor) -> Loaded {
        let manifest: ImageManifest = read_json(client.content(), ctx, desc).await.unwrap();
        let config_desc = manifest.config_descriptor();
        let config = read_json(client.content(), ctx, &config_desc).await.unwrap();
        Loaded {
            config_desc,
            layers: manifest.layer_descriptors(),
            config,
        }
    }

    #[tokio::test]
    async fn test_docker_to_oci_only() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let src = docker_image(&client, &ctx, "docker.io/library/src:1", &[layer_tar(&[("a", b"a")])]).await;

        let mut opts = ConvertOptions::new(MatchComparer::all());
        opts.docker_to_oci = true;
        let out = convert(&client, &ctx, "docker.io/library/dst:1", &src, &opts)
            .await
            .unwrap();
        assert_eq!(out.image.target.media_type, media::OCI_MANIFEST);
        let converted = load_manifest(&client, &ctx, &out.image.target).await;
        assert_eq!(converted.config_desc.media_type, media::OCI_CONFIG);
        assert_eq!(converted.layers[0].media_type, media::OCI_LAYER_GZIP);

        // Only media types changed: layer and config blobs are reused as is.
        let orig = load_manifest(&client, &ctx, &src.target).await;
        assert_eq!(converted.layers[0].digest, orig.layers[0].digest);
        assert_eq!(converted.config_desc.digest, orig.config_desc.digest);
        assert_eq!(converted.diff_ids(), orig.diff_ids());

        // The conversion lease is gone and the new manifest references its children.
        assert!(client.leases().list(&ctx).await.unwrap().is_empty());
        let info = client.content().info(&ctx, &out.image.target.digest).await.unwrap();
        assert!(info.labels.contains_key("containerd.io/gc.ref.content.config"));
    }

    #[tokio::test]
    async fn test_no_change_keeps_target() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let src = docker_image(&client, &ctx, "docker.io/library/src:1", &[layer_tar(&[("a", b"a")])]).await;
        let out = convert(
            &client,
            &ctx,
            "docker.io/library/dst:1",
            &src,
            &ConvertOptions::new(MatchComparer::all()),
        )
        .await
        .unwrap();
        assert_eq!(out.image.target, src.target);
    }

    #[tokio::test]
    async fn test_compose_uncompress_then_zstd() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let tar = layer_tar(&[("f", b"hello")]);
        let src = docker_image(&client, &ctx, "docker.io/library/src:1", &[tar.clone()]).await;

        let mut opts = ConvertOptions::new(MatchComparer::all());
        opts.layer = Some(Arc::new(Compose::new(
            Arc::new(Uncompress),
            Arc::new(ZstdConverter::new(Some(5))),
        )));
        opts.docker_to_oci = true;
        let out = convert(&client, &ctx, "docker.io/library/dst:1", &src, &opts)
            .await
            .unwrap();
        let converted = load_manifest(&client, &ctx, &out.image.target).await;
        assert_eq!(converted.layers[0].media_type, media::OCI_LAYER_ZSTD);
        assert_eq!(converted.diff_ids()[0], crate::digest::sha256_of(&tar));
        let data = client
            .content()
            .read_blob(&ctx, &converted.layers[0].digest, None)
            .await
            .unwrap();
        assert_eq!(compression::decompress_all(&data).unwrap(), tar);
    }

    #[tokio::test]
    async fn test_oci_rewrite_runs_before_layer_func() {
        struct Seen(Mutex<Vec<String>>);
        #[async_trait]
        impl LayerConvertFunc for Seen {
            async fn convert(
                &self,
                _cs: &dyn ContentStore,
                _ctx: &OpContext,
                desc: &Descriptor,
            ) -> Result<Option<Descriptor>> {
                self.0.lock().push(desc.media_type.clone());
                Ok(None)
            }
        }

        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let src = docker_image(&client, &ctx, "docker.io/library/src:1", &[layer_tar(&[("a", b"a")])]).await;

        let seen = Arc::new(Seen(Mutex::new(Vec::new())));
        let mut opts = ConvertOptions::new(MatchComparer::all());
        opts.docker_to_oci = true;
        opts.layer = Some(seen.clone() as Arc<dyn LayerConvertFunc>);
        let out = convert(&client, &ctx, "docker.io/library/dst:1", &src, &opts)
            .await
            .unwrap();
        assert_eq!(*seen.0.lock(), vec![media::OCI_LAYER_GZIP.to_string()]);
        let converted = load_manifest(&client, &ctx, &out.image.target).await;
        assert_eq!(converted.layers[0].media_type, media::OCI_LAYER_GZIP);
    }
}
