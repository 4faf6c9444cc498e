//! Manifest, index and image config documents.
//!
//! The documents are the `oci_spec::image` types. Docker schema 2 documents
//! parse into the same types; their media types come through as
//! `MediaType::Other`. The extension traits here bridge to the store's own
//! [`Descriptor`] and [`Platform`].
//!
//! Re-serializing a typed config drops fields the OCI schema does not model
//! (`container_config`, `docker_version`, ...). Paths that only change a
//! media type keep the original bytes, and [`patch_diff_ids`] rewrites diff
//! IDs on the raw JSON.

use std::collections::BTreeMap;

use cask_core::error::{CaskError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use oci_spec::image::{
    Arch, HistoryBuilder, ImageConfigurationBuilder, ImageIndexBuilder, ImageManifestBuilder, MediaType,
    Os, RootFsBuilder,
};
use oci_spec::OciSpecError;
use serde::Serialize;
use serde_json::Value;

pub use oci_spec::image::{Config, History, ImageConfiguration, ImageIndex, ImageManifest, RootFs};

use crate::descriptor::Descriptor;
use crate::platform::Platform;

pub const SCHEMA_VERSION: u32 = 2;

pub(crate) fn spec_error(e: OciSpecError) -> CaskError {
    CaskError::Serialization(format!("invalid image document: {e}"))
}

/// Encode a document with object keys in sorted order, so equal documents
/// always get equal digests.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// RFC 3339 timestamp as written into configs.
pub fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

pub fn new_manifest(media_type: &str, config: &Descriptor, layers: &[Descriptor]) -> Result<ImageManifest> {
    let layers = layers.iter().map(Descriptor::to_oci).collect::<Result<Vec<_>>>()?;
    ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::from(media_type))
        .config(config.to_oci()?)
        .layers(layers)
        .build()
        .map_err(spec_error)
}

pub fn new_index(media_type: &str, manifests: &[Descriptor]) -> Result<ImageIndex> {
    let manifests = manifests.iter().map(Descriptor::to_oci).collect::<Result<Vec<_>>>()?;
    ImageIndexBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::from(media_type))
        .manifests(manifests)
        .build()
        .map_err(spec_error)
}

/// An empty config for `platform`, with no layers.
pub fn new_config(platform: &Platform) -> Result<ImageConfiguration> {
    let rootfs = RootFsBuilder::default()
        .typ("layers")
        .diff_ids(Vec::<String>::new())
        .build()
        .map_err(spec_error)?;
    let mut config = ImageConfigurationBuilder::default()
        .architecture(Arch::from(platform.architecture.as_str()))
        .os(Os::from(platform.os.as_str()))
        .rootfs(rootfs)
        .build()
        .map_err(spec_error)?;
    config.apply_platform(platform);
    Ok(config)
}

/// One history entry for a layer.
pub fn new_history(
    created: DateTime<Utc>,
    created_by: &str,
    author: Option<&str>,
    comment: Option<&str>,
) -> Result<History> {
    let mut builder = HistoryBuilder::default().created(timestamp(created));
    if let Some(created_by) = non_empty(created_by) {
        builder = builder.created_by(created_by);
    }
    if let Some(author) = author.and_then(non_empty) {
        builder = builder.author(author);
    }
    if let Some(comment) = comment.and_then(non_empty) {
        builder = builder.comment(comment);
    }
    builder.build().map_err(spec_error)
}

pub fn is_empty_layer(h: &History) -> bool {
    h.empty_layer().unwrap_or(false)
}

/// Store descriptors of a manifest's children.
pub trait ManifestExt {
    fn config_descriptor(&self) -> Descriptor;
    fn layer_descriptors(&self) -> Vec<Descriptor>;
    /// Config then layers.
    fn child_descriptors(&self) -> Vec<Descriptor>;
    /// Replace config and layers, and set the media type.
    fn rebuild(&mut self, media_type: &str, config: &Descriptor, layers: &[Descriptor]) -> Result<()>;
}

impl ManifestExt for ImageManifest {
    fn config_descriptor(&self) -> Descriptor {
        Descriptor::from(self.config())
    }

    fn layer_descriptors(&self) -> Vec<Descriptor> {
        self.layers().iter().map(Descriptor::from).collect()
    }

    fn child_descriptors(&self) -> Vec<Descriptor> {
        std::iter::once(self.config_descriptor())
            .chain(self.layer_descriptors())
            .collect()
    }

    fn rebuild(&mut self, media_type: &str, config: &Descriptor, layers: &[Descriptor]) -> Result<()> {
        let layers = layers.iter().map(Descriptor::to_oci).collect::<Result<Vec<_>>>()?;
        self.set_media_type(Some(MediaType::from(media_type)));
        self.set_config(config.to_oci()?);
        self.set_layers(layers);
        Ok(())
    }
}

pub trait IndexExt {
    fn manifest_descriptors(&self) -> Vec<Descriptor>;
    /// Replace the manifests and set the media type.
    fn rebuild(&mut self, media_type: &str, manifests: &[Descriptor]) -> Result<()>;
}

impl IndexExt for ImageIndex {
    fn manifest_descriptors(&self) -> Vec<Descriptor> {
        self.manifests().iter().map(Descriptor::from).collect()
    }

    fn rebuild(&mut self, media_type: &str, manifests: &[Descriptor]) -> Result<()> {
        let manifests = manifests.iter().map(Descriptor::to_oci).collect::<Result<Vec<_>>>()?;
        self.set_media_type(Some(MediaType::from(media_type)));
        self.set_manifests(manifests);
        Ok(())
    }
}

/// Accessors over the image config the rest of the crate works in.
pub trait ConfigExt {
    fn to_platform(&self) -> Platform;
    fn apply_platform(&mut self, platform: &Platform);
    /// Labels from the runtime config.
    fn config_labels(&self) -> BTreeMap<String, String>;
    fn layer_diff_ids(&self) -> &[String];
    fn replace_diff_ids(&mut self, diff_ids: Vec<String>);
    fn push_layer(&mut self, diff_id: String, history: History);
    /// Truncate to the first `layers` layers. History entries are counted
    /// by non-empty layers; empty-layer entries before the cut stay.
    fn truncate_layers(&mut self, layers: usize);
    /// Pair each layer with its history entry (`None` when history is short).
    fn layer_history(&self) -> Vec<Option<&History>>;
}

impl ConfigExt for ImageConfiguration {
    fn to_platform(&self) -> Platform {
        Platform {
            architecture: self.architecture().to_string(),
            os: self.os().to_string(),
            os_version: self.os_version().clone().unwrap_or_default(),
            os_features: Vec::new(),
            variant: self.variant().clone().unwrap_or_default(),
        }
    }

    fn apply_platform(&mut self, platform: &Platform) {
        self.set_architecture(Arch::from(platform.architecture.as_str()));
        self.set_os(Os::from(platform.os.as_str()));
        self.set_os_version(non_empty(&platform.os_version));
        self.set_variant(non_empty(&platform.variant));
    }

    fn config_labels(&self) -> BTreeMap<String, String> {
        self.config()
            .as_ref()
            .and_then(|c| c.labels().as_ref())
            .map(|l| l.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    fn layer_diff_ids(&self) -> &[String] {
        self.rootfs().diff_ids()
    }

    fn replace_diff_ids(&mut self, diff_ids: Vec<String>) {
        let mut rootfs = self.rootfs().clone();
        rootfs.set_diff_ids(diff_ids);
        self.set_rootfs(rootfs);
    }

    fn push_layer(&mut self, diff_id: String, history: History) {
        let mut diff_ids = self.layer_diff_ids().to_vec();
        diff_ids.push(diff_id);
        self.replace_diff_ids(diff_ids);
        let mut entries = self.history().clone();
        entries.push(history);
        self.set_history(entries);
    }

    fn truncate_layers(&mut self, layers: usize) {
        let mut diff_ids = self.layer_diff_ids().to_vec();
        diff_ids.truncate(layers);
        self.replace_diff_ids(diff_ids);

        let mut seen = 0;
        let mut keep = 0;
        for entry in self.history() {
            if !is_empty_layer(entry) {
                if seen == layers {
                    break;
                }
                seen += 1;
            }
            keep += 1;
        }
        let mut entries = self.history().clone();
        entries.truncate(keep);
        self.set_history(entries);
    }

    fn layer_history(&self) -> Vec<Option<&History>> {
        let mut non_empty = self.history().iter().filter(|h| !is_empty_layer(h));
        self.layer_diff_ids().iter().map(|_| non_empty.next()).collect()
    }
}

/// Replace `rootfs.diff_ids` in raw config JSON, leaving every other field
/// as it was.
pub fn patch_diff_ids(raw: &[u8], diff_ids: &[String]) -> Result<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(raw)?;
    let rootfs = value
        .as_object_mut()
        .ok_or_else(|| CaskError::Serialization("image config is not a JSON object".to_string()))?
        .entry("rootfs")
        .or_insert_with(|| serde_json::json!({"type": "layers"}));
    let rootfs = rootfs
        .as_object_mut()
        .ok_or_else(|| CaskError::Serialization("image config rootfs is not a JSON object".to_string()))?;
    rootfs.insert("diff_ids".to_string(), serde_json::to_value(diff_ids)?);
    Ok(serde_json::to_vec(&value)?)
}
