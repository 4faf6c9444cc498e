//! Shared fixtures: an in-memory registry and local test clients.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use cask_core::{CaskConfig, CaskError, Result};
use cask_image::descriptor::Descriptor;
use cask_image::manifest::{new_config, new_index, new_manifest, ConfigExt};
use cask_image::remote::{Fetcher, Pusher, RemoteFactory, Resolver};
use cask_image::{digest, media, Client, OpContext, Platform, Reference};
use parking_lot::Mutex;
use tempfile::TempDir;

#[derive(Default)]
struct State {
    blobs: HashMap<String, Vec<u8>>,
    manifests: HashMap<String, Descriptor>,
    /// `domain/path:tag` -> manifest digest
    tags: HashMap<String, String>,
}

/// A registry holding everything in memory. With `https_broken`, every
/// HTTPS request fails with a scheme mismatch.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<Mutex<State>>,
    pub https_broken: bool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plain_http_only() -> Self {
        Self {
            https_broken: true,
            ..Self::default()
        }
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.state.lock().blobs.contains_key(digest)
    }

    pub fn tagged(&self, reference: &str) -> Option<String> {
        let r = Reference::parse_normalized(reference).ok()?;
        let key = format!("{}:{}", r.name(), r.tag.as_deref().unwrap_or("latest"));
        self.state.lock().tags.get(&key).cloned()
    }

    fn put_blob(&self, media_type: &str, data: Vec<u8>) -> Descriptor {
        let desc = Descriptor::of(media_type, &data);
        self.state.lock().blobs.insert(desc.digest.clone(), data);
        desc
    }

    fn put_manifest(&self, reference: Option<&str>, media_type: &str, data: Vec<u8>) -> Descriptor {
        let desc = self.put_blob(media_type, data);
        let mut state = self.state.lock();
        state.manifests.insert(desc.digest.clone(), desc.clone());
        if let Some(reference) = reference {
            let r = Reference::parse_normalized(reference).unwrap();
            let key = format!("{}:{}", r.name(), r.tag.as_deref().unwrap_or("latest"));
            state.tags.insert(key, desc.digest.clone());
        }
        desc
    }

    /// Publish a single-platform Docker image built from layer tarballs.
    pub fn publish(&self, reference: &str, platform: &str, layers: &[Vec<u8>]) -> Descriptor {
        let (desc, _) = self.manifest(platform, layers);
        let data = self.state.lock().blobs[&desc.digest].clone();
        self.put_manifest(Some(reference), media::DOCKER_MANIFEST, data)
    }

    /// Publish an OCI index with one manifest per platform.
    pub fn publish_index(&self, reference: &str, platforms: &[(&str, Vec<Vec<u8>>)]) -> Descriptor {
        let mut manifests = Vec::new();
        for (platform, layers) in platforms {
            let (desc, platform) = self.manifest(platform, layers);
            manifests.push(desc.with_platform(Some(platform)));
        }
        let index = new_index(media::OCI_INDEX, &manifests).unwrap();
        self.put_manifest(Some(reference), media::OCI_INDEX, serde_json::to_vec(&index).unwrap())
    }

    fn manifest(&self, platform: &str, layers: &[Vec<u8>]) -> (Descriptor, Platform) {
        let platform = Platform::parse(platform).unwrap();
        let mut config = new_config(&platform).unwrap();
        let mut descs = Vec::new();
        for tar in layers {
            descs.push(self.put_blob(media::DOCKER_LAYER_GZIP, gzip(tar)));
        }
        config.replace_diff_ids(layers.iter().map(|tar| digest::sha256_of(tar)).collect());
        let config = self.put_blob(media::DOCKER_CONFIG, serde_json::to_vec(&config).unwrap());
        let manifest = new_manifest(media::DOCKER_MANIFEST, &config, &descs).unwrap();
        let desc = self.put_manifest(None, media::DOCKER_MANIFEST, serde_json::to_vec(&manifest).unwrap());
        (desc, platform)
    }
}

impl RemoteFactory for MemoryRegistry {
    fn resolver(&self, domain: &str, plain_http: bool) -> Result<Arc<dyn Resolver>> {
        Ok(Arc::new(MemoryResolver {
            registry: self.clone(),
            domain: domain.to_string(),
            plain_http,
        }))
    }
}

struct MemoryResolver {
    registry: MemoryRegistry,
    domain: String,
    plain_http: bool,
}

impl MemoryResolver {
    fn check_scheme(&self) -> Result<()> {
        if self.registry.https_broken && !self.plain_http {
            return Err(CaskError::SchemeMismatch {
                registry: self.domain.clone(),
                message: "http: server gave HTTP response to HTTPS client".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Resolver for MemoryResolver {
    async fn resolve(&self, _ctx: &OpContext, reference: &Reference) -> Result<(String, Descriptor)> {
        self.check_scheme()?;
        let state = self.registry.state.lock();
        let digest = match (&reference.digest, &reference.tag) {
            (Some(d), _) => Some(d.clone()),
            (None, Some(tag)) => state.tags.get(&format!("{}:{}", reference.name(), tag)).cloned(),
            (None, None) => None,
        };
        let desc = digest
            .and_then(|d| state.manifests.get(&d).cloned())
            .ok_or_else(|| CaskError::not_found(format!("{reference}")))?;
        Ok((reference.to_string(), desc))
    }

    fn fetcher(&self, _reference: &Reference) -> Result<Arc<dyn Fetcher>> {
        self.check_scheme()?;
        Ok(Arc::new(MemoryFetcher {
            registry: self.registry.clone(),
        }))
    }

    fn pusher(&self, reference: &Reference) -> Result<Arc<dyn Pusher>> {
        self.check_scheme()?;
        Ok(Arc::new(MemoryPusher {
            registry: self.registry.clone(),
            name: reference.name(),
        }))
    }
}

struct MemoryFetcher {
    registry: MemoryRegistry,
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, _ctx: &OpContext, desc: &Descriptor) -> Result<Vec<u8>> {
        self.registry
            .state
            .lock()
            .blobs
            .get(&desc.digest)
            .cloned()
            .ok_or_else(|| CaskError::not_found(desc.digest.clone()))
    }
}

struct MemoryPusher {
    registry: MemoryRegistry,
    name: String,
}

#[async_trait]
impl Pusher for MemoryPusher {
    async fn push_blob(&self, _ctx: &OpContext, desc: &Descriptor, data: Vec<u8>) -> Result<()> {
        assert_eq!(digest::sha256_of(&data), desc.digest);
        self.registry.state.lock().blobs.insert(desc.digest.clone(), data);
        Ok(())
    }

    async fn push_manifest(
        &self,
        _ctx: &OpContext,
        desc: &Descriptor,
        data: Vec<u8>,
        tag: Option<&str>,
    ) -> Result<()> {
        let mut state = self.registry.state.lock();
        state.blobs.insert(desc.digest.clone(), data);
        state.manifests.insert(desc.digest.clone(), desc.clone());
        if let Some(tag) = tag {
            state.tags.insert(format!("{}:{tag}", self.name), desc.digest.clone());
        }
        Ok(())
    }
}

/// A client over a fresh store in `tmp` talking to `registry`.
pub fn client(tmp: &TempDir, registry: &MemoryRegistry) -> Client {
    client_with(tmp, registry, |_| {})
}

pub fn client_with(tmp: &TempDir, registry: &MemoryRegistry, tweak: impl FnOnce(&mut CaskConfig)) -> Client {
    let mut config = CaskConfig {
        data_root: tmp.path().to_path_buf(),
        hosts_dir: Vec::new(),
        ..Default::default()
    };
    tweak(&mut config);
    Client::open(config)
        .unwrap()
        .with_remotes(Arc::new(registry.clone()))
}

/// Tarball with the given regular files.
pub fn layer(files: &[(&str, &[u8])]) -> Vec<u8> {
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

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Labels of a stored blob.
pub async fn blob_labels(client: &Client, ctx: &OpContext, digest: &str) -> BTreeMap<String, String> {
    client.content().info(ctx, digest).await.unwrap().labels
}

/// The host platform as `os/arch[/variant]`.
pub fn host() -> String {
    Platform::host().to_string()
}
