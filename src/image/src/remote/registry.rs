//! Registry access over `oci-distribution`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use cask_core::error::{CaskError, Result};
use oci_distribution::client::{Certificate, CertificateEncoding, ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::{Client, RegistryOperation};

use super::credentials::{CredentialStore, RegistryAuth};
use super::hosts::HostConfig;
use super::{classify_error, Fetcher, Pusher, RemoteFactory, Resolver};
use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::media;
use crate::reference::Reference;

const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    media::OCI_INDEX,
    media::OCI_MANIFEST,
    media::DOCKER_MANIFEST_LIST,
    media::DOCKER_MANIFEST,
];

/// Default [`RemoteFactory`]: one `oci-distribution` client per host, with
/// host settings from the hosts directories and credentials from the store.
pub struct OciRemoteFactory {
    hosts_dirs: Vec<PathBuf>,
    credentials: CredentialStore,
    insecure: bool,
}

impl OciRemoteFactory {
    pub fn new(hosts_dirs: Vec<PathBuf>, credentials: CredentialStore, insecure: bool) -> Self {
        Self {
            hosts_dirs,
            credentials,
            insecure,
        }
    }
}

impl RemoteFactory for OciRemoteFactory {
    fn resolver(&self, domain: &str, plain_http: bool) -> Result<Arc<dyn Resolver>> {
        let host = HostConfig::load(&self.hosts_dirs, domain)?;
        let plain_http = plain_http || host.plain_http;
        let extra_root_certificates = host
            .ca_certificates()?
            .into_iter()
            .map(|data| Certificate {
                encoding: CertificateEncoding::Pem,
                data,
            })
            .collect();

        let config = ClientConfig {
            protocol: if plain_http {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            accept_invalid_certificates: host.skip_verify || self.insecure,
            extra_root_certificates,
            ..Default::default()
        };

        tracing::debug!(domain = %domain, plain_http, "Creating registry resolver");
        Ok(Arc::new(OciResolver {
            client: Arc::new(Client::new(config)),
            domain: domain.to_string(),
            auth: RegistryAuth::lookup(&self.credentials, domain),
        }))
    }
}

struct OciResolver {
    client: Arc<Client>,
    domain: String,
    auth: RegistryAuth,
}

impl OciResolver {
    fn remote(&self, reference: &Reference) -> OciRemote {
        OciRemote {
            client: self.client.clone(),
            domain: self.domain.clone(),
            repository: reference.path.clone(),
            display: reference.to_string(),
            auth: self.auth.to_oci(),
        }
    }
}

#[async_trait]
impl Resolver for OciResolver {
    async fn resolve(&self, ctx: &OpContext, reference: &Reference) -> Result<(String, Descriptor)> {
        let remote = self.remote(reference);
        let target = match (&reference.digest, &reference.tag) {
            (Some(digest), _) => remote.by_digest(digest),
            (None, Some(tag)) => remote.by_tag(tag),
            (None, None) => remote.by_tag(crate::reference::DEFAULT_TAG),
        };

        let (data, digest) = ctx
            .run(async {
                self.client
                    .pull_manifest_raw(&target, &remote.auth, ACCEPTED_MANIFEST_TYPES)
                    .await
                    .map_err(|e| remote.error(e.to_string(), false))
            })
            .await?;

        if let Some(pinned) = &reference.digest {
            if pinned != &digest {
                return Err(CaskError::IntegrityError {
                    digest: pinned.clone(),
                    message: format!("registry returned {digest}"),
                });
            }
        }

        let desc = Descriptor::new(manifest_media_type(&data), digest, data.len() as u64);
        tracing::debug!(reference = %reference, digest = %desc.digest, "Resolved reference");
        Ok((reference.name(), desc))
    }

    fn fetcher(&self, reference: &Reference) -> Result<Arc<dyn Fetcher>> {
        Ok(Arc::new(self.remote(reference)))
    }

    fn pusher(&self, reference: &Reference) -> Result<Arc<dyn Pusher>> {
        Ok(Arc::new(self.remote(reference)))
    }
}

/// One repository on one registry.
struct OciRemote {
    client: Arc<Client>,
    domain: String,
    repository: String,
    display: String,
    auth: oci_distribution::secrets::RegistryAuth,
}

impl OciRemote {
    fn by_tag(&self, tag: &str) -> oci_distribution::Reference {
        oci_distribution::Reference::with_tag(
            self.domain.clone(),
            self.repository.clone(),
            tag.to_string(),
        )
    }

    fn by_digest(&self, digest: &str) -> oci_distribution::Reference {
        oci_distribution::Reference::with_digest(
            self.domain.clone(),
            self.repository.clone(),
            digest.to_string(),
        )
    }

    fn error(&self, message: String, push: bool) -> CaskError {
        classify_error(&self.domain, &self.display, message, push)
    }

    async fn authorize(&self, target: &oci_distribution::Reference, op: RegistryOperation) -> Result<()> {
        let push = matches!(op, RegistryOperation::Push);
        self.client
            .auth(target, &self.auth, op)
            .await
            .map(|_| ())
            .map_err(|e| self.error(e.to_string(), push))
    }
}

#[async_trait]
impl Fetcher for OciRemote {
    async fn fetch(&self, ctx: &OpContext, desc: &Descriptor) -> Result<Vec<u8>> {
        let target = self.by_digest(&desc.digest);
        ctx.run(async {
            if media::is_manifest(&desc.media_type) || media::is_index(&desc.media_type) {
                let accepted = [desc.media_type.as_str()];
                let (data, _) = self
                    .client
                    .pull_manifest_raw(&target, &self.auth, &accepted)
                    .await
                    .map_err(|e| self.error(e.to_string(), false))?;
                return Ok(data);
            }

            self.authorize(&target, RegistryOperation::Pull).await?;
            let layer = OciDescriptor {
                media_type: desc.media_type.clone(),
                digest: desc.digest.clone(),
                size: desc.size as i64,
                urls: (!desc.urls.is_empty()).then(|| desc.urls.clone()),
                ..Default::default()
            };
            let mut data = Vec::with_capacity(desc.size as usize);
            self.client
                .pull_blob(&target, &layer, &mut data)
                .await
                .map_err(|e| self.error(e.to_string(), false))?;
            Ok(data)
        })
        .await
    }
}

#[async_trait]
impl Pusher for OciRemote {
    async fn push_blob(&self, ctx: &OpContext, desc: &Descriptor, data: Vec<u8>) -> Result<()> {
        let target = self.by_digest(&desc.digest);
        ctx.run(async {
            self.authorize(&target, RegistryOperation::Push).await?;
            self.client
                .push_blob(&target, &data, &desc.digest)
                .await
                .map_err(|e| self.error(e.to_string(), true))?;
            Ok(())
        })
        .await
    }

    async fn push_manifest(
        &self,
        ctx: &OpContext,
        desc: &Descriptor,
        data: Vec<u8>,
        tag: Option<&str>,
    ) -> Result<()> {
        let target = match tag {
            Some(tag) => self.by_tag(tag),
            None => self.by_digest(&desc.digest),
        };
        ctx.run(async {
            self.authorize(&target, RegistryOperation::Push).await?;
            let content_type = match desc.media_type.parse() {
                Ok(v) => v,
                Err(_) => {
                    return Err(CaskError::invalid(format!(
                        "invalid media type {}",
                        desc.media_type
                    )))
                }
            };
            self.client
                .push_manifest_raw(&target, data, content_type)
                .await
                .map_err(|e| self.error(e.to_string(), true))?;
            Ok(())
        })
        .await
    }
}

/// Media type of a manifest or index body: its `mediaType` field, else
/// guessed from the presence of `manifests`.
pub fn manifest_media_type(data: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        media_type: Option<String>,
        manifests: Option<serde_json::Value>,
    }
    match serde_json::from_slice::<Probe>(data) {
        Ok(Probe {
            media_type: Some(mt), ..
        }) if !mt.is_empty() => mt,
        Ok(Probe {
            manifests: Some(_), ..
        }) => media::OCI_INDEX.to_string(),
        _ => media::OCI_MANIFEST.to_string(),
    }
}
