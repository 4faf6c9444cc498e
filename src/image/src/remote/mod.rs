//! Remote registries.
//!
//! The core talks to registries through three capability traits: a
//! [`Resolver`] turns a reference into a root descriptor, a [`Fetcher`]
//! reads blobs and a [`Pusher`] writes them. [`RemoteFactory`] builds a
//! resolver per registry host; the default factory delegates to
//! `oci-distribution`, tests inject an in-memory one.

pub mod credentials;
pub mod fetch;
pub mod hosts;
pub mod push;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use cask_core::error::{CaskError, Result};
use cask_core::ErrorKind;

use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::reference::Reference;

pub use credentials::{CredentialStore, RegistryAuth};
pub use fetch::{fetch_graph, FetchEvent};
pub use hosts::HostConfig;
pub use push::push_graph;
pub use registry::OciRemoteFactory;

/// Reads blobs from a repository.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, ctx: &OpContext, desc: &Descriptor) -> Result<Vec<u8>>;
}

/// Writes blobs and manifests to a repository.
#[async_trait]
pub trait Pusher: Send + Sync {
    async fn push_blob(&self, ctx: &OpContext, desc: &Descriptor, data: Vec<u8>) -> Result<()>;

    /// Push a manifest or index by digest, or under `tag` when given.
    async fn push_manifest(
        &self,
        ctx: &OpContext,
        desc: &Descriptor,
        data: Vec<u8>,
        tag: Option<&str>,
    ) -> Result<()>;
}

/// Resolves references against one registry host.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve to `(canonical name, root descriptor)`.
    async fn resolve(&self, ctx: &OpContext, reference: &Reference) -> Result<(String, Descriptor)>;

    fn fetcher(&self, reference: &Reference) -> Result<Arc<dyn Fetcher>>;

    fn pusher(&self, reference: &Reference) -> Result<Arc<dyn Pusher>>;
}

/// Builds resolvers per registry host.
pub trait RemoteFactory: Send + Sync {
    fn resolver(&self, domain: &str, plain_http: bool) -> Result<Arc<dyn Resolver>>;
}

/// Resolve `reference`, retrying over plain HTTP when the registry answered
/// HTTPS with HTTP and `insecure` allows it. Returns the resolver that
/// succeeded so later fetches use the same scheme.
pub async fn resolve_with_fallback(
    factory: &dyn RemoteFactory,
    ctx: &OpContext,
    reference: &Reference,
    insecure: bool,
) -> Result<(Arc<dyn Resolver>, String, Descriptor)> {
    let resolver = factory.resolver(&reference.domain, false)?;
    match resolver.resolve(ctx, reference).await {
        Ok((name, desc)) => Ok((resolver, name, desc)),
        Err(e) if insecure && e.is(ErrorKind::SchemeMismatch) => {
            tracing::warn!(
                domain = %reference.domain,
                error = %e,
                "HTTPS failed, retrying with plain HTTP"
            );
            let resolver = factory.resolver(&reference.domain, true)?;
            let (name, desc) = resolver.resolve(ctx, reference).await?;
            Ok((resolver, name, desc))
        }
        Err(e) => Err(e),
    }
}

/// Classify a registry client error message into the error taxonomy.
pub fn classify_error(registry: &str, reference: &str, message: String, push: bool) -> CaskError {
    let lower = message.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("denied") {
        CaskError::Unauthorized {
            registry: registry.to_string(),
            message,
        }
    } else if lower.contains("http response to https client")
        || lower.contains("wrong version number")
        || lower.contains("invalid http version")
        || lower.contains("record overflow")
    {
        CaskError::SchemeMismatch {
            registry: registry.to_string(),
            message,
        }
    } else if lower.contains("error trying to connect")
        || lower.contains("connection refused")
        || lower.contains("dns error")
        || lower.contains("failed to lookup address")
        || lower.contains("timed out")
    {
        CaskError::RegistryUnreachable {
            registry: registry.to_string(),
            message,
        }
    } else if !push && (lower.contains("404") || lower.contains("not found") || lower.contains("unknown")) {
        CaskError::NotFound(format!("{reference}: {message}"))
    } else if push {
        CaskError::PushFailed {
            reference: reference.to_string(),
            message,
        }
    } else {
        CaskError::FetchFailed {
            reference: reference.to_string(),
            message,
        }
    }
}
