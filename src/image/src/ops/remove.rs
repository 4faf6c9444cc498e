//! Removing images.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use cask_core::error::{CaskError, Result};

use crate::client::Client;
use crate::context::OpContext;
use crate::graph;
use crate::platform::MatchComparer;
use crate::store::{ImageFilter, ImageRecord};
use crate::streams::IoStreams;
use crate::walker::{self, AmbiguityPolicy};

/// A container that was created from an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerUse {
    pub id: String,
    /// Image name or target digest the container was created from.
    pub image: String,
    pub running: bool,
}

impl ContainerUse {
    /// True if this container was created from `image`.
    pub fn uses(&self, image: &ImageRecord) -> bool {
        self.image == image.name || self.image == image.target.digest
    }
}

/// Source of container usage, owned by whoever tracks containers.
#[async_trait]
pub trait ContainerLookup: Send + Sync {
    async fn containers(&self, ctx: &OpContext) -> Result<Vec<ContainerUse>>;
}

/// A lookup for hosts without containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContainers;

#[async_trait]
impl ContainerLookup for NoContainers {
    async fn containers(&self, _ctx: &OpContext) -> Result<Vec<ContainerUse>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    pub force: bool,
}

/// Remove the images `refs` name. Every request is attempted; the first
/// failure is returned after the rest have been processed.
pub async fn remove(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    lookup: &dyn ContainerLookup,
    refs: &[String],
    opts: RemoveOptions,
) -> Result<()> {
    if refs.is_empty() {
        return Err(CaskError::invalid("requires at least 1 argument"));
    }
    let containers = lookup.containers(ctx).await?;
    let policy = if opts.force {
        AmbiguityPolicy::UniqueTarget
    } else {
        AmbiguityPolicy::Unique
    };

    let mut first_error = None;
    let mut removed = HashSet::new();
    for req in refs {
        let result = remove_one(client, ctx, streams, &containers, req, policy, opts, &mut removed).await;
        if let Err(e) = result {
            tracing::debug!(request = %req, error = %e, "Failed to remove image");
            if first_error.is_none() {
                first_error = Some(e);
            } else {
                streams.stderr.line(format!("Error: {e}"))?;
            }
        }
    }

    if !removed.is_empty() {
        let report = client.gc(ctx).await?;
        tracing::debug!(blobs = report.blobs_removed, bytes = report.bytes_reclaimed, "Collected garbage");
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn remove_one(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    containers: &[ContainerUse],
    req: &str,
    policy: AmbiguityPolicy,
    opts: RemoveOptions,
    removed: &mut HashSet<String>,
) -> Result<()> {
    let found = walker::walk(client.content(), client.images(), ctx, req, policy).await?;
    for f in found {
        if removed.contains(&f.image.name) {
            continue;
        }
        check_in_use(containers, &f.image, req, opts.force)?;
        let lines = delete_image(client, ctx, &f.image).await?;
        super::emit(&streams.stdout, &lines)?;
        removed.insert(f.image.name);
    }
    Ok(())
}

fn check_in_use(containers: &[ContainerUse], image: &ImageRecord, req: &str, force: bool) -> Result<()> {
    for c in containers.iter().filter(|c| c.uses(image)) {
        if c.running {
            return Err(CaskError::invalid(format!(
                "conflict: unable to delete {req} (cannot be forced) - image is being used by running container {}",
                c.id
            )));
        }
        if !force {
            return Err(CaskError::invalid(format!(
                "conflict: unable to delete {req} (must be forced) - image is being used by stopped container {}",
                c.id
            )));
        }
    }
    Ok(())
}

/// Delete one record and describe it: an `Untagged:` line, plus `Deleted:`
/// lines for its configs when no other record shares the target.
pub(crate) async fn delete_image(client: &Client, ctx: &OpContext, image: &ImageRecord) -> Result<Vec<String>> {
    let configs: BTreeSet<String> =
        match graph::manifests_for(client.content(), ctx, &image.target, &MatchComparer::all()).await {
            Ok(manifests) => manifests.into_iter().map(|pm| pm.config_desc.digest).collect(),
            Err(e) => {
                tracing::warn!(image = %image.name, error = %e, "Unable to enumerate image rootfs");
                BTreeSet::new()
            }
        };

    client.images().delete(ctx, &image.name).await?;
    tracing::info!(image = %image.name, digest = %image.target.digest, "Removed image");

    let mut lines = vec![format!("Untagged: {}@{}", image.name, image.target.digest)];
    let remaining = client
        .images()
        .list(ctx, &[ImageFilter::TargetDigest(image.target.digest.clone())])
        .await?;
    if remaining.is_empty() {
        lines.extend(configs.into_iter().map(|d| format!("Deleted: {d}")));
    }
    Ok(lines)
}
