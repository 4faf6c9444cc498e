//! Unpacking images into snapshots.
//!
//! Each layer becomes one committed snapshot named by the chain ID of the
//! layers up to and including it, so images sharing a base share its
//! snapshots.

use std::collections::BTreeMap;

use cask_core::error::{CaskError, Result};
use cask_core::ErrorKind;

use crate::client::Client;
use crate::context::OpContext;
use crate::digest;
use crate::graph::{self, PlatformManifest};
use crate::labels;
use crate::manifest::{ConfigExt, ManifestExt};
use crate::platform::MatchComparer;
use crate::store::ImageRecord;

/// Unpack one platform manifest; returns the chain ID of its top layer,
/// or `None` for an image without layers.
pub async fn unpack_manifest(
    client: &Client,
    ctx: &OpContext,
    pm: &PlatformManifest,
) -> Result<Option<String>> {
    let diff_ids = pm.config.layer_diff_ids();
    let layers = pm.manifest.layer_descriptors();
    if diff_ids.len() != layers.len() {
        return Err(CaskError::IntegrityError {
            digest: pm.desc.digest.clone(),
            message: format!(
                "manifest has {} layers but config lists {} diff IDs",
                layers.len(),
                diff_ids.len()
            ),
        });
    }

    let sn = client.snapshotter();
    let chains = digest::chain_ids(diff_ids);
    let mut parent: Option<String> = None;
    for ((layer, diff_id), chain) in layers.iter().zip(diff_ids).zip(&chains) {
        ctx.check()?;
        match sn.stat(ctx, chain).await {
            Ok(_) => {
                parent = Some(chain.clone());
                continue;
            }
            Err(e) if e.is(ErrorKind::NotFound) => {}
            Err(e) => return Err(e),
        }

        let key = format!(
            "extract-{}-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            digest::short_id(chain)
        );
        let mount = sn.prepare(ctx, &key, parent.as_deref()).await?;
        let applied = match client.differ().apply(ctx, layer, &mount).await {
            Ok(applied) => applied,
            Err(e) => {
                remove_quietly(client, ctx, &key).await;
                return Err(e);
            }
        };
        if &applied != diff_id {
            remove_quietly(client, ctx, &key).await;
            return Err(CaskError::IntegrityError {
                digest: layer.digest.clone(),
                message: format!("layer diff ID {applied} does not match config {diff_id}"),
            });
        }

        match sn.commit(ctx, chain, &key, BTreeMap::new()).await {
            Ok(()) => {}
            Err(e) if e.is(ErrorKind::AlreadyExists) => remove_quietly(client, ctx, &key).await,
            Err(e) => {
                remove_quietly(client, ctx, &key).await;
                return Err(e);
            }
        }

        let uncompressed = BTreeMap::from([(labels::UNCOMPRESSED.to_string(), diff_id.clone())]);
        client
            .content()
            .update_labels(ctx, &layer.digest, uncompressed, false)
            .await?;
        tracing::debug!(layer = %layer.digest, chain_id = %chain, "Applied layer");
        parent = Some(chain.clone());
    }

    if let Some(top) = &parent {
        let gc = BTreeMap::from([(labels::gc_snapshot_label(sn.name()), top.clone())]);
        client
            .content()
            .update_labels(ctx, &pm.config_desc.digest, gc, false)
            .await?;
    }
    Ok(parent)
}

/// Unpack the best matching platform manifest of `image`.
pub async fn unpack_image(
    client: &Client,
    ctx: &OpContext,
    image: &ImageRecord,
    matcher: &MatchComparer,
) -> Result<Option<String>> {
    let manifests = graph::manifests_for(client.content(), ctx, &image.target, matcher).await?;
    let Some(pm) = manifests.first() else {
        return Err(CaskError::not_found(format!(
            "no manifest of {} matches the requested platform",
            image.name
        )));
    };
    let top = unpack_manifest(client, ctx, pm).await?;
    tracing::info!(image = %image.name, platform = %pm.platform, "Unpacked image");
    Ok(top)
}

async fn remove_quietly(client: &Client, ctx: &OpContext, key: &str) {
    if let Err(e) = client.snapshotter().remove(ctx, key).await {
        tracing::debug!(key = %key, error = %e, "Failed to remove snapshot");
    }
}
