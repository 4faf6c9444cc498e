//! Squashing the top layers of an image into one.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use cask_core::error::{CaskError, Result};
use chrono::Utc;

use crate::client::Client;
use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::digest;
use crate::graph::{self, child_gc_labels, PlatformManifest};
use crate::labels;
use crate::manifest::{self, new_history, ConfigExt, ImageManifest, ManifestExt};
use crate::media;
use crate::platform::MatchComparer;
use crate::reference::Reference;
use crate::store::{create_or_update, write_blob, write_json, ImageRecord};
use crate::streams::IoStreams;
use crate::unpack;
use crate::walker;

const SQUASH_LEASE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Default)]
pub struct SquashOptions {
    pub source: String,
    pub target: String,
    /// Number of top layers to collapse.
    pub layer_count: usize,
    /// Defaults to the source image's author.
    pub author: Option<String>,
    /// Defaults to the comment of the source's last history entry.
    pub message: Option<String>,
}

/// Collapse the last `layer_count` layers of `source` into one and record
/// the result as `target`.
pub async fn squash(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    opts: &SquashOptions,
) -> Result<ImageRecord> {
    let target_name = Reference::parse_normalized(&opts.target)?.to_string();
    let image = walker::walk_one(client.content(), client.images(), ctx, &opts.source).await?;
    if !media::is_manifest(&image.target.media_type) {
        return Err(CaskError::invalid(format!(
            "{} is not a single-platform image (target is {})",
            opts.source, image.target.media_type
        )));
    }

    let lease = client.lease_for(ctx, "squash", SQUASH_LEASE).await?;
    let result = squash_leased(client, lease.context(), &image, target_name, opts).await;
    lease.release().await?;
    let record = result?;
    streams.stdout.line(&record.target.digest)?;
    Ok(record)
}

async fn squash_leased(
    client: &Client,
    ctx: &OpContext,
    image: &ImageRecord,
    target_name: String,
    opts: &SquashOptions,
) -> Result<ImageRecord> {
    let matcher = MatchComparer::all();
    let pm = graph::manifests_for(client.content(), ctx, &image.target, &matcher)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| CaskError::not_found(format!("manifest of {}", image.name)))?;

    let blobs = pm.manifest.layer_descriptors();
    let total = blobs.len();
    if opts.layer_count < 2 || opts.layer_count > total {
        return Err(CaskError::invalid(format!(
            "layer count must be between 2 and {total}, got {}",
            opts.layer_count
        )));
    }
    let keep = total - opts.layer_count;
    unpack::unpack_manifest(client, ctx, &pm).await?;

    let (layer, diff_id) = squash_layers(client, ctx, &pm, keep).await?;

    let mut config = pm.config.clone();
    let author = opts.author.clone().or_else(|| config.author().clone());
    let comment = opts
        .message
        .clone()
        .or_else(|| config.history().last().and_then(|h| h.comment().clone()));
    config.truncate_layers(keep);
    let now = Utc::now();
    config.set_created(Some(manifest::timestamp(now)));
    let history = new_history(
        now,
        &format!("squash from {}", digest::short_id(&image.target.digest)),
        author.as_deref(),
        comment.as_deref(),
    )?;
    config.push_layer(diff_id.clone(), history);

    let chain = digest::chain_id(config.layer_diff_ids()).unwrap_or_else(|| diff_id.clone());
    let config_labels = BTreeMap::from([(labels::gc_snapshot_label(client.snapshotter_name()), chain)]);
    let config_desc = write_json(client.content(), ctx, &pm.config_desc.media_type, &config, config_labels).await?;

    let mut layers: Vec<Descriptor> = blobs[..keep].to_vec();
    layers.push(layer);
    let mut manifest = pm.manifest.clone();
    manifest.rebuild(&image.target.media_type, &config_desc, &layers)?;
    let data = manifest::to_vec(&manifest)?;
    let target = Descriptor::of(&image.target.media_type, &data);
    write_blob(
        client.content(),
        ctx,
        &target,
        &data,
        child_gc_labels(&target, &manifest.child_descriptors()),
    )
    .await?;

    let record = create_or_update(client.images(), ctx, ImageRecord::new(target_name, target)).await?;
    unpack::unpack_image(client, ctx, &record, &matcher).await?;
    tracing::info!(
        source = %image.name,
        target = %record.name,
        layers = opts.layer_count,
        "Squashed image"
    );
    Ok(record)
}

/// Apply layers `keep..` onto a fresh snapshot of the base and diff the
/// result against the base.
async fn squash_layers(
    client: &Client,
    ctx: &OpContext,
    pm: &PlatformManifest,
    keep: usize,
) -> Result<(Descriptor, String)> {
    let sn = client.snapshotter();
    let diff_ids = pm.config.layer_diff_ids();
    let base = digest::chain_id(&diff_ids[..keep.min(diff_ids.len())]);
    let key = snapshot_key();
    let view_key = format!("{key}-base");

    let upper = sn.prepare(ctx, &key, base.as_deref()).await?;
    let empty = tempfile::TempDir::new()?;
    let result = async {
        let lower: PathBuf = match &base {
            Some(base) => sn.view(ctx, &view_key, Some(base)).await?,
            None => empty.path().to_path_buf(),
        };
        for layer in pm.manifest.layer_descriptors().iter().skip(keep) {
            client.differ().apply(ctx, layer, &upper).await?;
        }
        client.differ().compare(ctx, &lower, &upper, layer_media_type(&pm.manifest)).await
    }
    .await;

    for k in [&key, &view_key] {
        if let Err(e) = sn.remove(ctx, k).await {
            if !e.is(cask_core::ErrorKind::NotFound) {
                tracing::debug!(key = %k, error = %e, "Failed to remove squash snapshot");
            }
        }
    }
    result
}

/// `squash-<unix nanos>-<6 hex chars>`.
fn snapshot_key() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let suffix: [u8; 3] = rand::random();
    format!("squash-{nanos}-{}", hex::encode(suffix))
}

fn layer_media_type(manifest: &ImageManifest) -> &'static str {
    match manifest.media_type() {
        Some(m) if m.to_string() == media::DOCKER_MANIFEST => media::DOCKER_LAYER_GZIP,
        _ => media::OCI_LAYER_GZIP,
    }
}
