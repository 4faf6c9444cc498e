//! Layer history of an image.

use cask_core::error::{CaskError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::client::Client;
use crate::context::OpContext;
use crate::digest;
use crate::graph;
use crate::manifest::{is_empty_layer, ConfigExt, ManifestExt};
use crate::platform::MatchComparer;
use crate::walker::{self, AmbiguityPolicy};

const MISSING: &str = "<missing>";

/// One history entry, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoryRow {
    /// Chain ID of the layer, `<missing>` for empty layers.
    pub snapshot: String,
    pub created_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub size: u64,
    pub comment: String,
}

/// History rows of `req` for the best platform under `matcher`.
pub async fn history(
    client: &Client,
    ctx: &OpContext,
    req: &str,
    matcher: &MatchComparer,
) -> Result<Vec<HistoryRow>> {
    let found = walker::walk(client.content(), client.images(), ctx, req, AmbiguityPolicy::UniqueTarget).await?;
    let image = &found[0].image;
    let manifests = graph::manifests_for(client.content(), ctx, &image.target, matcher).await?;
    let pm = manifests
        .first()
        .ok_or_else(|| CaskError::not_found(format!("no manifest of {req} matches the requested platform")))?;

    let chains = digest::chain_ids(pm.config.layer_diff_ids());
    let blobs = pm.manifest.layer_descriptors();
    let mut rows = Vec::with_capacity(pm.config.history().len());
    let mut layer = 0;
    for h in pm.config.history() {
        let (snapshot, size) = if is_empty_layer(h) {
            (MISSING.to_string(), 0)
        } else {
            let size = layer_size(client, ctx, &chains, layer, blobs.get(layer).map(|l| l.size)).await?;
            let snapshot = chains.get(layer).cloned().unwrap_or_else(|| MISSING.to_string());
            layer += 1;
            (snapshot, size)
        };
        rows.push(HistoryRow {
            snapshot,
            created_at: h.created().as_deref().and_then(parse_created),
            created_by: h.created_by().clone().unwrap_or_default(),
            size,
            comment: h.comment().clone().unwrap_or_default(),
        });
    }
    rows.reverse();
    Ok(rows)
}

fn parse_created(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

/// Growth of the unpacked snapshot over its parent; the blob size when the
/// layer is not unpacked.
async fn layer_size(
    client: &Client,
    ctx: &OpContext,
    chains: &[String],
    index: usize,
    blob_size: Option<u64>,
) -> Result<u64> {
    let fallback = blob_size.unwrap_or(0);
    let Some(chain) = chains.get(index) else {
        return Ok(fallback);
    };
    let sn = client.snapshotter();
    let top = match sn.usage(ctx, chain).await {
        Ok(u) => u.size,
        Err(e) if e.is(cask_core::ErrorKind::NotFound) => return Ok(fallback),
        Err(e) => return Err(e),
    };
    let parent = match index.checked_sub(1).and_then(|i| chains.get(i)) {
        Some(parent) => match sn.usage(ctx, parent).await {
            Ok(u) => u.size,
            Err(e) if e.is(cask_core::ErrorKind::NotFound) => 0,
            Err(e) => return Err(e),
        },
        None => 0,
    };
    Ok(top.saturating_sub(parent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::convert::tests::{layer_tar, test_client};
    use crate::descriptor::Descriptor;
    use crate::manifest::{new_config, new_manifest};
    use oci_spec::image::HistoryBuilder;
    use crate::media;
    use crate::platform::Platform;
    use crate::store::{write_blob, write_json, ImageRecord};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_rows_newest_first_with_empty_layers() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();

        let tar = layer_tar(&[("a", b"hello")]);
        let gz = crate::compression::gzip_all(&tar).unwrap();
        let layer = Descriptor::of(media::DOCKER_LAYER_GZIP, &gz);
        write_blob(client.content(), &ctx, &layer, &gz, BTreeMap::new()).await.unwrap();

        let mut config = new_config(&Platform::host()).unwrap();
        config.push_layer(
            digest::sha256_of(&tar),
            HistoryBuilder::default()
                .created("2024-01-02T03:04:05Z".to_string())
                .created_by("ADD rootfs /".to_string())
                .build()
                .unwrap(),
        );
        let mut entries = config.history().clone();
        entries.push(
            HistoryBuilder::default()
                .created_by("CMD [\"sh\"]".to_string())
                .comment("buildkit".to_string())
                .empty_layer(true)
                .build()
                .unwrap(),
        );
        config.set_history(entries);
        let config_desc = write_json(client.content(), &ctx, media::DOCKER_CONFIG, &config, BTreeMap::new())
            .await
            .unwrap();
        let manifest = new_manifest(media::DOCKER_MANIFEST, &config_desc, &[layer.clone()]).unwrap();
        let target = write_json(client.content(), &ctx, media::DOCKER_MANIFEST, &manifest, BTreeMap::new())
            .await
            .unwrap();
        client
            .images()
            .create(&ctx, ImageRecord::new("docker.io/library/hist:1", target))
            .await
            .unwrap();

        let rows = history(&client, &ctx, "hist:1", &MatchComparer::host()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].snapshot, MISSING);
        assert_eq!(rows[0].comment, "buildkit");
        assert_eq!(rows[0].size, 0);
        assert_eq!(rows[1].snapshot, config.layer_diff_ids()[0]);
        assert_eq!(rows[1].created_at.map(|t| t.timestamp()), Some(1_704_164_645));
        assert_eq!(rows[1].created_by, "ADD rootfs /");
        assert_eq!(rows[1].size, layer.size);
    }

    #[tokio::test]
    async fn test_missing_image() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let err = history(&client, &client.context(), "nope", &MatchComparer::host())
            .await
            .unwrap_err();
        assert!(err.is(cask_core::ErrorKind::NotFound));
    }
}
