//! Pruning unused images.

use std::io::BufRead;

use cask_core::error::{CaskError, Result};
use chrono::Utc;

use crate::client::Client;
use crate::context::OpContext;
use crate::filter::{is_dangling, FilterSpec, PRUNE_FILTERS};
use crate::graph;
use crate::manifest::ConfigExt;
use crate::platform::MatchComparer;
use crate::store::GcReport;
use crate::streams::IoStreams;

use super::remove::{delete_image, ContainerLookup};

#[derive(Debug, Clone, Default)]
pub struct PruneOptions {
    /// Remove every image no container uses, not only dangling ones.
    pub all: bool,
    /// Skip the confirmation prompt.
    pub force: bool,
    pub filters: Vec<String>,
}

/// Remove dangling (or, with `all`, unused) images, then collect garbage.
/// Returns `None` when the prompt was declined.
pub async fn prune(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    lookup: &dyn ContainerLookup,
    opts: &PruneOptions,
) -> Result<Option<GcReport>> {
    let spec = FilterSpec::parse(&opts.filters, PRUNE_FILTERS)?;
    if !opts.force && !confirm(streams, opts.all).await? {
        return Ok(None);
    }
    let filters = spec.resolve(client, ctx, Utc::now()).await?;
    let containers = lookup.containers(ctx).await?;

    let mut lines = Vec::new();
    for image in client.images().list(ctx, &[]).await? {
        ctx.check()?;
        let configs = match graph::manifests_for(client.content(), ctx, &image.target, &MatchComparer::all()).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(image = %image.name, error = %e, "Unable to enumerate image rootfs");
                Vec::new()
            }
        };
        let config_digest = configs.first().map(|pm| pm.config_desc.digest.as_str());
        let config_labels = configs.first().map(|pm| pm.config.config_labels()).unwrap_or_default();

        if !filters.matches(&image, &config_labels, config_digest) {
            continue;
        }
        if opts.all {
            if containers.iter().any(|c| c.uses(&image)) {
                continue;
            }
        } else if !is_dangling(&image, config_digest) {
            continue;
        }
        lines.extend(delete_image(client, ctx, &image).await?);
    }
    super::emit(&streams.stdout, &lines)?;

    let report = client.gc(ctx).await?;
    tracing::info!(
        blobs = report.blobs_removed,
        snapshots = report.snapshots_removed,
        bytes = report.bytes_reclaimed,
        "Pruned images"
    );
    Ok(Some(report))
}

async fn confirm(streams: &IoStreams, all: bool) -> Result<bool> {
    let warning = if all {
        "WARNING! This will remove all images without at least one container associated to them."
    } else {
        "WARNING! This will remove all dangling images."
    };
    streams.stdout.line(warning)?;
    let mut out = streams.stdout.clone();
    std::io::Write::write_all(&mut out, b"Are you sure you want to continue? [y/N] ")?;
    std::io::Write::flush(&mut out)?;

    let stdin = streams.stdin.clone();
    let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut line = String::new();
        std::io::BufReader::new(stdin).read_line(&mut line)?;
        Ok(line)
    })
    .await
    .map_err(|e| CaskError::Other(format!("prompt task failed: {e}")))??;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::convert::tests::{docker_image, layer_tar, test_client};
    use crate::labels;
    use crate::ops::remove::{ContainerUse, NoContainers};
    use crate::store::ImageRecord;

    #[tokio::test]
    async fn test_prune_dangling_only() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let kept = docker_image(&client, &ctx, "docker.io/library/kept:1", &[layer_tar(&[("a", b"a")])]).await;
        let dangling = docker_image(&client, &ctx, "docker.io/library/tmp:1", &[layer_tar(&[("b", b"b")])]).await;
        client.images().delete(&ctx, &dangling.name).await.unwrap();
        client
            .images()
            .create(&ctx, ImageRecord::new(dangling.target.digest.clone(), dangling.target.clone()))
            .await
            .unwrap();

        let (streams, out, _) = IoStreams::buffered(b"");
        let opts = PruneOptions {
            force: true,
            ..Default::default()
        };
        let report = prune(&client, &ctx, &streams, &NoContainers, &opts).await.unwrap().unwrap();
        assert!(report.blobs_removed > 0);
        assert!(out.text().contains(&format!("Untagged: {0}@{0}", dangling.target.digest)));

        let left = client.images().list(&ctx, &[]).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, kept.name);
    }

    #[tokio::test]
    async fn test_cri_image_named_by_config_is_not_dangling() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let image = docker_image(&client, &ctx, "docker.io/library/app:1", &[layer_tar(&[("a", b"a")])]).await;
        let pm = graph::manifests_for(client.content(), &ctx, &image.target, &MatchComparer::all())
            .await
            .unwrap()
            .remove(0);
        let mut cri = ImageRecord::new(pm.config_desc.digest.clone(), image.target.clone());
        cri.labels.insert(labels::CRI_MANAGED.to_string(), "managed".to_string());
        client.images().create(&ctx, cri).await.unwrap();

        let (streams, _, _) = IoStreams::buffered(b"");
        let opts = PruneOptions {
            force: true,
            ..Default::default()
        };
        prune(&client, &ctx, &streams, &NoContainers, &opts).await.unwrap();
        assert_eq!(client.images().list(&ctx, &[]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_prune_all_skips_used_and_honors_prompt() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        docker_image(&client, &ctx, "docker.io/library/used:1", &[layer_tar(&[("a", b"a")])]).await;
        docker_image(&client, &ctx, "docker.io/library/unused:1", &[layer_tar(&[("b", b"b")])]).await;
        struct Used;
        #[async_trait::async_trait]
        impl ContainerLookup for Used {
            async fn containers(&self, _ctx: &OpContext) -> Result<Vec<ContainerUse>> {
                Ok(vec![ContainerUse {
                    id: "c1".to_string(),
                    image: "docker.io/library/used:1".to_string(),
                    running: false,
                }])
            }
        }

        let opts = PruneOptions {
            all: true,
            ..Default::default()
        };
        let (streams, _, _) = IoStreams::buffered(b"n\n");
        assert!(prune(&client, &ctx, &streams, &Used, &opts).await.unwrap().is_none());
        assert_eq!(client.images().list(&ctx, &[]).await.unwrap().len(), 2);

        let (streams, out, _) = IoStreams::buffered(b"y\n");
        prune(&client, &ctx, &streams, &Used, &opts).await.unwrap().unwrap();
        assert!(out.text().contains("Untagged: docker.io/library/unused:1@"));
        let left = client.images().list(&ctx, &[]).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "docker.io/library/used:1");
    }

    #[tokio::test]
    async fn test_until_filter_keeps_recent_images() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        docker_image(&client, &ctx, "docker.io/library/app:1", &[layer_tar(&[("a", b"a")])]).await;

        let (streams, out, _) = IoStreams::buffered(b"");
        let opts = PruneOptions {
            all: true,
            force: true,
            filters: vec!["until=12h".to_string()],
        };
        prune(&client, &ctx, &streams, &NoContainers, &opts).await.unwrap().unwrap();
        assert!(out.text().is_empty());
        assert_eq!(client.images().list(&ctx, &[]).await.unwrap().len(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let (streams, out, _) = IoStreams::buffered(b"");
        let opts = PruneOptions {
            filters: vec!["until=10ms".to_string()],
            ..opts
        };
        prune(&client, &ctx, &streams, &NoContainers, &opts).await.unwrap().unwrap();
        assert!(out.text().contains("Untagged: docker.io/library/app:1@"));
        assert!(client.images().list(&ctx, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_list_only_filters() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let (streams, _, _) = IoStreams::buffered(b"");
        let opts = PruneOptions {
            force: true,
            filters: vec!["dangling=true".to_string()],
            ..Default::default()
        };
        let err = prune(&client, &client.context(), &streams, &NoContainers, &opts)
            .await
            .unwrap_err();
        assert!(err.is(cask_core::ErrorKind::InvalidArgument));
    }
}
