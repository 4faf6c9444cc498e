//! Listing images.

use cask_core::error::{CaskError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::client::Client;
use crate::context::OpContext;
use crate::filter::{FilterSpec, LIST_FILTERS};
use crate::graph;
use crate::manifest::ConfigExt;
use crate::platform::MatchComparer;
use crate::reference::Reference;
use crate::store::ImageRecord;

const NONE: &str = "<none>";

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// `key=value` filters.
    pub filters: Vec<String>,
    pub platforms: Vec<String>,
    pub all_platforms: bool,
    pub quiet: bool,
    /// `table`, `wide`, `json` or a template; empty for the default table.
    pub format: String,
}

/// One row per image and platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageRow {
    pub name: String,
    pub repository: String,
    pub tag: String,
    /// Target digest.
    #[serde(rename = "ID")]
    pub id: String,
    pub digest: String,
    pub created_at: DateTime<Utc>,
    pub platform: String,
    /// Unpacked size, zero when not unpacked.
    pub size: u64,
    pub blob_size: u64,
}

/// Rows for every image passing the filters, newest first.
pub async fn list(client: &Client, ctx: &OpContext, opts: &ListOptions) -> Result<Vec<ImageRow>> {
    if opts.format == "raw" {
        return Err(CaskError::Unsupported("unsupported format: \"raw\"".to_string()));
    }
    if opts.quiet && !opts.format.is_empty() {
        return Err(CaskError::invalid("cannot use --quiet and --format at the same time"));
    }
    let spec = FilterSpec::parse(&opts.filters, LIST_FILTERS)?;
    let filters = spec.resolve(client, ctx, Utc::now()).await?;
    let matcher = if opts.platforms.is_empty() && !opts.all_platforms {
        MatchComparer::all()
    } else {
        MatchComparer::new(opts.all_platforms, &opts.platforms)?
    };

    let mut images = client.images().list(ctx, &[]).await?;
    images.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut rows = Vec::new();
    for image in &images {
        ctx.check()?;
        let manifests = match graph::manifests_for(client.content(), ctx, &image.target, &matcher).await {
            Ok(m) => m,
            Err(e) if e.is(cask_core::ErrorKind::NotFound) => {
                tracing::debug!(image = %image.name, error = %e, "Image content not available");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        if manifests.is_empty() {
            if opts.platforms.is_empty() && filters.matches(image, &Default::default(), None) {
                rows.push(row(image, String::new(), 0, 0));
            }
            continue;
        }
        for pm in &manifests {
            if !filters.matches(image, &pm.config.config_labels(), Some(&pm.config_desc.digest)) {
                continue;
            }
            let size = graph::image_size(client.snapshotter(), ctx, pm).await?;
            rows.push(row(image, pm.platform.to_string(), size.unpacked, size.packed));
        }
    }
    Ok(rows)
}

fn row(image: &ImageRecord, platform: String, size: u64, blob_size: u64) -> ImageRow {
    let (repository, tag) = match Reference::parse(&image.name) {
        Ok(r) if crate::digest::validate(&image.name).is_err() => {
            (r.familiar_name(), r.tag.clone().unwrap_or_else(|| NONE.to_string()))
        }
        _ => (NONE.to_string(), NONE.to_string()),
    };
    ImageRow {
        name: image.name.clone(),
        repository,
        tag,
        id: image.target.digest.clone(),
        digest: image.target.digest.clone(),
        created_at: image.created_at,
        platform,
        size,
        blob_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::convert::tests::{docker_image, layer_tar, test_client};

    #[tokio::test]
    async fn test_rows_newest_first_with_filters() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let old = docker_image(&client, &ctx, "docker.io/library/old:1", &[layer_tar(&[("a", b"a")])]).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let new = docker_image(&client, &ctx, "docker.io/library/new:1", &[layer_tar(&[("b", b"b")])]).await;

        let rows = list(&client, &ctx, &ListOptions::default()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, new.name);
        assert_eq!(rows[0].repository, "new");
        assert_eq!(rows[0].tag, "1");
        assert!(rows[0].blob_size > 0);
        assert_eq!(rows[1].id, old.target.digest);

        let opts = ListOptions {
            filters: vec!["reference=old*".to_string()],
            ..Default::default()
        };
        let rows = list(&client, &ctx, &opts).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, old.name);

        let opts = ListOptions {
            filters: vec!["since=old:1".to_string()],
            ..Default::default()
        };
        let rows = list(&client, &ctx, &opts).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, new.name);
    }

    #[tokio::test]
    async fn test_dangling_rows() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let image = docker_image(&client, &ctx, "docker.io/library/app:1", &[layer_tar(&[("a", b"a")])]).await;
        client
            .images()
            .create(&ctx, ImageRecord::new(image.target.digest.clone(), image.target.clone()))
            .await
            .unwrap();

        let opts = ListOptions {
            filters: vec!["dangling=true".to_string()],
            ..Default::default()
        };
        let rows = list(&client, &ctx, &opts).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].repository, NONE);
        assert_eq!(rows[0].tag, NONE);
    }

    #[tokio::test]
    async fn test_format_validation() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let opts = ListOptions {
            quiet: true,
            format: "json".to_string(),
            ..Default::default()
        };
        let err = list(&client, &ctx, &opts).await.unwrap_err();
        assert!(err.is(cask_core::ErrorKind::InvalidArgument));

        let opts = ListOptions {
            format: "raw".to_string(),
            ..Default::default()
        };
        let err = list(&client, &ctx, &opts).await.unwrap_err();
        assert!(err.is(cask_core::ErrorKind::Unsupported));

        let opts = ListOptions {
            filters: vec!["before=missing".to_string()],
            ..Default::default()
        };
        let err = list(&client, &ctx, &opts).await.unwrap_err();
        assert!(err.is(cask_core::ErrorKind::NotFound));
    }
}
