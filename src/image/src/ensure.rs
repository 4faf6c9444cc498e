//! Making an image's content locally complete.

use std::collections::BTreeMap;

use cask_core::error::{CaskError, Result};
use cask_core::ErrorKind;

use crate::client::Client;
use crate::context::OpContext;
use crate::graph;
use crate::labels;
use crate::platform::MatchComparer;
use crate::reference::Reference;
use crate::remote::{fetch_graph, FetchEvent};
use crate::store::ImageRecord;

/// Labels recording where fetched blobs came from.
pub fn source_labels(reference: &Reference) -> BTreeMap<String, String> {
    BTreeMap::from([(
        labels::distribution_source_label(&reference.domain),
        reference.path.clone(),
    )])
}

/// Fetch whatever `image` is missing under `matcher` from the registry its
/// name points at. A complete image is left alone.
pub async fn ensure_content(
    client: &Client,
    ctx: &OpContext,
    image: &ImageRecord,
    matcher: &MatchComparer,
) -> Result<()> {
    let health = graph::check(client.content(), ctx, &image.target, matcher).await?;
    if health.is_complete() {
        return Ok(());
    }
    tracing::debug!(
        image = %image.name,
        missing = health.missing.len(),
        "Fetching missing content"
    );

    let reference = match Reference::parse(&image.name) {
        Ok(r) if !r.is_ipfs() => r.with_digest(&image.target.digest),
        _ => {
            return Err(CaskError::FetchFailed {
                reference: image.name.clone(),
                message: format!(
                    "{} blob(s) missing and the image has no registry reference",
                    health.missing.len()
                ),
            })
        }
    };

    let insecure = client.config().insecure_registry;
    match fetch_missing(client, ctx, image, &reference, matcher, false).await {
        Err(e) if insecure && e.is(ErrorKind::SchemeMismatch) => {
            tracing::warn!(
                domain = %reference.domain,
                error = %e,
                "HTTPS failed, retrying with plain HTTP"
            );
            fetch_missing(client, ctx, image, &reference, matcher, true).await
        }
        other => other,
    }
}

async fn fetch_missing(
    client: &Client,
    ctx: &OpContext,
    image: &ImageRecord,
    reference: &Reference,
    matcher: &MatchComparer,
    plain_http: bool,
) -> Result<()> {
    let resolver = client.remotes().resolver(&reference.domain, plain_http)?;
    let fetcher = resolver.fetcher(reference)?;
    let progress = |event: FetchEvent| {
        if let FetchEvent::Done(desc) = event {
            tracing::debug!(digest = %desc.digest, "Fetched missing blob");
        }
    };
    fetch_graph(
        client.content(),
        ctx,
        fetcher.as_ref(),
        &image.target,
        matcher,
        &source_labels(reference),
        &progress,
    )
    .await
    .map_err(|e| match e.kind() {
        ErrorKind::NotFound => CaskError::FetchFailed {
            reference: reference.to_string(),
            message: e.to_string(),
        },
        _ => e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::descriptor::Descriptor;
    use crate::manifest::new_manifest;
    use crate::media;
    use crate::store::write_blob;

    #[tokio::test]
    async fn test_complete_image_needs_no_remote() {
        let tmp = TempDir::new().unwrap();
        let client = Client::open(cask_core::CaskConfig {
            data_root: tmp.path().to_path_buf(),
            hosts_dir: Vec::new(),
            ..Default::default()
        })
        .unwrap();
        let ctx = client.context();

        let config = Descriptor::of(media::OCI_CONFIG, b"{}");
        write_blob(client.content(), &ctx, &config, b"{}", BTreeMap::new()).await.unwrap();
        let manifest = new_manifest(media::OCI_MANIFEST, &config, &[]).unwrap();
        let data = serde_json::to_vec(&manifest).unwrap();
        let target = Descriptor::of(media::OCI_MANIFEST, &data);
        write_blob(client.content(), &ctx, &target, &data, BTreeMap::new()).await.unwrap();

        let image = ImageRecord::new("unreachable.invalid/x:1", target);
        ensure_content(&client, &ctx, &image, &MatchComparer::all())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_content_without_registry_name() {
        let tmp = TempDir::new().unwrap();
        let client = Client::open(cask_core::CaskConfig {
            data_root: tmp.path().to_path_buf(),
            hosts_dir: Vec::new(),
            ..Default::default()
        })
        .unwrap();
        let ctx = client.context();
        let target = Descriptor::of(media::OCI_MANIFEST, b"absent");
        let image = ImageRecord::new("not a reference!", target);
        let err = ensure_content(&client, &ctx, &image, &MatchComparer::all())
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::FetchFailed));
    }

    #[test]
    fn test_source_labels() {
        let r = Reference::parse("ghcr.io/org/app:1").unwrap();
        let labels = source_labels(&r);
        assert_eq!(
            labels.get("containerd.io/distribution.source.ghcr.io"),
            Some(&"org/app".to_string())
        );
    }
}
