//! Pulling images from a registry.

use cask_core::error::{CaskError, Result};

use crate::client::Client;
use crate::context::OpContext;
use crate::digest;
use crate::ensure::source_labels;
use crate::graph;
use crate::ops::progress_writer;
use crate::platform::MatchComparer;
use crate::reference::Reference;
use crate::remote::{fetch_graph, resolve_with_fallback, FetchEvent};
use crate::signature::VerifyMode;
use crate::store::{create_or_update, ImageRecord};
use crate::streams::IoStreams;
use crate::unpack;

/// `--unpack` mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Unpack {
    /// Unpack when exactly one platform is requested.
    #[default]
    Auto,
    Always,
    Never,
}

impl Unpack {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "auto" => Ok(Unpack::Auto),
            "true" => Ok(Unpack::Always),
            "false" => Ok(Unpack::Never),
            other => Err(CaskError::invalid(format!(
                "invalid --unpack value \"{other}\" (expected auto, true or false)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub platforms: Vec<String>,
    pub all_platforms: bool,
    pub unpack: Unpack,
    pub quiet: bool,
    pub verify: VerifyMode,
    /// Progress goes to stdout instead of stderr.
    pub progress_to_stdout: bool,
}

/// Pull `raw` and return its record.
pub async fn pull(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    raw: &str,
    opts: &PullOptions,
) -> Result<ImageRecord> {
    let reference = Reference::parse_normalized(raw)?;
    if reference.is_ipfs() {
        if opts.verify != VerifyMode::None {
            return Err(CaskError::Unsupported(
                "signature verification of IPFS images".to_string(),
            ));
        }
        return Err(CaskError::Unsupported(format!(
            "pulling {} from IPFS",
            reference
        )));
    }
    let matcher = MatchComparer::new(opts.all_platforms, &opts.platforms)?;

    let fetch_ref = match opts.verify.verifier() {
        Some(verifier) => Reference::parse(&verifier.verify(ctx, &reference.to_string()).await?)?,
        None => reference.clone(),
    };

    let lease = client.lease(ctx, "pull").await?;
    let result = pull_leased(client, lease.context(), streams, &reference, &fetch_ref, &matcher, opts).await;
    lease.release().await?;
    result
}

async fn pull_leased(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    reference: &Reference,
    fetch_ref: &Reference,
    matcher: &MatchComparer,
    opts: &PullOptions,
) -> Result<ImageRecord> {
    let out = progress_writer(streams, opts.progress_to_stdout);
    let (resolver, _, root) = resolve_with_fallback(
        client.remotes(),
        ctx,
        fetch_ref,
        client.config().insecure_registry,
    )
    .await?;
    let fetcher = resolver.fetcher(fetch_ref)?;

    let quiet = opts.quiet;
    let progress = |event: FetchEvent| {
        if quiet {
            return;
        }
        let line = match &event {
            FetchEvent::Exists(d) => format!("{}: exists", digest::short_id(&d.digest)),
            FetchEvent::Downloading(d) => format!("{}: downloading", digest::short_id(&d.digest)),
            FetchEvent::Done(d) => format!("{}: done", digest::short_id(&d.digest)),
        };
        if let Err(e) = out.line(line) {
            tracing::debug!(error = %e, "Failed to write progress");
        }
    };
    fetch_graph(
        client.content(),
        ctx,
        fetcher.as_ref(),
        &root,
        matcher,
        &source_labels(reference),
        &progress,
    )
    .await?;

    let record = create_or_update(
        client.images(),
        ctx,
        ImageRecord::new(reference.to_string(), root.clone()),
    )
    .await?;
    tracing::info!(image = %record.name, digest = %root.digest, "Pulled image");

    let unpack = match opts.unpack {
        Unpack::Never => false,
        Unpack::Always => true,
        Unpack::Auto => matcher.is_single(),
    };
    if unpack {
        let manifests = graph::manifests_for(client.content(), ctx, &root, matcher).await?;
        if opts.unpack == Unpack::Always && manifests.len() > 1 {
            return Err(CaskError::invalid(
                "cannot unpack more than one platform; specify a single --platform",
            ));
        }
        unpack::unpack_image(client, ctx, &record, matcher).await?;
    }

    if quiet {
        streams.stdout.line(&root.digest)?;
    } else {
        out.line(format!("Pulled {}", reference.familiar_string()))?;
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_parse() {
        assert_eq!(Unpack::parse("auto").unwrap(), Unpack::Auto);
        assert_eq!(Unpack::parse("true").unwrap(), Unpack::Always);
        assert_eq!(Unpack::parse("false").unwrap(), Unpack::Never);
        assert!(Unpack::parse("yes").is_err());
    }

    #[tokio::test]
    async fn test_ipfs_pull_unsupported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let client = crate::convert::tests::test_client(&tmp);
        let (streams, _, _) = IoStreams::buffered(b"");
        let cid = "ipfs://QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";
        let err = pull(&client, &client.context(), &streams, cid, &PullOptions::default())
            .await
            .unwrap_err();
        assert!(err.is(cask_core::ErrorKind::Unsupported));
    }
}
