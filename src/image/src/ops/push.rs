//! Pushing images to a registry.

use std::sync::Arc;

use cask_core::error::{CaskError, Result};
use cask_core::ErrorKind;

use crate::client::Client;
use crate::context::OpContext;
use crate::convert::{self, ConvertOptions, EstargzConverter, EstargzOptions};
use crate::ensure::ensure_content;
use crate::ops::{delete_quietly, progress_writer};
use crate::platform::MatchComparer;
use crate::reference::Reference;
use crate::remote::push_graph;
use crate::signature::SignMode;
use crate::store::ImageRecord;
use crate::streams::IoStreams;

/// Suffix of the transient single-platform image.
pub const REDUCED_PLATFORM_SUFFIX: &str = "-tmp-reduced-platform";

/// Suffix of the transient eStargz image.
pub const ESTARGZ_SUFFIX: &str = "-tmp-esgz";

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub platforms: Vec<String>,
    pub all_platforms: bool,
    /// Convert layers to eStargz before pushing.
    pub estargz: bool,
    pub sign: SignMode,
    pub quiet: bool,
    /// Any SOCI index flag was given.
    pub soci: bool,
    pub progress_to_stdout: bool,
}

/// Push the local image named `raw` to its registry.
pub async fn push(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    raw: &str,
    opts: &PushOptions,
) -> Result<()> {
    let reference = Reference::parse_normalized(raw)?;
    if reference.is_ipfs() {
        return Err(CaskError::Unsupported(format!("pushing {reference} to IPFS")));
    }
    if opts.soci {
        return Err(CaskError::Unsupported("SOCI index creation".to_string()));
    }
    let signer = opts.sign.signer(client.config().experimental)?;
    let matcher = MatchComparer::new(opts.all_platforms, &opts.platforms)?;

    let name = reference.to_string();
    let image = client.images().get(ctx, &name).await?;
    if let Err(e) = ensure_content(client, ctx, &image, &matcher).await {
        tracing::warn!(image = %name, error = %e, "Image content is incomplete");
    }

    let lease = client.lease(ctx, "push").await?;
    let mut transient = Vec::new();
    let result = push_leased(
        client,
        lease.context(),
        streams,
        &reference,
        image,
        &matcher,
        opts,
        &mut transient,
    )
    .await;
    for name in &transient {
        delete_quietly(client, lease.context(), name).await;
    }
    lease.release().await?;
    let pushed = result?;

    if let Some(signer) = signer {
        signer.sign(ctx, raw).await?;
    }
    let out = progress_writer(streams, opts.progress_to_stdout);
    if !opts.quiet {
        out.line(format!(
            "{}: digest: {} size: {}",
            reference.familiar_string(),
            pushed.target.digest,
            pushed.target.size
        ))?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn push_leased(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    reference: &Reference,
    mut image: ImageRecord,
    matcher: &MatchComparer,
    opts: &PushOptions,
    transient: &mut Vec<String>,
) -> Result<ImageRecord> {
    let name = reference.to_string();
    if !opts.all_platforms {
        let reduced = format!("{name}{REDUCED_PLATFORM_SUFFIX}");
        transient.push(reduced.clone());
        image = convert::convert(client, ctx, &reduced, &image, &ConvertOptions::new(matcher.clone()))
            .await?
            .image;
        tracing::debug!(image = %reduced, digest = %image.target.digest, "Reduced platforms for push");
    }

    if opts.estargz {
        let esgz = format!("{name}{ESTARGZ_SUFFIX}");
        transient.push(esgz.clone());
        let mut convert_opts = ConvertOptions::new(matcher.clone());
        convert_opts.docker_to_oci = true;
        convert_opts.layer = Some(Arc::new(EstargzConverter::new(EstargzOptions::default())?));
        image = convert::convert(client, ctx, &esgz, &image, &convert_opts).await?.image;
        if !opts.quiet {
            progress_writer(streams, opts.progress_to_stdout)
                .line(format!("Converted {} to eStargz", reference.familiar_string()))?;
        }
    }

    let insecure = client.config().insecure_registry;
    match push_with(client, ctx, reference, &image, matcher, false).await {
        Err(e) if insecure && e.is(ErrorKind::SchemeMismatch) => {
            tracing::warn!(
                domain = %reference.domain,
                error = %e,
                "HTTPS failed, retrying with plain HTTP"
            );
            push_with(client, ctx, reference, &image, matcher, true).await?;
        }
        other => other?,
    }
    tracing::info!(image = %name, digest = %image.target.digest, "Pushed image");
    Ok(image)
}

async fn push_with(
    client: &Client,
    ctx: &OpContext,
    reference: &Reference,
    image: &ImageRecord,
    matcher: &MatchComparer,
    plain_http: bool,
) -> Result<()> {
    let resolver = client.remotes().resolver(&reference.domain, plain_http)?;
    let pusher = resolver.pusher(reference)?;
    push_graph(
        client.content(),
        ctx,
        pusher.as_ref(),
        &image.target,
        matcher,
        reference.tag.as_deref(),
    )
    .await
}
