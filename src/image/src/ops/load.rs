//! Loading images from an archive.

use std::path::PathBuf;

use cask_core::error::{CaskError, Result};

use crate::archive;
use crate::client::Client;
use crate::context::OpContext;
use crate::platform::MatchComparer;
use crate::store::ImageRecord;
use crate::streams::IoStreams;
use crate::unpack;

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Input file; stdin when `None`.
    pub input: Option<PathBuf>,
    pub platforms: Vec<String>,
    pub all_platforms: bool,
    pub quiet: bool,
}

/// Load every image in the archive and unpack it for the requested platform.
pub async fn load(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    opts: &LoadOptions,
) -> Result<Vec<ImageRecord>> {
    let matcher = MatchComparer::new(opts.all_platforms, &opts.platforms)?;

    let lease = client.lease(ctx, "load").await?;
    let result = load_leased(client, lease.context(), streams, &matcher, opts).await;
    lease.release().await?;
    let records = result?;

    let mut lines = Vec::with_capacity(records.len());
    for record in &records {
        if opts.quiet {
            lines.push(record.target.digest.clone());
        } else {
            lines.push(format!("Loaded image: {}", record.name));
        }
    }
    super::emit(&streams.stdout, &lines)?;
    Ok(records)
}

async fn load_leased(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    matcher: &MatchComparer,
    opts: &LoadOptions,
) -> Result<Vec<ImageRecord>> {
    let records = match &opts.input {
        Some(path) => {
            let file = std::fs::File::open(path)
                .map_err(|e| CaskError::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))))?;
            archive::import(client, ctx, file).await?
        }
        None => {
            if streams.stdin_is_empty {
                return Err(CaskError::NoInput(
                    "stdin is empty and input file is not specified".to_string(),
                ));
            }
            archive::import(client, ctx, streams.stdin.clone()).await?
        }
    };

    for record in &records {
        match unpack::unpack_image(client, ctx, record, matcher).await {
            Ok(_) => {}
            Err(e) if e.is(cask_core::ErrorKind::NotFound) => {
                tracing::warn!(image = %record.name, error = %e, "Skipping unpack");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}
