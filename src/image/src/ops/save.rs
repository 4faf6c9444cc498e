//! Saving images to an archive.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;

use cask_core::error::{CaskError, Result};

use crate::archive;
use crate::client::Client;
use crate::context::OpContext;
use crate::ensure::ensure_content;
use crate::platform::MatchComparer;
use crate::store::ImageRecord;
use crate::streams::IoStreams;
use crate::walker::{self, AmbiguityPolicy};

#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Output file; stdout when `None`.
    pub output: Option<PathBuf>,
    pub platforms: Vec<String>,
    pub all_platforms: bool,
}

/// Save `images` into one archive.
pub async fn save(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    images: &[String],
    opts: &SaveOptions,
) -> Result<()> {
    if images.is_empty() {
        return Err(CaskError::invalid("requires at least 1 image"));
    }
    if opts.output.is_none() && streams.stdout_is_terminal {
        return Err(CaskError::invalid(
            "cowardly refusing to save to a terminal. Use the -o flag or redirect",
        ));
    }
    let matcher = MatchComparer::new(opts.all_platforms, &opts.platforms)?;

    // One root per target: the first name given for it wins.
    let mut records: Vec<ImageRecord> = Vec::new();
    let mut seen = HashSet::new();
    for req in images {
        let found = walker::walk(client.content(), client.images(), ctx, req, AmbiguityPolicy::UniqueTarget).await?;
        for f in found {
            if seen.insert(f.image.target.digest.clone()) {
                records.push(f.image);
            }
        }
    }

    let lease = client.lease(ctx, "save").await?;
    let result = save_leased(client, lease.context(), streams, &records, &matcher, opts).await;
    lease.release().await?;
    result
}

async fn save_leased(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    records: &[ImageRecord],
    matcher: &MatchComparer,
    opts: &SaveOptions,
) -> Result<()> {
    for image in records {
        ensure_content(client, ctx, image, matcher).await?;
    }

    match &opts.output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .map_err(|e| CaskError::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))))?;
            let mut file = archive::export(client, ctx, records, matcher, file).await?;
            file.flush()?;
            file.sync_all()?;
        }
        None => {
            let mut out = archive::export(client, ctx, records, matcher, streams.stdout.clone()).await?;
            out.flush()?;
        }
    }
    tracing::info!(images = records.len(), "Saved images");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::convert::tests::{docker_image, layer_tar, test_client};
    use crate::manifest::{ImageIndex, IndexExt};

    #[tokio::test]
    async fn test_refuses_terminal_stdout() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let (mut streams, _, _) = IoStreams::buffered(b"");
        streams.stdout_is_terminal = true;
        let err = save(
            &client,
            &client.context(),
            &streams,
            &["alpine".to_string()],
            &SaveOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(err.is(cask_core::ErrorKind::InvalidArgument));
        assert!(err.to_string().contains("cowardly refusing"));
    }

    #[tokio::test]
    async fn test_save_to_stdout_dedups_by_target() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let image = docker_image(&client, &ctx, "docker.io/library/app:1", &[layer_tar(&[("a", b"a")])]).await;
        client
            .images()
            .create(&ctx, ImageRecord::new("docker.io/library/app:2", image.target.clone()))
            .await
            .unwrap();

        let (streams, out, _) = IoStreams::buffered(b"");
        let id = crate::digest::short_id(&image.target.digest).to_string();
        save(
            &client,
            &ctx,
            &streams,
            &["app:1".to_string(), "app:2".to_string(), id],
            &SaveOptions::default(),
        )
        .await
        .unwrap();

        let data = out.contents();
        let mut ar = tar::Archive::new(&data[..]);
        let index = ar
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().to_string_lossy() == archive::INDEX_FILE)
            .map(|mut e| {
                let mut s = Vec::new();
                std::io::Read::read_to_end(&mut e, &mut s).unwrap();
                s
            })
            .unwrap();
        let index: ImageIndex = serde_json::from_slice(&index).unwrap();
        assert_eq!(index.manifest_descriptors().len(), 1);
        assert!(client.leases().list(&ctx).await.unwrap().is_empty());
    }
}
