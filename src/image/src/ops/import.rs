//! Importing a rootfs tarball as a single-layer image.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use cask_core::error::{CaskError, Result};
use chrono::Utc;

use crate::client::Client;
use crate::compression;
use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::digest::{self, DigestingReader, DigestingWriter};
use crate::graph::child_gc_labels;
use crate::labels;
use crate::manifest::{self, new_config, new_history, new_manifest, ConfigExt};
use crate::media::{self, Compression};
use crate::platform::{MatchComparer, Platform};
use crate::reference::Reference;
use crate::store::{create_or_update, write_blob, write_file, write_json, ImageRecord};
use crate::streams::IoStreams;
use crate::unpack;

/// Where the rootfs tarball comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportSource {
    Stdin,
    File(PathBuf),
    Url(String),
}

impl ImportSource {
    /// `-`, an `http(s)://` URL, or a path.
    pub fn parse(s: &str) -> Self {
        if s == "-" {
            ImportSource::Stdin
        } else if s.starts_with("http://") || s.starts_with("https://") {
            ImportSource::Url(s.to_string())
        } else {
            ImportSource::File(PathBuf::from(s))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub reference: Option<String>,
    pub message: Option<String>,
    pub platform: Option<String>,
}

/// Import `source` and return the new record.
pub async fn import_rootfs(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    source: &ImportSource,
    opts: &ImportOptions,
) -> Result<ImageRecord> {
    let platform = match &opts.platform {
        Some(p) => Platform::parse(p)?,
        None => Platform::host(),
    };
    let name = opts
        .reference
        .as_deref()
        .map(|r| Reference::parse_normalized(r).map(|r| r.to_string()))
        .transpose()?;

    let lease = client.lease(ctx, "import").await?;
    let result = import_leased(client, lease.context(), streams, source, opts, &platform, name).await;
    lease.release().await?;
    let record = result?;
    streams.stdout.line(&record.target.digest)?;
    Ok(record)
}

async fn import_leased(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    source: &ImportSource,
    opts: &ImportOptions,
    platform: &Platform,
    name: Option<String>,
) -> Result<ImageRecord> {
    let reader: Box<dyn Read + Send> = match source {
        ImportSource::Stdin => {
            if streams.stdin_is_empty {
                return Err(CaskError::NoInput("stdin is empty".to_string()));
            }
            Box::new(streams.stdin.clone())
        }
        ImportSource::File(path) => Box::new(std::fs::File::open(path).map_err(|e| {
            CaskError::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display())))
        })?),
        ImportSource::Url(url) => Box::new(download(ctx, url).await?),
    };

    let staged = tempfile::NamedTempFile::new()?;
    let out = staged.reopen()?;
    let (diff_id, layer_digest, layer_size) = ctx
        .run(async {
            tokio::task::spawn_blocking(move || -> std::io::Result<(String, String, u64)> {
                let (_, decoded) = compression::decompress(reader)?;
                let mut tee = DigestingReader::new(decoded);
                let writer = compression::compress(
                    Compression::Gzip,
                    None,
                    &mut tee,
                    DigestingWriter::new(out),
                )?;
                let (mut file, layer_digest, layer_size) = writer.finish();
                file.flush()?;
                let (diff_id, _) = tee.finish()?;
                Ok((diff_id, layer_digest, layer_size))
            })
            .await
            .map_err(|e| CaskError::Other(format!("import task failed: {e}")))?
            .map_err(|e| CaskError::invalid(format!("failed to read rootfs archive: {e}")))
        })
        .await?;

    let layer = Descriptor::new(media::DOCKER_LAYER_GZIP, layer_digest, layer_size);
    let layer_labels = BTreeMap::from([(labels::UNCOMPRESSED.to_string(), diff_id.clone())]);
    write_file(client.content(), ctx, &layer, staged.path(), layer_labels).await?;

    let now = Utc::now();
    let mut config = new_config(platform)?;
    config.set_created(Some(manifest::timestamp(now)));
    config.push_layer(diff_id.clone(), new_history(now, "", None, opts.message.as_deref())?);
    let chain = digest::chain_id(config.layer_diff_ids()).unwrap_or_else(|| diff_id.clone());
    let config_labels = BTreeMap::from([(labels::gc_snapshot_label(client.snapshotter_name()), chain)]);
    let config_desc = write_json(client.content(), ctx, media::DOCKER_CONFIG, &config, config_labels).await?;

    let manifest = new_manifest(media::DOCKER_MANIFEST, &config_desc, &[layer.clone()])?;
    let data = manifest::to_vec(&manifest)?;
    let target = Descriptor::of(media::DOCKER_MANIFEST, &data);
    write_blob(
        client.content(),
        ctx,
        &target,
        &data,
        child_gc_labels(&target, &[config_desc, layer]),
    )
    .await?;

    let name = name.unwrap_or_else(|| target.digest.clone());
    let record = create_or_update(client.images(), ctx, ImageRecord::new(name, target)).await?;
    unpack::unpack_image(client, ctx, &record, &MatchComparer::only(platform.clone())).await?;
    tracing::info!(image = %record.name, diff_id = %diff_id, "Imported rootfs");
    Ok(record)
}

/// Download `url` into an anonymous temporary file.
async fn download(ctx: &OpContext, url: &str) -> Result<std::fs::File> {
    ctx.run(async {
        let mut response = reqwest::get(url)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CaskError::FetchFailed {
                reference: url.to_string(),
                message: e.to_string(),
            })?;
        let mut file = tempfile::tempfile()?;
        while let Some(chunk) = response.chunk().await.map_err(|e| CaskError::FetchFailed {
            reference: url.to_string(),
            message: e.to_string(),
        })? {
            file.write_all(&chunk)?;
        }
        std::io::Seek::rewind(&mut file)?;
        tracing::debug!(url = %url, "Downloaded rootfs archive");
        Ok(file)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::convert::tests::{layer_tar, test_client};
    use crate::graph::{self, read_json};
    use crate::manifest::{ImageConfiguration, ImageManifest, ManifestExt};

    #[test]
    fn test_source_parse() {
        assert_eq!(ImportSource::parse("-"), ImportSource::Stdin);
        assert_eq!(
            ImportSource::parse("https://example.com/rootfs.tar.gz"),
            ImportSource::Url("https://example.com/rootfs.tar.gz".to_string())
        );
        assert_eq!(
            ImportSource::parse("rootfs.tar"),
            ImportSource::File(PathBuf::from("rootfs.tar"))
        );
    }

    #[tokio::test]
    async fn test_import_from_stdin() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let tar = layer_tar(&[("bin/sh", b"#!"), ("etc/os-release", b"ID=test\n")]);
        let gz = compression::gzip_all(&tar).unwrap();
        let (streams, out, _) = IoStreams::buffered(&gz);

        let opts = ImportOptions {
            reference: Some("myroot".to_string()),
            message: Some("initial import".to_string()),
            platform: Some("linux/arm64".to_string()),
        };
        let record = import_rootfs(&client, &ctx, &streams, &ImportSource::Stdin, &opts)
            .await
            .unwrap();
        assert_eq!(record.name, "docker.io/library/myroot:latest");
        assert_eq!(out.text().trim(), record.target.digest);

        let manifest: ImageManifest = read_json(client.content(), &ctx, &record.target).await.unwrap();
        let config_desc = manifest.config_descriptor();
        let config: ImageConfiguration = read_json(client.content(), &ctx, &config_desc).await.unwrap();
        assert_eq!(config.architecture().to_string(), "arm64");
        assert_eq!(config.layer_diff_ids(), [digest::sha256_of(&tar)]);
        assert_eq!(config.history()[0].comment().as_deref(), Some("initial import"));
        assert!(config.history()[0].created_by().is_none());
        let layers = manifest.layer_descriptors();
        assert_eq!(layers[0].media_type, media::DOCKER_LAYER_GZIP);

        let layer = client.content().info(&ctx, &layers[0].digest).await.unwrap();
        assert_eq!(layer.labels.get(labels::UNCOMPRESSED), Some(&config.layer_diff_ids()[0]));
        let config_info = client.content().info(&ctx, &config_desc.digest).await.unwrap();
        assert_eq!(
            config_info.labels.get("containerd.io/gc.ref.snapshot.native"),
            Some(&config.layer_diff_ids()[0])
        );
        let health = graph::check(client.content(), &ctx, &record.target, &MatchComparer::all())
            .await
            .unwrap();
        assert!(health.is_complete());
        assert!(client.leases().list(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_unnamed_uses_digest() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rootfs.tar");
        std::fs::write(&path, layer_tar(&[("a", b"a")])).unwrap();
        let (streams, _, _) = IoStreams::buffered(b"");

        let record = import_rootfs(
            &client,
            &ctx,
            &streams,
            &ImportSource::File(path),
            &ImportOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(record.name, record.target.digest);
    }
}
