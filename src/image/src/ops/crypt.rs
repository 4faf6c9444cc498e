//! `image encrypt` and `image decrypt`.

use std::sync::Arc;

use cask_core::error::Result;

use crate::client::Client;
use crate::context::OpContext;
use crate::convert::{self, ConvertOptions};
use crate::crypt::{CryptOptions, LayerDecrypter, LayerEncrypter};
use crate::ensure::ensure_content;
use crate::platform::MatchComparer;
use crate::reference::Reference;
use crate::store::ImageRecord;
use crate::streams::IoStreams;
use crate::walker;

#[derive(Debug, Clone, Default)]
pub struct CryptRequest {
    pub source: String,
    pub target: String,
    pub platforms: Vec<String>,
    pub all_platforms: bool,
    pub options: CryptOptions,
}

/// Encrypt the layers of `req.source` into `req.target`. Encrypted images
/// always use OCI media types.
pub async fn encrypt_image(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    req: &CryptRequest,
) -> Result<ImageRecord> {
    let config = req.options.encrypt_config()?;
    let mut opts = ConvertOptions::new(MatchComparer::new(req.all_platforms, &req.platforms)?);
    opts.docker_to_oci = true;
    opts.layer = Some(Arc::new(LayerEncrypter::new(config)?));
    let image = crypt_image(client, ctx, streams, req, &opts).await?;
    tracing::info!(source = %req.source, target = %image.name, "Encrypted image");
    Ok(image)
}

/// Decrypt the layers of `req.source` into `req.target`.
pub async fn decrypt_image(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    req: &CryptRequest,
) -> Result<ImageRecord> {
    let config = req.options.decrypt_config()?;
    let mut opts = ConvertOptions::new(MatchComparer::new(req.all_platforms, &req.platforms)?);
    opts.layer = Some(Arc::new(LayerDecrypter::new(config)));
    let image = crypt_image(client, ctx, streams, req, &opts).await?;
    tracing::info!(source = %req.source, target = %image.name, "Decrypted image");
    Ok(image)
}

async fn crypt_image(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    req: &CryptRequest,
    opts: &ConvertOptions,
) -> Result<ImageRecord> {
    let target = Reference::parse_normalized(&req.target)?.to_string();
    let source = walker::walk_one(client.content(), client.images(), ctx, &req.source).await?;
    ensure_content(client, ctx, &source, &opts.matcher).await?;
    let converted = convert::convert(client, ctx, &target, &source, opts).await?;
    streams.stdout.line(&converted.image.target.digest)?;
    Ok(converted.image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::convert::tests::{docker_image, layer_tar, test_client};
    use crate::graph::read_json;
    use crate::manifest::{ImageManifest, ManifestExt};
    use crate::media;

    #[tokio::test]
    async fn test_encrypt_then_decrypt_image() {
        let tmp = TempDir::new().unwrap();
        let keys = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        docker_image(&client, &ctx, "docker.io/library/app:1", &[layer_tar(&[("a", b"secret")])]).await;
        let key = keys.path().join("img.key");
        std::fs::write(&key, b"0123456789abcdef0123456789abcdef").unwrap();
        let key = key.to_string_lossy().into_owned();

        let (streams, out, _) = IoStreams::buffered(b"");
        let enc = CryptRequest {
            source: "app:1".to_string(),
            target: "app:enc".to_string(),
            options: CryptOptions {
                recipients: vec![format!("sym:{key}")],
                ..Default::default()
            },
            ..Default::default()
        };
        let encrypted = encrypt_image(&client, &ctx, &streams, &enc).await.unwrap();
        assert_eq!(out.text().trim(), encrypted.target.digest);
        assert_eq!(encrypted.target.media_type, media::OCI_MANIFEST);
        let manifest: ImageManifest = read_json(client.content(), &ctx, &encrypted.target).await.unwrap();
        assert!(media::is_encrypted(&manifest.layer_descriptors()[0].media_type));

        let (streams, _, _) = IoStreams::buffered(b"");
        let dec = CryptRequest {
            source: "app:enc".to_string(),
            target: "app:dec".to_string(),
            options: CryptOptions {
                keys: vec![key],
                ..Default::default()
            },
            ..Default::default()
        };
        let decrypted = decrypt_image(&client, &ctx, &streams, &dec).await.unwrap();
        let manifest: ImageManifest = read_json(client.content(), &ctx, &decrypted.target).await.unwrap();
        assert_eq!(manifest.layer_descriptors()[0].media_type, media::OCI_LAYER_GZIP);
    }

    #[tokio::test]
    async fn test_encrypt_requires_recipients() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let (streams, _, _) = IoStreams::buffered(b"");
        let req = CryptRequest {
            source: "app:1".to_string(),
            target: "app:enc".to_string(),
            ..Default::default()
        };
        let err = encrypt_image(&client, &client.context(), &streams, &req).await.unwrap_err();
        assert!(err.is(cask_core::ErrorKind::InvalidArgument));
    }
}
