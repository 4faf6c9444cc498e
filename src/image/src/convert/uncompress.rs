//! Layer decompression.

use std::io;

use async_trait::async_trait;
use cask_core::error::Result;

use super::{commit_layer, convertible, rewrite_layer, LayerConvertFunc, Rewrite};
use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::digest::DigestingReader;
use crate::media::{self, Compression};
use crate::store::ContentStore;

/// Rewrites compressed layers as plain tar.
pub struct Uncompress;

#[async_trait]
impl LayerConvertFunc for Uncompress {
    async fn convert(
        &self,
        cs: &dyn ContentStore,
        ctx: &OpContext,
        desc: &Descriptor,
    ) -> Result<Option<Descriptor>> {
        if !convertible(desc) || media::compression(&desc.media_type) == Compression::Uncompressed {
            return Ok(None);
        }
        let layer = rewrite_layer(cs, ctx, desc, |reader, out| {
            let mut reader = DigestingReader::new(reader);
            io::copy(&mut reader, out)?;
            let (diff_id, _) = reader.finish()?;
            Ok(Rewrite::plain(diff_id))
        })
        .await?;
        let media_type = media::with_compression(&desc.media_type, Compression::Uncompressed);
        commit_layer(cs, ctx, desc, media_type, layer).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    use crate::compression;
    use crate::convert::tests::{layer_tar, test_client};
    use crate::labels;
    use crate::store::write_blob;

    #[tokio::test]
    async fn test_uncompress_gzip_layer() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let tar = layer_tar(&[("etc/hostname", b"box\n")]);
        let gz = compression::gzip_all(&tar).unwrap();
        let src = Descriptor::of(media::OCI_LAYER_GZIP, &gz);
        write_blob(client.content(), &ctx, &src, &gz, BTreeMap::new()).await.unwrap();

        let out = Uncompress
            .convert(client.content(), &ctx, &src)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.media_type, media::OCI_LAYER);
        assert_eq!(out.digest, crate::digest::sha256_of(&tar));
        assert_eq!(out.size, tar.len() as u64);
        let info = client.content().info(&ctx, &out.digest).await.unwrap();
        assert_eq!(info.labels.get(labels::UNCOMPRESSED), Some(&out.digest));
    }

    #[tokio::test]
    async fn test_uncompressed_layer_is_left_alone() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let src = Descriptor::of(media::OCI_LAYER, b"not read");
        assert!(Uncompress.convert(client.content(), &ctx, &src).await.unwrap().is_none());
        let config = Descriptor::of(media::OCI_CONFIG, b"{}");
        assert!(Uncompress.convert(client.content(), &ctx, &config).await.unwrap().is_none());
    }
}
