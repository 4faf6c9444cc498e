//! Plain zstd recompression.


use async_trait::async_trait;
use cask_core::error::Result;

use super::{commit_layer, convertible, rewrite_layer, LayerConvertFunc, Rewrite};
use crate::compression;
use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::digest::DigestingReader;
use crate::media::{self, Compression};
use crate::store::ContentStore;

/// Recompresses layers with zstd. Layers that already are zstd are kept.
pub struct ZstdConverter {
    level: Option<i32>,
}

impl ZstdConverter {
    /// `level` is the zstd level; `None` uses the encoder default.
    pub fn new(level: Option<i32>) -> Self {
        Self { level }
    }
}

#[async_trait]
impl LayerConvertFunc for ZstdConverter {
    async fn convert(
        &self,
        cs: &dyn ContentStore,
        ctx: &OpContext,
        desc: &Descriptor,
    ) -> Result<Option<Descriptor>> {
        if !convertible(desc) || media::compression(&desc.media_type) == Compression::Zstd {
            return Ok(None);
        }
        let level = self.level;
        let layer = rewrite_layer(cs, ctx, desc, move |reader, out| {
            let mut reader = DigestingReader::new(reader);
            compression::compress(Compression::Zstd, level, &mut reader, out)?;
            let (diff_id, _) = reader.finish()?;
            Ok(Rewrite::plain(diff_id))
        })
        .await?;
        let media_type = media::with_compression(&desc.media_type, Compression::Zstd);
        commit_layer(cs, ctx, desc, media_type, layer).await.map(Some)
    }
}
