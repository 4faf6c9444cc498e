//! zstd:chunked: seekable zstd layers.
//!
//! Entries and file chunks are written as separate zstd frames followed by
//! the tar trailer, so the blob still decompresses to the original tar and
//! the diff ID does not change. The table of contents is zstd-compressed
//! into a skippable frame, located by a skippable footer frame.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use async_trait::async_trait;
use cask_core::error::{CaskError, Result};

use super::toc::{self, Codec, FrameWriter, Toc};
use super::{commit_layer, convertible, rewrite_layer, LayerConvertFunc, Rewrite};
use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::digest;
use crate::labels;
use crate::media::{self, Compression};
use crate::store::ContentStore;

/// Magic of the skippable frames holding the manifest and footer.
pub const SKIPPABLE_FRAME_MAGIC: u32 = 0x184D_2A50;

/// Trailing magic of the footer frame.
pub const FOOTER_MAGIC: &[u8; 8] = b"GNUlInUx";

/// Footer payload length.
pub const FOOTER_SIZE: usize = 40;

/// Manifest type recorded in the footer and position annotation.
const MANIFEST_TYPE_CRFS: u64 = 1;

/// zstd:chunked tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZstdChunkedOptions {
    pub compression_level: i32,
    pub chunk_size: u64,
}

impl Default for ZstdChunkedOptions {
    fn default() -> Self {
        Self {
            compression_level: 3,
            chunk_size: 4 << 20,
        }
    }
}

impl ZstdChunkedOptions {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(CaskError::invalid("zstd:chunked chunk size must be positive"));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(CaskError::invalid(format!(
                "invalid zstd compression level {}",
                self.compression_level
            )));
        }
        Ok(())
    }
}

/// Converts layers to zstd:chunked.
pub struct ZstdChunkedConverter {
    opts: ZstdChunkedOptions,
}

impl ZstdChunkedConverter {
    pub fn new(opts: ZstdChunkedOptions) -> Result<Self> {
        opts.validate()?;
        Ok(Self { opts })
    }
}

/// True if `desc` already is a zstd:chunked layer.
pub fn is_zstd_chunked(desc: &Descriptor) -> bool {
    desc.annotations
        .contains_key(labels::ZSTD_CHUNKED_MANIFEST_CHECKSUM)
}

#[async_trait]
impl LayerConvertFunc for ZstdChunkedConverter {
    async fn convert(
        &self,
        cs: &dyn ContentStore,
        ctx: &OpContext,
        desc: &Descriptor,
    ) -> Result<Option<Descriptor>> {
        if !convertible(desc) || is_zstd_chunked(desc) {
            return Ok(None);
        }
        let opts = self.opts.clone();
        let layer = rewrite_layer(cs, ctx, desc, move |mut reader, out| build(&mut reader, out, &opts)).await?;
        let media_type = media::with_compression(&desc.media_type, Compression::Zstd);
        let converted = commit_layer(cs, ctx, desc, media_type, layer).await?;
        tracing::debug!(
            layer = %desc.digest,
            zstd_chunked = %converted.digest,
            "Converted layer to zstd:chunked"
        );
        Ok(Some(converted))
    }
}

fn build<W: Write>(reader: &mut dyn Read, out: &mut W, opts: &ZstdChunkedOptions) -> io::Result<Rewrite> {
    let mut file = toc::stage(reader)?;
    let layout = toc::scan(&mut file)?;
    let mut frames = FrameWriter::new(out, Codec::Zstd(opts.compression_level), 0);
    let pending = toc::emit_entries(&mut file, &layout, &mut frames, opts.chunk_size)?;
    frames.begin(true)?;
    toc::copy_range(
        &mut file,
        layout.trailer_start,
        layout.len - layout.trailer_start,
        &mut frames,
    )?;
    frames.close()?;

    let entries = toc::resolve(pending, &frames, true);
    let manifest = serde_json::to_vec(&Toc { version: 1, entries })?;
    let compressed = zstd::stream::encode_all(&manifest[..], opts.compression_level)?;
    let offset = frames.position()? + 8;
    frames.write_raw(&skippable_frame(&compressed))?;

    let mut footer = Vec::with_capacity(FOOTER_SIZE);
    for v in [
        offset,
        compressed.len() as u64,
        manifest.len() as u64,
        MANIFEST_TYPE_CRFS,
    ] {
        footer.extend_from_slice(&v.to_le_bytes());
    }
    footer.extend_from_slice(FOOTER_MAGIC);
    frames.write_raw(&skippable_frame(&footer))?;
    let (diff_id, _) = frames.finish()?;

    let annotations = BTreeMap::from([
        (
            labels::ZSTD_CHUNKED_MANIFEST_CHECKSUM.to_string(),
            digest::sha256_of(&compressed),
        ),
        (
            labels::ZSTD_CHUNKED_MANIFEST_POSITION.to_string(),
            format!(
                "{}:{}:{}:{}",
                offset,
                compressed.len(),
                manifest.len(),
                MANIFEST_TYPE_CRFS
            ),
        ),
    ]);
    Ok(Rewrite {
        diff_id,
        annotations,
        extra: None,
    })
}

fn skippable_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&SKIPPABLE_FRAME_MAGIC.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// `(offset, length, uncompressed length)` of the manifest named by a
/// blob's footer frame.
pub fn parse_footer(blob: &[u8]) -> Option<(u64, u64, u64)> {
    let frame = blob.get(blob.len().checked_sub(FOOTER_SIZE + 8)?..)?;
    if frame[..4] != SKIPPABLE_FRAME_MAGIC.to_le_bytes() || &frame[frame.len() - 8..] != FOOTER_MAGIC {
        return None;
    }
    let field = |i: usize| -> Option<u64> {
        let start = 8 + i * 8;
        Some(u64::from_le_bytes(frame.get(start..start + 8)?.try_into().ok()?))
    };
    Some((field(0)?, field(1)?, field(2)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::compression;
    use crate::convert::tests::{layer_tar, test_client};
    use crate::store::write_blob;

    #[tokio::test]
    async fn test_zstd_chunked_layer() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let tar = layer_tar(&[("usr/lib/libfoo.so", &[9u8; 10_000]), ("etc/foo.conf", b"x=1\n")]);
        let gz = compression::gzip_all(&tar).unwrap();
        let src = Descriptor::of(media::OCI_LAYER_GZIP, &gz);
        write_blob(client.content(), &ctx, &src, &gz, BTreeMap::new()).await.unwrap();

        let converter = ZstdChunkedConverter::new(ZstdChunkedOptions {
            chunk_size: 4096,
            ..Default::default()
        })
        .unwrap();
        let out = converter
            .convert(client.content(), &ctx, &src)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.media_type, media::OCI_LAYER_ZSTD);
        assert!(is_zstd_chunked(&out));

        let blob = client.content().read_blob(&ctx, &out.digest, None).await.unwrap();
        // Skippable frames are ignored by decoders, so the tar is intact.
        assert_eq!(compression::decompress_all(&blob).unwrap(), tar);

        let (offset, len, plain_len) = parse_footer(&blob).unwrap();
        assert_eq!(
            out.annotation(labels::ZSTD_CHUNKED_MANIFEST_POSITION),
            Some(format!("{offset}:{len}:{plain_len}:1").as_str())
        );
        let compressed = &blob[offset as usize..(offset + len) as usize];
        assert_eq!(
            out.annotation(labels::ZSTD_CHUNKED_MANIFEST_CHECKSUM),
            Some(digest::sha256_of(compressed).as_str())
        );
        let manifest: Toc =
            serde_json::from_slice(&zstd::stream::decode_all(compressed).unwrap()).unwrap();
        let lib: Vec<_> = manifest
            .entries
            .iter()
            .filter(|e| e.name == "usr/lib/libfoo.so")
            .collect();
        assert_eq!(lib.len(), 3);
        assert_eq!(lib[0].entry_type, "reg");
        assert!(lib.iter().all(|e| e.end_offset.unwrap() > e.offset));
        // First chunk starts its own frame, which decompresses to the chunk.
        let frame = &blob[lib[1].offset as usize..lib[1].end_offset.unwrap() as usize];
        assert_eq!(zstd::stream::decode_all(frame).unwrap(), vec![9u8; 4096]);
    }

    #[test]
    fn test_options_validate() {
        assert!(ZstdChunkedOptions::default().validate().is_ok());
        let bad = ZstdChunkedOptions {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
