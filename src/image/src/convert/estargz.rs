//! eStargz: seekable gzip layers.
//!
//! Every tar entry (and every chunk of a large file) starts a gzip member,
//! and a `stargz.index.json` table of contents records where each one
//! lives. The blob ends with a 51-byte gzip footer carrying the TOC offset.
//! With an external TOC the index is kept in a separate blob and published
//! as a `<target>-esgztoc` image.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use async_trait::async_trait;
use cask_core::error::{CaskError, Result};
use parking_lot::Mutex;

use super::toc::{self, Codec, FrameWriter, Toc};
use super::{commit_layer, convertible, rewrite_layer, Finalize, LayerConvertFunc, Rewrite};
use crate::client::Client;
use crate::compression;
use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::digest;
use crate::graph::child_gc_labels;
use crate::labels;
use crate::manifest::{new_config, new_manifest, ConfigExt};
use crate::media::{self, Compression};
use crate::platform::Platform;
use crate::store::{create_or_update, write_blob, write_json, ContentStore, ImageRecord};

/// Name of the TOC entry.
pub const TOC_NAME: &str = "stargz.index.json";

/// Suffix of the image holding external TOCs.
pub const TOC_IMAGE_SUFFIX: &str = "-esgztoc";

/// Footer length in bytes.
pub const FOOTER_SIZE: usize = 51;

/// eStargz tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstargzOptions {
    /// gzip level, 0-9.
    pub compression_level: u32,
    pub chunk_size: u64,
    /// Entries smaller than this share a gzip member. Zero disables packing.
    pub min_chunk_size: u64,
    pub external_toc: bool,
    /// Keep the tar trailer so the diff ID is unchanged. Needs `external_toc`.
    pub keep_diff_id: bool,
}

impl Default for EstargzOptions {
    fn default() -> Self {
        Self {
            compression_level: 9,
            chunk_size: 4 << 20,
            min_chunk_size: 0,
            external_toc: false,
            keep_diff_id: false,
        }
    }
}

impl EstargzOptions {
    pub fn validate(&self) -> Result<()> {
        if self.keep_diff_id && !self.external_toc {
            return Err(CaskError::invalid(
                "option keep-diff-id is only supported with external-toc",
            ));
        }
        if self.compression_level > 9 {
            return Err(CaskError::invalid(format!(
                "invalid estargz compression level {}",
                self.compression_level
            )));
        }
        Ok(())
    }
}

/// External TOC written for one layer.
#[derive(Debug, Clone)]
struct ExternalToc {
    layer: String,
    blob: Descriptor,
    diff_id: String,
}

/// Converts layers to eStargz. Also the finalize hook that publishes
/// external TOCs.
pub struct EstargzConverter {
    opts: EstargzOptions,
    tocs: Mutex<Vec<ExternalToc>>,
}

impl EstargzConverter {
    pub fn new(opts: EstargzOptions) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            opts,
            tocs: Mutex::new(Vec::new()),
        })
    }

    pub fn options(&self) -> &EstargzOptions {
        &self.opts
    }
}

/// True if `desc` already is an eStargz layer.
pub fn is_estargz(desc: &Descriptor) -> bool {
    desc.annotations.contains_key(labels::ESTARGZ_TOC_DIGEST)
}

#[async_trait]
impl LayerConvertFunc for EstargzConverter {
    async fn convert(
        &self,
        cs: &dyn ContentStore,
        ctx: &OpContext,
        desc: &Descriptor,
    ) -> Result<Option<Descriptor>> {
        if !convertible(desc) || is_estargz(desc) {
            return Ok(None);
        }
        let opts = self.opts.clone();
        let mut layer = rewrite_layer(cs, ctx, desc, move |mut reader, out| build(&mut reader, out, &opts)).await?;
        let external = layer.rewrite.extra.take();
        let media_type = media::with_compression(&desc.media_type, Compression::Gzip);
        let converted = commit_layer(cs, ctx, desc, media_type, layer).await?;

        if let Some(tar) = external {
            let gz = compression::gzip_all(&tar)?;
            let mut blob = Descriptor::of(media::OCI_LAYER_GZIP, &gz);
            blob.annotations
                .insert(labels::ESTARGZ_LAYER_DIGEST.to_string(), converted.digest.clone());
            let diff_id = digest::sha256_of(&tar);
            let blob_labels = BTreeMap::from([(labels::UNCOMPRESSED.to_string(), diff_id.clone())]);
            write_blob(cs, ctx, &blob, &gz, blob_labels).await?;
            self.tocs.lock().push(ExternalToc {
                layer: converted.digest.clone(),
                blob,
                diff_id,
            });
        }
        tracing::debug!(
            layer = %desc.digest,
            estargz = %converted.digest,
            external_toc = self.opts.external_toc,
            "Converted layer to eStargz"
        );
        Ok(Some(converted))
    }
}

#[async_trait]
impl Finalize for EstargzConverter {
    async fn finalize(
        &self,
        client: &Client,
        ctx: &OpContext,
        target: &str,
        _converted: &Descriptor,
    ) -> Result<Option<ImageRecord>> {
        if !self.opts.external_toc {
            return Ok(None);
        }
        let tocs = self.tocs.lock().clone();
        if tocs.is_empty() {
            return Ok(None);
        }

        let cs = client.content();
        let mut config = new_config(&Platform::host())?;
        config.replace_diff_ids(tocs.iter().map(|t| t.diff_id.clone()).collect());
        let config_desc = write_json(cs, ctx, media::OCI_CONFIG, &config, BTreeMap::new()).await?;

        let layers: Vec<Descriptor> = tocs.iter().map(|t| t.blob.clone()).collect();
        let children: Vec<Descriptor> = std::iter::once(config_desc.clone())
            .chain(layers.iter().cloned())
            .collect();
        let manifest = new_manifest(media::OCI_MANIFEST, &config_desc, &layers)?;
        let data = crate::manifest::to_vec(&manifest)?;
        let desc = Descriptor::of(media::OCI_MANIFEST, &data);
        write_blob(cs, ctx, &desc, &data, child_gc_labels(&desc, &children)).await?;

        let name = format!("{target}{TOC_IMAGE_SUFFIX}");
        let record = create_or_update(client.images(), ctx, ImageRecord::new(&name, desc)).await?;
        tracing::info!(
            image = %name,
            layers = tocs.len(),
            toc_layers = ?tocs.iter().map(|t| t.layer.as_str()).collect::<Vec<_>>(),
            "Created external TOC image"
        );
        Ok(Some(record))
    }
}

fn build<W: Write>(reader: &mut dyn Read, out: &mut W, opts: &EstargzOptions) -> io::Result<Rewrite> {
    let mut file = toc::stage(reader)?;
    let layout = toc::scan(&mut file)?;
    let mut frames = FrameWriter::new(out, Codec::Gzip(opts.compression_level), opts.min_chunk_size);
    let pending = toc::emit_entries(&mut file, &layout, &mut frames, opts.chunk_size)?;
    if opts.keep_diff_id {
        toc::copy_range(
            &mut file,
            layout.trailer_start,
            layout.len - layout.trailer_start,
            &mut frames,
        )?;
    }
    let toc_offset = frames.position()?;
    let entries = toc::resolve(pending, &frames, false);
    let toc_json = serde_json::to_vec(&Toc { version: 1, entries })?;
    let toc_tar = toc_tar(&toc_json)?;

    let extra = if opts.external_toc {
        Some(toc_tar)
    } else {
        frames.write(&toc_tar)?;
        frames.close()?;
        None
    };
    frames.write_raw(&footer(toc_offset))?;
    let (diff_id, size) = frames.finish()?;

    let annotations = BTreeMap::from([
        (labels::ESTARGZ_TOC_DIGEST.to_string(), digest::sha256_of(&toc_json)),
        (labels::ESTARGZ_UNCOMPRESSED_SIZE.to_string(), size.to_string()),
    ]);
    Ok(Rewrite {
        diff_id,
        annotations,
        extra,
    })
}

/// A tar holding only the TOC entry, trailer included.
fn toc_tar(json: &[u8]) -> io::Result<Vec<u8>> {
    let mut header = tar::Header::new_ustar();
    header.set_path(TOC_NAME)?;
    header.set_size(json.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, json)?;
    builder.into_inner()
}

/// Empty gzip member whose extra field records the TOC offset.
pub fn footer(toc_offset: u64) -> [u8; FOOTER_SIZE] {
    let mut out = [0u8; FOOTER_SIZE];
    out[..10].copy_from_slice(&[0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff]);
    out[10..12].copy_from_slice(&26u16.to_le_bytes());
    out[12..14].copy_from_slice(b"SG");
    out[14..16].copy_from_slice(&22u16.to_le_bytes());
    out[16..38].copy_from_slice(format!("{toc_offset:016x}STARGZ").as_bytes());
    out[38..43].copy_from_slice(&[0x01, 0x00, 0x00, 0xff, 0xff]);
    out
}

/// TOC offset recorded in a blob's footer, if it has one.
pub fn parse_footer(blob: &[u8]) -> Option<u64> {
    let footer = blob.get(blob.len().checked_sub(FOOTER_SIZE)?..)?;
    if footer[..4] != [0x1f, 0x8b, 0x08, 0x04] || &footer[12..14] != b"SG" {
        return None;
    }
    let payload = std::str::from_utf8(&footer[16..38]).ok()?;
    let hex = payload.strip_suffix("STARGZ")?;
    u64::from_str_radix(hex, 16).ok()
}
