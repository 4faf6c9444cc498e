//! `image convert`: flag handling around [`crate::convert`].

use std::sync::Arc;

use cask_core::error::{CaskError, Result};
use serde::Serialize;

use crate::client::Client;
use crate::context::OpContext;
use crate::convert::{
    self, ConvertOptions, EstargzConverter, EstargzOptions, Finalize, LayerConvertFunc, Uncompress,
    ZstdChunkedConverter, ZstdChunkedOptions, ZstdConverter,
};
use crate::ensure::ensure_content;
use crate::platform::MatchComparer;
use crate::reference::Reference;
use crate::store::ImageRecord;
use crate::streams::IoStreams;
use crate::walker;

#[derive(Debug, Clone, Default)]
pub struct ConvertRequest {
    pub source: String,
    pub target: String,
    pub platforms: Vec<String>,
    pub all_platforms: bool,
    /// Print only the new digest, even when `format` is set.
    pub quiet: bool,
    /// `json` prints a [`ConvertedInfo`] summary instead of the digest.
    pub format: Option<String>,

    pub oci: bool,
    pub uncompress: bool,
    pub estargz: bool,
    pub zstd: bool,
    pub zstd_chunked: bool,
    pub nydus: bool,
    pub overlaybd: bool,
    pub soci: bool,

    pub zstd_compression_level: Option<i32>,
    pub zstdchunked_compression_level: Option<i32>,
    pub zstdchunked_chunk_size: Option<u64>,
    pub estargz_compression_level: Option<u32>,
    pub estargz_chunk_size: Option<u64>,
    pub estargz_min_chunk_size: Option<u64>,
    pub estargz_external_toc: bool,
    pub estargz_keep_diff_id: bool,
}

impl ConvertRequest {
    fn format_count(&self) -> usize {
        [
            self.estargz,
            self.zstd,
            self.zstd_chunked,
            self.nydus,
            self.overlaybd,
            self.soci,
        ]
        .iter()
        .filter(|f| **f)
        .count()
    }

    /// Check flag combinations. Returns the effective `oci` setting.
    fn validate(&self) -> Result<bool> {
        let formats = self.format_count();
        if formats > 1 {
            return Err(CaskError::invalid(
                "multiple target formats specified: pick one of --estargz, --zstd, --zstdchunked, --nydus, --overlaybd, --soci",
            ));
        }
        if self.uncompress && formats > 0 {
            return Err(CaskError::invalid(
                "option --uncompress cannot be combined with a target format",
            ));
        }
        if let Some(format) = self.format.as_deref().filter(|f| *f != "json") {
            return Err(CaskError::invalid(format!(
                "unsupported format {format:?}: only \"json\" is supported"
            )));
        }
        let mut oci = self.oci;
        for (enabled, name) in [(self.nydus, "nydus"), (self.overlaybd, "overlaybd")] {
            if enabled && !oci {
                tracing::warn!("option --{name} should be used in conjunction with --oci, forcibly enabling --oci");
                oci = true;
            }
        }
        for (enabled, name) in [(self.nydus, "nydus"), (self.overlaybd, "overlaybd"), (self.soci, "soci")] {
            if enabled {
                return Err(CaskError::Unsupported(format!("{name} conversion is not available in this build")));
            }
        }
        Ok(oci)
    }

    fn estargz_options(&self) -> EstargzOptions {
        let defaults = EstargzOptions::default();
        EstargzOptions {
            compression_level: self.estargz_compression_level.unwrap_or(defaults.compression_level),
            chunk_size: self.estargz_chunk_size.unwrap_or(defaults.chunk_size),
            min_chunk_size: self.estargz_min_chunk_size.unwrap_or(defaults.min_chunk_size),
            external_toc: self.estargz_external_toc,
            keep_diff_id: self.estargz_keep_diff_id,
        }
    }

    fn zstd_chunked_options(&self) -> ZstdChunkedOptions {
        let defaults = ZstdChunkedOptions::default();
        ZstdChunkedOptions {
            compression_level: self.zstdchunked_compression_level.unwrap_or(defaults.compression_level),
            chunk_size: self.zstdchunked_chunk_size.unwrap_or(defaults.chunk_size),
        }
    }
}

/// JSON summary of a conversion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConvertedInfo {
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_images: Vec<String>,
}

/// Convert `req.source` into `req.target`.
pub async fn convert_image(
    client: &Client,
    ctx: &OpContext,
    streams: &IoStreams,
    req: &ConvertRequest,
) -> Result<ImageRecord> {
    let oci = req.validate()?;
    let target = Reference::parse_normalized(&req.target)?.to_string();
    let matcher = MatchComparer::new(req.all_platforms, &req.platforms)?;
    let source = walker::walk_one(client.content(), client.images(), ctx, &req.source).await?;
    ensure_content(client, ctx, &source, &matcher).await?;

    let mut opts = ConvertOptions::new(matcher);
    opts.docker_to_oci = oci;
    if req.uncompress {
        opts.layer = Some(Arc::new(Uncompress));
    } else if req.estargz {
        let esgz = Arc::new(EstargzConverter::new(req.estargz_options())?);
        opts.finalize = Some(esgz.clone() as Arc<dyn Finalize>);
        opts.layer = Some(esgz as Arc<dyn LayerConvertFunc>);
    } else if req.zstd {
        opts.layer = Some(Arc::new(ZstdConverter::new(req.zstd_compression_level)));
    } else if req.zstd_chunked {
        opts.layer = Some(Arc::new(ZstdChunkedConverter::new(req.zstd_chunked_options())?));
    }

    let converted = convert::convert(client, ctx, &target, &source, &opts).await?;
    let image = converted.image;
    if req.quiet || req.format.is_none() {
        streams.stdout.line(&image.target.digest)?;
    } else {
        let info = ConvertedInfo {
            image: format!("{}@{}", image.name, image.target.digest),
            extra_images: converted
                .extra
                .iter()
                .map(|e| format!("{}@{}", e.name, e.target.digest))
                .collect(),
        };
        streams.stdout.line(serde_json::to_string(&info)?)?;
    }
    tracing::info!(source = %source.name, target = %image.name, "Converted image");
    Ok(image)
}
