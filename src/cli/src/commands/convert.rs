//! `cask image convert` command.

use cask_core::Result;
use cask_image::ops::{self, ConvertRequest};
use clap::Args;

use super::{PlatformArgs, Session};

#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Source image
    pub source: String,

    /// Target reference
    pub target: String,

    /// Print only the converted image digest
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format: json prints a summary of the converted images
    #[arg(long)]
    pub format: Option<String>,

    #[command(flatten)]
    pub platform: PlatformArgs,

    /// Convert Docker media types to OCI media types
    #[arg(long)]
    pub oci: bool,

    /// Convert tar.gz layers to uncompressed tar layers
    #[arg(long)]
    pub uncompress: bool,

    /// Convert legacy tar(.gz) layers to eStargz for lazy pulling
    #[arg(long)]
    pub estargz: bool,

    /// eStargz compression level
    #[arg(long)]
    pub estargz_compression_level: Option<u32>,

    /// eStargz chunk size in bytes
    #[arg(long)]
    pub estargz_chunk_size: Option<u64>,

    /// Minimal number of bytes for one gzip stream
    #[arg(long)]
    pub estargz_min_chunk_size: Option<u64>,

    /// Separate the TOC JSON into another image
    #[arg(long)]
    pub estargz_external_toc: bool,

    /// Keep diff IDs of the source layers
    #[arg(long)]
    pub estargz_keep_diff_id: bool,

    /// Convert legacy tar(.gz) layers to zstd
    #[arg(long)]
    pub zstd: bool,

    /// zstd compression level
    #[arg(long)]
    pub zstd_compression_level: Option<i32>,

    /// Convert legacy tar(.gz) layers to zstd:chunked for lazy pulling
    #[arg(long = "zstdchunked")]
    pub zstd_chunked: bool,

    /// zstd:chunked compression level
    #[arg(long)]
    pub zstdchunked_compression_level: Option<i32>,

    /// zstd:chunked chunk size in bytes
    #[arg(long)]
    pub zstdchunked_chunk_size: Option<u64>,

    /// Convert to nydus
    #[arg(long)]
    pub nydus: bool,

    /// Convert to OverlayBD
    #[arg(long)]
    pub overlaybd: bool,

    /// Build a SOCI index for the image
    #[arg(long)]
    pub soci: bool,
}

impl ConvertArgs {
    fn request(self) -> ConvertRequest {
        ConvertRequest {
            source: self.source,
            target: self.target,
            platforms: self.platform.platforms,
            all_platforms: self.platform.all_platforms,
            quiet: self.quiet,
            format: self.format,
            oci: self.oci,
            uncompress: self.uncompress,
            estargz: self.estargz,
            zstd: self.zstd,
            zstd_chunked: self.zstd_chunked,
            nydus: self.nydus,
            overlaybd: self.overlaybd,
            soci: self.soci,
            zstd_compression_level: self.zstd_compression_level,
            zstdchunked_compression_level: self.zstdchunked_compression_level,
            zstdchunked_chunk_size: self.zstdchunked_chunk_size,
            estargz_compression_level: self.estargz_compression_level,
            estargz_chunk_size: self.estargz_chunk_size,
            estargz_min_chunk_size: self.estargz_min_chunk_size,
            estargz_external_toc: self.estargz_external_toc,
            estargz_keep_diff_id: self.estargz_keep_diff_id,
        }
    }
}

pub async fn execute(session: &Session, args: ConvertArgs) -> Result<()> {
    let req = args.request();
    ops::convert_image(&session.client, &session.ctx, &session.streams, &req).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: ConvertArgs,
    }

    #[test]
    fn test_flags_map_to_request() {
        let args = Wrapper::try_parse_from([
            "convert",
            "--oci",
            "--zstdchunked",
            "--zstdchunked-chunk-size",
            "65536",
            "--all-platforms",
            "--format",
            "json",
            "src:1",
            "dst:1",
        ])
        .unwrap()
        .args;
        let req = args.request();
        assert!(req.oci && req.zstd_chunked && req.all_platforms);
        assert_eq!(req.zstdchunked_chunk_size, Some(65536));
        assert_eq!(req.format.as_deref(), Some("json"));
        assert_eq!(req.source, "src:1");
        assert_eq!(req.target, "dst:1");
    }
}
