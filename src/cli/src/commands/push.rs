//! `cask push` command.

use cask_core::Result;
use cask_image::ops::{self, PushOptions};
use cask_image::SignMode;
use clap::Args;

use super::{PlatformArgs, Session};

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Image reference to push
    pub image: String,

    /// Suppress the final digest line
    #[arg(short, long)]
    pub quiet: bool,

    #[command(flatten)]
    pub platform: PlatformArgs,

    /// Convert layers to eStargz before pushing
    #[arg(long)]
    pub estargz: bool,

    /// Sign the image after pushing: none, cosign or notation
    #[arg(long, default_value = "none")]
    pub sign: String,

    /// Path to the private key file or KMS URI for --sign=cosign
    #[arg(long)]
    pub cosign_key: Option<String>,

    /// Signing key name for --sign=notation
    #[arg(long)]
    pub notation_key_name: Option<String>,

    /// Span size in bytes for SOCI index creation
    #[arg(long)]
    pub soci_span_size: Option<i64>,

    /// Minimum layer size in bytes for SOCI index creation
    #[arg(long)]
    pub soci_min_layer_size: Option<i64>,

    /// Allow pushing layers marked non-distributable
    #[arg(long)]
    pub allow_nondistributable_artifacts: bool,
}

impl PushArgs {
    fn options(&self) -> Result<PushOptions> {
        Ok(PushOptions {
            platforms: self.platform.platforms.clone(),
            all_platforms: self.platform.all_platforms,
            estargz: self.estargz,
            sign: SignMode::parse(&self.sign, self.cosign_key.clone(), self.notation_key_name.clone())?,
            quiet: self.quiet,
            soci: self.soci_span_size.is_some() || self.soci_min_layer_size.is_some(),
            progress_to_stdout: true,
        })
    }
}

pub async fn execute(session: &Session, args: PushArgs) -> Result<()> {
    let opts = args.options()?;
    if args.allow_nondistributable_artifacts {
        tracing::debug!("Non-distributable layers are pushed like any other layer");
    }
    ops::push(&session.client, &session.ctx, &session.streams, &args.image, &opts).await
}
