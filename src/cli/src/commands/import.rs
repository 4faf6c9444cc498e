//! `cask image import` command.

use cask_core::Result;
use cask_image::ops::{self, ImportOptions, ImportSource};
use clap::Args;

use super::Session;

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Rootfs tarball: a file, an http(s) URL, or "-" for stdin
    pub source: String,

    /// Name of the new image, REPOSITORY[:TAG]
    pub reference: Option<String>,

    /// Commit message recorded in the image history
    #[arg(short, long)]
    pub message: Option<String>,

    /// Platform of the image, defaults to the host platform
    #[arg(long)]
    pub platform: Option<String>,
}

pub async fn execute(session: &Session, args: ImportArgs) -> Result<()> {
    let source = ImportSource::parse(&args.source);
    let opts = ImportOptions {
        reference: args.reference,
        message: args.message,
        platform: args.platform,
    };
    ops::import_rootfs(&session.client, &session.ctx, &session.streams, &source, &opts).await?;
    Ok(())
}
