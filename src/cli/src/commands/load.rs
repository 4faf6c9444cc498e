//! `cask load` command.

use std::path::PathBuf;

use cask_core::Result;
use cask_image::ops::{self, LoadOptions};
use clap::Args;

use super::{PlatformArgs, Session};

#[derive(Args, Debug)]
pub struct LoadArgs {
    /// Read from a tar archive file instead of stdin
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Print only the digests of loaded images
    #[arg(short, long)]
    pub quiet: bool,

    #[command(flatten)]
    pub platform: PlatformArgs,
}

pub async fn execute(session: &Session, args: LoadArgs) -> Result<()> {
    let opts = LoadOptions {
        input: args.input,
        platforms: args.platform.platforms,
        all_platforms: args.platform.all_platforms,
        quiet: args.quiet,
    };
    ops::load(&session.client, &session.ctx, &session.streams, &opts).await?;
    Ok(())
}
