//! `cask save` command.

use std::path::PathBuf;

use cask_core::Result;
use cask_image::ops::{self, SaveOptions};
use clap::Args;

use super::{PlatformArgs, Session};

#[derive(Args, Debug)]
pub struct SaveArgs {
    /// Images to save
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Write to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub platform: PlatformArgs,
}

pub async fn execute(session: &Session, args: SaveArgs) -> Result<()> {
    let opts = SaveOptions {
        output: args.output,
        platforms: args.platform.platforms,
        all_platforms: args.platform.all_platforms,
    };
    ops::save(&session.client, &session.ctx, &session.streams, &args.images, &opts).await
}
