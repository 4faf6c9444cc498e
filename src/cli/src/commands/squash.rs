//! `cask image squash` command.

use cask_core::Result;
use cask_image::ops::{self, SquashOptions};
use clap::Args;

use super::Session;

#[derive(Args, Debug)]
pub struct SquashArgs {
    /// Source image
    pub source: String,

    /// Target reference
    pub target: String,

    /// Number of top layers to squash (at least 2)
    #[arg(short = 'c', long)]
    pub layer_count: usize,

    /// Author of the squashed layer, defaults to the source image's author
    #[arg(short, long)]
    pub author: Option<String>,

    /// Commit message of the squashed layer
    #[arg(short, long)]
    pub message: Option<String>,
}

pub async fn execute(session: &Session, args: SquashArgs) -> Result<()> {
    let opts = SquashOptions {
        source: args.source,
        target: args.target,
        layer_count: args.layer_count,
        author: args.author,
        message: args.message,
    };
    ops::squash(&session.client, &session.ctx, &session.streams, &opts).await?;
    Ok(())
}
