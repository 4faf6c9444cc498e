//! `cask tag` command.

use cask_core::Result;
use cask_image::ops;
use clap::Args;

use super::Session;

#[derive(Args, Debug)]
pub struct ImageTagArgs {
    /// Source image (name, ID or digest)
    pub source: String,

    /// Target reference (e.g., "myrepo:v1", "registry.example.com/app:latest")
    pub target: String,
}

pub async fn execute(session: &Session, args: ImageTagArgs) -> Result<()> {
    ops::tag(&session.client, &session.ctx, &args.source, &args.target).await?;
    Ok(())
}
