//! `cask rmi` command: remove one or more images.

use cask_core::Result;
use cask_image::ops::{self, RemoveOptions};
use clap::Args;

use super::Session;

#[derive(Args, Debug)]
pub struct RmiArgs {
    /// Images to remove (name, ID or digest)
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Remove every image an ambiguous ID names, and images of stopped containers
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(session: &Session, args: RmiArgs) -> Result<()> {
    let containers = session.containers();
    ops::remove(
        &session.client,
        &session.ctx,
        &session.streams,
        &containers,
        &args.images,
        RemoveOptions { force: args.force },
    )
    .await
}
