//! `cask image prune` command.

use cask_core::Result;
use cask_image::ops::{self, PruneOptions};
use clap::Args;

use super::Session;
use crate::output;

#[derive(Args, Debug)]
pub struct ImagePruneArgs {
    /// Remove all images not used by any container, not just dangling ones
    #[arg(short, long)]
    pub all: bool,

    /// Do not prompt for confirmation
    #[arg(short, long)]
    pub force: bool,

    /// Filter images: label=<key>[=<value>] or until=<timestamp|duration> (repeatable)
    #[arg(long = "filter")]
    pub filters: Vec<String>,
}

pub async fn execute(session: &Session, args: ImagePruneArgs) -> Result<()> {
    let containers = session.containers();
    let opts = PruneOptions {
        all: args.all,
        force: args.force,
        filters: args.filters,
    };
    let report = ops::prune(&session.client, &session.ctx, &session.streams, &containers, &opts).await?;
    if let Some(report) = report {
        session.streams.stdout.line(format!(
            "Total reclaimed space: {}",
            output::format_bytes(report.bytes_reclaimed)
        ))?;
    }
    Ok(())
}
