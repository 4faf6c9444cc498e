//! `cask image inspect` command.

use cask_core::Result;
use cask_image::ops::{self, InspectMode};
use cask_image::MatchComparer;
use clap::Args;

use super::Session;
use crate::output::Template;

#[derive(Args, Debug)]
pub struct ImageInspectArgs {
    /// Images to inspect (name, ID or digest)
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Inspect mode: dockercompat or native
    #[arg(long, default_value = "dockercompat")]
    pub mode: String,

    /// Format the output using a Go template, e.g. '{{json .}}'
    #[arg(short, long)]
    pub format: Option<String>,

    /// Platform to inspect, defaults to the host platform
    #[arg(long)]
    pub platform: Option<String>,
}

pub async fn execute(session: &Session, args: ImageInspectArgs) -> Result<()> {
    let mode = InspectMode::parse(&args.mode)?;
    let template = args.format.as_deref().map(Template::parse).transpose()?;
    let matcher = MatchComparer::new(false, &args.platform.iter().cloned().collect::<Vec<_>>())?;

    let docs = ops::inspect(&session.client, &session.ctx, &args.images, mode, &matcher).await?;
    let lines = match template {
        Some(t) => docs.iter().map(|d| t.render(d)).collect::<Result<Vec<_>>>()?,
        None => vec![serde_json::to_string_pretty(&docs)?],
    };
    for line in lines {
        session.streams.stdout.line(line)?;
    }
    Ok(())
}
