//! `cask image history` command.

use cask_core::{CaskError, Result};
use cask_image::ops::{self, HistoryRow};
use cask_image::MatchComparer;
use clap::Args;

use super::Session;
use crate::output::{self, Template};

/// Width of the CREATED BY column unless `--no-trunc`.
const CREATED_BY_WIDTH: usize = 45;

#[derive(Args, Debug, Default)]
pub struct HistoryArgs {
    /// Image (name, ID or digest)
    pub image: String,

    /// Only show snapshot IDs
    #[arg(short, long)]
    pub quiet: bool,

    /// Don't truncate output
    #[arg(long)]
    pub no_trunc: bool,

    /// Format the output: table, json, or a Go template
    #[arg(short, long)]
    pub format: Option<String>,

    /// Platform to show, defaults to the host platform
    #[arg(long)]
    pub platform: Option<String>,
}

pub async fn execute(session: &Session, args: HistoryArgs) -> Result<()> {
    let matcher = MatchComparer::new(false, &args.platform.iter().cloned().collect::<Vec<_>>())?;
    let rows = ops::history(&session.client, &session.ctx, &args.image, &matcher).await?;
    for line in render(&rows, &args)? {
        session.streams.stdout.line(line)?;
    }
    Ok(())
}

fn render(rows: &[HistoryRow], args: &HistoryArgs) -> Result<Vec<String>> {
    let snapshot = |row: &HistoryRow| {
        if args.no_trunc {
            row.snapshot.clone()
        } else {
            output::short_digest(&row.snapshot).to_string()
        }
    };
    if args.quiet {
        return Ok(rows.iter().map(&snapshot).collect());
    }

    match args.format.as_deref().unwrap_or("") {
        "" | "table" => {}
        "json" => {
            return rows
                .iter()
                .map(|r| serde_json::to_string(r).map_err(CaskError::from))
                .collect();
        }
        template => {
            let template = Template::parse(template)?;
            return rows.iter().map(|r| template.render(r)).collect();
        }
    }

    let mut table = output::new_table(&["IMAGE", "CREATED", "CREATED BY", "SIZE", "COMMENT"]);
    for row in rows {
        let created_by = if args.no_trunc {
            row.created_by.clone()
        } else {
            output::ellipsis(&row.created_by, CREATED_BY_WIDTH)
        };
        table.add_row(vec![
            snapshot(row),
            row.created_at.as_ref().map(output::format_ago).unwrap_or_default(),
            created_by,
            output::format_bytes(row.size),
            row.comment.clone(),
        ]);
    }
    Ok(vec![table.to_string()])
}
