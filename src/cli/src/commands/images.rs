//! `cask image ls` / `cask images` command.

use std::collections::HashSet;

use cask_core::{CaskError, Result};
use cask_image::ops::{self, ImageRow, ListOptions};
use clap::Args;

use super::{PlatformArgs, Session};
use crate::output::{self, Template};

#[derive(Args, Debug, Default)]
pub struct ImagesArgs {
    /// Only show image IDs
    #[arg(short, long)]
    pub quiet: bool,

    /// Don't truncate output
    #[arg(long)]
    pub no_trunc: bool,

    /// Format the output: table, wide, json, or a Go template such as
    /// '{{.Repository}}:{{.Tag}}'
    #[arg(long)]
    pub format: Option<String>,

    /// Filter output based on conditions provided (repeatable)
    #[arg(short, long = "filter")]
    pub filters: Vec<String>,

    /// Show digests
    #[arg(long)]
    pub digests: bool,

    /// Show full image names instead of repository and tag
    #[arg(long)]
    pub names: bool,

    #[command(flatten)]
    pub platform: PlatformArgs,
}

pub async fn execute(session: &Session, args: ImagesArgs) -> Result<()> {
    let opts = ListOptions {
        filters: args.filters.clone(),
        platforms: args.platform.platforms.clone(),
        all_platforms: args.platform.all_platforms,
        quiet: args.quiet,
        format: args.format.clone().unwrap_or_default(),
    };
    let rows = ops::list(&session.client, &session.ctx, &opts).await?;
    for line in render(&rows, &args)? {
        session.streams.stdout.line(line)?;
    }
    Ok(())
}

fn render(rows: &[ImageRow], args: &ImagesArgs) -> Result<Vec<String>> {
    let id = |row: &ImageRow| {
        if args.no_trunc {
            row.id.clone()
        } else {
            output::short_digest(&row.id).to_string()
        }
    };

    if args.quiet {
        let mut seen = HashSet::new();
        return Ok(rows.iter().map(&id).filter(|i| seen.insert(i.clone())).collect());
    }

    let format = args.format.as_deref().unwrap_or("");
    match format {
        "" | "table" | "wide" => {}
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

    let digests = args.digests || format == "wide";
    let mut headers: Vec<&str> = if args.names {
        vec!["NAME"]
    } else {
        vec!["REPOSITORY", "TAG"]
    };
    if digests {
        headers.push("DIGEST");
    }
    headers.extend(["IMAGE ID", "CREATED", "PLATFORM", "SIZE", "BLOB SIZE"]);

    let mut table = output::new_table(&headers);
    for row in rows {
        let mut cells = if args.names {
            vec![row.name.clone()]
        } else {
            vec![row.repository.clone(), row.tag.clone()]
        };
        if digests {
            cells.push(row.digest.clone());
        }
        cells.extend([
            id(row),
            output::format_ago(&row.created_at),
            row.platform.clone(),
            output::format_bytes(row.size),
            output::format_bytes(row.blob_size),
        ]);
        table.add_row(cells);
    }
    Ok(vec![table.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, id: &str) -> ImageRow {
        ImageRow {
            name: format!("docker.io/library/{name}:latest"),
            repository: name.to_string(),
            tag: "latest".to_string(),
            id: id.to_string(),
            digest: id.to_string(),
            created_at: chrono::Utc::now(),
            platform: "linux/amd64".to_string(),
            size: 2048,
            blob_size: 1024,
        }
    }

    const ID: &str = "sha256:aaaaaaaaaaaabbbbbbbbbbbbccccccccccccddddddddddddeeeeeeeeeeeeffff";

    #[test]
    fn test_quiet_dedups_ids() {
        let rows = vec![row("a", ID), row("b", ID)];
        let args = ImagesArgs {
            quiet: true,
            ..Default::default()
        };
        assert_eq!(render(&rows, &args).unwrap(), vec!["aaaaaaaaaaaa"]);
    }

    #[test]
    fn test_table_columns() {
        let rows = vec![row("alpine", ID)];
        let out = render(&rows, &ImagesArgs::default()).unwrap().join("\n");
        assert!(out.contains("REPOSITORY"));
        assert!(!out.contains("DIGEST"));
        assert!(out.contains("alpine"));
        assert!(out.contains("aaaaaaaaaaaa"));
        assert!(out.contains("2.0 KB"));

        let args = ImagesArgs {
            format: Some("wide".to_string()),
            names: true,
            ..Default::default()
        };
        let out = render(&rows, &args).unwrap().join("\n");
        assert!(out.contains("DIGEST"));
        assert!(out.contains("docker.io/library/alpine:latest"));
    }

    #[test]
    fn test_template_and_json() {
        let rows = vec![row("alpine", ID)];
        let args = ImagesArgs {
            format: Some("{{.Repository}}:{{.Tag}}".to_string()),
            ..Default::default()
        };
        assert_eq!(render(&rows, &args).unwrap(), vec!["alpine:latest"]);

        let args = ImagesArgs {
            format: Some("json".to_string()),
            ..Default::default()
        };
        let line = &render(&rows, &args).unwrap()[0];
        let v: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(v["ID"], ID);
    }
}
