//! Table, size, time and template formatting for command output.

use cask_core::{CaskError, Result};
use comfy_table::{ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

/// Create a borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a chrono timestamp as a relative "ago" string.
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let now = chrono::Utc::now();
    let duration = now.signed_duration_since(*dt);

    let secs = duration.num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }

    if secs < 60 {
        return format!("{secs} seconds ago");
    }

    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }

    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }

    let days = duration.num_days();
    if days < 30 {
        return format!("{days} days ago");
    }

    let months = days / 30;
    if months < 12 {
        return format!("{months} months ago");
    }

    let years = days / 365;
    format!("{years} years ago")
}

/// First 12 hex characters of a digest, without the algorithm.
pub fn short_digest(digest: &str) -> &str {
    let hex = digest.split_once(':').map(|(_, h)| h).unwrap_or(digest);
    &hex[..hex.len().min(12)]
}

/// Shorten `s` to `max` characters with a trailing ellipsis.
pub fn ellipsis(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

// ============================================================================
// Templates
// ============================================================================

/// A parsed `--format` template over the JSON projection of a row.
///
/// Supported actions: `{{.Field}}`, `{{.Field.Sub}}`, `{{.}}`,
/// `{{json .}}` and `{{json .Field}}`. A leading `table ` is dropped.
#[derive(Debug, Clone)]
pub struct Template {
    parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Text(String),
    Field { path: Vec<String>, json: bool },
}

impl Template {
    pub fn parse(format: &str) -> Result<Self> {
        let format = format.strip_prefix("table ").unwrap_or(format);
        let format = format.replace("\\t", "\t").replace("\\n", "\n");
        let mut parts = Vec::new();
        let mut rest = format.as_str();
        while let Some(start) = rest.find("{{") {
            if start > 0 {
                parts.push(Part::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| CaskError::invalid(format!("unclosed action in template {format:?}")))?;
            parts.push(parse_action(after[..end].trim())?);
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_string()));
        }
        Ok(Self { parts })
    }

    /// Render one row.
    pub fn render<T: Serialize>(&self, row: &T) -> Result<String> {
        let value = serde_json::to_value(row)?;
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(t) => out.push_str(t),
                Part::Field { path, json } => {
                    let v = lookup(&value, path);
                    if *json {
                        out.push_str(&serde_json::to_string(v.unwrap_or(&Value::Null))?);
                    } else {
                        out.push_str(&plain(v));
                    }
                }
            }
        }
        Ok(out)
    }
}

fn parse_action(action: &str) -> Result<Part> {
    let (json, expr) = match action.strip_prefix("json ") {
        Some(e) => (true, e.trim()),
        None => (false, action),
    };
    let path = expr
        .strip_prefix('.')
        .ok_or_else(|| CaskError::invalid(format!("unsupported template action {{{{{action}}}}}")))?;
    let path = path
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    Ok(Part::Field { path, json })
}

fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

fn plain(value: Option<&Value>) -> String {
    match value {
        None => "<no value>".to_string(),
        Some(Value::Null) => "<nil>".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => {
            let inner: Vec<String> = items.iter().map(|v| plain(Some(v))).collect();
            format!("[{}]", inner.join(" "))
        }
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(100 * 1048576), "100.0 MB");
        assert_eq!(format_bytes(10 * 1073741824), "10.0 GB");
    }

    #[test]
    fn test_new_table_with_rows() {
        let mut table = new_table(&["REPOSITORY", "TAG"]);
        table.add_row(["alpine", "3.19"]);
        let output = table.to_string();
        assert!(output.contains("REPOSITORY"));
        assert!(output.contains("alpine"));
        assert!(output.contains("3.19"));
    }

    #[test]
    fn test_format_ago() {
        let now = chrono::Utc::now();
        assert_eq!(format_ago(&(now - chrono::Duration::minutes(5))), "5 minutes ago");
        assert_eq!(format_ago(&(now - chrono::Duration::hours(3))), "3 hours ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(730))), "2 years ago");
        assert_eq!(format_ago(&(now + chrono::Duration::hours(1))), "just now");
    }

    #[test]
    fn test_short_digest() {
        let d = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        assert_eq!(short_digest(d), "0123456789ab");
        assert_eq!(short_digest("abc"), "abc");
    }

    #[test]
    fn test_ellipsis() {
        assert_eq!(ellipsis("short", 10), "short");
        assert_eq!(ellipsis("/bin/sh -c apk add curl", 10), "/bin/sh -…");
    }

    #[test]
    fn test_template_fields() {
        let row = json!({"Repository": "alpine", "Tag": "3.19", "Config": {"Labels": {"a": "b"}}});
        let t = Template::parse("{{.Repository}}:{{.Tag}}").unwrap();
        assert_eq!(t.render(&row).unwrap(), "alpine:3.19");

        let t = Template::parse("{{json .Config.Labels}}").unwrap();
        assert_eq!(t.render(&row).unwrap(), r#"{"a":"b"}"#);

        let t = Template::parse("table {{.Repository}}\\t{{.Missing}}").unwrap();
        assert_eq!(t.render(&row).unwrap(), "alpine\t<no value>");
    }

    #[test]
    fn test_template_whole_row() {
        let row = json!({"ID": "x"});
        let t = Template::parse("{{json .}}").unwrap();
        assert_eq!(t.render(&row).unwrap(), r#"{"ID":"x"}"#);
    }

    #[test]
    fn test_template_errors() {
        assert!(Template::parse("{{.Repository").is_err());
        assert!(Template::parse("{{range .}}").is_err());
    }
}
