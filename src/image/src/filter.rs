//! Filters for listing and pruning images.
//!
//! `label=<k>[=<v>]`, `reference=<pattern>`, `before=<image>`,
//! `since=<image>`, `until=<duration|timestamp>` and `dangling=<bool>`.
//! Every filter must hold for an image to match.

use std::collections::BTreeMap;

use cask_core::error::{CaskError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::client::Client;
use crate::context::OpContext;
use crate::labels;
use crate::reference::Reference;
use crate::store::ImageRecord;
use crate::walker::{self, AmbiguityPolicy};

/// Keys `image ls` accepts.
pub const LIST_FILTERS: &[&str] = &["label", "reference", "before", "since", "until", "dangling"];

/// Keys `image prune` accepts.
pub const PRUNE_FILTERS: &[&str] = &["label", "until"];

/// Parsed but unresolved filters; `before`/`since` still name images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSpec {
    pub labels: Vec<(String, Option<String>)>,
    pub references: Vec<String>,
    pub before: Vec<String>,
    pub since: Vec<String>,
    pub until: Vec<String>,
    pub dangling: Option<bool>,
}

impl FilterSpec {
    /// Parse `key=value` filters, accepting only `allowed` keys.
    pub fn parse(raw: &[String], allowed: &[&str]) -> Result<Self> {
        let mut spec = FilterSpec::default();
        for filter in raw {
            let (key, value) = filter
                .split_once('=')
                .ok_or_else(|| CaskError::invalid(format!("bad format of filter \"{filter}\" (expected name=value)")))?;
            let key = key.trim();
            if !allowed.contains(&key) {
                return Err(CaskError::invalid(format!("invalid filter '{key}'")));
            }
            match key {
                "label" => {
                    let (k, v) = match value.split_once('=') {
                        Some((k, v)) => (k.to_string(), Some(v.to_string())),
                        None => (value.to_string(), None),
                    };
                    spec.labels.push((k, v));
                }
                "reference" => spec.references.push(value.to_string()),
                "before" => spec.before.push(value.to_string()),
                "since" => spec.since.push(value.to_string()),
                "until" => spec.until.push(value.to_string()),
                "dangling" => {
                    spec.dangling = Some(match value {
                        "true" | "1" => true,
                        "false" | "0" => false,
                        other => {
                            return Err(CaskError::invalid(format!(
                                "invalid filter 'dangling={other}' (expected true or false)"
                            )))
                        }
                    })
                }
                other => return Err(CaskError::invalid(format!("invalid filter '{other}'"))),
            }
        }
        Ok(spec)
    }

    /// Resolve image references and times relative to `now`.
    pub async fn resolve(&self, client: &Client, ctx: &OpContext, now: DateTime<Utc>) -> Result<Filters> {
        let mut before = Vec::with_capacity(self.before.len());
        for req in &self.before {
            before.push(created_of(client, ctx, req).await?);
        }
        let mut since = Vec::with_capacity(self.since.len());
        for req in &self.since {
            since.push(created_of(client, ctx, req).await?);
        }
        let until = self
            .until
            .iter()
            .map(|u| parse_until(u, now))
            .collect::<Result<Vec<_>>>()?;
        let references = self
            .references
            .iter()
            .map(|p| (p.clone(), Regex::new(p).ok()))
            .collect();
        Ok(Filters {
            labels: self.labels.clone(),
            references,
            before,
            since,
            until,
            dangling: self.dangling,
        })
    }
}

async fn created_of(client: &Client, ctx: &OpContext, req: &str) -> Result<DateTime<Utc>> {
    let found = walker::walk(client.content(), client.images(), ctx, req, AmbiguityPolicy::All).await?;
    Ok(found[0].image.created_at)
}

/// Resolved filters.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    labels: Vec<(String, Option<String>)>,
    references: Vec<(String, Option<Regex>)>,
    before: Vec<DateTime<Utc>>,
    since: Vec<DateTime<Utc>>,
    until: Vec<DateTime<Utc>>,
    dangling: Option<bool>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
            && self.references.is_empty()
            && self.before.is_empty()
            && self.since.is_empty()
            && self.until.is_empty()
            && self.dangling.is_none()
    }

    /// Whether the filters need config labels to decide.
    pub fn needs_config(&self) -> bool {
        !self.labels.is_empty()
    }

    /// Match `image`. `config_labels` are the labels of its config;
    /// `config_digest` names the config for the dangling test.
    pub fn matches(
        &self,
        image: &ImageRecord,
        config_labels: &BTreeMap<String, String>,
        config_digest: Option<&str>,
    ) -> bool {
        let labels_ok = self.labels.iter().all(|(k, v)| {
            let found = config_labels.get(k).or_else(|| image.labels.get(k));
            match (found, v) {
                (Some(found), Some(v)) => found == v,
                (Some(_), None) => true,
                (None, _) => false,
            }
        });
        if !labels_ok {
            return false;
        }

        if !self.references.is_empty() {
            let parsed = Reference::parse(&image.name).ok();
            let all = self.references.iter().all(|(pattern, re)| {
                let familiar = parsed.as_ref().map_or(false, |r| r.familiar_match(pattern));
                let regex = re.as_ref().map_or(false, |re| re.is_match(&image.name));
                familiar || regex
            });
            if !all {
                return false;
            }
        }

        let created = image.created_at;
        if !self.before.iter().all(|t| created < *t)
            || !self.since.iter().all(|t| created > *t)
            || !self.until.iter().all(|t| created < *t)
        {
            return false;
        }

        match self.dangling {
            Some(want) => is_dangling(image, config_digest) == want,
            None => true,
        }
    }
}

/// An image without a tag. CRI keeps images named by their config digest;
/// those are not dangling.
pub fn is_dangling(image: &ImageRecord, config_digest: Option<&str>) -> bool {
    if image.labels.contains_key(labels::CRI_MANAGED) && config_digest == Some(image.name.as_str()) {
        return false;
    }
    if crate::digest::validate(&image.name).is_ok() {
        return true;
    }
    match Reference::parse(&image.name) {
        Ok(r) => r.tag.is_none() && !r.is_ipfs(),
        Err(_) => true,
    }
}

/// `until` cut-off: `now - <go duration>`, or an absolute timestamp.
pub fn parse_until(value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Some(d) = parse_go_duration(value) {
        return Ok(now - d);
    }
    parse_timestamp(value).ok_or_else(|| {
        CaskError::invalid(format!(
            "invalid until filter \"{value}\" (expected a duration such as 1h30m or a timestamp)"
        ))
    })
}

/// Parse a Go duration string (`300ms`, `-1.5h`, `2h45m`).
pub fn parse_go_duration(s: &str) -> Option<chrono::Duration> {
    let (negative, mut rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if rest == "0" {
        return Some(chrono::Duration::zero());
    }
    if rest.is_empty() {
        return None;
    }

    let mut total_nanos: f64 = 0.0;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        rest = &rest[unit_end..];
        total_nanos += value * unit;
    }
    if !total_nanos.is_finite() || total_nanos > i64::MAX as f64 {
        return None;
    }
    let d = chrono::Duration::nanoseconds(total_nanos as i64);
    Some(if negative { -d } else { d })
}

/// RFC 3339, `YYYY-MM-DDTHH:MM:SS`, `YYYY-MM-DD` or Unix seconds.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&t));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|t| Utc.from_utc_datetime(&t));
    }
    let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs: i64 = secs.parse().ok()?;
    let nanos: u32 = if frac.is_empty() {
        0
    } else {
        format!("{:0<9}", &frac[..frac.len().min(9)]).parse().ok()?
    };
    Utc.timestamp_opt(secs, nanos).single()
}
