//! Finding image records from user requests.
//!
//! A request is matched two ways: as a reference (exact canonical name) and,
//! when it looks like a hex digest prefix, against the digests of stored
//! blobs. Records whose target is one of those digests match too.

use std::collections::BTreeSet;

use cask_core::error::{CaskError, Result};

use crate::context::OpContext;
use crate::digest;
use crate::reference::Reference;
use crate::store::{ContentStore, ImageFilter, ImageRecord, ImageService};

/// How many matches a caller accepts for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbiguityPolicy {
    /// Exactly one record.
    Unique,
    /// Any number of records as long as they share one target.
    UniqueTarget,
    /// Every match.
    All,
}

/// One matched record.
#[derive(Debug, Clone)]
pub struct Found {
    pub image: ImageRecord,
    pub req: String,
    pub match_index: usize,
    pub match_count: usize,
}

/// Records matching `req`: the exact-name match first, then the rest by name.
pub async fn find(
    cs: &dyn ContentStore,
    images: &dyn ImageService,
    ctx: &OpContext,
    req: &str,
) -> Result<(Option<ImageRecord>, Vec<ImageRecord>)> {
    let mut filters = Vec::new();
    let canonical = Reference::parse_normalized(req).ok().map(|r| r.to_string());
    if let Some(name) = &canonical {
        filters.push(ImageFilter::Name(name.clone()));
    }

    if digest::is_digest_query(req) {
        let prefix = req.strip_prefix("sha256:").unwrap_or(req);
        let digests: BTreeSet<String> = cs
            .walk(ctx)
            .await?
            .into_iter()
            .filter(|b| digest::encoded(&b.digest).starts_with(prefix))
            .map(|b| b.digest)
            .collect();
        filters.extend(digests.into_iter().map(ImageFilter::TargetDigest));
    }

    if filters.is_empty() {
        return Err(CaskError::InvalidReference {
            reference: req.to_string(),
            reason: "neither a reference nor a digest".to_string(),
        });
    }

    let mut records = images.list(ctx, &filters).await?;
    let exact = match &canonical {
        Some(name) => records
            .iter()
            .position(|r| &r.name == name)
            .map(|i| records.remove(i)),
        None => None,
    };
    Ok((exact, records))
}

/// Resolve `req` under `policy`. `NotFound` when nothing matches. An exact
/// name match wins over digest-prefix matches except under
/// [`AmbiguityPolicy::All`].
pub async fn walk(
    cs: &dyn ContentStore,
    images: &dyn ImageService,
    ctx: &OpContext,
    req: &str,
    policy: AmbiguityPolicy,
) -> Result<Vec<Found>> {
    let (exact, rest) = find(cs, images, ctx, req).await?;

    let matches: Vec<ImageRecord> = match (exact, policy) {
        (Some(exact), AmbiguityPolicy::All) => std::iter::once(exact).chain(rest).collect(),
        (Some(exact), _) => vec![exact],
        (None, _) => rest,
    };

    if matches.is_empty() {
        return Err(CaskError::not_found(format!("image \"{req}\"")));
    }
    match policy {
        AmbiguityPolicy::Unique if matches.len() > 1 => {
            return Err(CaskError::Ambiguous {
                query: req.to_string(),
                count: matches.len(),
            })
        }
        AmbiguityPolicy::UniqueTarget => {
            let targets: BTreeSet<&str> = matches.iter().map(|m| m.target.digest.as_str()).collect();
            if targets.len() > 1 {
                return Err(CaskError::Ambiguous {
                    query: req.to_string(),
                    count: targets.len(),
                });
            }
        }
        _ => {}
    }

    let count = matches.len();
    Ok(matches
        .into_iter()
        .enumerate()
        .map(|(i, image)| Found {
            image,
            req: req.to_string(),
            match_index: i,
            match_count: count,
        })
        .collect())
}

/// The single record `req` names.
pub async fn walk_one(
    cs: &dyn ContentStore,
    images: &dyn ImageService,
    ctx: &OpContext,
    req: &str,
) -> Result<ImageRecord> {
    let mut found = walk(cs, images, ctx, req, AmbiguityPolicy::Unique).await?;
    Ok(found.remove(0).image)
}
