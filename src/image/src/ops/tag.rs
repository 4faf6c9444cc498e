//! Tagging images.

use cask_core::error::Result;

use crate::client::Client;
use crate::context::OpContext;
use crate::ensure::ensure_content;
use crate::platform::MatchComparer;
use crate::reference::Reference;
use crate::store::ImageRecord;
use crate::walker::{self, AmbiguityPolicy};

/// Point `target` at the image `source` names. An existing `target` is
/// replaced.
pub async fn tag(client: &Client, ctx: &OpContext, source: &str, target: &str) -> Result<ImageRecord> {
    let name = Reference::parse_normalized(target)?.to_string();
    let found = walker::walk(client.content(), client.images(), ctx, source, AmbiguityPolicy::All).await?;
    let image = found[0].image.clone();

    let lease = client.lease(ctx, "tag").await?;
    let result = tag_leased(client, lease.context(), &image, name).await;
    lease.release().await?;
    result
}

async fn tag_leased(client: &Client, ctx: &OpContext, image: &ImageRecord, name: String) -> Result<ImageRecord> {
    if let Err(e) = ensure_content(client, ctx, image, &MatchComparer::all()).await {
        tracing::warn!(image = %image.name, error = %e, "Unable to fetch missing content");
    }

    let mut record = ImageRecord::new(name, image.target.clone());
    record.labels = image.labels.clone();
    let images = client.images();
    let created = match images.create(ctx, record.clone()).await {
        Err(e) if e.is(cask_core::ErrorKind::AlreadyExists) => {
            images.delete(ctx, &record.name).await?;
            images.create(ctx, record).await?
        }
        other => other?,
    };
    tracing::info!(source = %image.name, target = %created.name, "Tagged image");
    Ok(created)
}
