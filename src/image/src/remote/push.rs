//! Pushing a local content graph to a registry.

use std::collections::HashSet;

use cask_core::error::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use super::Pusher;
use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::graph::{Node, MAX_JSON_BLOB};
use crate::media;
use crate::platform::MatchComparer;
use crate::store::ContentStore;

/// Push `root` and the part of its graph `matcher` selects, leaves first.
/// The root goes last, under `tag` when given. Non-distributable layers
/// are skipped.
pub async fn push_graph(
    cs: &dyn ContentStore,
    ctx: &OpContext,
    pusher: &dyn Pusher,
    root: &Descriptor,
    matcher: &MatchComparer,
    tag: Option<&str>,
) -> Result<()> {
    let seen = Mutex::new(HashSet::new());
    push_node(cs, ctx, pusher, root.clone(), matcher, tag, &seen).await
}

fn push_node<'a>(
    cs: &'a dyn ContentStore,
    ctx: &'a OpContext,
    pusher: &'a dyn Pusher,
    desc: Descriptor,
    matcher: &'a MatchComparer,
    tag: Option<&'a str>,
    seen: &'a Mutex<HashSet<String>>,
) -> BoxFuture<'a, Result<()>> {
    async move {
        ctx.check()?;
        if tag.is_none() && !seen.lock().insert(desc.digest.clone()) {
            return Ok(());
        }

        if !Node::has_children(&desc) {
            if media::is_nondistributable(&desc.media_type) {
                tracing::debug!(digest = %desc.digest, "Skipping non-distributable layer");
                return Ok(());
            }
            let data = cs.read_blob(ctx, &desc.digest, None).await?;
            pusher.push_blob(ctx, &desc, data).await?;
            tracing::debug!(digest = %desc.digest, size = desc.size, "Pushed blob");
            return Ok(());
        }

        let data = cs.read_blob(ctx, &desc.digest, Some(MAX_JSON_BLOB)).await?;
        let node = Node::parse(&desc, &data)?;
        for child in node.children_for(matcher) {
            push_node(cs, ctx, pusher, child, matcher, None, seen).await?;
        }
        pusher.push_manifest(ctx, &desc, data, tag).await?;
        tracing::debug!(digest = %desc.digest, tag = ?tag, "Pushed manifest");
        Ok(())
    }
    .boxed()
}
