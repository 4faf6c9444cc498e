//! Mark-and-sweep garbage collection over blobs and snapshots.
//!
//! Roots are image targets, blobs labelled `containerd.io/gc.root`, and the
//! resources of unexpired leases. Edges follow `containerd.io/gc.ref.*`
//! labels on blobs and parent links between snapshots.

use std::collections::{HashMap, HashSet, VecDeque};

use cask_core::error::Result;
use chrono::Utc;

use super::{ContentStore, ImageService, LeaseManager, ResourceKind, Snapshotter};
use crate::context::OpContext;
use crate::labels;

/// What a collection removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub blobs_removed: usize,
    pub snapshots_removed: usize,
    pub bytes_reclaimed: u64,
    pub leases_expired: usize,
}

/// Run one collection.
pub async fn collect(
    ctx: &OpContext,
    content: &dyn ContentStore,
    images: &dyn ImageService,
    leases: &dyn LeaseManager,
    snapshotter: &dyn Snapshotter,
) -> Result<GcReport> {
    let mut report = GcReport::default();
    let snapshot_prefix = format!("{}/", snapshotter.name());

    let mut content_roots: Vec<String> = Vec::new();
    let mut snapshot_roots: Vec<String> = Vec::new();

    let now = Utc::now();
    for lease in leases.list(ctx).await? {
        if lease.is_expired(now) {
            leases.delete(ctx, &lease.id).await?;
            report.leases_expired += 1;
            tracing::debug!(lease = %lease.id, "Expired lease dropped");
            continue;
        }
        for resource in lease.resources {
            match resource.kind {
                ResourceKind::Content => content_roots.push(resource.id),
                ResourceKind::Snapshot => {
                    if let Some(key) = resource.id.strip_prefix(&snapshot_prefix) {
                        snapshot_roots.push(key.to_string());
                    }
                }
            }
        }
    }

    for image in images.list(ctx, &[]).await? {
        content_roots.push(image.target.digest);
    }

    let blobs = content.walk(ctx).await?;
    let blob_index: HashMap<&str, usize> = blobs
        .iter()
        .enumerate()
        .map(|(i, b)| (b.digest.as_str(), i))
        .collect();
    for blob in &blobs {
        if blob.labels.contains_key(labels::GC_ROOT) {
            content_roots.push(blob.digest.clone());
        }
    }

    // Mark content.
    let snapshot_label = labels::gc_snapshot_label(snapshotter.name());
    let mut marked: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = content_roots.into_iter().collect();
    while let Some(digest) = queue.pop_front() {
        ctx.check()?;
        if !marked.insert(digest.clone()) {
            continue;
        }
        let Some(&i) = blob_index.get(digest.as_str()) else {
            continue;
        };
        for (key, value) in &blobs[i].labels {
            if key.starts_with(labels::GC_REF_CONTENT) {
                queue.push_back(value.clone());
            } else if *key == snapshot_label {
                snapshot_roots.push(value.clone());
            }
        }
    }

    // Mark snapshots, keeping parents alive.
    let snapshots = snapshotter.list(ctx).await?;
    let parents: HashMap<&str, Option<&str>> = snapshots
        .iter()
        .map(|s| (s.name.as_str(), s.parent.as_deref()))
        .collect();
    let mut live_snapshots: HashSet<String> = HashSet::new();
    for root in snapshot_roots {
        let mut current = Some(root);
        while let Some(key) = current {
            if !live_snapshots.insert(key.clone()) {
                break;
            }
            current = parents
                .get(key.as_str())
                .and_then(|p| p.map(str::to_string));
        }
    }

    // Sweep content.
    for blob in &blobs {
        if marked.contains(&blob.digest) {
            continue;
        }
        content.delete(ctx, &blob.digest).await?;
        report.blobs_removed += 1;
        report.bytes_reclaimed += blob.size;
    }

    // Sweep snapshots, children first.
    let mut dead: Vec<(String, Option<String>)> = snapshots
        .iter()
        .filter(|s| !live_snapshots.contains(&s.name))
        .map(|s| (s.name.clone(), s.parent.clone()))
        .collect();
    while !dead.is_empty() {
        let has_children: HashSet<String> = dead.iter().filter_map(|(_, p)| p.clone()).collect();
        let (leaves, rest): (Vec<_>, Vec<_>) = dead
            .into_iter()
            .partition(|(name, _)| !has_children.contains(name));
        if leaves.is_empty() {
            break;
        }
        for (name, _) in leaves {
            let usage = snapshotter.usage(ctx, &name).await.unwrap_or_default();
            snapshotter.remove(ctx, &name).await?;
            report.snapshots_removed += 1;
            report.bytes_reclaimed += usage.size;
        }
        dead = rest;
    }

    tracing::debug!(
        blobs = report.blobs_removed,
        snapshots = report.snapshots_removed,
        bytes = report.bytes_reclaimed,
        "Garbage collection finished"
    );
    Ok(report)
}
