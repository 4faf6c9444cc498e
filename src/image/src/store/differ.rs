//! Layer application and directory diffing.
//!
//! `apply` unpacks a (possibly compressed) layer tarball into a snapshot
//! mount, honoring OCI whiteouts. `compare` produces the layer that turns
//! `lower` into `upper`.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use cask_core::error::{CaskError, Result};

use super::{write_file, ContentStore, Differ};
use crate::compression;
use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::digest::{DigestingReader, DigestingWriter};
use crate::labels;
use crate::media;

/// Prefix marking a deleted entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marks a directory whose lower contents are hidden.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// Differ over the local content store.
#[derive(Clone)]
pub struct LocalDiffer {
    content: Arc<dyn ContentStore>,
}

impl LocalDiffer {
    pub fn new(content: Arc<dyn ContentStore>) -> Self {
        Self { content }
    }
}

#[async_trait]
impl Differ for LocalDiffer {
    async fn apply(&self, ctx: &OpContext, layer: &Descriptor, mount: &Path) -> Result<String> {
        if media::is_encrypted(&layer.media_type) {
            return Err(CaskError::DecryptionFailed(format!(
                "layer {} is encrypted",
                layer.digest
            )));
        }
        let blob = self.content.open_blob(ctx, &layer.digest).await?;
        let mount = mount.to_path_buf();
        let digest = layer.digest.clone();
        let diff_id = ctx
            .run(async move {
                tokio::task::spawn_blocking(move || apply_tar(blob, &mount))
                    .await
                    .map_err(|e| CaskError::Other(format!("apply task failed: {e}")))?
                    .map_err(|e| CaskError::IntegrityError {
                        digest,
                        message: format!("failed to apply layer: {e}"),
                    })
            })
            .await?;
        tracing::debug!(layer = %layer.digest, diff_id = %diff_id, "Layer applied");
        Ok(diff_id)
    }

    async fn compare(
        &self,
        ctx: &OpContext,
        lower: &Path,
        upper: &Path,
        media_type: &str,
    ) -> Result<(Descriptor, String)> {
        let lower = lower.to_path_buf();
        let upper = upper.to_path_buf();
        let compression = media::compression(media_type);
        let (blob, digest, size, diff_id) = tokio::task::spawn_blocking(move || {
            let changes = diff_trees(&lower, &upper)?;
            let tar = tempfile::NamedTempFile::new()?;
            let writer = DigestingWriter::new(tar.reopen()?);
            let (_, diff_id, _) = write_changes(&upper, &changes, writer)?;

            let blob = tempfile::NamedTempFile::new()?;
            let writer = DigestingWriter::new(blob.reopen()?);
            let writer = compression::compress(compression, None, tar.reopen()?, writer)?;
            let (_, digest, size) = writer.finish();
            Ok::<_, std::io::Error>((blob, digest, size, diff_id))
        })
        .await
        .map_err(|e| CaskError::Other(format!("diff task failed: {e}")))??;

        let desc = Descriptor::new(media_type, digest, size);
        let mut blob_labels = BTreeMap::new();
        blob_labels.insert(labels::UNCOMPRESSED.to_string(), diff_id.clone());
        write_file(self.content.as_ref(), ctx, &desc, blob.path(), blob_labels).await?;
        tracing::debug!(layer = %desc.digest, diff_id = %diff_id, "Diff committed");
        Ok((desc, diff_id))
    }
}

/// Apply a layer stream onto `mount` and return the diff ID of its
/// uncompressed contents.
pub fn apply_tar<R: Read + Send>(reader: R, mount: &Path) -> std::io::Result<String> {
    let (_, decoded) = compression::decompress(reader)?;
    let mut archive = tar::Archive::new(DigestingReader::new(decoded));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    std::fs::create_dir_all(mount)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let Some(rel) = clean_path(&entry.path()?) else {
            continue;
        };
        let Some(name) = rel.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        let parent = mount.join(rel.parent().unwrap_or(Path::new("")));

        if name == WHITEOUT_OPAQUE {
            if let Ok(children) = std::fs::read_dir(&parent) {
                for child in children {
                    remove_path(&child?.path())?;
                }
            }
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            remove_path(&parent.join(hidden))?;
            continue;
        }

        let target = mount.join(&rel);
        if let Ok(existing) = std::fs::symlink_metadata(&target) {
            let both_dirs = existing.is_dir() && entry.header().entry_type().is_dir();
            if !both_dirs {
                remove_path(&target)?;
            }
        }
        entry.unpack_in(mount)?;
    }

    let (diff_id, _) = archive.into_inner().finish()?;
    Ok(diff_id)
}

/// Relative path of a tar entry; `None` for the root or paths escaping it.
fn clean_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq)]
struct EntryState {
    is_dir: bool,
    size: u64,
    mode: u32,
    mtime: i64,
    link: Option<PathBuf>,
}

/// A change between two trees.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Change {
    /// Added or modified in `upper`.
    Upsert(PathBuf),
    /// Present in `lower` only.
    Delete(PathBuf),
}

fn capture(root: &Path) -> std::io::Result<HashMap<PathBuf, EntryState>> {
    use std::os::unix::fs::MetadataExt;

    let mut entries = HashMap::new();
    if !root.exists() {
        return Ok(entries);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let metadata = std::fs::symlink_metadata(&path)?;
            let relative = path
                .strip_prefix(root)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
                .to_path_buf();
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0);
            let link = if metadata.file_type().is_symlink() {
                Some(std::fs::read_link(&path)?)
            } else {
                None
            };
            if metadata.is_dir() {
                stack.push(path);
            }
            entries.insert(
                relative,
                EntryState {
                    is_dir: metadata.is_dir(),
                    size: metadata.len(),
                    mode: metadata.mode(),
                    mtime,
                    link,
                },
            );
        }
    }
    Ok(entries)
}

/// Changes turning `lower` into `upper`, parents before children.
pub fn diff_trees(lower: &Path, upper: &Path) -> std::io::Result<Vec<Change>> {
    let before = capture(lower)?;
    let after = capture(upper)?;
    let mut changes = Vec::new();

    for (path, state) in &after {
        match before.get(path) {
            Some(old) if old == state => {}
            Some(old) if old.is_dir && state.is_dir && old.mode == state.mode => {}
            _ => changes.push(Change::Upsert(path.clone())),
        }
    }
    for path in before.keys() {
        if after.contains_key(path) {
            continue;
        }
        let parent_deleted = path
            .parent()
            .map(|p| !p.as_os_str().is_empty() && !after.contains_key(p))
            .unwrap_or(false);
        if !parent_deleted {
            changes.push(Change::Delete(path.clone()));
        }
    }
    changes.sort_by(|a, b| change_path(a).cmp(change_path(b)));
    Ok(changes)
}

fn change_path(change: &Change) -> &Path {
    match change {
        Change::Upsert(p) | Change::Delete(p) => p,
    }
}

/// Write `changes` as an uncompressed tar and return the writer's digest.
fn write_changes<W: std::io::Write>(
    upper: &Path,
    changes: &[Change],
    writer: DigestingWriter<W>,
) -> std::io::Result<(W, String, u64)> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    for change in changes {
        match change {
            Change::Upsert(rel) => {
                let full = upper.join(rel);
                let metadata = std::fs::symlink_metadata(&full)?;
                if metadata.is_dir() {
                    builder.append_dir(rel, &full)?;
                } else {
                    builder.append_path_with_name(&full, rel)?;
                }
            }
            Change::Delete(rel) => {
                let name = rel
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let whiteout = rel
                    .parent()
                    .unwrap_or(Path::new(""))
                    .join(format!("{WHITEOUT_PREFIX}{name}"));
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(0);
                header.set_mode(0o644);
                header.set_mtime(0);
                builder.append_data(&mut header, whiteout, std::io::empty())?;
            }
        }
    }
    let writer = builder.into_inner()?;
    Ok(writer.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalContentStore, LocalLeaseManager};
    use std::fs;
    use tempfile::TempDir;

    fn layer(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_apply_tar_returns_uncompressed_digest() {
        let tmp = TempDir::new().unwrap();
        let tar = layer(&[("etc/hostname", b"box"), ("bin/sh", b"#!")]);
        let gz = compression::gzip_all(&tar).unwrap();

        let diff_id = apply_tar(&gz[..], tmp.path()).unwrap();
        assert_eq!(diff_id, crate::digest::sha256_of(&tar));
        assert_eq!(fs::read_to_string(tmp.path().join("etc/hostname")).unwrap(), "box");
    }

    #[test]
    fn test_apply_whiteouts() {
        let tmp = TempDir::new().unwrap();
        apply_tar(
            &layer(&[("a.txt", b"a"), ("dir/x", b"x"), ("opq/y", b"y")])[..],
            tmp.path(),
        )
        .unwrap();
        apply_tar(
            &layer(&[(".wh.a.txt", b""), ("dir/.wh.x", b""), ("opq/.wh..wh..opq", b"")])[..],
            tmp.path(),
        )
        .unwrap();
        assert!(!tmp.path().join("a.txt").exists());
        assert!(!tmp.path().join("dir/x").exists());
        assert!(tmp.path().join("dir").is_dir());
        assert!(tmp.path().join("opq").is_dir());
        assert!(!tmp.path().join("opq/y").exists());
        assert!(!tmp.path().join(".wh.a.txt").exists());
    }

    #[test]
    fn test_apply_skips_escaping_paths() {
        assert_eq!(clean_path(Path::new("../etc/passwd")), None);
        assert_eq!(clean_path(Path::new("./")), None);
        assert_eq!(
            clean_path(Path::new("/usr/bin/env")),
            Some(PathBuf::from("usr/bin/env"))
        );
    }

    #[test]
    fn test_diff_trees() {
        let tmp = TempDir::new().unwrap();
        let lower = tmp.path().join("lower");
        let upper = tmp.path().join("upper");
        fs::create_dir_all(lower.join("gone")).unwrap();
        fs::write(lower.join("gone/file"), "g").unwrap();
        fs::write(lower.join("keep"), "k").unwrap();
        fs::write(lower.join("removed"), "r").unwrap();
        fs::create_dir_all(&upper).unwrap();
        fs::copy(lower.join("keep"), upper.join("keep")).unwrap();
        let mtime = fs::metadata(lower.join("keep")).unwrap().modified().unwrap();
        fs::File::options()
            .write(true)
            .open(upper.join("keep"))
            .unwrap()
            .set_modified(mtime)
            .unwrap();
        fs::write(upper.join("new"), "n").unwrap();

        let changes = diff_trees(&lower, &upper).unwrap();
        assert_eq!(
            changes,
            vec![
                Change::Delete(PathBuf::from("gone")),
                Change::Upsert(PathBuf::from("new")),
                Change::Delete(PathBuf::from("removed")),
            ]
        );
    }

    #[tokio::test]
    async fn test_compare_then_apply() {
        let tmp = TempDir::new().unwrap();
        let leases = Arc::new(LocalLeaseManager::open(tmp.path()).unwrap());
        let content: Arc<dyn ContentStore> =
            Arc::new(LocalContentStore::open(tmp.path(), leases).unwrap());
        let differ = LocalDiffer::new(content.clone());
        let ctx = OpContext::new("default");

        let lower = tmp.path().join("lower");
        let upper = tmp.path().join("upper");
        fs::create_dir_all(&lower).unwrap();
        fs::write(lower.join("old"), "old").unwrap();
        fs::create_dir_all(&upper).unwrap();
        fs::write(upper.join("added"), "added").unwrap();

        let (desc, diff_id) = differ
            .compare(&ctx, &lower, &upper, media::OCI_LAYER_GZIP)
            .await
            .unwrap();
        let info = content.info(&ctx, &desc.digest).await.unwrap();
        assert_eq!(info.labels[labels::UNCOMPRESSED], diff_id);
        assert_eq!(info.size, desc.size);

        // Applying the diff on a copy of lower reproduces upper.
        let target = tmp.path().join("target");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("old"), "old").unwrap();
        let applied = differ.apply(&ctx, &desc, &target).await.unwrap();
        assert_eq!(applied, diff_id);
        assert!(!target.join("old").exists());
        assert_eq!(fs::read_to_string(target.join("added")).unwrap(), "added");
    }

    #[tokio::test]
    async fn test_apply_rejects_encrypted() {
        let tmp = TempDir::new().unwrap();
        let leases = Arc::new(LocalLeaseManager::open(tmp.path()).unwrap());
        let content: Arc<dyn ContentStore> =
            Arc::new(LocalContentStore::open(tmp.path(), leases).unwrap());
        let differ = LocalDiffer::new(content);
        let desc = Descriptor::of(format!("{}+encrypted", media::OCI_LAYER_GZIP), b"x");
        let err = differ
            .apply(&OpContext::new("default"), &desc, tmp.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), cask_core::ErrorKind::DecryptionFailed);
    }
}
