//! Inspecting images.
//!
//! Native mode returns every matching record with its index, manifests and
//! configs; Docker mode folds records sharing a target into one document.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use cask_core::error::{CaskError, Result};
use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::context::OpContext;
use crate::descriptor::Descriptor;
use crate::digest;
use crate::dockercompat::{self, DockerImage};
use crate::graph::{self, read_json};
use crate::manifest::{ConfigExt, ImageConfiguration, ImageIndex, ImageManifest};
use crate::media;
use crate::platform::MatchComparer;
use crate::reference::Reference;
use crate::store::{ImageFilter, ImageRecord};

/// Time allowed to load one candidate.
const CANDIDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// `--mode`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InspectMode {
    #[default]
    DockerCompat,
    Native,
}

impl InspectMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "dockercompat" => Ok(InspectMode::DockerCompat),
            "native" => Ok(InspectMode::Native),
            other => Err(CaskError::invalid(format!(
                "unknown mode \"{other}\" (expected dockercompat or native)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NativeManifest {
    pub manifest_desc: Descriptor,
    pub manifest: ImageManifest,
    pub config_desc: Descriptor,
    pub config: ImageConfiguration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NativeImage {
    pub image: ImageRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_desc: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<ImageIndex>,
    pub manifests: Vec<NativeManifest>,
}

/// One inspect document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Inspected {
    Native(Box<NativeImage>),
    Docker(Box<DockerImage>),
}

/// Inspect each identifier in order. An identifier that matches nothing
/// is `NotFound`.
pub async fn inspect(
    client: &Client,
    ctx: &OpContext,
    identifiers: &[String],
    mode: InspectMode,
    matcher: &MatchComparer,
) -> Result<Vec<Inspected>> {
    let mut out = Vec::new();
    for id in identifiers {
        let (requested, candidates) = candidates(client, ctx, id).await?;
        if candidates.is_empty() {
            return Err(CaskError::not_found(format!("no such image: {id}")));
        }

        let mut natives = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let cctx = ctx.with_timeout(CANDIDATE_TIMEOUT);
            match cctx.run(load_native(client, &cctx, candidate, matcher)).await {
                Ok(native) => natives.push(native),
                Err(e) => {
                    tracing::warn!(image = %candidate.name, error = %e, "Failed to inspect candidate");
                }
            }
        }
        if natives.is_empty() {
            return Err(CaskError::not_found(format!(
                "no manifest of {id} matches the requested platform"
            )));
        }

        match mode {
            InspectMode::Native => out.extend(natives.into_iter().map(|n| Inspected::Native(Box::new(n)))),
            InspectMode::DockerCompat => {
                for docker in fold_docker(client, ctx, &natives, &candidates, requested.as_ref()).await? {
                    out.push(Inspected::Docker(Box::new(docker)));
                }
            }
        }
    }
    Ok(out)
}

/// Records an identifier names: by normalized name first, then by
/// `name@<digest or digest prefix>`, then by (possibly truncated) digest.
async fn candidates(
    client: &Client,
    ctx: &OpContext,
    id: &str,
) -> Result<(Option<Reference>, Vec<ImageRecord>)> {
    let images = client.images();
    let exact = images.list(ctx, &[ImageFilter::Name(id.to_string())]).await?;
    if let Some(first) = exact.first() {
        let records = images
            .list(ctx, &[ImageFilter::TargetDigest(first.target.digest.clone())])
            .await?;
        return Ok((None, records));
    }
    if let Some((name, prefix)) = pinned_prefix(id) {
        let Ok(named) = Reference::parse_normalized(name) else {
            return Ok((None, Vec::new()));
        };
        let want = named.familiar_name();
        let mut records = images
            .list(ctx, &[ImageFilter::TargetDigestPrefix(prefix.to_string())])
            .await?;
        let targets: BTreeSet<String> = records
            .iter()
            .filter(|r| Reference::parse(&r.name).map_or(false, |p| p.familiar_name() == want))
            .map(|r| r.target.digest.clone())
            .collect();
        records.retain(|r| targets.contains(&r.target.digest));
        return Ok((Some(named), records));
    }
    let parsed = Reference::parse_normalized(id).ok();
    if let Some(r) = &parsed {
        let named = images.list(ctx, &[ImageFilter::Name(r.to_string())]).await?;
        if let Some(first) = named.first() {
            let records = images
                .list(ctx, &[ImageFilter::TargetDigest(first.target.digest.clone())])
                .await?;
            return Ok((parsed.clone(), records));
        }
    }
    if digest::is_digest_query(id) {
        let hex = id.strip_prefix("sha256:").unwrap_or(id);
        let prefix = format!("sha256:{hex}");
        let records = images.list(ctx, &[ImageFilter::TargetDigestPrefix(prefix)]).await?;
        return Ok((None, records));
    }
    Ok((parsed, Vec::new()))
}

/// Split `name@algo:hex` where `hex` may be truncated. Returns the name and
/// the `algo:hex` prefix.
fn pinned_prefix(id: &str) -> Option<(&str, &str)> {
    let (name, pinned) = id.split_once('@')?;
    let (algo, hex) = pinned.split_once(':')?;
    let algo_ok = !algo.is_empty() && algo.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    (algo_ok && digest::is_lower_hex(hex) && !name.is_empty()).then_some((name, pinned))
}

async fn load_native(
    client: &Client,
    ctx: &OpContext,
    image: &ImageRecord,
    matcher: &MatchComparer,
) -> Result<NativeImage> {
    let cs = client.content();
    let (index_desc, index) = if media::is_index(&image.target.media_type) {
        let index: ImageIndex = read_json(cs, ctx, &image.target).await?;
        (Some(image.target.clone()), Some(index))
    } else {
        (None, None)
    };
    let manifests = graph::manifests_for(cs, ctx, &image.target, matcher)
        .await?
        .into_iter()
        .map(|pm| NativeManifest {
            manifest_desc: pm.desc,
            manifest: pm.manifest,
            config_desc: pm.config_desc,
            config: pm.config,
        })
        .collect::<Vec<_>>();
    if manifests.is_empty() {
        return Err(CaskError::not_found(format!(
            "no manifest of {} matches the requested platform",
            image.name
        )));
    }
    Ok(NativeImage {
        image: image.clone(),
        index_desc,
        index,
        manifests,
    })
}

/// One Docker document per distinct target. The representative is the
/// record whose familiar name matches the request, else the first.
async fn fold_docker(
    client: &Client,
    ctx: &OpContext,
    natives: &[NativeImage],
    candidates: &[ImageRecord],
    requested: Option<&Reference>,
) -> Result<Vec<DockerImage>> {
    let mut by_target: BTreeMap<&str, Vec<&NativeImage>> = BTreeMap::new();
    let mut order = Vec::new();
    for native in natives {
        let key = native.image.target.digest.as_str();
        if !by_target.contains_key(key) {
            order.push(key);
        }
        by_target.entry(key).or_default().push(native);
    }

    let mut out = Vec::with_capacity(order.len());
    for key in order {
        let group = &by_target[key];
        let chosen = requested
            .and_then(|req| {
                let want = req.familiar_name();
                group.iter().find(|n| {
                    Reference::parse(&n.image.name).map_or(false, |r| r.familiar_name() == want)
                })
            })
            .unwrap_or(&group[0]);
        let same: Vec<&ImageRecord> = candidates.iter().filter(|c| c.target.digest == key).collect();
        let Some(m) = chosen.manifests.first() else {
            continue;
        };
        let pm = graph::PlatformManifest {
            desc: m.manifest_desc.clone(),
            manifest: m.manifest.clone(),
            config_desc: m.config_desc.clone(),
            platform: m.config.to_platform(),
            config: m.config.clone(),
        };
        let size = graph::image_size(client.snapshotter(), ctx, &pm).await?;
        let size = if size.unpacked > 0 { size.unpacked } else { size.packed };
        out.push(dockercompat::image_from_native(
            &chosen.image,
            &same,
            &m.config_desc.digest,
            &m.config,
            size,
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::convert::tests::{docker_image, layer_tar, test_client};

    #[tokio::test]
    async fn test_native_and_docker_modes() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let image = docker_image(&client, &ctx, "docker.io/library/app:1", &[layer_tar(&[("a", b"a")])]).await;
        client
            .images()
            .create(&ctx, ImageRecord::new("docker.io/library/app:2", image.target.clone()))
            .await
            .unwrap();

        let native = inspect(&client, &ctx, &["app:1".to_string()], InspectMode::Native, &MatchComparer::all())
            .await
            .unwrap();
        assert_eq!(native.len(), 2);
        let json = serde_json::to_value(&native[0]).unwrap();
        assert!(json["Image"]["name"].is_string());
        assert_eq!(json["Manifests"][0]["ManifestDesc"]["digest"], image.target.digest);

        let docker = inspect(&client, &ctx, &["app:2".to_string()], InspectMode::DockerCompat, &MatchComparer::all())
            .await
            .unwrap();
        assert_eq!(docker.len(), 1);
        let Inspected::Docker(d) = &docker[0] else {
            panic!("expected docker document");
        };
        assert_eq!(d.repo_tags, vec!["app:1", "app:2"]);
        assert_eq!(d.metadata.last_tag_time.map(|t| t.timestamp() > 0), Some(true));
        assert!(d.id.starts_with("sha256:"));
    }

    #[tokio::test]
    async fn test_by_digest_prefix_and_missing() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let image = docker_image(&client, &ctx, "docker.io/library/app:1", &[layer_tar(&[("a", b"a")])]).await;
        let id = digest::short_id(&image.target.digest).to_string();

        let found = inspect(&client, &ctx, &[id], InspectMode::Native, &MatchComparer::all())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let err = inspect(&client, &ctx, &["nope".to_string()], InspectMode::Native, &MatchComparer::all())
            .await
            .unwrap_err();
        assert!(err.is(cask_core::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_every_reference_form_finds_one_image() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let image = docker_image(&client, &ctx, "docker.io/library/busybox:latest", &[layer_tar(&[("bin/sh", b"#!")])]).await;
        let full = image.target.digest.clone();
        let short = format!("sha256:{}", &digest::encoded(&full)[..8]);

        for name in ["busybox", "docker.io/library/busybox", "registry-1.docker.io/library/busybox"] {
            for tag in ["", ":latest"] {
                for suffix in [String::new(), format!("@{full}"), format!("@{short}")] {
                    let id = format!("{name}{tag}{suffix}");
                    for mode in [InspectMode::Native, InspectMode::DockerCompat] {
                        let found = inspect(&client, &ctx, &[id.clone()], mode, &MatchComparer::all())
                            .await
                            .unwrap_or_else(|e| panic!("{id}: {e}"));
                        assert_eq!(found.len(), 1, "{id}");
                        match &found[0] {
                            Inspected::Native(n) => assert_eq!(n.image.target.digest, full, "{id}"),
                            Inspected::Docker(d) => assert_eq!(d.repo_tags, vec!["busybox:latest"], "{id}"),
                        }
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_pinned_prefix_requires_matching_name() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let image = docker_image(&client, &ctx, "docker.io/library/busybox:latest", &[layer_tar(&[("a", b"a")])]).await;
        let short = &digest::encoded(&image.target.digest)[..8];

        let err = inspect(&client, &ctx, &[format!("alpine@sha256:{short}")], InspectMode::Native, &MatchComparer::all())
            .await
            .unwrap_err();
        assert!(err.is(cask_core::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_name_wins_over_digest_prefix() {
        let tmp = TempDir::new().unwrap();
        let client = test_client(&tmp);
        let ctx = client.context();
        let busybox = docker_image(&client, &ctx, "docker.io/library/busybox:latest", &[layer_tar(&[("b", b"busybox")])]).await;
        let alpine = docker_image(&client, &ctx, "docker.io/library/alpine:latest", &[layer_tar(&[("a", b"alpine")])]).await;
        let short = digest::encoded(&busybox.target.digest)[..8].to_string();
        client
            .images()
            .create(&ctx, ImageRecord::new(format!("docker.io/library/{short}:latest"), alpine.target.clone()))
            .await
            .unwrap();

        let found = inspect(&client, &ctx, &[short], InspectMode::Native, &MatchComparer::all())
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        for doc in &found {
            let Inspected::Native(n) = doc else {
                panic!("expected native document");
            };
            assert_eq!(n.image.target.digest, alpine.target.digest);
        }
    }

    #[test]
    fn test_pinned_prefix_split() {
        assert_eq!(pinned_prefix("busybox@sha256:7926f92e"), Some(("busybox", "sha256:7926f92e")));
        assert_eq!(pinned_prefix("busybox:1@sha256:ab"), Some(("busybox:1", "sha256:ab")));
        assert_eq!(pinned_prefix("busybox@sha256:"), None);
        assert_eq!(pinned_prefix("busybox@sha256:XYZ"), None);
        assert_eq!(pinned_prefix("@sha256:ab"), None);
        assert_eq!(pinned_prefix("busybox"), None);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(InspectMode::parse("native").unwrap(), InspectMode::Native);
        assert_eq!(InspectMode::parse("").unwrap(), InspectMode::DockerCompat);
        assert!(InspectMode::parse("x").is_err());
    }
}
