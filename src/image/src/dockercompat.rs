//! Docker-compatible `image inspect` projection.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manifest::{ConfigExt, ImageConfiguration};
use crate::reference::Reference;
use crate::store::ImageRecord;

/// `docker image inspect` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DockerImage {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub comment: String,
    pub created: String,
    pub author: String,
    pub config: Option<DockerConfig>,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
    pub os: String,
    pub size: i64,
    #[serde(rename = "RootFS")]
    pub root_fs: DockerRootFs,
    pub metadata: DockerMetadata,
}

/// Runtime defaults in Docker's field layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DockerConfig {
    pub hostname: String,
    pub domainname: String,
    pub user: String,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, Value>>,
    pub tty: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub image: String,
    pub volumes: Option<BTreeMap<String, Value>>,
    pub working_dir: String,
    pub entrypoint: Option<Vec<String>>,
    pub on_build: Option<Vec<String>>,
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DockerRootFs {
    #[serde(rename = "Type")]
    pub fs_type: String,
    pub layers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DockerMetadata {
    pub last_tag_time: Option<DateTime<Utc>>,
}

/// `RepoTags` and `RepoDigests` of the records sharing one target.
pub fn repo_names(records: &[&ImageRecord]) -> (Vec<String>, Vec<String>) {
    let mut tags = Vec::new();
    let mut digests = Vec::new();
    for record in records {
        let Ok(r) = Reference::parse(&record.name) else {
            continue;
        };
        if let Some(tag) = &r.tag {
            let tagged = format!("{}:{}", r.familiar_name(), tag);
            if !tags.contains(&tagged) {
                tags.push(tagged);
            }
        }
        let pinned = format!("{}@{}", r.familiar_name(), record.target.digest);
        if !digests.contains(&pinned) {
            digests.push(pinned);
        }
    }
    (tags, digests)
}

fn as_set(items: &Option<Vec<String>>) -> Option<BTreeMap<String, Value>> {
    items.as_ref().map(|items| {
        items
            .iter()
            .map(|i| (i.clone(), Value::Object(Default::default())))
            .collect()
    })
}

/// Project an image onto Docker's inspect layout. `records` are every
/// record sharing the image's target; `config_digest` is the image ID.
pub fn image_from_native(
    image: &ImageRecord,
    records: &[&ImageRecord],
    config_digest: &str,
    config: &ImageConfiguration,
    size: u64,
) -> DockerImage {
    let (repo_tags, repo_digests) = repo_names(records);
    let docker_config = config.config().as_ref().map(|c| DockerConfig {
        user: c.user().clone().unwrap_or_default(),
        exposed_ports: as_set(c.exposed_ports()),
        env: c.env().clone().unwrap_or_default(),
        cmd: c.cmd().clone(),
        volumes: as_set(c.volumes()),
        working_dir: c.working_dir().clone().unwrap_or_default(),
        entrypoint: c.entrypoint().clone(),
        labels: c
            .labels()
            .as_ref()
            .map(|l| l.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        stop_signal: c.stop_signal().clone(),
        ..Default::default()
    });
    DockerImage {
        id: config_digest.to_string(),
        repo_tags,
        repo_digests,
        comment: config
            .history()
            .last()
            .and_then(|h| h.comment().clone())
            .unwrap_or_default(),
        created: config.created().clone().unwrap_or_default(),
        author: config.author().clone().unwrap_or_default(),
        config: Some(docker_config.unwrap_or_default()),
        architecture: config.architecture().to_string(),
        variant: config.variant().clone().unwrap_or_default(),
        os: config.os().to_string(),
        size: i64::try_from(size).unwrap_or(i64::MAX),
        root_fs: DockerRootFs {
            fs_type: config.rootfs().typ().clone(),
            layers: config.layer_diff_ids().to_vec(),
        },
        metadata: DockerMetadata {
            last_tag_time: Some(image.updated_at),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use crate::media;

    #[test]
    fn test_projection() {
        let target = Descriptor::of(media::OCI_MANIFEST, b"m");
        let a = ImageRecord::new("docker.io/library/alpine:3.19", target.clone());
        let b = ImageRecord::new("docker.io/library/alpine:latest", target.clone());
        let config: ImageConfiguration = serde_json::from_str(
            r#"{
                "architecture": "amd64",
                "os": "linux",
                "author": "me",
                "created": "2024-01-02T03:04:05.123456789Z",
                "config": {"Env": ["PATH=/bin"], "Cmd": ["sh"], "ExposedPorts": {"80/tcp": {}}},
                "history": [{"comment": "squashed"}],
                "rootfs": {"type": "layers", "diff_ids": ["sha256:aa"]}
            }"#,
        )
        .unwrap();

        let docker = image_from_native(&a, &[&a, &b], "sha256:cfg", &config, 42);
        assert_eq!(docker.id, "sha256:cfg");
        assert_eq!(docker.repo_tags, vec!["alpine:3.19", "alpine:latest"]);
        assert_eq!(docker.repo_digests, vec![format!("alpine@{}", target.digest)]);
        assert_eq!(docker.comment, "squashed");
        assert_eq!(docker.created, "2024-01-02T03:04:05.123456789Z");
        assert_eq!(docker.author, "me");
        assert_eq!(docker.size, 42);

        let json = serde_json::to_value(&docker).unwrap();
        assert_eq!(json["RootFS"]["Type"], "layers");
        assert_eq!(json["RootFS"]["Layers"][0], "sha256:aa");
        assert_eq!(json["Config"]["Cmd"][0], "sh");
        assert_eq!(json["Config"]["ExposedPorts"]["80/tcp"], serde_json::json!({}));
        assert_eq!(json["Id"], "sha256:cfg");
        assert_eq!(json["Os"], "linux");
        assert_eq!(json["Architecture"], "amd64");
        assert!(json["Metadata"]["LastTagTime"].is_string());
    }
}
