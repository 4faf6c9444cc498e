//! Content descriptors.

use std::collections::{BTreeMap, HashMap};

use cask_core::error::{CaskError, Result};
use oci_spec::image as oci;
use serde::{Deserialize, Serialize};

use crate::platform::Platform;

/// `(media type, digest, size)` plus optional annotations, URLs and platform.
/// The only handle the core uses to reach content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            urls: Vec::new(),
            annotations: BTreeMap::new(),
            platform: None,
        }
    }

    /// Descriptor of an in-memory blob.
    pub fn of(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, crate::digest::sha256_of(data), data.len() as u64)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn with_platform(mut self, platform: Option<Platform>) -> Self {
        self.platform = platform;
        self
    }

    /// The `oci_spec` form, for embedding in manifests and indexes.
    pub fn to_oci(&self) -> Result<oci::Descriptor> {
        let size = i64::try_from(self.size)
            .map_err(|_| CaskError::invalid(format!("descriptor size {} out of range", self.size)))?;
        let mut builder = oci::DescriptorBuilder::default()
            .media_type(oci::MediaType::from(self.media_type.as_str()))
            .digest(self.digest.clone())
            .size(size);
        if !self.urls.is_empty() {
            builder = builder.urls(self.urls.clone());
        }
        if !self.annotations.is_empty() {
            let annotations: HashMap<String, String> = self
                .annotations
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            builder = builder.annotations(annotations);
        }
        if let Some(platform) = &self.platform {
            builder = builder.platform(platform.to_oci()?);
        }
        builder.build().map_err(crate::manifest::spec_error)
    }
}

impl From<&oci::Descriptor> for Descriptor {
    fn from(d: &oci::Descriptor) -> Self {
        Self {
            media_type: d.media_type().to_string(),
            digest: d.digest().to_string(),
            // Negative sizes never match a blob and fail the size check on read.
            size: u64::try_from(d.size()).unwrap_or(u64::MAX),
            urls: d.urls().clone().unwrap_or_default(),
            annotations: d
                .annotations()
                .as_ref()
                .map(|a| a.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
            platform: d.platform().as_ref().map(Platform::from),
        }
    }
}
