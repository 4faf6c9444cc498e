//! Platforms and the platform matcher.
//!
//! A [`MatchComparer`] answers two questions about a platform found in an
//! index or config: does it match the request, and how does it rank
//! against another match. The request is one of:
//!
//! - all platforms,
//! - the host platform only (strict, the default),
//! - an ordered list of user-supplied platforms, earlier ranking higher.

use std::fmt;
use std::path::Path;

use cask_core::error::{CaskError, Result};
use serde::{Deserialize, Serialize};

/// An OCI platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

impl Platform {
    /// Parse `<os>[/<arch>[/<variant>]]`. A lone architecture (`arm64`) is
    /// taken as a Linux platform.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let invalid = || CaskError::invalid(format!("invalid platform \"{spec}\""));
        let parts: Vec<&str> = spec.split('/').collect();
        if spec.is_empty() || parts.iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }
        let platform = match parts.as_slice() {
            [single] if is_known_os(single) => Platform {
                os: single.to_string(),
                architecture: host_arch().0,
                ..Default::default()
            },
            [single] => Platform {
                os: "linux".to_string(),
                architecture: single.to_string(),
                ..Default::default()
            },
            [os, arch] => Platform {
                os: os.to_string(),
                architecture: arch.to_string(),
                ..Default::default()
            },
            [os, arch, variant] => Platform {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: variant.to_string(),
                ..Default::default()
            },
            _ => return Err(invalid()),
        };
        Ok(platform.normalize())
    }

    /// The default platform of this host.
    pub fn host() -> Self {
        let (architecture, variant) = host_arch();
        Platform {
            os: "linux".to_string(),
            architecture,
            variant,
            ..Default::default()
        }
    }

    /// Normalize architecture aliases and default variants.
    pub fn normalize(mut self) -> Self {
        self.os = self.os.to_lowercase();
        let (arch, variant) = normalize_arch(&self.architecture, &self.variant);
        self.architecture = arch;
        self.variant = variant;
        self
    }

    fn same(&self, other: &Platform) -> bool {
        let a = self.clone().normalize();
        let b = other.clone().normalize();
        a.os == b.os
            && a.architecture == b.architecture
            && (a.variant == b.variant || a.variant.is_empty() || b.variant.is_empty())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if !self.variant.is_empty() {
            write!(f, "/{}", self.variant)?;
        }
        Ok(())
    }
}

impl From<&oci_spec::image::Platform> for Platform {
    fn from(p: &oci_spec::image::Platform) -> Self {
        Self {
            architecture: p.architecture().to_string(),
            os: p.os().to_string(),
            os_version: p.os_version().clone().unwrap_or_default(),
            os_features: p.os_features().clone().unwrap_or_default(),
            variant: p.variant().clone().unwrap_or_default(),
        }
    }
}

impl Platform {
    pub fn to_oci(&self) -> Result<oci_spec::image::Platform> {
        let mut builder = oci_spec::image::PlatformBuilder::default()
            .architecture(oci_spec::image::Arch::from(self.architecture.as_str()))
            .os(oci_spec::image::Os::from(self.os.as_str()));
        if !self.os_version.is_empty() {
            builder = builder.os_version(self.os_version.clone());
        }
        if !self.os_features.is_empty() {
            builder = builder.os_features(self.os_features.clone());
        }
        if !self.variant.is_empty() {
            builder = builder.variant(self.variant.clone());
        }
        builder.build().map_err(crate::manifest::spec_error)
    }
}

fn is_known_os(s: &str) -> bool {
    matches!(
        s.to_lowercase().as_str(),
        "linux" | "windows" | "darwin" | "freebsd" | "netbsd" | "openbsd" | "solaris" | "illumos"
    )
}

fn host_arch() -> (String, String) {
    normalize_arch(std::env::consts::ARCH, "")
}

fn normalize_arch(arch: &str, variant: &str) -> (String, String) {
    let arch = arch.to_lowercase();
    let variant = variant.to_lowercase();
    match arch.as_str() {
        "i386" | "i686" | "x86" => ("386".to_string(), String::new()),
        "x86_64" | "x86-64" | "amd64" => {
            let variant = if variant == "v1" { String::new() } else { variant };
            ("amd64".to_string(), variant)
        }
        "aarch64" | "arm64" => {
            let variant = match variant.as_str() {
                "8" | "v8" | "" => "v8".to_string(),
                _ => variant,
            };
            ("arm64".to_string(), variant)
        }
        "armhf" => ("arm".to_string(), "v7".to_string()),
        "armel" => ("arm".to_string(), "v6".to_string()),
        "arm" => {
            let variant = match variant.as_str() {
                "" | "7" => "v7".to_string(),
                "5" | "6" | "8" => format!("v{variant}"),
                _ => variant,
            };
            ("arm".to_string(), variant)
        }
        _ => (arch, variant),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    All,
    /// Host default; only the host platform matches.
    Strict(Platform),
    Ordered(Vec<Platform>),
}

/// Platform predicate plus ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchComparer {
    kind: Kind,
}

impl MatchComparer {
    /// Build a matcher from the `--all-platforms` flag and `--platform`
    /// values. Comma-separated values are split.
    pub fn new(all: bool, platforms: &[String]) -> Result<Self> {
        if all {
            return Ok(Self::all());
        }
        let parsed = platforms
            .iter()
            .flat_map(|p| p.split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(Platform::parse)
            .collect::<Result<Vec<_>>>()?;
        if parsed.is_empty() {
            Ok(Self::host())
        } else {
            Ok(Self {
                kind: Kind::Ordered(parsed),
            })
        }
    }

    pub fn all() -> Self {
        Self { kind: Kind::All }
    }

    pub fn host() -> Self {
        Self {
            kind: Kind::Strict(Platform::host()),
        }
    }

    /// Matcher for exactly one platform.
    pub fn only(platform: Platform) -> Self {
        Self {
            kind: Kind::Ordered(vec![platform.normalize()]),
        }
    }

    pub fn is_all(&self) -> bool {
        self.kind == Kind::All
    }

    /// True when the matcher selects exactly one platform.
    pub fn is_single(&self) -> bool {
        match &self.kind {
            Kind::All => false,
            Kind::Strict(_) => true,
            Kind::Ordered(ps) => ps.len() == 1,
        }
    }

    /// The requested platforms, best first. Empty for all platforms.
    pub fn platforms(&self) -> Vec<Platform> {
        match &self.kind {
            Kind::All => Vec::new(),
            Kind::Strict(p) => vec![p.clone()],
            Kind::Ordered(ps) => ps.clone(),
        }
    }

    pub fn matches(&self, platform: &Platform) -> bool {
        self.rank(platform).is_some()
    }

    /// True if `a` ranks strictly higher than `b`.
    pub fn less(&self, a: &Platform, b: &Platform) -> bool {
        match (self.rank(a), self.rank(b)) {
            (Some(ra), Some(rb)) => ra < rb,
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn rank(&self, platform: &Platform) -> Option<usize> {
        match &self.kind {
            Kind::All => {
                if Platform::host().same(platform) {
                    Some(0)
                } else {
                    Some(1)
                }
            }
            Kind::Strict(host) => host.same(platform).then_some(0),
            Kind::Ordered(ps) => ps.iter().position(|p| p.same(platform)),
        }
    }
}

/// Whether this host can execute binaries for `platform`, natively or
/// through a registered binfmt_misc handler.
pub fn can_exec(platform: &Platform) -> bool {
    if Platform::host().same(platform) {
        return true;
    }
    if platform.os != "linux" {
        return false;
    }
    let qemu_arch = match platform.architecture.as_str() {
        "amd64" => "x86_64",
        "arm64" => "aarch64",
        "386" => "i386",
        other => other,
    };
    binfmt_enabled(&Path::new("/proc/sys/fs/binfmt_misc").join(format!("qemu-{qemu_arch}")))
}

fn binfmt_enabled(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(content) => content.lines().next().map(str::trim) == Some("enabled"),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "No binfmt_misc handler");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Platform {
        Platform::parse(s).unwrap()
    }

    #[test]
    fn test_parse_and_normalize() {
        assert_eq!(p("linux/x86_64").architecture, "amd64");
        let arm64 = p("linux/aarch64");
        assert_eq!(arm64.architecture, "arm64");
        assert_eq!(arm64.variant, "v8");
        let armhf = p("linux/armhf");
        assert_eq!((armhf.architecture.as_str(), armhf.variant.as_str()), ("arm", "v7"));
        let armel = p("linux/armel");
        assert_eq!(armel.variant, "v6");
        assert_eq!(p("linux/arm/7").variant, "v7");
        assert_eq!(p("arm64").os, "linux");
        assert_eq!(p("linux/amd64").to_string(), "linux/amd64");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Platform::parse("").is_err());
        assert!(Platform::parse("linux//amd64").is_err());
        assert!(Platform::parse("a/b/c/d").is_err());
    }

    #[test]
    fn test_strict_host_default() {
        let m = MatchComparer::new(false, &[]).unwrap();
        assert!(m.is_single());
        assert!(m.matches(&Platform::host()));
        let other = if Platform::host().architecture == "amd64" {
            p("linux/s390x")
        } else {
            p("linux/amd64")
        };
        assert!(!m.matches(&other));
    }

    #[test]
    fn test_ordered_ranking() {
        let m = MatchComparer::new(false, &["linux/arm64,linux/amd64".to_string()]).unwrap();
        let amd = p("linux/amd64");
        let arm = p("linux/arm64");
        assert!(m.matches(&amd));
        assert!(m.matches(&arm));
        assert!(!m.matches(&p("linux/ppc64le")));
        assert!(m.less(&arm, &amd));
        assert!(!m.less(&amd, &arm));
    }

    #[test]
    fn test_arm64_without_variant_matches() {
        let m = MatchComparer::only(p("linux/arm64"));
        let bare = Platform {
            os: "linux".to_string(),
            architecture: "arm64".to_string(),
            ..Default::default()
        };
        assert!(m.matches(&bare));
    }

    #[test]
    fn test_all_matches_everything() {
        let m = MatchComparer::new(true, &["linux/amd64".to_string()]).unwrap();
        assert!(m.is_all());
        assert!(m.matches(&p("windows/amd64")));
        assert!(m.less(&Platform::host(), &p("linux/s390x")) || Platform::host().architecture == "s390x");
    }

    #[test]
    fn test_can_exec_host() {
        assert!(can_exec(&Platform::host()));
        assert!(!can_exec(&p("windows/amd64")));
    }

    #[test]
    fn test_serde_field_names() {
        let platform = Platform {
            os: "windows".to_string(),
            architecture: "amd64".to_string(),
            os_version: "10.0.17763".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&platform).unwrap();
        assert_eq!(json["os.version"], "10.0.17763");
        assert!(json.get("variant").is_none());
    }
}
