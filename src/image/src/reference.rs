//! Image reference parsing.
//!
//! Parses every identifier form a user may type into a structured
//! [`Reference`]:
//!
//! - `busybox` → `docker.io/library/busybox` (`:latest` after normalization)
//! - `ghcr.io/org/image:tag@sha256:…`
//! - `localhost:5000/image`
//! - a bare IPFS CID, `ipfs://<cid>` or `ipns://<name>`
//!
//! Truncated digests are not references; see [`crate::digest::is_digest_query`].

use std::fmt;
use std::sync::OnceLock;

use cask_core::error::{CaskError, Result};
use glob::{MatchOptions, Pattern};
use regex::Regex;

/// Registry used when a reference carries no domain.
pub const DEFAULT_DOMAIN: &str = "docker.io";

/// Tag filled in by normalization when neither tag nor digest is given.
pub const DEFAULT_TAG: &str = "latest";

const LEGACY_DOMAINS: &[&str] = &["index.docker.io", "registry-1.docker.io"];
const OFFICIAL_PREFIX: &str = "library/";
const NAME_TOTAL_LENGTH_MAX: usize = 255;

/// Reference protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Registry reference.
    #[default]
    Registry,
    Ipfs,
    Ipns,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Registry => "",
            Protocol::Ipfs => "ipfs",
            Protocol::Ipns => "ipns",
        }
    }
}

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub protocol: Protocol,
    /// Registry host (`docker.io`, `localhost:5000`); empty for IPFS/IPNS.
    pub domain: String,
    /// Repository path, or the CID/name for IPFS/IPNS.
    pub path: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

fn path_component_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*$").expect("valid path regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("valid tag regex"))
}

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])(?:\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*|\[[a-fA-F0-9:]+\])(?::[0-9]+)?$",
        )
        .expect("valid domain regex")
    })
}

impl Reference {
    /// Parse a reference without normalization: a reference without tag and
    /// digest keeps `tag == None`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(invalid(raw, "empty reference"));
        }

        let (protocol, rest) = if let Some(rest) = raw.strip_prefix("ipfs://") {
            (Some(Protocol::Ipfs), rest)
        } else if let Some(rest) = raw.strip_prefix("ipns://") {
            (Some(Protocol::Ipns), rest)
        } else {
            (None, raw)
        };

        if is_cid(rest) {
            return Ok(Reference {
                protocol: protocol.unwrap_or(Protocol::Ipfs),
                domain: String::new(),
                path: rest.to_string(),
                tag: None,
                digest: None,
            });
        }
        match protocol {
            Some(Protocol::Ipns) if !rest.is_empty() && !rest.contains('/') => {
                return Ok(Reference {
                    protocol: Protocol::Ipns,
                    domain: String::new(),
                    path: rest.to_string(),
                    tag: None,
                    digest: None,
                });
            }
            Some(_) => return Err(invalid(raw, "not a valid CID")),
            None => {}
        }

        Self::parse_registry(raw)
    }

    /// Parse and normalize: a reference with neither tag nor digest gets `:latest`.
    pub fn parse_normalized(raw: &str) -> Result<Self> {
        Ok(Self::parse(raw)?.normalize())
    }

    fn parse_registry(raw: &str) -> Result<Self> {
        let (name_tag, digest) = match raw.split_once('@') {
            Some((name, digest)) => {
                crate::digest::validate(digest)?;
                (name, Some(digest.to_string()))
            }
            None => (raw, None),
        };

        let (name, tag) = match name_tag.rfind(':') {
            Some(colon) if !name_tag[colon + 1..].contains('/') => {
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            _ => (name_tag, None),
        };
        if let Some(tag) = &tag {
            if !tag_re().is_match(tag) {
                return Err(invalid(raw, "invalid tag"));
            }
        }
        if name.is_empty() {
            return Err(invalid(raw, "empty repository name"));
        }
        if name.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(invalid(
                raw,
                "repository name must not be more than 255 characters",
            ));
        }

        let (domain, path) = split_domain(name);
        if !domain_re().is_match(&domain) {
            return Err(invalid(raw, "invalid domain"));
        }
        for component in path.split('/') {
            if !path_component_re().is_match(component) {
                if component.chars().any(|c| c.is_ascii_uppercase())
                    && path_component_re().is_match(&component.to_lowercase())
                {
                    return Err(invalid(raw, "repository name must be lowercase"));
                }
                return Err(invalid(raw, "invalid repository name"));
            }
        }

        Ok(Reference {
            protocol: Protocol::Registry,
            domain,
            path,
            tag,
            digest,
        })
    }

    /// Fill in `latest` when there is neither tag nor digest.
    pub fn normalize(mut self) -> Self {
        if self.protocol == Protocol::Registry && self.tag.is_none() && self.digest.is_none() {
            self.tag = Some(DEFAULT_TAG.to_string());
        }
        self
    }

    pub fn is_ipfs(&self) -> bool {
        self.protocol != Protocol::Registry
    }

    /// `domain/path` without tag or digest.
    pub fn name(&self) -> String {
        if self.is_ipfs() {
            return format!("{}://{}", self.protocol.as_str(), self.path);
        }
        format!("{}/{}", self.domain, self.path)
    }

    /// Name with the default domain and `library/` prefix stripped.
    pub fn familiar_name(&self) -> String {
        if self.is_ipfs() {
            return self.name();
        }
        if self.domain == DEFAULT_DOMAIN {
            match self.path.strip_prefix(OFFICIAL_PREFIX) {
                Some(rest) if !rest.contains('/') => rest.to_string(),
                _ => self.path.clone(),
            }
        } else {
            self.name()
        }
    }

    /// Familiar name with tag and digest.
    pub fn familiar_string(&self) -> String {
        let mut s = self.familiar_name();
        self.push_suffix(&mut s);
        s
    }

    /// Glob match (`*`, `?`, `[…]`) on the familiar string, then on the familiar name.
    pub fn familiar_match(&self, pattern: &str) -> bool {
        glob_match(pattern, &self.familiar_string()) || glob_match(pattern, &self.familiar_name())
    }

    /// Same reference with the tag replaced and the digest dropped.
    pub fn with_tag(&self, tag: &str) -> Self {
        Reference {
            tag: Some(tag.to_string()),
            digest: None,
            ..self.clone()
        }
    }

    /// Same name pinned to a digest (tag kept).
    pub fn with_digest(&self, digest: &str) -> Self {
        Reference {
            digest: Some(digest.to_string()),
            ..self.clone()
        }
    }

    fn push_suffix(&self, s: &mut String) {
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = self.name();
        self.push_suffix(&mut s);
        f.write_str(&s)
    }
}

impl std::str::FromStr for Reference {
    type Err = CaskError;

    fn from_str(s: &str) -> Result<Self> {
        Reference::parse(s)
    }
}

fn invalid(reference: &str, reason: &str) -> CaskError {
    CaskError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

fn split_domain(name: &str) -> (String, String) {
    let (domain, path) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.')
                || first.contains(':')
                || first == "localhost"
                || first.chars().any(|c| c.is_ascii_uppercase()) =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    };
    let domain = if LEGACY_DOMAINS.contains(&domain.as_str()) {
        DEFAULT_DOMAIN.to_string()
    } else {
        domain
    };
    let path = if domain == DEFAULT_DOMAIN && !path.contains('/') {
        format!("{OFFICIAL_PREFIX}{path}")
    } else {
        path
    };
    (domain, path)
}

/// Suggest a container name for an image: `<base>-<id[0:5]>`, or
/// `untitled-<id[0:5]>` when the image reference does not parse.
pub fn suggest_container_name(image: &str, container_id: &str) -> String {
    const SHORT: usize = 5;
    let short_id: String = container_id.chars().take(SHORT).collect();
    if image.is_empty() {
        return format!("untitled-{short_id}");
    }
    match Reference::parse(image) {
        Ok(r) if r.is_ipfs() => {
            let cid: String = r.path.chars().take(SHORT).collect();
            format!("{}-{}-{}", r.protocol.as_str(), cid, short_id)
        }
        Ok(r) => {
            let base = r.path.rsplit('/').next().unwrap_or(&r.path);
            format!("{base}-{short_id}")
        }
        Err(_) => format!("untitled-{short_id}"),
    }
}

// ============================================================================
// Glob matching
// ============================================================================

/// Shell-style match where `*` and `?` do not cross `/`. An invalid
/// pattern matches nothing.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    Pattern::new(pattern).map_or(false, |p| p.matches_with(name, options))
}

// ============================================================================
// CID detection
// ============================================================================

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const BASE36_ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

/// True if `s` is an IPFS content identifier (CIDv0 or multibase CIDv1).
pub fn is_cid(s: &str) -> bool {
    if s.len() == 46 && s.starts_with("Qm") {
        return decode_base_n(s, BASE58_ALPHABET)
            .map(|b| b.len() == 34 && b[0] == 0x12 && b[1] == 0x20)
            .unwrap_or(false);
    }
    let mut chars = s.chars();
    let bytes = match chars.next() {
        Some('b') => decode_base32(chars.as_str()),
        Some('B') => decode_base32(&chars.as_str().to_lowercase()),
        Some('k') => decode_base_n(chars.as_str(), BASE36_ALPHABET),
        Some('z') => decode_base_n(chars.as_str(), BASE58_ALPHABET),
        Some('f') => hex::decode(chars.as_str()).ok(),
        _ => None,
    };
    bytes.map(|b| is_cid_v1_bytes(&b)).unwrap_or(false)
}

fn is_cid_v1_bytes(bytes: &[u8]) -> bool {
    let mut rest = bytes;
    let Some(version) = read_varint(&mut rest) else { return false };
    if version != 1 {
        return false;
    }
    let Some(_codec) = read_varint(&mut rest) else { return false };
    let Some(_hash_code) = read_varint(&mut rest) else { return false };
    let Some(len) = read_varint(&mut rest) else { return false };
    len > 0 && rest.len() as u64 == len
}

fn read_varint(buf: &mut &[u8]) -> Option<u64> {
    let mut value = 0u64;
    for (i, byte) in buf.iter().enumerate().take(9) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            *buf = &buf[i + 1..];
            return Some(value);
        }
    }
    None
}

fn decode_base32(s: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
    if s.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buffer = 0u32;
    let mut bits = 0;
    for c in s.bytes() {
        let v = ALPHABET.iter().position(|&a| a == c)? as u32;
        buffer = (buffer << 5) | v;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Some(out)
}

fn decode_base_n(s: &str, alphabet: &str) -> Option<Vec<u8>> {
    if s.is_empty() {
        return None;
    }
    let base = alphabet.len() as u32;
    let zero = alphabet.chars().next()?;
    let mut out: Vec<u8> = Vec::new();
    for c in s.chars() {
        let mut carry = alphabet.find(c)? as u32;
        for byte in out.iter_mut().rev() {
            carry += u32::from(*byte) * base;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            out.insert(0, (carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let leading = s.chars().take_while(|&c| c == zero).count();
    let mut result = vec![0u8; leading];
    result.extend(out);
    Some(result)
}
