//! Content digests (`algo:hex`), streaming digesters and chain IDs.

use std::io::{Read, Write};

use cask_core::error::{CaskError, Result};
use sha2::{Digest as _, Sha256, Sha384, Sha512};

/// Canonical digest algorithm.
pub const CANONICAL_ALGORITHM: &str = "sha256";

/// Length of the truncated image ID shown in tables.
pub const SHORT_ID_LEN: usize = 12;

/// Validate an `algo:hex` digest string.
pub fn validate(digest: &str) -> Result<()> {
    let (algo, hex) = digest
        .split_once(':')
        .ok_or_else(|| CaskError::InvalidDigest(digest.to_string()))?;
    let expected_len = match algo {
        "sha256" => 64,
        "sha384" => 96,
        "sha512" => 128,
        _ => return Err(CaskError::InvalidDigest(digest.to_string())),
    };
    if hex.len() != expected_len || !is_lower_hex(hex) {
        return Err(CaskError::InvalidDigest(digest.to_string()));
    }
    Ok(())
}

/// Algorithm part of a digest (`sha256` for `sha256:abc…`).
pub fn algorithm(digest: &str) -> &str {
    digest.split_once(':').map(|(a, _)| a).unwrap_or(CANONICAL_ALGORITHM)
}

/// Hex part of a digest; a bare hex string is returned unchanged.
pub fn encoded(digest: &str) -> &str {
    digest.split_once(':').map(|(_, h)| h).unwrap_or(digest)
}

/// Truncated hex used as an image ID in tables.
pub fn short_id(digest: &str) -> &str {
    let hex = encoded(digest);
    &hex[..hex.len().min(SHORT_ID_LEN)]
}

/// True for a non-empty string of lowercase hex characters.
pub fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// True if `query` looks like a (possibly truncated) digest: hex, optionally
/// prefixed with `sha256:`.
pub fn is_digest_query(query: &str) -> bool {
    let hex = query.strip_prefix("sha256:").unwrap_or(query);
    is_lower_hex(hex) && hex.len() <= 64
}

/// `sha256:<hex>` of a byte slice.
pub fn sha256_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Compute a digest of `data` with the named algorithm.
pub fn digest_with_algorithm(algo: &str, data: &[u8]) -> Result<String> {
    let hex = match algo {
        "sha256" => hex::encode(Sha256::digest(data)),
        "sha384" => hex::encode(Sha384::digest(data)),
        "sha512" => hex::encode(Sha512::digest(data)),
        other => {
            return Err(CaskError::Unsupported(format!(
                "digest algorithm {other}"
            )))
        }
    };
    Ok(format!("{algo}:{hex}"))
}

/// Chain ID of an ordered list of diff IDs.
///
/// `chain(d1) = d1`, `chain(d1..dn) = sha256(chain(d1..dn-1) + " " + dn)`.
pub fn chain_id(diff_ids: &[String]) -> Option<String> {
    let mut iter = diff_ids.iter();
    let mut chain = iter.next()?.clone();
    for diff_id in iter {
        chain = sha256_of(format!("{chain} {diff_id}").as_bytes());
    }
    Some(chain)
}

/// Chain IDs for every prefix of `diff_ids`.
pub fn chain_ids(diff_ids: &[String]) -> Vec<String> {
    (1..=diff_ids.len())
        .filter_map(|n| chain_id(&diff_ids[..n]))
        .collect()
}

/// Streaming sha256 digester that counts bytes.
///
/// Implements [`Write`] so it can sit behind a tee while data is copied.
#[derive(Clone, Default)]
pub struct Digester {
    hasher: Sha256,
    size: u64,
}

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.size += data.len() as u64;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Finish and return `(sha256:<hex>, size)`.
    pub fn finish(self) -> (String, u64) {
        (
            format!("sha256:{}", hex::encode(self.hasher.finalize())),
            self.size,
        )
    }
}

impl std::fmt::Debug for Digester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Digester").field("size", &self.size).finish()
    }
}

impl Write for Digester {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A writer that forwards to `inner` while digesting everything written.
pub struct DigestingWriter<W> {
    inner: W,
    digester: Digester,
}

impl<W: Write> DigestingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            digester: Digester::new(),
        }
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.digester.size()
    }

    /// Return the inner writer and `(digest, size)` of the bytes written.
    pub fn finish(self) -> (W, String, u64) {
        let (digest, size) = self.digester.finish();
        (self.inner, digest, size)
    }
}

impl<W: Write> Write for DigestingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A reader that digests everything read through it.
pub struct DigestingReader<R> {
    inner: R,
    digester: Digester,
}

impl<R: Read> DigestingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digester: Digester::new(),
        }
    }

    /// Read the remainder of the stream, then return `(digest, size)`.
    pub fn finish(mut self) -> std::io::Result<(String, u64)> {
        std::io::copy(&mut self.inner, &mut self.digester)?;
        Ok(self.digester.finish())
    }
}

impl<R: Read> Read for DigestingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }
}
