//! Layer encryption.
//!
//! ## Scheme
//!
//! Each layer is sealed with AES-256-GCM under a random 256-bit layer key.
//! The blob is cut into 64 KiB segments; segment `i` uses the nonce
//! `prefix (4 bytes) || i (u64 BE)` and the AAD `[1]` on the last segment,
//! `[0]` otherwise, so truncation and reordering are detected.
//!
//! The layer key is wrapped once per recipient with a KEK derived by
//! HKDF-SHA256 from the recipient's key material and a random salt. The
//! wrapped keys are stored base64-encoded JSON in the
//! `org.opencontainers.image.enc.keys.sym` annotation; the nonce prefix and
//! segment size go in `org.opencontainers.image.enc.pubopts`.
//!
//! Recipients are `sym:<keyfile>[:<passphrase>]`; decryption keys are
//! `<keyfile>[:<passphrase>]`. Other recipient protocols are not available.
//!
//! This format is not interchangeable with ocicrypt: images encrypted here
//! decrypt only with this module, and layers whose keys were wrapped for
//! `jwe`, `pgp` or `pkcs7` recipients are rejected as unsupported.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use cask_core::error::{CaskError, Result};
use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, NONCE_LEN};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::context::OpContext;
use crate::convert::{diff_id_of, LayerConvertFunc};
use crate::descriptor::Descriptor;
use crate::digest::DigestingWriter;
use crate::labels;
use crate::media;
use crate::store::{write_file, ContentStore};

/// Plaintext bytes per sealed segment.
const SEGMENT_SIZE: usize = 64 << 10;

/// HKDF info for key wrapping.
const KEK_INFO: &[u8] = b"cask-layer-key-wrap-v1";

/// Cipher name recorded in the public options.
const CIPHER: &str = "AES_256_GCM_STREAM";

const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const PREFIX_LEN: usize = 4;

/// Recipient protocols this build cannot use.
const UNSUPPORTED_PROTOCOLS: &[&str] = &["pgp", "jwe", "pkcs7", "pkcs11", "provider"];

/// Options as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CryptOptions {
    pub gpg_homedir: Option<PathBuf>,
    pub gpg_version: Option<String>,
    pub keys: Vec<String>,
    pub recipients: Vec<String>,
    pub dec_recipients: Vec<String>,
}

/// Symmetric key material read from a key file.
#[derive(Clone)]
pub struct SymKey {
    source: String,
    secret: Vec<u8>,
}

impl std::fmt::Debug for SymKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymKey").field("source", &self.source).finish_non_exhaustive()
    }
}

impl SymKey {
    /// Parse `<keyfile>[:<passphrase>]`. A path that exists as given wins
    /// over a passphrase split.
    pub fn parse(spec: &str) -> Result<Self> {
        let (path, passphrase) = if Path::new(spec).is_file() {
            (spec, None)
        } else {
            match spec.rsplit_once(':') {
                Some((path, pass)) => (path, Some(pass)),
                None => (spec, None),
            }
        };
        let mut secret = std::fs::read(path)
            .map_err(|e| CaskError::invalid(format!("cannot read key file {path}: {e}")))?;
        if secret.is_empty() {
            return Err(CaskError::invalid(format!("key file {path} is empty")));
        }
        if let Some(pass) = passphrase {
            secret.push(0);
            secret.extend_from_slice(pass.as_bytes());
        }
        Ok(Self {
            source: path.to_string(),
            secret,
        })
    }

    fn kek(&self, salt: &[u8]) -> Result<aead::LessSafeKey> {
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(&self.secret);
        let okm = prk
            .expand(&[KEK_INFO], &aead::AES_256_GCM)
            .map_err(|_| CaskError::EncryptionFailed("HKDF expand failed".to_string()))?;
        Ok(aead::LessSafeKey::new(aead::UnboundKey::from(okm)))
    }
}

/// Keys resolved for one encrypt or decrypt run.
#[derive(Debug, Clone, Default)]
pub struct CryptConfig {
    pub recipients: Vec<SymKey>,
    pub keys: Vec<SymKey>,
}

impl CryptOptions {
    fn check_gpg(&self) -> Result<()> {
        if self.gpg_homedir.is_some() || self.gpg_version.is_some() {
            return Err(CaskError::Unsupported(
                "gpg key handling is not available in this build".to_string(),
            ));
        }
        Ok(())
    }

    /// Config for `encrypt`. At least one recipient is required.
    pub fn encrypt_config(&self) -> Result<CryptConfig> {
        self.check_gpg()?;
        if self.recipients.is_empty() {
            return Err(CaskError::invalid("at least one recipient must be specified"));
        }
        let recipients = self
            .recipients
            .iter()
            .map(|r| parse_recipient(r))
            .collect::<Result<Vec<_>>>()?;
        Ok(CryptConfig {
            recipients,
            keys: Vec::new(),
        })
    }

    /// Config for `decrypt`.
    pub fn decrypt_config(&self) -> Result<CryptConfig> {
        self.check_gpg()?;
        if !self.dec_recipients.is_empty() {
            return Err(CaskError::Unsupported(
                "decryption recipients (pkcs7) are not available in this build".to_string(),
            ));
        }
        if self.keys.is_empty() {
            return Err(CaskError::invalid("at least one decryption key must be specified"));
        }
        let keys = self
            .keys
            .iter()
            .map(|k| SymKey::parse(k))
            .collect::<Result<Vec<_>>>()?;
        Ok(CryptConfig {
            recipients: Vec::new(),
            keys,
        })
    }
}

fn parse_recipient(spec: &str) -> Result<SymKey> {
    let (protocol, value) = spec
        .split_once(':')
        .ok_or_else(|| CaskError::invalid(format!("invalid recipient format \"{spec}\"")))?;
    match protocol {
        "sym" => SymKey::parse(value),
        p if UNSUPPORTED_PROTOCOLS.contains(&p) => Err(CaskError::Unsupported(format!(
            "{p} recipients are not available in this build"
        ))),
        p => Err(CaskError::invalid(format!("unknown recipient protocol \"{p}\""))),
    }
}

/// One recipient's copy of the layer key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WrappedKey {
    #[serde(with = "base64_serde")]
    salt: Vec<u8>,
    #[serde(with = "base64_serde")]
    nonce: Vec<u8>,
    #[serde(with = "base64_serde")]
    key: Vec<u8>,
}

/// Non-secret parameters needed to decrypt.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PubOpts {
    cipher: String,
    segment_size: usize,
    #[serde(with = "base64_serde")]
    nonce_prefix: Vec<u8>,
}

fn random<const N: usize>(rng: &SystemRandom) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    rng.fill(&mut out)
        .map_err(|_| CaskError::EncryptionFailed("failed to generate random bytes".to_string()))?;
    Ok(out)
}

fn wrap(recipient: &SymKey, layer_key: &[u8], rng: &SystemRandom) -> Result<WrappedKey> {
    let salt: [u8; SALT_LEN] = random(rng)?;
    let nonce: [u8; NONCE_LEN] = random(rng)?;
    let mut key = layer_key.to_vec();
    recipient
        .kek(&salt)?
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut key)
        .map_err(|_| CaskError::EncryptionFailed(format!("failed to wrap key for {}", recipient.source)))?;
    Ok(WrappedKey {
        salt: salt.to_vec(),
        nonce: nonce.to_vec(),
        key,
    })
}

fn unwrap(keys: &[SymKey], wrapped: &[WrappedKey]) -> Option<Vec<u8>> {
    for key in keys {
        for w in wrapped {
            let Ok(nonce) = Nonce::try_assume_unique_for_key(&w.nonce) else {
                continue;
            };
            let Ok(kek) = key.kek(&w.salt) else {
                continue;
            };
            let mut data = w.key.clone();
            if let Ok(plain) = kek.open_in_place(nonce, Aad::empty(), &mut data) {
                return Some(plain.to_vec());
            }
        }
    }
    None
}

fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(value)?))
}

fn decode_json<T: for<'de> Deserialize<'de>>(value: &str) -> Result<T> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| CaskError::DecryptionFailed(format!("malformed annotation: {e}")))?;
    serde_json::from_slice(&data)
        .map_err(|e| CaskError::DecryptionFailed(format!("malformed annotation: {e}")))
}

// ============================================================================
// Segmented stream
// ============================================================================

/// Nonces `prefix || counter` for consecutive segments.
struct CounterNonce {
    prefix: [u8; PREFIX_LEN],
    counter: u64,
}

impl NonceSequence for CounterNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..PREFIX_LEN].copy_from_slice(&self.prefix);
        nonce[PREFIX_LEN..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self.counter.checked_add(1).ok_or(ring::error::Unspecified)?;
        Ok(Nonce::assume_unique_for_key(nonce))
    }
}

fn read_segment<R: Read>(reader: &mut R, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(size);
    reader.take(size as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

fn segment_aad(last: bool) -> Aad<[u8; 1]> {
    Aad::from([last as u8])
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn seal_stream<R: Read, W: Write>(
    mut reader: R,
    out: &mut W,
    layer_key: &[u8],
    prefix: [u8; PREFIX_LEN],
) -> io::Result<()> {
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, layer_key)
        .map_err(|_| invalid_data("invalid layer key"))?;
    let mut key = aead::SealingKey::new(unbound, CounterNonce { prefix, counter: 0 });
    let mut current = read_segment(&mut reader, SEGMENT_SIZE)?;
    loop {
        let next = read_segment(&mut reader, SEGMENT_SIZE)?;
        let last = next.is_empty();
        key.seal_in_place_append_tag(segment_aad(last), &mut current)
            .map_err(|_| invalid_data("segment seal failed"))?;
        out.write_all(&current)?;
        if last {
            return Ok(());
        }
        current = next;
    }
}

fn open_stream<R: Read, W: Write>(
    mut reader: R,
    out: &mut W,
    layer_key: &[u8],
    opts: &PubOpts,
) -> io::Result<()> {
    let prefix: [u8; PREFIX_LEN] = opts
        .nonce_prefix
        .as_slice()
        .try_into()
        .map_err(|_| invalid_data("invalid nonce prefix"))?;
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, layer_key)
        .map_err(|_| invalid_data("invalid layer key"))?;
    let mut key = aead::OpeningKey::new(unbound, CounterNonce { prefix, counter: 0 });
    let sealed_size = opts.segment_size + aead::AES_256_GCM.tag_len();
    let mut current = read_segment(&mut reader, sealed_size)?;
    loop {
        let next = read_segment(&mut reader, sealed_size)?;
        let last = next.is_empty();
        let plain = key
            .open_in_place(segment_aad(last), &mut current)
            .map_err(|_| invalid_data("layer data failed authentication"))?;
        out.write_all(plain)?;
        if last {
            return Ok(());
        }
        current = next;
    }
}

/// Run a blocking transform of `src` into a staged temp file; returns the
/// file with the digest and size of what was written.
async fn transform_blob<F>(
    cs: &dyn ContentStore,
    ctx: &OpContext,
    src: &Descriptor,
    transform: F,
) -> io::Result<(tempfile::NamedTempFile, String, u64)>
where
    F: FnOnce(Box<dyn Read + Send>, &mut DigestingWriter<File>) -> io::Result<()> + Send + 'static,
{
    let blob = cs
        .open_blob(ctx, &src.digest)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;
    tokio::task::spawn_blocking(move || {
        let file = tempfile::NamedTempFile::new()?;
        let mut writer = DigestingWriter::new(file.reopen()?);
        transform(blob, &mut writer)?;
        let (_, digest, size) = writer.finish();
        Ok::<_, io::Error>((file, digest, size))
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
}

// ============================================================================
// Layer convert functions
// ============================================================================

/// Encrypts every unencrypted layer for the configured recipients.
pub struct LayerEncrypter {
    config: Arc<CryptConfig>,
}

impl LayerEncrypter {
    pub fn new(config: CryptConfig) -> Result<Self> {
        if config.recipients.is_empty() {
            return Err(CaskError::invalid("at least one recipient must be specified"));
        }
        Ok(Self {
            config: Arc::new(config),
        })
    }
}

#[async_trait]
impl LayerConvertFunc for LayerEncrypter {
    async fn convert(
        &self,
        cs: &dyn ContentStore,
        ctx: &OpContext,
        desc: &Descriptor,
    ) -> Result<Option<Descriptor>> {
        if !media::is_layer(&desc.media_type) || media::is_encrypted(&desc.media_type) {
            return Ok(None);
        }
        let diff_id = diff_id_of(cs, ctx, desc).await?;

        let rng = SystemRandom::new();
        let layer_key: [u8; KEY_LEN] = random(&rng)?;
        let prefix: [u8; PREFIX_LEN] = random(&rng)?;
        let wrapped = self
            .config
            .recipients
            .iter()
            .map(|r| wrap(r, &layer_key, &rng))
            .collect::<Result<Vec<_>>>()?;
        let pub_opts = PubOpts {
            cipher: CIPHER.to_string(),
            segment_size: SEGMENT_SIZE,
            nonce_prefix: prefix.to_vec(),
        };

        let (file, digest, size) = ctx
            .run(async {
                transform_blob(cs, ctx, desc, move |blob, out| seal_stream(blob, out, &layer_key, prefix))
                    .await
                    .map_err(|e| CaskError::EncryptionFailed(format!("{}: {e}", desc.digest)))
            })
            .await?;

        let mut out = Descriptor::new(
            format!("{}{}", desc.media_type, media::ENCRYPTED_SUFFIX),
            digest,
            size,
        );
        out.urls = desc.urls.clone();
        out.annotations = desc.annotations.clone();
        out.annotations
            .insert(labels::ENC_KEYS_SYM.to_string(), encode_json(&wrapped)?);
        out.annotations
            .insert(labels::ENC_PUBOPTS.to_string(), encode_json(&pub_opts)?);
        let blob_labels = BTreeMap::from([(labels::UNCOMPRESSED.to_string(), diff_id)]);
        write_file(cs, ctx, &out, file.path(), blob_labels).await?;
        tracing::debug!(
            layer = %desc.digest,
            encrypted = %out.digest,
            recipients = self.config.recipients.len(),
            "Encrypted layer"
        );
        Ok(Some(out))
    }
}

/// Decrypts layers with any of the configured keys.
pub struct LayerDecrypter {
    config: Arc<CryptConfig>,
}

impl LayerDecrypter {
    pub fn new(config: CryptConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl LayerConvertFunc for LayerDecrypter {
    async fn convert(
        &self,
        cs: &dyn ContentStore,
        ctx: &OpContext,
        desc: &Descriptor,
    ) -> Result<Option<Descriptor>> {
        if !media::is_encrypted(&desc.media_type) {
            return Ok(None);
        }
        let Some(keys_annotation) = desc.annotation(labels::ENC_KEYS_SYM) else {
            return Err(foreign_protocol_error(desc));
        };
        let wrapped: Vec<WrappedKey> = decode_json(keys_annotation)?;
        let pub_opts: PubOpts = decode_json(desc.annotation(labels::ENC_PUBOPTS).ok_or_else(|| {
            CaskError::DecryptionFailed(format!("layer {} has no encryption options", desc.digest))
        })?)?;
        if pub_opts.cipher != CIPHER || pub_opts.segment_size == 0 {
            return Err(CaskError::DecryptionFailed(format!(
                "unsupported cipher {} ({} byte segments)",
                pub_opts.cipher, pub_opts.segment_size
            )));
        }
        let layer_key = unwrap(&self.config.keys, &wrapped).ok_or_else(|| {
            CaskError::DecryptionFailed(format!("no matching key for layer {}", desc.digest))
        })?;

        let (file, digest, size) = ctx
            .run(async {
                transform_blob(cs, ctx, desc, move |blob, out| open_stream(blob, out, &layer_key, &pub_opts))
                    .await
                    .map_err(|e| CaskError::DecryptionFailed(format!("{}: {e}", desc.digest)))
            })
            .await?;

        let media_type = desc
            .media_type
            .strip_suffix(media::ENCRYPTED_SUFFIX)
            .unwrap_or(&desc.media_type);
        let mut out = Descriptor::new(media_type, digest, size);
        out.urls = desc.urls.clone();
        out.annotations = desc.annotations.clone();
        out.annotations.remove(labels::ENC_KEYS_SYM);
        out.annotations.remove(labels::ENC_PUBOPTS);

        let info = cs.info(ctx, &desc.digest).await?;
        let blob_labels = info
            .labels
            .get(labels::UNCOMPRESSED)
            .map(|d| BTreeMap::from([(labels::UNCOMPRESSED.to_string(), d.clone())]))
            .unwrap_or_default();
        write_file(cs, ctx, &out, file.path(), blob_labels).await?;
        tracing::debug!(layer = %desc.digest, decrypted = %out.digest, "Decrypted layer");
        Ok(Some(out))
    }
}

/// Error for an encrypted layer without a `sym` key annotation.
fn foreign_protocol_error(desc: &Descriptor) -> CaskError {
    let protocols: Vec<&str> = desc
        .annotations
        .keys()
        .filter_map(|k| k.strip_prefix(labels::ENC_KEYS_PREFIX))
        .collect();
    if protocols.is_empty() {
        return CaskError::DecryptionFailed(format!("layer {} has no wrapped keys", desc.digest));
    }
    CaskError::Unsupported(format!(
        "layer {} is encrypted for {} recipients; only sym recipients are supported",
        desc.digest,
        protocols.join(", ")
    ))
}

mod base64_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> std::result::Result<S::Ok, S::Error> {
        use base64::Engine;
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        use base64::Engine;
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}
