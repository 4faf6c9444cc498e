//! Image signature verification and signing.
//!
//! Both cosign and notation are driven as external programs. A verifier
//! returns the reference pinned to the digest that was verified, so the
//! pull that follows fetches exactly the signed content.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use cask_core::error::{CaskError, Result};
use serde::Deserialize;
use tokio::process::Command;

use crate::context::OpContext;
use crate::reference::Reference;

/// Keyless cosign identity constraints and an optional key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CosignOptions {
    pub key: Option<String>,
    pub certificate_identity: Option<String>,
    pub certificate_identity_regexp: Option<String>,
    pub certificate_oidc_issuer: Option<String>,
    pub certificate_oidc_issuer_regexp: Option<String>,
}

/// `--verify` mode of a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VerifyMode {
    #[default]
    None,
    Cosign(CosignOptions),
    Notation,
}

impl VerifyMode {
    /// Parse `none|cosign|notation`.
    pub fn parse(mode: &str, cosign: CosignOptions) -> Result<Self> {
        match mode {
            "" | "none" => Ok(VerifyMode::None),
            "cosign" => Ok(VerifyMode::Cosign(cosign)),
            "notation" => Ok(VerifyMode::Notation),
            other => Err(CaskError::invalid(format!(
                "no verifier found: {other} (expected none, cosign or notation)"
            ))),
        }
    }

    /// The verifier for this mode, `None` when verification is off.
    pub fn verifier(&self) -> Option<Box<dyn Verifier>> {
        match self {
            VerifyMode::None => None,
            VerifyMode::Cosign(opts) => Some(Box::new(CosignVerifier::new(opts.clone()))),
            VerifyMode::Notation => Some(Box::new(NotationVerifier::new())),
        }
    }
}

/// `--sign` mode of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SignMode {
    #[default]
    None,
    Cosign { key: Option<String> },
    Notation { key_name: Option<String> },
}

impl SignMode {
    pub fn parse(mode: &str, cosign_key: Option<String>, notation_key_name: Option<String>) -> Result<Self> {
        match mode {
            "" | "none" => Ok(SignMode::None),
            "cosign" => Ok(SignMode::Cosign { key: cosign_key }),
            "notation" => Ok(SignMode::Notation {
                key_name: notation_key_name,
            }),
            other => Err(CaskError::invalid(format!(
                "no signer found: {other} (expected none, cosign or notation)"
            ))),
        }
    }

    /// The signer for this mode. Cosign signing is experimental.
    pub fn signer(&self, experimental: bool) -> Result<Option<Box<dyn Signer>>> {
        match self {
            SignMode::None => Ok(None),
            SignMode::Cosign { .. } if !experimental => Err(CaskError::Unsupported(
                "signing with cosign requires experimental mode".to_string(),
            )),
            SignMode::Cosign { key } => Ok(Some(Box::new(CosignSigner {
                program: PathBuf::from("cosign"),
                key: key.clone(),
            }))),
            SignMode::Notation { key_name } => Ok(Some(Box::new(NotationSigner {
                program: PathBuf::from("notation"),
                key_name: key_name.clone(),
            }))),
        }
    }
}

/// Verifies a remote image signature.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Verify `reference`; returns it pinned to the verified digest.
    async fn verify(&self, ctx: &OpContext, reference: &str) -> Result<String>;
}

/// Signs a pushed image.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, ctx: &OpContext, reference: &str) -> Result<()>;
}

/// `cosign verify`.
pub struct CosignVerifier {
    program: PathBuf,
    opts: CosignOptions,
}

impl CosignVerifier {
    pub fn new(opts: CosignOptions) -> Self {
        Self {
            program: PathBuf::from("cosign"),
            opts,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self, reference: &str) -> Result<Vec<String>> {
        let mut args = vec!["verify".to_string(), reference.to_string()];
        if let Some(key) = &self.opts.key {
            args.extend(["--key".to_string(), key.clone()]);
            return Ok(args);
        }

        match (
            &self.opts.certificate_identity,
            &self.opts.certificate_identity_regexp,
        ) {
            (Some(id), _) => args.extend(["--certificate-identity".to_string(), id.clone()]),
            (None, Some(re)) => {
                args.extend(["--certificate-identity-regexp".to_string(), re.clone()])
            }
            (None, None) => {
                return Err(CaskError::invalid(
                    "keyless cosign verification needs --cosign-certificate-identity or --cosign-certificate-identity-regexp",
                ))
            }
        }
        match (
            &self.opts.certificate_oidc_issuer,
            &self.opts.certificate_oidc_issuer_regexp,
        ) {
            (Some(issuer), _) => {
                args.extend(["--certificate-oidc-issuer".to_string(), issuer.clone()])
            }
            (None, Some(re)) => {
                args.extend(["--certificate-oidc-issuer-regexp".to_string(), re.clone()])
            }
            (None, None) => {
                return Err(CaskError::invalid(
                    "keyless cosign verification needs --cosign-certificate-oidc-issuer or --cosign-certificate-oidc-issuer-regexp",
                ))
            }
        }
        Ok(args)
    }
}

#[async_trait]
impl Verifier for CosignVerifier {
    async fn verify(&self, ctx: &OpContext, reference: &str) -> Result<String> {
        let args = self.args(reference)?;
        let output = run_tool(ctx, &self.program, &args).await?;
        if !output.success {
            return Err(CaskError::SignatureInvalid {
                message: format!("cosign verify {reference}: {}", output.stderr.trim()),
                cosign_mismatch: true,
            });
        }
        let digest = parse_cosign_digest(&output.stdout).ok_or_else(|| CaskError::SignatureInvalid {
            message: format!("cosign verify {reference}: no verified digest in output"),
            cosign_mismatch: true,
        })?;
        tracing::info!(reference = %reference, digest = %digest, "Verified cosign signature");
        pin(reference, &digest)
    }
}

/// `notation verify`.
pub struct NotationVerifier {
    program: PathBuf,
}

impl NotationVerifier {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("notation"),
        }
    }
}

impl Default for NotationVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Verifier for NotationVerifier {
    async fn verify(&self, ctx: &OpContext, reference: &str) -> Result<String> {
        let args = vec!["verify".to_string(), reference.to_string()];
        let output = run_tool(ctx, &self.program, &args).await?;
        if !output.success {
            return Err(CaskError::SignatureInvalid {
                message: format!("notation verify {reference}: {}", output.stderr.trim()),
                cosign_mismatch: false,
            });
        }
        let digest = parse_notation_digest(&output.stdout).ok_or_else(|| {
            CaskError::SignatureInvalid {
                message: format!("notation verify {reference}: no verified digest in output"),
                cosign_mismatch: false,
            }
        })?;
        tracing::info!(reference = %reference, digest = %digest, "Verified notation signature");
        pin(reference, &digest)
    }
}

/// `cosign sign`.
pub struct CosignSigner {
    program: PathBuf,
    key: Option<String>,
}

#[async_trait]
impl Signer for CosignSigner {
    async fn sign(&self, ctx: &OpContext, reference: &str) -> Result<()> {
        let mut args = vec!["sign".to_string(), "--yes".to_string()];
        if let Some(key) = &self.key {
            args.extend(["--key".to_string(), key.clone()]);
        }
        args.push(reference.to_string());
        let output = run_tool(ctx, &self.program, &args).await?;
        if !output.success {
            return Err(CaskError::PushFailed {
                reference: reference.to_string(),
                message: format!("cosign sign: {}", output.stderr.trim()),
            });
        }
        tracing::info!(reference = %reference, "Signed with cosign");
        Ok(())
    }
}

/// `notation sign`.
pub struct NotationSigner {
    program: PathBuf,
    key_name: Option<String>,
}

#[async_trait]
impl Signer for NotationSigner {
    async fn sign(&self, ctx: &OpContext, reference: &str) -> Result<()> {
        let mut args = vec!["sign".to_string()];
        if let Some(key) = &self.key_name {
            args.extend(["--key".to_string(), key.clone()]);
        }
        args.push(reference.to_string());
        let output = run_tool(ctx, &self.program, &args).await?;
        if !output.success {
            return Err(CaskError::PushFailed {
                reference: reference.to_string(),
                message: format!("notation sign: {}", output.stderr.trim()),
            });
        }
        tracing::info!(reference = %reference, "Signed with notation");
        Ok(())
    }
}

struct ToolOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Run an external program under `ctx`; it is killed when the context
/// is canceled or expires.
async fn run_tool(ctx: &OpContext, program: &Path, args: &[String]) -> Result<ToolOutput> {
    tracing::debug!(program = %program.display(), args = ?args, "Running external tool");
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                CaskError::Unsupported(format!("{} is not installed", program.display()))
            }
            _ => CaskError::Io(e),
        })?;

    let output = ctx
        .run(async { child.wait_with_output().await.map_err(CaskError::from) })
        .await?;
    Ok(ToolOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn pin(reference: &str, digest: &str) -> Result<String> {
    let parsed = Reference::parse(reference)?;
    if let Some(existing) = &parsed.digest {
        if existing != digest {
            return Err(CaskError::SignatureInvalid {
                message: format!("verified digest {digest} does not match {existing}"),
                cosign_mismatch: false,
            });
        }
    }
    Ok(parsed.with_digest(digest).to_string())
}

/// Digest from `cosign verify` output: one JSON array of payloads per line,
/// each with `critical.image.docker-manifest-digest`.
pub fn parse_cosign_digest(stdout: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Payload {
        critical: Critical,
    }
    #[derive(Deserialize)]
    struct Critical {
        image: Image,
    }
    #[derive(Deserialize)]
    struct Image {
        #[serde(rename = "docker-manifest-digest")]
        digest: String,
    }

    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<Vec<Payload>>(line.trim()).ok())
        .flatten()
        .map(|p| p.critical.image.digest)
        .next()
}

/// Digest from `notation verify` output
/// (`Successfully verified signature for <repo>@<digest>`).
pub fn parse_notation_digest(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter(|l| l.contains("Successfully verified"))
        .filter_map(|l| l.rsplit_once('@'))
        .map(|(_, digest)| digest.trim().to_string())
        .find(|d| crate::digest::validate(d).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:6e9f67fa63b0323e9a1e587fd71c561ba48a034504fb804fd26fd8800039835d";

    #[test]
    fn test_parse_modes() {
        assert_eq!(VerifyMode::parse("none", CosignOptions::default()).unwrap(), VerifyMode::None);
        assert!(matches!(
            VerifyMode::parse("cosign", CosignOptions::default()).unwrap(),
            VerifyMode::Cosign(_)
        ));
        assert!(VerifyMode::parse("gpg", CosignOptions::default()).is_err());
        assert!(SignMode::parse("x", None, None).is_err());
    }

    #[test]
    fn test_cosign_signing_requires_experimental() {
        let mode = SignMode::parse("cosign", None, None).unwrap();
        let err = mode.signer(false).err().unwrap();
        assert!(err.is(cask_core::ErrorKind::Unsupported));
        assert!(mode.signer(true).unwrap().is_some());
        assert!(SignMode::None.signer(false).unwrap().is_none());
    }

    #[test]
    fn test_cosign_args() {
        let keyed = CosignVerifier::new(CosignOptions {
            key: Some("cosign.pub".to_string()),
            ..Default::default()
        });
        assert_eq!(
            keyed.args("r.io/a:1").unwrap(),
            vec!["verify", "r.io/a:1", "--key", "cosign.pub"]
        );

        let keyless = CosignVerifier::new(CosignOptions {
            certificate_identity: Some("me@example.com".to_string()),
            ..Default::default()
        });
        assert!(keyless.args("r.io/a:1").is_err());
    }

    #[test]
    fn test_parse_cosign_output() {
        let out = format!(
            "\n[{{\"critical\":{{\"identity\":{{\"docker-reference\":\"r.io/a\"}},\"image\":{{\"docker-manifest-digest\":\"{DIGEST}\"}},\"type\":\"cosign container image signature\"}},\"optional\":null}}]\n"
        );
        assert_eq!(parse_cosign_digest(&out), Some(DIGEST.to_string()));
        assert_eq!(parse_cosign_digest("garbage"), None);
    }

    #[test]
    fn test_parse_notation_output() {
        let out = format!("Successfully verified signature for r.io/a@{DIGEST}\n");
        assert_eq!(parse_notation_digest(&out), Some(DIGEST.to_string()));
    }

    #[test]
    fn test_pin() {
        assert_eq!(pin("r.io/a:1", DIGEST).unwrap(), format!("r.io/a:1@{DIGEST}"));
    }

    #[tokio::test]
    async fn test_missing_program_is_unsupported() {
        let verifier = CosignVerifier::new(CosignOptions {
            key: Some("k".to_string()),
            ..Default::default()
        })
        .with_program("/nonexistent/cosign");
        let err = verifier
            .verify(&OpContext::new("default"), "r.io/a:1")
            .await
            .unwrap_err();
        assert!(err.is(cask_core::ErrorKind::Unsupported));
    }
}
