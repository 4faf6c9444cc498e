//! `cask pull` command.

use cask_core::{CaskError, Result};
use cask_image::ops::{self, PullOptions, Unpack};
use cask_image::signature::CosignOptions;
use cask_image::VerifyMode;
use clap::Args;

use super::{PlatformArgs, Session};

#[derive(Args, Debug)]
pub struct PullArgs {
    /// Image reference (e.g., "alpine:latest", "ghcr.io/org/image:tag")
    pub image: String,

    /// Suppress progress output and print only the digest
    #[arg(short, long)]
    pub quiet: bool,

    #[command(flatten)]
    pub platform: PlatformArgs,

    /// Unpack the image for the current snapshotter: auto, true or false
    #[arg(long, default_value = "auto")]
    pub unpack: String,

    /// Verify the image: none, cosign or notation
    #[arg(long, default_value = "none")]
    pub verify: String,

    /// Path to the public key file, KMS URI or Kubernetes Secret for --verify=cosign
    #[arg(long)]
    pub cosign_key: Option<String>,

    /// Identity expected in a valid keyless certificate
    #[arg(long)]
    pub cosign_certificate_identity: Option<String>,

    /// Regular expression for the keyless certificate identity
    #[arg(long)]
    pub cosign_certificate_identity_regexp: Option<String>,

    /// OIDC issuer expected in a valid keyless certificate
    #[arg(long)]
    pub cosign_certificate_oidc_issuer: Option<String>,

    /// Regular expression for the keyless certificate OIDC issuer
    #[arg(long)]
    pub cosign_certificate_oidc_issuer_regexp: Option<String>,

    /// Digest of a SOCI index to use for lazy pulling
    #[arg(long)]
    pub soci_index_digest: Option<String>,
}

impl PullArgs {
    fn options(&self) -> Result<PullOptions> {
        if self.soci_index_digest.is_some() {
            return Err(CaskError::Unsupported(
                "--soci-index-digest requires the soci snapshotter".to_string(),
            ));
        }
        let cosign = CosignOptions {
            key: self.cosign_key.clone(),
            certificate_identity: self.cosign_certificate_identity.clone(),
            certificate_identity_regexp: self.cosign_certificate_identity_regexp.clone(),
            certificate_oidc_issuer: self.cosign_certificate_oidc_issuer.clone(),
            certificate_oidc_issuer_regexp: self.cosign_certificate_oidc_issuer_regexp.clone(),
        };
        Ok(PullOptions {
            platforms: self.platform.platforms.clone(),
            all_platforms: self.platform.all_platforms,
            unpack: Unpack::parse(&self.unpack)?,
            quiet: self.quiet,
            verify: VerifyMode::parse(&self.verify, cosign)?,
            progress_to_stdout: true,
        })
    }
}

pub async fn execute(session: &Session, args: PullArgs) -> Result<()> {
    let opts = args.options()?;
    ops::pull(&session.client, &session.ctx, &session.streams, &args.image, &opts).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: PullArgs,
    }

    fn parse(argv: &[&str]) -> PullArgs {
        Wrapper::try_parse_from(std::iter::once("pull").chain(argv.iter().copied()))
            .unwrap()
            .args
    }

    #[test]
    fn test_defaults() {
        let opts = parse(&["alpine"]).options().unwrap();
        assert_eq!(opts.unpack, Unpack::Auto);
        assert_eq!(opts.verify, VerifyMode::None);
        assert!(opts.progress_to_stdout);
    }

    #[test]
    fn test_cosign_flags() {
        let opts = parse(&["--verify", "cosign", "--cosign-key", "cosign.pub", "alpine"])
            .options()
            .unwrap();
        let VerifyMode::Cosign(cosign) = opts.verify else {
            panic!("expected cosign");
        };
        assert_eq!(cosign.key.as_deref(), Some("cosign.pub"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(parse(&["--unpack", "maybe", "alpine"]).options().is_err());
        assert!(parse(&["--verify", "gpg", "alpine"]).options().is_err());
        let err = parse(&["--soci-index-digest", "sha256:abc", "alpine"]).options().unwrap_err();
        assert!(err.is(cask_core::ErrorKind::Unsupported));
    }
}
