//! `cask image encrypt` and `cask image decrypt` commands.

use std::path::PathBuf;

use cask_core::Result;
use cask_image::crypt::CryptOptions;
use cask_image::ops::{self, CryptRequest};
use clap::Args;

use super::{PlatformArgs, Session};

/// Flags shared by encrypt and decrypt.
#[derive(Args, Debug)]
pub struct CryptArgs {
    /// Source image
    pub source: String,

    /// Target reference
    pub target: String,

    #[command(flatten)]
    pub platform: PlatformArgs,

    /// GnuPG home directory
    #[arg(long)]
    pub gpg_homedir: Option<PathBuf>,

    /// GnuPG version: v1 or v2
    #[arg(long)]
    pub gpg_version: Option<String>,

    /// Private key file, with an optional password: <file>[:<password>] (repeatable)
    #[arg(long = "key")]
    pub keys: Vec<String>,

    /// Recipient of the decryption key in the form <type>:<value> (repeatable)
    #[arg(long = "dec-recipient")]
    pub dec_recipients: Vec<String>,
}

impl CryptArgs {
    fn request(self, recipients: Vec<String>) -> CryptRequest {
        CryptRequest {
            source: self.source,
            target: self.target,
            platforms: self.platform.platforms,
            all_platforms: self.platform.all_platforms,
            options: CryptOptions {
                gpg_homedir: self.gpg_homedir,
                gpg_version: self.gpg_version,
                keys: self.keys,
                recipients,
                dec_recipients: self.dec_recipients,
            },
        }
    }
}

#[derive(Args, Debug)]
pub struct EncryptArgs {
    #[command(flatten)]
    pub common: CryptArgs,

    /// Recipient of the image in the form <type>:<value>, e.g. sym:<keyfile> (repeatable)
    #[arg(long = "recipient")]
    pub recipients: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DecryptArgs {
    #[command(flatten)]
    pub common: CryptArgs,
}

pub async fn encrypt(session: &Session, args: EncryptArgs) -> Result<()> {
    let req = args.common.request(args.recipients);
    ops::encrypt_image(&session.client, &session.ctx, &session.streams, &req).await?;
    Ok(())
}

pub async fn decrypt(session: &Session, args: DecryptArgs) -> Result<()> {
    let req = args.common.request(Vec::new());
    ops::decrypt_image(&session.client, &session.ctx, &session.streams, &req).await?;
    Ok(())
}
