//! CLI command definitions and dispatch.

mod convert;
mod crypt;
mod history;
mod image_inspect;
mod image_prune;
mod image_tag;
mod images;
mod import;
mod load;
mod pull;
mod push;
mod rmi;
mod save;
mod squash;

use std::path::PathBuf;

use cask_core::{CaskConfig, ConfigFlags, Result};
use cask_image::{CancelHandle, Client, IoStreams, MatchComparer, OpContext};
use clap::{Args, Parser, Subcommand};

use crate::state::StateFile;

/// Manage container images in a local content store.
#[derive(Parser)]
#[command(name = "cask", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags accepted by every command; they override the config file.
#[derive(Args, Debug, Default, Clone)]
pub struct GlobalArgs {
    /// Root directory of the image store
    #[arg(long, global = true)]
    pub data_root: Option<PathBuf>,

    /// Namespace inside the store
    #[arg(short = 'n', long, global = true)]
    pub namespace: Option<String>,

    /// Snapshotter used to unpack images
    #[arg(long, global = true)]
    pub snapshotter: Option<String>,

    /// Directory of per-registry host settings (repeatable)
    #[arg(long, global = true)]
    pub hosts_dir: Vec<PathBuf>,

    /// Fall back to plain HTTP when HTTPS fails
    #[arg(long, global = true)]
    pub insecure_registry: bool,

    /// Enable experimental features
    #[arg(long, global = true)]
    pub experimental: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

impl GlobalArgs {
    fn flags(&self) -> ConfigFlags {
        ConfigFlags {
            data_root: self.data_root.clone(),
            namespace: self.namespace.clone(),
            snapshotter: self.snapshotter.clone(),
            hosts_dir: self.hosts_dir.clone(),
            insecure_registry: self.insecure_registry,
            experimental: self.experimental,
            debug: self.debug,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Manage images
    #[command(subcommand)]
    Image(ImageCommand),
    /// List images
    Images(images::ImagesArgs),
    /// Pull an image from a registry
    Pull(pull::PullArgs),
    /// Push an image to a registry
    Push(push::PushArgs),
    /// Load images from a tar archive
    Load(load::LoadArgs),
    /// Save images to a tar archive
    Save(save::SaveArgs),
    /// Create a tag that refers to an existing image
    Tag(image_tag::ImageTagArgs),
    /// Remove one or more images
    Rmi(rmi::RmiArgs),
}

/// `cask image` subcommands.
#[derive(Subcommand)]
pub enum ImageCommand {
    /// List images
    #[command(visible_alias = "list")]
    Ls(images::ImagesArgs),
    /// Show the history of an image
    History(history::HistoryArgs),
    /// Pull an image from a registry
    Pull(pull::PullArgs),
    /// Push an image to a registry
    Push(push::PushArgs),
    /// Load images from a tar archive
    Load(load::LoadArgs),
    /// Save images to a tar archive
    Save(save::SaveArgs),
    /// Create a tag that refers to an existing image
    Tag(image_tag::ImageTagArgs),
    /// Remove one or more images
    #[command(visible_alias = "remove")]
    Rm(rmi::RmiArgs),
    /// Convert an image format
    Convert(convert::ConvertArgs),
    /// Display detailed information on one or more images
    Inspect(image_inspect::ImageInspectArgs),
    /// Encrypt image layers
    Encrypt(crypt::EncryptArgs),
    /// Decrypt image layers
    Decrypt(crypt::DecryptArgs),
    /// Remove unused images
    Prune(image_prune::ImagePruneArgs),
    /// Import a rootfs tarball as an image
    Import(import::ImportArgs),
    /// Squash the top layers of an image into one
    Squash(squash::SquashArgs),
}

/// Everything a command needs: the store client, the request context and
/// the process streams.
pub struct Session {
    pub client: Client,
    pub ctx: OpContext,
    pub streams: IoStreams,
}

impl Session {
    /// Load the configuration, apply `global` and open the store.
    pub fn open(global: &GlobalArgs) -> Result<(Self, CancelHandle)> {
        let config = CaskConfig::load()?.merge_flags(global.flags());
        Self::with_config(config, IoStreams::system())
    }

    pub fn with_config(config: CaskConfig, streams: IoStreams) -> Result<(Self, CancelHandle)> {
        let (ctx, cancel) = OpContext::with_cancel(&config.namespace);
        let client = Client::open(config)?;
        Ok((Self { client, ctx, streams }, cancel))
    }

    /// Containers of the current namespace.
    pub fn containers(&self) -> StateFile {
        let config = self.client.config();
        StateFile::for_namespace(&config.data_root, &config.namespace)
    }
}

/// Shared `--platform` / `--all-platforms` flags.
#[derive(Args, Debug, Default, Clone)]
pub struct PlatformArgs {
    /// Target platform(s), e.g. "linux/amd64" (repeatable or comma separated)
    #[arg(long = "platform", value_delimiter = ',')]
    pub platforms: Vec<String>,

    /// Operate on all platforms
    #[arg(long)]
    pub all_platforms: bool,
}

impl PlatformArgs {
    pub fn matcher(&self) -> Result<MatchComparer> {
        MatchComparer::new(self.all_platforms, &self.platforms)
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<()> {
    let (session, cancel) = Session::open(&cli.global)?;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Interrupted, canceling");
            cancel.cancel();
        }
    });
    run(&session, cli.command).await
}

/// Run one command against an open session.
pub async fn run(session: &Session, command: Command) -> Result<()> {
    match command {
        Command::Image(cmd) => run_image(session, cmd).await,
        Command::Images(args) => images::execute(session, args).await,
        Command::Pull(args) => pull::execute(session, args).await,
        Command::Push(args) => push::execute(session, args).await,
        Command::Load(args) => load::execute(session, args).await,
        Command::Save(args) => save::execute(session, args).await,
        Command::Tag(args) => image_tag::execute(session, args).await,
        Command::Rmi(args) => rmi::execute(session, args).await,
    }
}

async fn run_image(session: &Session, command: ImageCommand) -> Result<()> {
    match command {
        ImageCommand::Ls(args) => images::execute(session, args).await,
        ImageCommand::History(args) => history::execute(session, args).await,
        ImageCommand::Pull(args) => pull::execute(session, args).await,
        ImageCommand::Push(args) => push::execute(session, args).await,
        ImageCommand::Load(args) => load::execute(session, args).await,
        ImageCommand::Save(args) => save::execute(session, args).await,
        ImageCommand::Tag(args) => image_tag::execute(session, args).await,
        ImageCommand::Rm(args) => rmi::execute(session, args).await,
        ImageCommand::Convert(args) => convert::execute(session, args).await,
        ImageCommand::Inspect(args) => image_inspect::execute(session, args).await,
        ImageCommand::Encrypt(args) => crypt::encrypt(session, args).await,
        ImageCommand::Decrypt(args) => crypt::decrypt(session, args).await,
        ImageCommand::Prune(args) => image_prune::execute(session, args).await,
        ImageCommand::Import(args) => import::execute(session, args).await,
        ImageCommand::Squash(args) => squash::execute(session, args).await,
    }
}
