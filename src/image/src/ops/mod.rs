//! Image lifecycle operations.
//!
//! Each operation takes a [`Client`](crate::client::Client), a context and
//! the invocation's [`IoStreams`]; structured output is built completely
//! before anything is written.

pub mod convert;
pub mod crypt;
pub mod history;
pub mod import;
pub mod inspect;
pub mod list;
pub mod load;
pub mod prune;
pub mod pull;
pub mod push;
pub mod remove;
pub mod save;
pub mod squash;
pub mod tag;

pub use convert::{convert_image, ConvertRequest};
pub use crypt::{decrypt_image, encrypt_image, CryptRequest};
pub use history::{history, HistoryRow};
pub use import::{import_rootfs, ImportOptions, ImportSource};
pub use inspect::{inspect, InspectMode, NativeImage, NativeManifest};
pub use list::{list, ImageRow, ListOptions};
pub use load::{load, LoadOptions};
pub use prune::{prune, PruneOptions};
pub use pull::{pull, PullOptions, Unpack};
pub use push::{push, PushOptions};
pub use remove::{remove, ContainerLookup, ContainerUse, NoContainers, RemoveOptions};
pub use save::{save, SaveOptions};
pub use squash::{squash, SquashOptions};
pub use tag::tag;

use cask_core::error::Result;

use crate::client::Client;
use crate::context::OpContext;
use crate::streams::{IoStreams, SharedWriter};

/// Stream progress goes to: stdout for a direct command, stderr when the
/// operation runs on behalf of another one.
pub(crate) fn progress_writer(streams: &IoStreams, to_stdout: bool) -> SharedWriter {
    if to_stdout {
        streams.stdout.clone()
    } else {
        streams.stderr.clone()
    }
}

/// Delete a transient record; failures are only logged.
pub(crate) async fn delete_quietly(client: &Client, ctx: &OpContext, name: &str) {
    if let Err(e) = client.images().delete(ctx, name).await {
        tracing::warn!(image = %name, error = %e, "Failed to remove temporary image");
    }
}

/// Write lines to a stream, mapping I/O errors.
pub(crate) fn emit(out: &SharedWriter, lines: &[String]) -> Result<()> {
    for line in lines {
        out.line(line)?;
    }
    Ok(())
}
