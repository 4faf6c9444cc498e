//! Cask Image - the image subsystem.
//!
//! This crate resolves user references to image records, keeps image content
//! in a content-addressed store under leases and garbage collection, and
//! implements the image lifecycle: pull, push, tag, remove, prune, save,
//! load, import, inspect, list, history, squash, convert, encrypt and decrypt.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod client;
pub mod compression;
pub mod context;
pub mod convert;
pub mod crypt;
pub mod descriptor;
pub mod digest;
pub mod dockercompat;
pub mod ensure;
pub mod filter;
pub mod graph;
pub mod labels;
pub mod manifest;
pub mod media;
pub mod ops;
pub mod platform;
pub mod reference;
pub mod remote;
pub mod signature;
pub mod store;
pub mod streams;
pub mod unpack;
pub mod walker;

// Re-export common types
pub use client::Client;
pub use context::{CancelHandle, OpContext};
pub use descriptor::Descriptor;
pub use platform::{MatchComparer, Platform};
pub use reference::Reference;
pub use remote::{OciRemoteFactory, RemoteFactory};
pub use signature::{SignMode, VerifyMode};
pub use store::{ImageRecord, LeaseGuard};
pub use streams::IoStreams;
pub use walker::AmbiguityPolicy;
