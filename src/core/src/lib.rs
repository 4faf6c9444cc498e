//! Cask Core - foundational types shared by the image subsystem and the CLI.
//!
//! This crate provides the error taxonomy every image operation reports
//! through, and the global configuration that locates the store, the
//! registry host settings, and the default snapshotter.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{CaskConfig, ConfigFlags};
pub use error::{CaskError, ErrorKind, Result, ResultExt};

/// Cask version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
