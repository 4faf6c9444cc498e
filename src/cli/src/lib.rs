//! Cask CLI - nerdctl-style image management over a local content store.

pub mod commands;
pub mod output;
pub mod state;
