//! sync-cli library: the native collaborators behind the `drive-sync` binary.
//!
//! This is a thin library layer over the binary's components,
//! allowing integration tests to access them.

pub mod auth;
pub mod config;
pub mod graph;
pub mod native_fs;
pub mod persistence;

// Re-export key types for convenience
pub use auth::{AccountSession, AuthError, OAuthClient, TokenHolder};
pub use config::{OptionOverrides, SyncOptions};
pub use graph::GraphClient;
pub use native_fs::NativeFs;
pub use persistence::{ConfigFile, ConfigStore};
