//! # addt-core
//!
//! Core types, configuration, and utilities for addt.
//!
//! This crate provides functionality shared by the sandbox providers and the CLI:
//!
//! - **Assets**: Embedded Dockerfiles, entrypoint scripts and the built-in extension tree
//! - **Extensions**: Manifest loading, local overrides and dependency ordering
//! - **Configuration**: Key table, layered composition and config-file editing
//! - **Utilities**: Path resolution, session naming and environment handling

pub mod assets;
pub mod config;
pub mod env;
pub mod error;
pub mod extensions;
pub mod id;
pub mod paths;
pub mod secret;

// Re-exports for convenience
pub use config::EffectiveConfig;
pub use error::{ConfigError, Error, ExtensionError, Result};
pub use extensions::{Extension, ExtensionRegistry};
pub use paths::AddtPaths;
pub use secret::SecretString;

/// Version string baked into image tags.
pub const ADDT_VERSION: &str = env!("CARGO_PKG_VERSION");
