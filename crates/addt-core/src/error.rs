//! Error types for addt core.

use std::path::PathBuf;
use thiserror::Error;

/// Core result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for addt core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Extension error: {0}")]
    Extension(#[from] ExtensionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Unknown config key '{key}'. Valid keys: {valid}")]
    UnknownKey { key: String, valid: String },

    #[error("Invalid value '{value}' for {key}: expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Create an invalid value error.
    pub fn invalid(key: &str, value: &str, expected: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            expected: expected.into(),
        }
    }
}

/// Extension registry errors.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("Unknown extension: {0}")]
    NotFound(String),

    #[error("Dependency cycle detected: {0}")]
    Cycle(String),

    #[error("Invalid manifest for {name}: {message}")]
    Manifest { name: String, message: String },

    #[error("Extension already exists: {0}")]
    AlreadyExists(PathBuf),
}
