//! Sandbox error types.

use addt_proxy::ProxyError;
use std::io;
use thiserror::Error;

/// Errors that can occur while preparing or running a sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A required tool is not installed.
    #[error("{tool} not found. {hint}")]
    PrerequisiteMissing { tool: String, hint: String },

    /// The runtime is installed but its daemon does not answer.
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Image build failed; the runtime output was already streamed.
    #[error("Image build failed: {0}")]
    BuildFailed(String),

    /// The expected image does not exist and was not built.
    #[error("Image {0} not found; run `addt build` first")]
    ImageMissing(String),

    /// Session name already taken by another container.
    #[error("Container name {0} is already in use")]
    NameInUse(String),

    /// A credential or network proxy could not be started.
    #[error("Failed to start {feature} forwarding: {source}")]
    ProxyStart {
        feature: &'static str,
        #[source]
        source: ProxyError,
    },

    /// The sandboxed process exited non-zero.
    #[error("Sandbox exited with code {0}")]
    RuntimeExit(i32),

    /// Operation not supported by this provider.
    #[error("Not supported by the {provider} provider: {operation}")]
    Unsupported {
        provider: &'static str,
        operation: &'static str,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error from configuration or extension handling.
    #[error(transparent)]
    Core(#[from] addt_core::Error),

    /// Proxy error outside of start-up.
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    /// Create a new prerequisite error.
    pub fn prerequisite(tool: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::PrerequisiteMissing {
            tool: tool.into(),
            hint: hint.into(),
        }
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PrerequisiteMissing { .. } => 2,
            Self::RuntimeExit(code) => *code,
            _ => 1,
        }
    }
}

impl From<addt_core::ConfigError> for SandboxError {
    fn from(e: addt_core::ConfigError) -> Self {
        Self::Core(addt_core::Error::Config(e))
    }
}

impl From<addt_core::ExtensionError> for SandboxError {
    fn from(e: addt_core::ExtensionError) -> Self {
        Self::Core(addt_core::Error::Extension(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(SandboxError::prerequisite("bwrap", "install it").exit_code(), 2);
        assert_eq!(SandboxError::RuntimeExit(42).exit_code(), 42);
        assert_eq!(SandboxError::BuildFailed("x".into()).exit_code(), 1);
        assert_eq!(SandboxError::config("bad").exit_code(), 1);
    }
}
