//! Proxy error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Proxy result type alias.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors raised while starting or running a proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Listener socket could not be bound.
    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The real agent or target could not be reached.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Malformed protocol traffic.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// `start` called on a proxy that is already running.
    #[error("Proxy already running")]
    AlreadyRunning,
}

impl ProxyError {
    /// Create a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new upstream error.
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }
}
