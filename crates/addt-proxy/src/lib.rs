//! Credential and egress proxies for addt sandboxes.
//!
//! Each proxy listens on a Unix socket inside its own `0700` directory and
//! is stopped explicitly (or on drop), removing that directory.

pub mod error;
pub mod gpg_agent;
pub mod http;
mod listener;
pub mod policy;
pub mod socket_dir;
pub mod ssh_agent;

pub use error::{ProxyError, Result};
pub use gpg_agent::GpgAgentProxy;
pub use http::HttpProxy;
pub use policy::{DomainPolicy, PolicyMode};
pub use socket_dir::SocketDir;
pub use ssh_agent::{KeyFilter, SshAgentProxy};
