//! Sandbox providers and session orchestration for addt.
//!
//! This crate turns an [`EffectiveConfig`](addt_core::EffectiveConfig) into a
//! running sandbox:
//! - OCI runtimes (Docker, Podman, OrbStack) with a content-hashed image builder
//! - bubblewrap on Linux, with an HTTP proxy standing in for the firewall
//! - SSH, GPG, Git, GitHub and tmux forwarding shared by both backends
//! - Secret materialisation, port publishing, DinD and session cleanup

pub mod bwrap;
pub mod dind;
pub mod env;
pub mod error;
pub mod firewall;
pub mod forward;
pub mod history;
pub mod oci;
pub mod orchestrator;
pub mod ports;
pub mod process;
pub mod provider;
pub mod secrets;
pub mod session;
pub mod spec;
pub mod status;

pub use bwrap::BwrapProvider;
pub use error::{Result, SandboxError};
pub use firewall::{FirewallLists, ListKind};
pub use oci::OciProvider;
pub use orchestrator::{build_spec, Orchestrator, SessionMode};
pub use provider::{BuildOptions, Provider, SandboxBackend};
pub use session::SessionResources;
pub use spec::{Environment, EnvironmentStatus, RunSpec, VolumeMount};
