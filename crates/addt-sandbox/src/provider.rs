//! Provider capability set and the sum type over backends.

use crate::bwrap::BwrapProvider;
use crate::error::Result;
use crate::oci::OciProvider;
use crate::session::SessionResources;
use crate::spec::{Environment, RunSpec};
use addt_core::config::ProviderKind;
use addt_core::{id, AddtPaths, EffectiveConfig, ExtensionRegistry};
use async_trait::async_trait;
use std::path::Path;

/// Image build switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Rebuild the extension image (`--addt-rebuild`).
    pub rebuild: bool,
    /// Rebuild the base image too (`--addt-rebuild-base`).
    pub rebuild_base: bool,
    /// Pass `--no-cache` to the runtime (`addt update`).
    pub no_cache: bool,
}

/// Operations every sandbox backend provides.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Provider name as used in config (`docker`, `podman`, `orbstack`, `bwrap`).
    fn name(&self) -> &'static str;

    /// Check prerequisites. Must be called before any other async operation.
    async fn initialize(&mut self, config: &EffectiveConfig) -> Result<()>;

    /// Image tag for the active extensions; `None` for image-less backends.
    fn determine_image_name(
        &self,
        config: &EffectiveConfig,
        registry: &ExtensionRegistry,
    ) -> Result<Option<String>>;

    /// Build missing images. Returns the image to run, if any.
    async fn build_if_needed(
        &self,
        config: &EffectiveConfig,
        registry: &ExtensionRegistry,
        options: BuildOptions,
    ) -> Result<Option<String>>;

    /// Run the extension command. Returns the sandboxed process's exit code.
    async fn run(&self, spec: &RunSpec, session: &mut SessionResources) -> Result<i32>;

    /// Like [`run`](Self::run) with an interactive bash instead of the command.
    async fn shell(&self, spec: &RunSpec, session: &mut SessionResources) -> Result<i32>;

    /// Sessions known to the backend.
    async fn list(&self) -> Result<Vec<Environment>>;

    async fn exists(&self, name: &str) -> Result<bool>;

    async fn is_running(&self, name: &str) -> Result<bool>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    /// Remove a session in any state, together with its backend-side state.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Release everything the session created on the host.
    fn cleanup(&self, session: &mut SessionResources) {
        session.cleanup();
    }

    /// Stable name for the project's persistent session.
    fn generate_persistent_name(&self, workdir: &Path, extensions: &[String]) -> String {
        id::persistent_name(self.name_segment(), workdir, extensions)
    }

    /// Unique name for a one-off session.
    fn generate_ephemeral_name(&self, workdir: &Path, extensions: &[String]) -> String {
        id::ephemeral_name(
            self.name_segment(),
            workdir,
            extensions,
            chrono::Local::now(),
            std::process::id(),
        )
    }

    /// Backend segment inserted into session names.
    fn name_segment(&self) -> Option<&'static str> {
        None
    }

    /// One-line banner printed before the sandbox starts.
    fn status(&self, config: &EffectiveConfig, spec: &RunSpec) -> String {
        crate::status::banner(self.name(), config, spec)
    }

    /// Names of the environment variables the image's extensions consume.
    async fn extension_env_vars(
        &self,
        image: Option<&str>,
        config: &EffectiveConfig,
        registry: &ExtensionRegistry,
    ) -> Vec<String>;
}

/// A configured backend.
pub enum Provider {
    Oci(OciProvider),
    Bwrap(BwrapProvider),
}

impl Provider {
    /// Backend for the configured provider kind.
    pub fn new(kind: ProviderKind, paths: &AddtPaths) -> Self {
        match kind {
            ProviderKind::Bwrap => Self::Bwrap(BwrapProvider::new(paths.clone())),
            kind => Self::Oci(OciProvider::new(kind, paths.clone())),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Oci(oci) => oci.kind(),
            Self::Bwrap(_) => ProviderKind::Bwrap,
        }
    }

    pub fn backend(&self) -> &dyn SandboxBackend {
        match self {
            Self::Oci(oci) => oci,
            Self::Bwrap(bwrap) => bwrap,
        }
    }

    pub fn backend_mut(&mut self) -> &mut dyn SandboxBackend {
        match self {
            Self::Oci(oci) => oci,
            Self::Bwrap(bwrap) => bwrap,
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Provider").field(&self.backend().name()).finish()
    }
}
