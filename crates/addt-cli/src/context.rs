//! Per-invocation state shared by the command handlers.

use addt_core::config::{ConfigLoader, ExtensionSelection};
use addt_core::env::{self, EnvSnapshot};
use addt_core::{AddtPaths, EffectiveConfig, ExtensionRegistry};
use anyhow::Context as _;
use std::path::{Path, PathBuf};

/// Environment, paths, config layers and the extension registry.
pub struct Context {
    pub paths: AddtPaths,
    pub workdir: PathBuf,
    pub loader: ConfigLoader,
    pub registry: ExtensionRegistry,
}

impl Context {
    /// Snapshot the process environment and read every config layer.
    pub fn load() -> anyhow::Result<Self> {
        let workdir = std::env::current_dir().context("Cannot determine the working directory")?;
        Self::from_env(env::snapshot(), &workdir)
    }

    pub fn from_env(env: EnvSnapshot, workdir: &Path) -> anyhow::Result<Self> {
        let paths = AddtPaths::from_env(&env)?;
        let loader = ConfigLoader::new(paths.clone(), workdir, env)?;
        let registry = ExtensionRegistry::load(&paths.extensions_dir());
        Ok(Self {
            paths,
            workdir: workdir.to_path_buf(),
            loader,
            registry,
        })
    }

    /// Local and built-in extensions, without reading any config file.
    ///
    /// Used before argv is parsed; falls back to the built-ins when the addt
    /// home cannot be resolved.
    pub fn load_registry() -> ExtensionRegistry {
        match AddtPaths::from_env(&env::snapshot()) {
            Ok(paths) => ExtensionRegistry::load(&paths.extensions_dir()),
            Err(_) => ExtensionRegistry::embedded(),
        }
    }

    /// Global keys only; enough for provider lifecycle commands.
    pub fn base_config(&self) -> anyhow::Result<EffectiveConfig> {
        Ok(self.loader.compose_base()?)
    }

    /// Full configuration for `selection`.
    pub fn compose(&self, selection: &ExtensionSelection) -> anyhow::Result<EffectiveConfig> {
        Ok(self.loader.compose(&self.registry, selection)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_context_from_env() {
        let home = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let env: EnvSnapshot = [
            ("HOME".to_string(), home.path().display().to_string()),
            ("ADDT_PROVIDER".to_string(), "podman".to_string()),
        ]
        .into_iter()
        .collect();

        let ctx = Context::from_env(env, project.path()).unwrap();
        assert_eq!(ctx.paths.home(), home.path().join(".addt"));
        assert!(ctx.registry.contains("claude"));

        let config = ctx.compose(&ExtensionSelection::requested("claude")).unwrap();
        assert_eq!(config.provider, addt_core::config::ProviderKind::Podman);
        assert_eq!(config.extensions, vec!["claude"]);
        assert_eq!(config.workdir.path, project.path());
    }
}
