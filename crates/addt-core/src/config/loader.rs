//! Config composition: defaults < global file < project file < environment.

use super::file::ConfigFile;
use super::keys::{self, ConfigKey, ExtensionField};
use super::schema::{EffectiveConfig, HostContext, Source};
use crate::env::{self, vars, EnvSnapshot, TERMINAL_VARS};
use crate::error::{ConfigError, Result};
use crate::extensions::ExtensionRegistry;
use crate::paths::AddtPaths;
use crate::secret::SecretString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extension used when nothing selects one.
pub const DEFAULT_EXTENSION: &str = "claude";

/// Prefix of symlinked aliases that force an extension (`addt-codex`).
pub const ALIAS_PREFIX: &str = "addt-";

/// Per-extension switches (`ADDT_<EXT>_<SUFFIX>`) passed through to the entrypoint.
const EXTENSION_AUTH_VARS: &[&str] = &["AUTH_AUTOLOGIN", "AUTH_METHOD", "WORKDIR_AUTOTRUST"];

/// How the caller asked for extensions.
#[derive(Debug, Clone, Default)]
pub struct ExtensionSelection {
    /// File name the binary was invoked as.
    pub invoked_as: Option<String>,
    /// Extension named on the command line.
    pub requested: Option<String>,
}

impl ExtensionSelection {
    pub fn requested(name: impl Into<String>) -> Self {
        Self {
            invoked_as: None,
            requested: Some(name.into()),
        }
    }

    /// Extension forced by an `addt-<ext>` alias. Names that are not a
    /// known extension (`addt-dev`) are not aliases.
    pub fn alias_extension(&self, registry: &ExtensionRegistry) -> Option<&str> {
        self.invoked_as
            .as_deref()
            .and_then(|name| name.strip_prefix(ALIAS_PREFIX))
            .filter(|ext| !ext.is_empty() && registry.contains(ext))
    }
}

/// Holds the config layers for one invocation.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    paths: AddtPaths,
    workdir: PathBuf,
    env: EnvSnapshot,
    global: ConfigFile,
    project: ConfigFile,
}

impl ConfigLoader {
    /// Read both config files. Unreadable or malformed files are fatal.
    pub fn new(
        paths: AddtPaths,
        workdir: &Path,
        env: EnvSnapshot,
    ) -> std::result::Result<Self, ConfigError> {
        let global = ConfigFile::load(&paths.global_config_file())?;
        let project = ConfigFile::load(&paths.project_config_file(workdir))?;
        Ok(Self {
            paths,
            workdir: workdir.to_path_buf(),
            env,
            global,
            project,
        })
    }

    pub fn paths(&self) -> &AddtPaths {
        &self.paths
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn env(&self) -> &EnvSnapshot {
        &self.env
    }

    pub fn global_file(&self) -> &ConfigFile {
        &self.global
    }

    pub fn project_file(&self) -> &ConfigFile {
        &self.project
    }

    /// Compose the global keys only.
    ///
    /// Enough to initialise logging before the extension registry is read.
    pub fn compose_base(&self) -> std::result::Result<EffectiveConfig, ConfigError> {
        let mut config = EffectiveConfig::default();

        for (file, source) in [(&self.global, Source::Global), (&self.project, Source::Project)] {
            for (key, value) in file.flatten() {
                let Some(def) = keys::lookup(&key) else {
                    if !key.starts_with("extensions.") {
                        debug!("Ignoring unknown key {} in {}", key, file.path().display());
                    }
                    continue;
                };
                keys::check_yaml_value(def.key, def.kind, &value)?;
                config.apply(def.key, &keys::render_value(&value))?;
                config.record_source(def.key, source);
            }
        }

        for def in keys::KEYS {
            if let Some(raw) = self.env.get(&keys::env_var_for(def.key)) {
                config.apply(def.key, raw)?;
                config.record_source(def.key, Source::Env);
            }
        }

        config.workdir.path = self.workdir.clone();
        config.host = self.host_context();
        Ok(config)
    }

    /// Compose the full configuration for the selected extensions.
    pub fn compose(
        &self,
        registry: &ExtensionRegistry,
        selection: &ExtensionSelection,
    ) -> Result<EffectiveConfig> {
        let mut config = self.compose_base()?;
        config.host.invoked_as = selection.invoked_as.clone();

        config.extensions = self.select_extensions(registry, selection);
        registry.validate_names(&config.extensions)?;
        let installed = registry.resolve_order(&config.extensions)?;

        for name in &installed {
            self.apply_extension_settings(&mut config, registry, name)?;
        }

        config.command = env::get_var(&self.env, vars::ADDT_COMMAND)
            .map(str::to_string)
            .or_else(|| {
                config
                    .primary_extension()
                    .and_then(|name| registry.get(name))
                    .map(|ext| ext.command().to_string())
            });

        self.collect_forwarded(&mut config, registry, &installed)?;
        Ok(config)
    }

    /// Alias beats the command line, which beats `ADDT_EXTENSIONS`.
    fn select_extensions(
        &self,
        registry: &ExtensionRegistry,
        selection: &ExtensionSelection,
    ) -> Vec<String> {
        let from_env = env::get_var(&self.env, vars::ADDT_EXTENSIONS)
            .map(keys::parse_list)
            .unwrap_or_default();

        let mut selected = if let Some(ext) = selection.alias_extension(registry) {
            vec![ext.to_string()]
        } else if let Some(ext) = selection.requested.as_deref() {
            // A requested extension leads; ADDT_EXTENSIONS still contributes
            // companions when it names the requested one.
            let mut list = vec![ext.to_string()];
            if from_env.iter().any(|e| e == ext) {
                list.extend(from_env.iter().cloned());
            }
            list
        } else if !from_env.is_empty() {
            from_env
        } else {
            vec![DEFAULT_EXTENSION.to_string()]
        };

        let mut seen = std::collections::HashSet::new();
        selected.retain(|e| seen.insert(e.clone()));
        selected
    }

    fn apply_extension_settings(
        &self,
        config: &mut EffectiveConfig,
        registry: &ExtensionRegistry,
        name: &str,
    ) -> Result<()> {
        let Some(ext) = registry.get(name) else {
            return Ok(());
        };

        let mut fields = vec![
            ExtensionField::Version,
            ExtensionField::Automount,
            ExtensionField::Readonly,
        ];
        fields.extend(ext.flags.iter().map(|f| ExtensionField::Flag(f.flag.clone())));

        let mut settings = config.extension(name);
        for field in fields {
            let key = ConfigKey::Extension {
                name: name.to_string(),
                field: field.clone(),
            };
            let path = key.path();

            let mut found: Option<(String, Source)> = None;
            for (file, source) in [(&self.global, Source::Global), (&self.project, Source::Project)] {
                if let Some(value) = file.get(&path) {
                    keys::check_yaml_value(&path, key.kind(), value)?;
                    found = Some((keys::render_value(value), source));
                }
            }
            if let Some(raw) = env::get_var(&self.env, &key.env_var()) {
                found = Some((raw.to_string(), Source::Env));
            }

            let Some((raw, source)) = found else {
                continue;
            };
            match &field {
                ExtensionField::Version => settings.version = Some(raw),
                ExtensionField::Automount => {
                    settings.automount = Some(keys::parse_bool(&path, &raw)?)
                }
                ExtensionField::Readonly => {
                    settings.readonly = Some(keys::parse_bool(&path, &raw)?)
                }
                ExtensionField::Flag(flag) => {
                    settings.flags.insert(flag.clone(), raw);
                }
            }
            config.record_source(&path, source);
        }

        config
            .extension_settings
            .insert(name.to_string(), settings);
        Ok(())
    }

    fn collect_forwarded(
        &self,
        config: &mut EffectiveConfig,
        registry: &ExtensionRegistry,
        installed: &[String],
    ) -> Result<()> {
        for name in installed {
            let Some(ext) = registry.get(name) else {
                continue;
            };
            for spec in ext.env_var_specs() {
                if config.host.secrets.contains_key(&spec.name) {
                    continue;
                }
                let value = env::get_var(&self.env, &spec.name)
                    .map(str::to_string)
                    .or(spec.default)
                    .filter(|v| !v.is_empty());
                if let Some(value) = value {
                    config
                        .host
                        .secrets
                        .insert(spec.name, SecretString::new(value));
                }
            }
        }

        for name in installed {
            let stem = env::env_stem(name);
            for suffix in EXTENSION_AUTH_VARS {
                let var = format!("ADDT_{}_{}", stem, suffix);
                if let Some(value) = env::get_var(&self.env, &var) {
                    let value = SecretString::new(value);
                    config.host.forwarded.insert(var, value);
                }
            }
        }

        let env_file = if config.env_file.is_empty() {
            self.workdir.join(".env")
        } else {
            let path = self.paths.expand(&config.env_file);
            if path.is_absolute() {
                path
            } else {
                self.workdir.join(path)
            }
        };
        for (name, value) in env::load_env_file(&env_file)? {
            if config.host.secrets.contains_key(&name) {
                continue;
            }
            let value = env::get_var(&self.env, &name)
                .map(str::to_string)
                .unwrap_or(value);
            if !value.is_empty() {
                config.host.forwarded.insert(name, SecretString::new(value));
            }
        }

        for name in config.env_vars.clone() {
            if config.host.secrets.contains_key(&name) {
                continue;
            }
            if let Some(value) = env::get_var(&self.env, &name) {
                config
                    .host
                    .forwarded
                    .insert(name, SecretString::new(value));
            }
        }

        Ok(())
    }

    fn host_context(&self) -> HostContext {
        let terminal = TERMINAL_VARS
            .iter()
            .filter_map(|name| {
                env::get_var(&self.env, name).map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        let github_token = env::get_var(&self.env, vars::GH_TOKEN)
            .or_else(|| env::get_var(&self.env, vars::GITHUB_TOKEN))
            .map(SecretString::new);

        HostContext {
            terminal,
            ssh_auth_sock: env::get_var(&self.env, vars::SSH_AUTH_SOCK).map(PathBuf::from),
            gnupg_home: env::get_var(&self.env, vars::GNUPGHOME).map(PathBuf::from),
            docker_host: env::get_var(&self.env, vars::DOCKER_HOST).map(str::to_string),
            tmux: env::get_var(&self.env, vars::TMUX).map(str::to_string),
            tmux_pane: env::get_var(&self.env, vars::TMUX_PANE).map(str::to_string),
            github_token,
            secrets: Default::default(),
            forwarded: Default::default(),
            user_home: self.paths.user_home().to_path_buf(),
            addt_home: self.paths.home().to_path_buf(),
            invoked_as: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{FirewallMode, ProviderKind};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        paths: AddtPaths,
        workdir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("addt");
        let workdir = dir.path().join("project");
        fs::create_dir_all(&home).unwrap();
        fs::create_dir_all(&workdir).unwrap();
        Fixture {
            paths: AddtPaths::with_root(&home, dir.path()),
            workdir,
            _dir: dir,
        }
    }

    fn env(pairs: &[(&str, &str)]) -> EnvSnapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_precedence_defaults_global_project_env() {
        let fx = fixture();
        fs::write(
            fx.paths.global_config_file(),
            "security:\n  pids_limit: 100\npersistent: true\nfirewall:\n  mode: permissive\n",
        )
        .unwrap();
        fs::write(
            fx.paths.project_config_file(&fx.workdir),
            "security:\n  pids_limit: 150\n",
        )
        .unwrap();

        let loader = ConfigLoader::new(
            fx.paths.clone(),
            &fx.workdir,
            env(&[("ADDT_FIREWALL_MODE", "strict"), ("ADDT_PROVIDER", "bwrap")]),
        )
        .unwrap();
        let config = loader.compose_base().unwrap();

        assert_eq!(config.security.pids_limit, 150);
        assert_eq!(config.source_of("security.pids_limit"), Source::Project);
        assert!(config.persistent);
        assert_eq!(config.source_of("persistent"), Source::Global);
        assert_eq!(config.firewall.mode, FirewallMode::Strict);
        assert_eq!(config.source_of("firewall.mode"), Source::Env);
        assert_eq!(config.provider, ProviderKind::Bwrap);
        assert_eq!(config.source_of("node_version"), Source::Default);
    }

    #[test]
    fn test_invalid_env_value_is_fatal() {
        let fx = fixture();
        let loader =
            ConfigLoader::new(fx.paths.clone(), &fx.workdir, env(&[("ADDT_PERSISTENT", "yes")]))
                .unwrap();
        assert!(matches!(
            loader.compose_base(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_extension_selection() {
        let fx = fixture();
        let registry = ExtensionRegistry::embedded();

        let loader = ConfigLoader::new(fx.paths.clone(), &fx.workdir, env(&[])).unwrap();
        let config = loader.compose(&registry, &ExtensionSelection::default()).unwrap();
        assert_eq!(config.extensions, vec!["claude"]);
        assert_eq!(config.command.as_deref(), Some("claude"));

        let loader = ConfigLoader::new(
            fx.paths.clone(),
            &fx.workdir,
            env(&[("ADDT_EXTENSIONS", "codex, claude, codex")]),
        )
        .unwrap();
        let config = loader.compose(&registry, &ExtensionSelection::default()).unwrap();
        assert_eq!(config.extensions, vec!["codex", "claude"]);
        assert_eq!(config.command.as_deref(), Some("codex"));

        let alias = ExtensionSelection {
            invoked_as: Some("addt-gemini".to_string()),
            requested: Some("codex".to_string()),
        };
        let config = loader.compose(&registry, &alias).unwrap();
        assert_eq!(config.extensions, vec!["gemini"]);

        let dev_build = ExtensionSelection {
            invoked_as: Some("addt-dev".to_string()),
            requested: Some("codex".to_string()),
        };
        assert_eq!(dev_build.alias_extension(&registry), None);
        assert_eq!(alias.alias_extension(&registry), Some("gemini"));
        let config = loader.compose(&registry, &dev_build).unwrap();
        assert_eq!(config.extensions[0], "codex");

        let config = loader
            .compose(&registry, &ExtensionSelection::requested("claude"))
            .unwrap();
        assert_eq!(config.extensions, vec!["claude", "codex"]);
    }

    #[test]
    fn test_unknown_extension_fails() {
        let fx = fixture();
        let registry = ExtensionRegistry::embedded();
        let loader = ConfigLoader::new(fx.paths.clone(), &fx.workdir, env(&[])).unwrap();
        assert!(loader
            .compose(&registry, &ExtensionSelection::requested("nope"))
            .is_err());
    }

    #[test]
    fn test_command_override_and_extension_settings() {
        let fx = fixture();
        fs::write(
            fx.paths.project_config_file(&fx.workdir),
            "extensions:\n  claude:\n    version: 1.0.0\n    automount: false\n",
        )
        .unwrap();
        let registry = ExtensionRegistry::embedded();
        let loader = ConfigLoader::new(
            fx.paths.clone(),
            &fx.workdir,
            env(&[
                ("ADDT_COMMAND", "bash -l"),
                ("ADDT_CLAUDE_VERSION", "2.0.0"),
                ("ADDT_CLAUDE_YOLO", "true"),
            ]),
        )
        .unwrap();
        let config = loader
            .compose(&registry, &ExtensionSelection::requested("claude"))
            .unwrap();

        let claude = config.extension("claude");
        assert_eq!(claude.version.as_deref(), Some("2.0.0"));
        assert_eq!(claude.automount, Some(false));
        assert_eq!(claude.flags.get("yolo").map(String::as_str), Some("true"));
        assert_eq!(config.command.as_deref(), Some("bash -l"));
        assert_eq!(config.source_of("extensions.claude.version"), Source::Env);
        assert_eq!(config.source_of("extensions.claude.automount"), Source::Project);
    }

    #[test]
    fn test_secrets_and_forwarded_env() {
        let fx = fixture();
        fs::write(fx.workdir.join(".env"), "FROM_FILE=1\nOVERRIDDEN=file\n").unwrap();
        let registry = ExtensionRegistry::embedded();
        let loader = ConfigLoader::new(
            fx.paths.clone(),
            &fx.workdir,
            env(&[
                ("ANTHROPIC_API_KEY", "sk-1"),
                ("CLAUDE_CODE_OAUTH_TOKEN", ""),
                ("OVERRIDDEN", "host"),
                ("ADDT_ENV_VARS", "EXTRA,MISSING"),
                ("EXTRA", "x"),
            ]),
        )
        .unwrap();
        let config = loader
            .compose(&registry, &ExtensionSelection::requested("claude-flow"))
            .unwrap();

        let secrets = &config.host.secrets;
        assert_eq!(secrets["ANTHROPIC_API_KEY"].expose_secret(), "sk-1");
        assert!(!secrets.contains_key("CLAUDE_CODE_OAUTH_TOKEN"));

        let forwarded = &config.host.forwarded;
        assert_eq!(forwarded["FROM_FILE"].expose_secret(), "1");
        assert_eq!(forwarded["OVERRIDDEN"].expose_secret(), "host");
        assert_eq!(forwarded["EXTRA"].expose_secret(), "x");
        assert!(!forwarded.contains_key("MISSING"));
    }
}
