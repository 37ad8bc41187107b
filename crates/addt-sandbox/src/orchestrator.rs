//! Session orchestration: from an [`EffectiveConfig`] to a running sandbox.
//!
//! The orchestrator owns the selected [`Provider`], composes the
//! [`RunSpec`] for one invocation and guarantees that every resource the
//! session created is released, whatever the outcome of the run.

use crate::env;
use crate::error::{Result, SandboxError};
use crate::firewall::{self, FirewallLists, ListKind};
use crate::forward::{git, github};
use crate::history;
use crate::ports;
use crate::process;
use crate::provider::{BuildOptions, Provider, SandboxBackend};
use crate::session::SessionResources;
use crate::spec::{AgentForward, FirewallSpec, RunSpec, TmuxForward, VolumeMount, SANDBOX_HOME};
use addt_core::config::Source;
use addt_core::{AddtPaths, EffectiveConfig, ExtensionRegistry};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause before retrying with a fresh ephemeral name.
const NAME_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What the session executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// The extension command.
    Run,
    /// An interactive bash.
    Shell,
}

/// Drives one invocation against the configured provider.
pub struct Orchestrator {
    provider: Provider,
    paths: AddtPaths,
    initialized: bool,
}

impl Orchestrator {
    /// Orchestrator for the provider selected in `config`.
    pub fn new(config: &EffectiveConfig, paths: AddtPaths) -> Self {
        Self::with_provider(Provider::new(config.provider, &paths), paths)
    }

    pub fn with_provider(provider: Provider, paths: AddtPaths) -> Self {
        Self {
            provider,
            paths,
            initialized: false,
        }
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn backend(&self) -> &dyn SandboxBackend {
        self.provider.backend()
    }

    pub fn paths(&self) -> &AddtPaths {
        &self.paths
    }

    /// Check provider prerequisites once.
    pub async fn initialize(&mut self, config: &EffectiveConfig) -> Result<()> {
        if !self.initialized {
            self.provider.backend_mut().initialize(config).await?;
            self.initialized = true;
        }
        Ok(())
    }

    /// Build the images for the active extensions.
    pub async fn build(
        &mut self,
        config: &EffectiveConfig,
        registry: &ExtensionRegistry,
        options: BuildOptions,
    ) -> Result<Option<String>> {
        self.initialize(config).await?;
        self.backend().build_if_needed(config, registry, options).await
    }

    /// Run the session and return the sandboxed process's exit code.
    ///
    /// Session resources are released before returning: on success, on every
    /// error path, and when SIGINT or SIGTERM arrives during the build,
    /// proxy start-up or container start (exit code `128 + signo`).
    pub async fn run(
        &mut self,
        config: &EffectiveConfig,
        registry: &ExtensionRegistry,
        mode: SessionMode,
        args: Vec<String>,
        options: BuildOptions,
    ) -> Result<i32> {
        let mut session = SessionResources::new();
        let outcome = until_interrupted(self.run_session(
            config,
            registry,
            mode,
            args,
            options,
            &mut session,
        ))
        .await;
        self.backend().cleanup(&mut session);
        outcome
    }

    async fn run_session(
        &mut self,
        config: &EffectiveConfig,
        registry: &ExtensionRegistry,
        mode: SessionMode,
        args: Vec<String>,
        options: BuildOptions,
        session: &mut SessionResources,
    ) -> Result<i32> {
        let image = self.build(config, registry, options).await?;

        let mut retried = false;
        loop {
            let spec = build_spec(self.backend(), config, registry, &self.paths, image.clone(), args.clone())
                .await?;
            eprintln!("{}", self.backend().status(config, &spec));

            let result = match mode {
                SessionMode::Run => self.backend().run(&spec, session).await,
                SessionMode::Shell => self.backend().shell(&spec, session).await,
            };
            self.backend().cleanup(session);

            match result {
                Err(SandboxError::NameInUse(name)) if !spec.persistent && !retried => {
                    warn!("Container name {} is taken, retrying with a new name", name);
                    retried = true;
                    tokio::time::sleep(NAME_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }
}

/// Drive `work` until it finishes or addt is interrupted.
///
/// On interrupt `work` is dropped unfinished and the result is `128 + signo`;
/// the caller still owns whatever `work` borrowed and must release it.
pub async fn until_interrupted<F>(work: F) -> Result<i32>
where
    F: Future<Output = Result<i32>>,
{
    tokio::select! {
        result = work => result,
        code = process::interrupted() => {
            let code = code?;
            warn!("Interrupted, releasing session resources");
            Ok(code)
        }
    }
}

/// Compose the [`RunSpec`] for one session.
pub async fn build_spec(
    backend: &dyn SandboxBackend,
    config: &EffectiveConfig,
    registry: &ExtensionRegistry,
    paths: &AddtPaths,
    image: Option<String>,
    args: Vec<String>,
) -> Result<RunSpec> {
    let workdir = config.workdir.path.clone();
    let name = if config.persistent {
        backend.generate_persistent_name(&workdir, &config.extensions)
    } else {
        backend.generate_ephemeral_name(&workdir, &config.extensions)
    };
    debug!("Session name {}", name);

    let mut spec = RunSpec::new(name, workdir).with_args(args);
    spec.interactive = true;
    spec.persistent = config.persistent;
    spec.image = image;
    spec.command = config.command.clone();
    spec.mount_workdir = config.workdir.automount;
    spec.workdir_readonly = config.workdir.readonly;
    spec.security = config.security.clone();
    spec.container = config.container.clone();
    spec.dind = config.dind.mode;
    spec.history_persist = config.history_persist;

    spec.volumes = extension_mounts(config, registry, paths);
    if config.history_persist {
        match history::history_mounts(paths, &spec.workdir) {
            Ok(mounts) => spec.volumes.extend(mounts),
            Err(e) => warn!("Shell history not persisted: {}", e),
        }
    }

    spec.env = session_env(backend, config);
    spec.secrets = config.host.secrets.clone();
    if let Some(token) = github::resolve_token(&config.github, config.host.github_token.as_ref()).await {
        spec.secrets.insert("GH_TOKEN".to_string(), token);
    }

    if config.ports.forward && !config.ports.expose.is_empty() {
        let container_ports = ports::parse_ports(&config.ports.expose)?;
        let range_start = u16::try_from(config.ports.range_start).map_err(|_| {
            SandboxError::config(format!(
                "ports.range_start {} is not a valid port",
                config.ports.range_start
            ))
        })?;
        spec.ports = ports::allocate(&container_ports, range_start).await?;
        ports::apply_env(&mut spec.env, &spec.ports, config.ports.inject_system_prompt);
    }

    spec.ssh = AgentForward {
        mode: config.ssh.forward_mode,
        allowed: config.ssh.allowed_keys.clone(),
        explicit: config.source_of("ssh.forward_mode") != Source::Default,
    };
    spec.ssh_auth_sock = config.host.ssh_auth_sock.clone();
    spec.gpg = AgentForward {
        mode: config.gpg.forward,
        allowed: config.gpg.allowed_key_ids.clone(),
        explicit: config.source_of("gpg.forward") != Source::Default,
    };
    spec.gnupg_home = config.host.gnupg_home.clone();
    spec.docker_host = config.host.docker_host.clone();
    if config.tmux_forward {
        spec.tmux = config.host.tmux.clone().map(|tmux| TmuxForward {
            tmux,
            pane: config.host.tmux_pane.clone(),
        });
    }
    spec.git_config = git::host_gitconfig(&config.git, paths.user_home());
    spec.git_disable_hooks = config.git.disable_hooks;

    spec.firewall = firewall_spec(config, paths)?;
    Ok(spec)
}

/// Manifest mounts of the active extensions that are switched on.
fn extension_mounts(
    config: &EffectiveConfig,
    registry: &ExtensionRegistry,
    paths: &AddtPaths,
) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();
    for name in &config.extensions {
        let Some(ext) = registry.get(name) else {
            continue;
        };
        let settings = config.extension(name);
        if !settings.automount.unwrap_or(ext.auto_mount) {
            continue;
        }
        let readonly = settings.readonly.unwrap_or(ext.readonly);
        for mount in &ext.mounts {
            let target = match mount.target.strip_prefix('~') {
                Some(rest) => format!("{}{}", SANDBOX_HOME, rest),
                None => mount.target.clone(),
            };
            mounts.push(VolumeMount::new(paths.expand(&mount.source), target).readonly(readonly));
        }
    }
    mounts
}

/// Plain environment for the session; secrets are kept apart.
fn session_env(backend: &dyn SandboxBackend, config: &EffectiveConfig) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = config
        .host
        .forwarded
        .iter()
        .map(|(k, v)| (k.clone(), v.expose_secret().to_string()))
        .collect();
    out.extend(env::terminal_env(&config.host.terminal));

    if let Some(command) = &config.command {
        out.insert("ADDT_COMMAND".to_string(), command.clone());
    }
    out.insert("ADDT_EXTENSIONS".to_string(), config.extensions.join(","));
    out.insert(
        "ADDT_FIREWALL_ENABLED".to_string(),
        config.firewall.enabled.to_string(),
    );
    out.insert("ADDT_FIREWALL_MODE".to_string(), config.firewall.mode.to_string());

    let first = config.primary_extension().unwrap_or_default();
    out.extend(env::otel_env(&config.otel, first, config.provider));
    out.extend(env::extension_flag_env(config));
    out.extend(github::scope_env(&config.github));
    debug!("{} environment variables for {}", out.len(), backend.name());
    out
}

/// Global firewall lists merged with the project's `firewall.*` keys.
fn firewall_spec(config: &EffectiveConfig, paths: &AddtPaths) -> Result<FirewallSpec> {
    if !config.firewall.enabled {
        return Ok(FirewallSpec {
            mode: config.firewall.mode,
            ..FirewallSpec::default()
        });
    }
    let lists = FirewallLists::new(paths.firewall_dir());
    lists.ensure_defaults()?;
    let allowed = firewall::merge(&lists.read(ListKind::Allowed)?, &config.firewall.allowed);
    let denied = firewall::merge(&lists.read(ListKind::Denied)?, &config.firewall.denied);
    info!(
        "Firewall {}: {} allowed, {} denied",
        config.firewall.mode,
        allowed.len(),
        denied.len()
    );
    Ok(FirewallSpec {
        enabled: true,
        mode: config.firewall.mode,
        allowed,
        denied,
        allowed_ports: lists.allowed_ports()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use addt_core::config::{FirewallMode, ProviderKind};
    use addt_core::extensions::ExtensionMount;
    use addt_core::{Extension, SecretString};
    use std::path::Path;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, AddtPaths, Provider) {
        let dir = TempDir::new().unwrap();
        let paths = AddtPaths::with_root(dir.path().join(".addt"), dir.path());
        let provider = Provider::new(ProviderKind::Bwrap, &paths);
        (dir, paths, provider)
    }

    fn config_for(workdir: &Path) -> EffectiveConfig {
        let mut config = EffectiveConfig::default();
        config.provider = ProviderKind::Bwrap;
        config.extensions = vec!["claude".to_string()];
        config.command = Some("claude".to_string());
        config.workdir.path = workdir.to_path_buf();
        config.workdir.automount = true;
        config.github.forward_token = false;
        config.history_persist = false;
        config
    }

    #[tokio::test]
    async fn test_build_spec_env_and_names() {
        let (dir, paths, provider) = fixture();
        let mut config = config_for(dir.path());
        config.host.forwarded.insert("EXTRA".to_string(), SecretString::new("x"));
        config
            .host
            .secrets
            .insert("ANTHROPIC_API_KEY".to_string(), SecretString::new("sk-1"));
        let registry = ExtensionRegistry::embedded();

        let spec = build_spec(provider.backend(), &config, &registry, &paths, None, vec!["-p".into()])
            .await
            .unwrap();
        assert!(spec.name.starts_with("addt-bwrap-"));
        assert!(!spec.persistent);
        assert_eq!(spec.args, vec!["-p"]);
        assert_eq!(spec.env["ADDT_COMMAND"], "claude");
        assert_eq!(spec.env["ADDT_EXTENSIONS"], "claude");
        assert_eq!(spec.env["ADDT_FIREWALL_ENABLED"], "false");
        assert_eq!(spec.env["EXTRA"], "x");
        assert!(spec.env.contains_key("TERM"));
        assert!(!spec.env.contains_key("ANTHROPIC_API_KEY"));
        assert_eq!(spec.secrets["ANTHROPIC_API_KEY"].expose_secret(), "sk-1");
        assert!(!spec.firewall.enabled);

        config.persistent = true;
        let persistent = build_spec(provider.backend(), &config, &registry, &paths, None, Vec::new())
            .await
            .unwrap();
        assert!(persistent.name.starts_with("addt-bwrap-persistent-"));
        assert!(persistent.persistent);
    }

    #[tokio::test]
    async fn test_build_spec_forward_explicitness() {
        let (dir, paths, provider) = fixture();
        let env: addt_core::env::EnvSnapshot =
            [("ADDT_SSH_FORWARD_MODE".to_string(), "proxy".to_string())]
                .into_iter()
                .collect();
        let loader = addt_core::config::ConfigLoader::new(paths.clone(), dir.path(), env).unwrap();
        let mut config = loader.compose_base().unwrap();
        config.extensions = vec!["claude".to_string()];
        config.github.forward_token = false;
        let registry = ExtensionRegistry::embedded();

        let spec = build_spec(provider.backend(), &config, &registry, &paths, None, Vec::new())
            .await
            .unwrap();
        assert_eq!(spec.ssh.mode, addt_core::config::ForwardMode::Proxy);
        assert!(spec.ssh.explicit);
        assert!(!spec.gpg.explicit);
    }

    #[tokio::test]
    async fn test_firewall_lists_merge() {
        let (dir, paths, _) = fixture();
        let mut config = config_for(dir.path());
        config.firewall.enabled = true;
        config.firewall.mode = FirewallMode::Permissive;
        config.firewall.allowed = vec!["Example.com".to_string()];
        config.firewall.denied = vec!["evil.test".to_string()];

        let spec = firewall_spec(&config, &paths).unwrap();
        assert!(spec.enabled);
        assert_eq!(spec.mode, FirewallMode::Permissive);
        assert!(spec.allowed.contains(&"github.com".to_string()));
        assert!(spec.allowed.contains(&"example.com".to_string()));
        assert_eq!(spec.denied, vec!["evil.test"]);
        assert!(!spec.allowed_ports.is_empty());
        assert!(paths.firewall_dir().join(firewall::ALLOWED_DOMAINS_FILE).is_file());
    }

    #[test]
    fn test_extension_mounts_respect_overrides() {
        let (dir, paths, _) = fixture();
        let mut config = config_for(dir.path());
        config.extensions = vec!["demo".to_string()];

        let mut registry = ExtensionRegistry::embedded();
        let mut ext = Extension::from_yaml("name: demo\nentrypoint: demo\n").unwrap();
        ext.mounts = vec![ExtensionMount {
            source: "~/.demo".to_string(),
            target: "~/.demo".to_string(),
        }];
        registry.insert(ext);

        assert!(extension_mounts(&config, &registry, &paths).is_empty());

        let settings = config.extension_settings.entry("demo".to_string()).or_default();
        settings.automount = Some(true);
        settings.readonly = Some(true);
        let mounts = extension_mounts(&config, &registry, &paths);
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].source, dir.path().join(".demo"));
        assert_eq!(mounts[0].target, "/home/addt/.demo");
        assert!(mounts[0].readonly);
    }

    #[tokio::test]
    async fn test_bwrap_build_is_noop() {
        let (dir, paths, provider) = fixture();
        let config = config_for(dir.path());
        let registry = ExtensionRegistry::embedded();
        let orchestrator = Orchestrator::with_provider(provider, paths);
        assert_eq!(orchestrator.backend().name(), "bwrap");
        let image = orchestrator
            .backend()
            .build_if_needed(&config, &registry, BuildOptions::default())
            .await
            .unwrap();
        assert!(image.is_none());
    }
}
