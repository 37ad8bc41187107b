//! OCI provider: Docker, Podman and OrbStack.

pub mod args;
pub mod build;
pub mod runtime;

pub use build::{BuildPlan, HostUser, ImageBuilder};
pub use runtime::Runtime;

use self::args::{Entry, Launch, RunCommand};
use crate::dind;
use crate::error::{Result, SandboxError};
use crate::firewall;
use crate::forward;
use crate::ports;
use crate::process;
use crate::provider::{BuildOptions, SandboxBackend};
use crate::secrets::{self, SECRETS_MOUNT, SECRETS_SCRIPT};
use crate::session::SessionResources;
use crate::spec::{Environment, RunSpec, VolumeMount};
use addt_core::config::{DindMode, ProviderKind};
use addt_core::{AddtPaths, EffectiveConfig, ExtensionRegistry};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Keep-alive readiness polling.
const READY_ATTEMPTS: u32 = 30;
const READY_INTERVAL: Duration = Duration::from_secs(1);
const READY_MARKER: &str = "/tmp/.addt-ready";

/// Sandbox backed by a container runtime.
pub struct OciProvider {
    kind: ProviderKind,
    paths: AddtPaths,
    user: HostUser,
    runtime: Option<Runtime>,
}

/// Everything a session contributes on top of the [`RunSpec`].
struct Prepared {
    mounts: Vec<VolumeMount>,
    /// Environment without secrets; safe for `docker inspect`.
    env: BTreeMap<String, String>,
    /// Secrets passed with `-e` when isolation is off.
    secret_env: BTreeMap<String, String>,
    secrets_file: Option<String>,
}

impl OciProvider {
    pub fn new(kind: ProviderKind, paths: AddtPaths) -> Self {
        Self {
            kind,
            paths,
            user: HostUser::current(),
            runtime: None,
        }
    }

    /// Provider with an already resolved runtime.
    pub fn with_runtime(runtime: Runtime, paths: AddtPaths) -> Self {
        Self {
            kind: runtime.kind(),
            paths,
            user: HostUser::current(),
            runtime: Some(runtime),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| SandboxError::config(format!("{} provider is not initialized", self.kind)))
    }

    async fn prepare(&self, spec: &RunSpec, session: &mut SessionResources) -> Result<Prepared> {
        let forwarding =
            forward::prepare_all(session, spec, self.paths.user_home(), self.kind).await?;

        let mut env = spec.env.clone();
        env.extend(forwarding.env);
        let mut mounts = forwarding.mounts;
        let mut secret_env = BTreeMap::new();
        let mut secrets_file = None;

        if spec.security.isolate_secrets {
            if let Some(mount) = secrets::materialize(session, &spec.secrets)? {
                mounts.push(mount);
                let file = format!("{}/{}", SECRETS_MOUNT, SECRETS_SCRIPT);
                env.insert(args::SECRETS_FILE_VAR.to_string(), file.clone());
                secrets_file = Some(file);
            }
        } else {
            for (name, value) in &spec.secrets {
                if !value.is_empty() {
                    secret_env.insert(name.clone(), value.expose_secret().to_string());
                }
            }
        }

        Ok(Prepared {
            mounts,
            env,
            secret_env,
            secrets_file,
        })
    }

    /// Network, firewall and DinD arguments, plus their environment.
    fn runtime_args(&self, spec: &RunSpec, env: &mut BTreeMap<String, String>) -> Result<Vec<String>> {
        let runtime = self.runtime()?;
        let mut out = args::security_args(&spec.security, &spec.container, self.user);

        let network = if spec.firewall.enabled && self.kind == ProviderKind::Podman {
            firewall::pasta_network(spec.firewall.mode, &spec.firewall.allowed_ports)
        } else {
            spec.security.network_mode.as_str().to_string()
        };
        out.push("--network".to_string());
        out.push(network);

        if spec.firewall.enabled {
            out.push("--cap-add".to_string());
            out.push("NET_ADMIN".to_string());
        }

        let socket = dind::host_socket(spec.docker_host.as_deref());
        let setup = dind::setup(spec.dind, runtime.backend_name(), &spec.name, &socket);
        out.extend(setup.args);
        env.extend(setup.env);

        let otel_on_host = env
            .get("OTEL_EXPORTER_OTLP_ENDPOINT")
            .is_some_and(|e| e.contains("host.docker.internal"));
        if cfg!(target_os = "linux") && self.kind == ProviderKind::Docker && otel_on_host {
            out.push("--add-host".to_string());
            out.push("host.docker.internal:host-gateway".to_string());
        }
        Ok(out)
    }

    fn tty() -> bool {
        std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
    }

    async fn ensure_image(&self, spec: &RunSpec) -> Result<String> {
        let image = spec
            .image
            .clone()
            .ok_or_else(|| SandboxError::config("no image selected for the session"))?;
        if !self.runtime()?.image_exists(&image).await? {
            return Err(SandboxError::ImageMissing(image));
        }
        Ok(image)
    }

    async fn run_ephemeral(
        &self,
        spec: &RunSpec,
        session: &mut SessionResources,
        shell: bool,
    ) -> Result<i32> {
        let runtime = self.runtime()?;
        let image = self.ensure_image(spec).await?;
        if runtime.container_exists(&spec.name).await? {
            return Err(SandboxError::NameInUse(spec.name.clone()));
        }

        let prepared = self.prepare(spec, session).await?;
        let mut env = prepared.env;
        let mut mounts = spec.volumes.clone();
        mounts.extend(prepared.mounts);
        if spec.firewall.enabled {
            mounts.push(firewall::session_rules(
                session,
                &spec.firewall.allowed,
                &spec.firewall.denied,
            )?);
        }
        let runtime_args = self.runtime_args(spec, &mut env)?;
        env.extend(prepared.secret_env);

        let entry = if shell {
            Entry::Shell {
                bootstrap: args::shell_bootstrap(
                    spec.firewall.enabled,
                    spec.dind == DindMode::Isolated,
                    prepared.secrets_file.as_deref(),
                ),
                args: spec.args.clone(),
            }
        } else {
            Entry::Command(spec.args.clone())
        };

        let command = RunCommand {
            name: spec.name.clone(),
            image,
            launch: Launch::Ephemeral,
            tty: Self::tty(),
            workdir: spec
                .mount_workdir
                .then(|| (spec.workdir.clone(), spec.workdir_readonly)),
            mounts,
            env,
            ports: spec.ports.clone(),
            runtime_args,
            entry,
        };
        let args = command.to_args()?;
        debug!("{} {}", runtime.binary().display(), args.join(" "));
        process::run_foreground(runtime.command_with(&args), spec.time_limit()).await
    }

    async fn run_persistent(
        &self,
        spec: &RunSpec,
        session: &mut SessionResources,
        shell: bool,
    ) -> Result<i32> {
        let runtime = self.runtime()?;
        let root = self.paths.session_root(&spec.name);
        session.set_root(&root)?;

        let prepared = self.prepare(spec, session).await?;
        let mut env = prepared.env;
        let relocated = args::relocate(&root, prepared.mounts, &mut env);

        if !runtime.container_exists(&spec.name).await? {
            let image = self.ensure_image(spec).await?;
            let mut create_env = env.clone();
            create_env.remove(args::LINKS_VAR);
            create_env.remove(args::SECRETS_FILE_VAR);
            let runtime_args = self.runtime_args(spec, &mut create_env)?;
            create_env.insert(args::KEEPALIVE_VAR.to_string(), "true".to_string());

            let mut mounts = spec.volumes.clone();
            mounts.extend(relocated.fixed);
            if spec.firewall.enabled {
                let rules = root.join("firewall");
                firewall::write_rules(&rules, &spec.firewall.allowed, &spec.firewall.denied)?;
                mounts.push(
                    VolumeMount::new(rules, firewall::RULES_MOUNT)
                        .readonly(true)
                        .required(),
                );
            }
            mounts.push(VolumeMount::new(&root, args::SESSION_MOUNT).required());

            let command = RunCommand {
                name: spec.name.clone(),
                image,
                launch: Launch::Keepalive,
                tty: false,
                workdir: spec
                    .mount_workdir
                    .then(|| (spec.workdir.clone(), spec.workdir_readonly)),
                mounts,
                env: create_env,
                ports: spec.ports.clone(),
                runtime_args,
                entry: Entry::Command(Vec::new()),
            };
            info!("Creating persistent container {}", spec.name);
            runtime.run_detached(&spec.name, &command.to_args()?).await?;
            self.wait_ready(&spec.name).await?;
        } else {
            if !relocated.fixed.is_empty() {
                debug!(
                    "{} mounts apply only when {} is created",
                    relocated.fixed.len(),
                    spec.name
                );
            }
            if !runtime.container_running(&spec.name).await? {
                info!("Starting persistent container {}", spec.name);
                runtime.start(&spec.name).await?;
                self.wait_ready(&spec.name).await?;
            }
            if !spec.ports.is_empty() {
                let published = runtime.published_ports(&spec.name).await?;
                let hint = env.contains_key(ports::PORT_HINT_VAR);
                ports::apply_env(&mut env, &ports::reconcile(&spec.ports, &published), hint);
            }
        }

        env.extend(prepared.secret_env);
        env.insert(args::SESSION_EXEC_VAR.to_string(), "true".to_string());
        if shell {
            env.insert(args::SHELL_VAR.to_string(), "true".to_string());
        }
        let args = args::exec_args(&spec.name, Self::tty(), spec.mount_workdir, &env, &spec.args);
        debug!("{} exec {}", runtime.binary().display(), spec.name);
        process::run_foreground(runtime.command_with(&args), spec.time_limit()).await
    }

    /// Wait until the keep-alive entrypoint finished its setup.
    async fn wait_ready(&self, name: &str) -> Result<()> {
        let runtime = self.runtime()?;
        for _ in 0..READY_ATTEMPTS {
            if runtime.exec_succeeds(name, &["test", "-f", READY_MARKER]).await? {
                return Ok(());
            }
            if !runtime.container_running(name).await? {
                let logs = runtime.logs_tail(name, 20).await.unwrap_or_default();
                return Err(SandboxError::RuntimeUnavailable(format!(
                    "{} exited during start-up\n{}",
                    name, logs
                )));
            }
            tokio::time::sleep(READY_INTERVAL).await;
        }
        Err(SandboxError::RuntimeUnavailable(format!(
            "{} did not become ready within {}s",
            name,
            READY_ATTEMPTS
        )))
    }

    async fn launch(&self, spec: &RunSpec, session: &mut SessionResources, shell: bool) -> Result<i32> {
        if spec.persistent {
            self.run_persistent(spec, session, shell).await
        } else {
            self.run_ephemeral(spec, session, shell).await
        }
    }
}

#[async_trait]
impl SandboxBackend for OciProvider {
    fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    async fn initialize(&mut self, _config: &EffectiveConfig) -> Result<()> {
        if self.runtime.is_none() {
            let runtime = Runtime::detect(self.kind, &self.paths)?;
            runtime.check_daemon().await?;
            self.runtime = Some(runtime);
        }
        Ok(())
    }

    fn determine_image_name(
        &self,
        config: &EffectiveConfig,
        registry: &ExtensionRegistry,
    ) -> Result<Option<String>> {
        let plan = BuildPlan::new(config, registry, self.user)?;
        Ok(Some(plan.image_tag))
    }

    async fn build_if_needed(
        &self,
        config: &EffectiveConfig,
        registry: &ExtensionRegistry,
        options: BuildOptions,
    ) -> Result<Option<String>> {
        let tag = ImageBuilder::new(self.runtime()?)
            .build_if_needed(config, registry, options)
            .await?;
        Ok(Some(tag))
    }

    async fn run(&self, spec: &RunSpec, session: &mut SessionResources) -> Result<i32> {
        self.launch(spec, session, false).await
    }

    async fn shell(&self, spec: &RunSpec, session: &mut SessionResources) -> Result<i32> {
        self.launch(spec, session, true).await
    }

    async fn list(&self) -> Result<Vec<Environment>> {
        self.runtime()?.list().await
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        self.runtime()?.container_exists(name).await
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        self.runtime()?.container_running(name).await
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.runtime()?.start(name).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.runtime()?.stop(name).await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let runtime = self.runtime()?;
        runtime.remove(name).await?;
        runtime
            .remove_volume(&dind::volume_name(runtime.backend_name(), name))
            .await?;

        let root = self.paths.session_root(name);
        if root.exists() {
            if let Err(e) = std::fs::remove_dir_all(&root) {
                warn!("Failed to remove {}: {}", root.display(), e);
            }
        }
        Ok(())
    }

    async fn extension_env_vars(
        &self,
        image: Option<&str>,
        config: &EffectiveConfig,
        registry: &ExtensionRegistry,
    ) -> Vec<String> {
        if let (Some(image), Ok(runtime)) = (image, self.runtime()) {
            match runtime.image_labels(image).await {
                Ok(labels) => {
                    if let Some(vars) = labels.get(build::ENV_VARS_LABEL) {
                        return vars
                            .split(',')
                            .map(str::trim)
                            .filter(|v| !v.is_empty())
                            .map(str::to_string)
                            .collect();
                    }
                }
                Err(e) => debug!("No labels for {}: {}", image, e),
            }
        }
        registry.env_var_names(&config.extensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::PortMapping;
    use addt_core::config::FirewallMode;
    use tempfile::TempDir;

    fn provider(kind: ProviderKind, dir: &TempDir) -> OciProvider {
        let paths = AddtPaths::with_root(dir.path().join(".addt"), dir.path());
        OciProvider::with_runtime(Runtime::new(kind, "/usr/bin/false"), paths)
    }

    fn pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_runtime_args_podman_firewall() {
        let dir = TempDir::new().unwrap();
        let oci = provider(ProviderKind::Podman, &dir);
        let mut spec = RunSpec::new("addt-x", dir.path());
        spec.firewall.enabled = true;
        spec.firewall.mode = FirewallMode::Strict;
        spec.firewall.allowed_ports = vec![443];
        spec.dind = DindMode::Isolated;

        let mut env = BTreeMap::new();
        let args = oci.runtime_args(&spec, &mut env).unwrap();
        assert!(pair(&args, "--network", "pasta:-T,443"));
        assert!(pair(&args, "--cap-add", "NET_ADMIN"));
        assert!(args.contains(&"--privileged".to_string()));
        assert!(pair(&args, "-v", "addt-podman-x:/var/lib/docker"));
        assert_eq!(env["ADDT_DOCKER_DIND_ENABLE"], "true");
    }

    #[test]
    fn test_runtime_args_docker_network_mode() {
        let dir = TempDir::new().unwrap();
        let oci = provider(ProviderKind::Docker, &dir);
        let mut spec = RunSpec::new("addt-x", dir.path());
        spec.security.network_mode = addt_core::config::NetworkMode::None;
        spec.ports.push(PortMapping { container: 80, host: 30000 });

        let mut env = BTreeMap::new();
        let args = oci.runtime_args(&spec, &mut env).unwrap();
        assert!(pair(&args, "--network", "none"));
        assert!(!args.contains(&"NET_ADMIN".to_string()));
        assert!(env.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_isolates_secrets() {
        let dir = TempDir::new().unwrap();
        let oci = provider(ProviderKind::Docker, &dir);
        let mut spec = RunSpec::new("addt-x", dir.path());
        spec.secrets.insert(
            "ANTHROPIC_API_KEY".to_string(),
            addt_core::SecretString::new("sk-1"),
        );

        let mut session = SessionResources::new();
        let plain = oci.prepare(&spec, &mut session).await.unwrap();
        assert_eq!(plain.secret_env["ANTHROPIC_API_KEY"], "sk-1");
        assert!(plain.secrets_file.is_none());

        spec.security.isolate_secrets = true;
        let isolated = oci.prepare(&spec, &mut session).await.unwrap();
        assert!(isolated.secret_env.is_empty());
        assert_eq!(isolated.env[args::SECRETS_FILE_VAR], "/run/secrets/.secrets");
        assert!(isolated.mounts.iter().any(|m| m.target == SECRETS_MOUNT));
        assert!(!isolated.env.values().any(|v| v.contains("sk-1")));
        session.cleanup();
    }

    #[test]
    fn test_uninitialized_provider() {
        let dir = TempDir::new().unwrap();
        let paths = AddtPaths::with_root(dir.path().join(".addt"), dir.path());
        let oci = OciProvider::new(ProviderKind::Orbstack, paths);
        assert_eq!(oci.name(), "orbstack");
        assert!(matches!(oci.runtime(), Err(SandboxError::Config(_))));
    }
}
