//! bubblewrap provider (Linux only).
//!
//! The sandbox reuses the host's system directories read-only and gets a
//! persistent home under `<addt_home>/bwrap/home`. With the firewall on the
//! network namespace is unshared and all egress goes through the filtering
//! HTTP proxy, reached via a socat bridge started by `net-proxy.sh`.

use crate::error::{Result, SandboxError};
use crate::forward;
use crate::process;
use crate::provider::{BuildOptions, SandboxBackend};
use crate::secrets::{self, SECRETS_MOUNT, SECRETS_SCRIPT};
use crate::session::SessionResources;
use crate::spec::{Environment, RunSpec, VolumeMount, SANDBOX_HOME, SANDBOX_USER, WORKSPACE_DIR};
use addt_core::config::{DindMode, NetworkMode, ProviderKind};
use addt_core::{AddtPaths, EffectiveConfig, ExtensionRegistry};
use addt_proxy::http::{SANDBOX_PROXY_PORT, SOCKET_NAME};
use addt_proxy::{DomainPolicy, HttpProxy, PolicyMode};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

const NET_PROXY_SCRIPT: &str = include_str!("../../assets/net-proxy.sh");

/// Where the proxy socket directory is bound.
pub const PROXY_MOUNT: &str = "/run/addt-proxy";

/// Where `net-proxy.sh` is bound.
pub const NET_MOUNT: &str = "/run/addt-net";

const HOSTNAME: &str = "addt";
const SHELL: &str = "/bin/bash";
const SANDBOX_PATH: &str =
    "/home/addt/.local/bin:/usr/local/bin:/usr/bin:/bin:/usr/local/sbin:/usr/sbin:/sbin";

/// Host directories exposed read-only, as symlinks where the host has them.
const SYSTEM_DIRS: &[&str] = &["/usr", "/bin", "/lib", "/lib64", "/sbin", "/etc", "/opt", "/nix"];

/// `sh -c` script: loads the secrets file named by `$1`, then execs the rest.
fn secrets_loader() -> String {
    format!(
        "f=\"$1\"; shift\n{}exec \"$@\"",
        secrets::load_and_scrub("\"$f\"")
    )
}

/// Sandbox backed by `bwrap`.
pub struct BwrapProvider {
    paths: AddtPaths,
    bwrap: Option<PathBuf>,
}

/// The pieces of one `bwrap` invocation.
#[derive(Debug, Clone)]
struct Layout {
    home: PathBuf,
    mounts: Vec<VolumeMount>,
    env: BTreeMap<String, String>,
    unshare_net: bool,
    command: Vec<String>,
}

fn system_args() -> Vec<String> {
    let mut args = Vec::new();
    for dir in SYSTEM_DIRS {
        let path = Path::new(dir);
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if let Ok(target) = fs::read_link(path) {
                    args.extend([
                        "--symlink".to_string(),
                        target.to_string_lossy().into_owned(),
                        dir.to_string(),
                    ]);
                }
            }
            Ok(_) => args.extend(["--ro-bind".to_string(), dir.to_string(), dir.to_string()]),
            Err(_) => {}
        }
    }
    args
}

fn bind_args(mount: &VolumeMount) -> Result<Option<[String; 3]>> {
    if !mount.source.exists() {
        if mount.required {
            return Err(SandboxError::config(format!(
                "mount source {} does not exist",
                mount.source.display()
            )));
        }
        debug!("Skipping mount of missing {}", mount.source.display());
        return Ok(None);
    }
    let flag = if mount.readonly { "--ro-bind" } else { "--bind" };
    Ok(Some([
        flag.to_string(),
        mount.source.to_string_lossy().into_owned(),
        mount.target.clone(),
    ]))
}

/// Full `bwrap` argument list for `spec`.
fn bwrap_args(spec: &RunSpec, layout: &Layout) -> Result<Vec<String>> {
    let mut args = system_args();

    args.extend(["--proc".to_string(), "/proc".to_string()]);
    if spec.security.disable_devices {
        args.extend(["--dev".to_string(), "/dev".to_string()]);
    } else {
        args.extend(["--dev-bind".to_string(), "/dev".to_string(), "/dev".to_string()]);
    }
    for dir in ["/tmp", "/var/tmp", "/run"] {
        args.extend(["--tmpfs".to_string(), dir.to_string()]);
    }

    args.extend([
        "--bind".to_string(),
        layout.home.to_string_lossy().into_owned(),
        SANDBOX_HOME.to_string(),
    ]);

    if spec.mount_workdir {
        let workdir = VolumeMount::new(&spec.workdir, WORKSPACE_DIR)
            .readonly(spec.workdir_readonly)
            .required();
        args.extend(bind_args(&workdir)?.into_iter().flatten());
        args.extend(["--chdir".to_string(), WORKSPACE_DIR.to_string()]);
    } else {
        args.extend(["--chdir".to_string(), SANDBOX_HOME.to_string()]);
    }

    for mount in &layout.mounts {
        args.extend(bind_args(mount)?.into_iter().flatten());
    }

    args.push("--clearenv".to_string());
    let mut setenv = |key: &str, value: &str| {
        args.extend(["--setenv".to_string(), key.to_string(), value.to_string()]);
    };
    setenv("HOME", SANDBOX_HOME);
    setenv("USER", SANDBOX_USER);
    setenv("SHELL", SHELL);
    setenv("PATH", SANDBOX_PATH);
    for (key, value) in &layout.env {
        setenv(key, value);
    }

    args.extend(
        [
            "--unshare-pid",
            "--unshare-ipc",
            "--unshare-uts",
            "--hostname",
            HOSTNAME,
            "--die-with-parent",
            "--new-session",
        ]
        .map(str::to_string),
    );
    if layout.unshare_net {
        args.push("--unshare-net".to_string());
    }

    args.push("--".to_string());
    args.extend(layout.command.iter().cloned());
    Ok(args)
}

/// Command run inside the sandbox.
///
/// `ADDT_COMMAND` words followed by the arguments, else the arguments alone,
/// else an interactive shell.
fn session_command(spec: &RunSpec, shell: bool) -> Vec<String> {
    let mut command = if shell {
        vec![SHELL.to_string()]
    } else {
        spec.command_words()
    };
    command.extend(spec.args.iter().cloned());
    if command.is_empty() {
        command.push(SHELL.to_string());
    }
    command
}

fn write_script(dir: &Path, name: &str, content: &str) -> io::Result<()> {
    let path = dir.join(name);
    fs::write(&path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

impl BwrapProvider {
    pub fn new(paths: AddtPaths) -> Self {
        Self { paths, bwrap: None }
    }

    fn bwrap(&self) -> Result<&Path> {
        self.bwrap
            .as_deref()
            .ok_or_else(|| SandboxError::config("bwrap provider is not initialized"))
    }

    /// Start the filtering proxy and return the wrapper command prefix.
    async fn start_firewall(
        &self,
        spec: &RunSpec,
        session: &mut SessionResources,
        mounts: &mut Vec<VolumeMount>,
        env: &mut BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        let mode = match spec.firewall.mode {
            addt_core::config::FirewallMode::Strict => PolicyMode::Strict,
            addt_core::config::FirewallMode::Permissive => PolicyMode::Permissive,
        };
        let policy = DomainPolicy::new(mode, &spec.firewall.allowed, &spec.firewall.denied);
        let mut proxy = HttpProxy::new(policy);
        proxy
            .start_in(session.socket_dir("net-proxy")?)
            .await
            .map_err(|source| SandboxError::ProxyStart {
                feature: "firewall",
                source,
            })?;
        if let Some(dir) = proxy.socket_dir() {
            mounts.push(VolumeMount::new(dir, PROXY_MOUNT).required());
        }
        session.set_http_proxy(proxy);

        let scripts = session.temp_dir("net")?;
        write_script(&scripts, "net-proxy.sh", NET_PROXY_SCRIPT)?;
        mounts.push(VolumeMount::new(&scripts, NET_MOUNT).readonly(true).required());

        env.insert(
            "ADDT_PROXY_SOCKET".to_string(),
            format!("{}/{}", PROXY_MOUNT, SOCKET_NAME),
        );
        env.insert("ADDT_PROXY_PORT".to_string(), SANDBOX_PROXY_PORT.to_string());
        Ok(vec![format!("{}/net-proxy.sh", NET_MOUNT)])
    }

    async fn layout(
        &self,
        spec: &RunSpec,
        session: &mut SessionResources,
        shell: bool,
    ) -> Result<Layout> {
        let home = self.paths.bwrap_home();
        fs::create_dir_all(&home)?;

        if spec.dind != DindMode::Off {
            warn!("Docker-in-Docker is not available with bwrap; ignoring dind.mode={}", spec.dind);
        }
        if !spec.ports.is_empty() {
            debug!("bwrap shares the host network; published ports are not remapped");
        }

        let forwarding =
            forward::prepare_all(session, spec, self.paths.user_home(), ProviderKind::Bwrap).await?;
        let mut mounts = spec.volumes.clone();
        mounts.extend(forwarding.mounts);
        let mut env = spec.env.clone();
        env.extend(forwarding.env);

        let mut prefix = Vec::new();
        if spec.firewall.enabled {
            prefix = self.start_firewall(spec, session, &mut mounts, &mut env).await?;
        }

        if spec.security.isolate_secrets {
            if let Some(mount) = secrets::materialize(session, &spec.secrets)? {
                mounts.push(mount);
                prefix.extend([
                    SHELL.to_string(),
                    "-c".to_string(),
                    secrets_loader(),
                    "addt-secrets".to_string(),
                    format!("{}/{}", SECRETS_MOUNT, SECRETS_SCRIPT),
                ]);
            }
        } else {
            for (name, value) in &spec.secrets {
                if !value.is_empty() {
                    env.insert(name.clone(), value.expose_secret().to_string());
                }
            }
        }

        let mut command = prefix;
        command.extend(session_command(spec, shell));
        Ok(Layout {
            home,
            mounts,
            env,
            unshare_net: spec.security.network_mode == NetworkMode::None || spec.firewall.enabled,
            command,
        })
    }

    async fn launch(&self, spec: &RunSpec, session: &mut SessionResources, shell: bool) -> Result<i32> {
        let bwrap = self.bwrap()?;
        let layout = self.layout(spec, session, shell).await?;
        let args = bwrap_args(spec, &layout)?;
        debug!("{} {}", bwrap.display(), args.join(" "));

        let mut cmd = Command::new(bwrap);
        cmd.args(&args);
        process::run_foreground(cmd, spec.time_limit()).await
    }

    fn unsupported(operation: &'static str) -> SandboxError {
        SandboxError::Unsupported {
            provider: "bwrap",
            operation,
        }
    }
}

#[async_trait]
impl SandboxBackend for BwrapProvider {
    fn name(&self) -> &'static str {
        "bwrap"
    }

    async fn initialize(&mut self, config: &EffectiveConfig) -> Result<()> {
        if !cfg!(target_os = "linux") {
            return Err(Self::unsupported("hosts other than Linux"));
        }
        let bwrap = which::which("bwrap").map_err(|_| {
            SandboxError::prerequisite(
                "bwrap",
                "Install bubblewrap (apt install bubblewrap / dnf install bubblewrap)",
            )
        })?;

        let mut version = Command::new(&bwrap);
        version.arg("--version");
        let output = process::capture(version).await?;
        if !output.status.success() {
            return Err(SandboxError::prerequisite(
                "bwrap",
                format!(
                    "`bwrap --version` failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        debug!("{}", String::from_utf8_lossy(&output.stdout).trim());

        if config.firewall.enabled && which::which("socat").is_err() {
            return Err(SandboxError::prerequisite(
                "socat",
                "The bwrap firewall needs socat (apt install socat / dnf install socat)",
            ));
        }
        self.bwrap = Some(bwrap);
        Ok(())
    }

    fn determine_image_name(
        &self,
        _config: &EffectiveConfig,
        _registry: &ExtensionRegistry,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    async fn build_if_needed(
        &self,
        _config: &EffectiveConfig,
        _registry: &ExtensionRegistry,
        _options: BuildOptions,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    async fn run(&self, spec: &RunSpec, session: &mut SessionResources) -> Result<i32> {
        self.launch(spec, session, false).await
    }

    async fn shell(&self, spec: &RunSpec, session: &mut SessionResources) -> Result<i32> {
        self.launch(spec, session, true).await
    }

    async fn list(&self) -> Result<Vec<Environment>> {
        Ok(Vec::new())
    }

    async fn exists(&self, _name: &str) -> Result<bool> {
        Ok(false)
    }

    async fn is_running(&self, _name: &str) -> Result<bool> {
        Ok(false)
    }

    async fn start(&self, _name: &str) -> Result<()> {
        Err(Self::unsupported("start"))
    }

    async fn stop(&self, _name: &str) -> Result<()> {
        Err(Self::unsupported("stop"))
    }

    async fn remove(&self, _name: &str) -> Result<()> {
        Err(Self::unsupported("remove"))
    }

    fn name_segment(&self) -> Option<&'static str> {
        Some("bwrap")
    }

    async fn extension_env_vars(
        &self,
        _image: Option<&str>,
        config: &EffectiveConfig,
        registry: &ExtensionRegistry,
    ) -> Vec<String> {
        registry.env_var_names(&config.extensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use addt_core::SecretString;
    use tempfile::TempDir;

    fn layout(dir: &TempDir) -> Layout {
        Layout {
            home: dir.path().join("home"),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            unshare_net: false,
            command: vec!["/bin/bash".to_string()],
        }
    }

    fn has_seq(args: &[String], seq: &[&str]) -> bool {
        args.windows(seq.len()).any(|w| w.iter().zip(seq).all(|(a, b)| a == b))
    }

    #[test]
    fn test_session_command() {
        let mut spec = RunSpec::new("addt-x", "/w");
        assert_eq!(session_command(&spec, false), vec!["/bin/bash"]);

        spec.args = vec!["-c".to_string(), "echo hi".to_string()];
        assert_eq!(session_command(&spec, false), vec!["-c", "echo hi"]);

        spec.command = Some("bash".to_string());
        assert_eq!(session_command(&spec, false), vec!["bash", "-c", "echo hi"]);
        assert_eq!(session_command(&spec, true), vec!["/bin/bash", "-c", "echo hi"]);
    }

    #[test]
    fn test_bwrap_args() {
        let dir = TempDir::new().unwrap();
        let mut spec = RunSpec::new("addt-bwrap-x", dir.path());
        spec.workdir_readonly = true;
        let mut layout = layout(&dir);
        layout.env.insert("TERM".to_string(), "xterm".to_string());
        layout.mounts.push(VolumeMount::new(dir.path().join("missing"), "/x"));
        layout.mounts.push(VolumeMount::new(dir.path(), "/home/addt/.claude"));

        let args = bwrap_args(&spec, &layout).unwrap();
        let workdir = dir.path().to_string_lossy().into_owned();
        assert!(has_seq(&args, &["--ro-bind", &workdir, "/workspace"]));
        assert!(has_seq(&args, &["--chdir", "/workspace"]));
        assert!(has_seq(&args, &["--bind", &workdir, "/home/addt/.claude"]));
        assert!(!args.contains(&"/x".to_string()));
        assert!(has_seq(&args, &["--dev", "/dev"]));
        assert!(has_seq(&args, &["--tmpfs", "/run"]));
        assert!(has_seq(&args, &["--setenv", "HOME", "/home/addt"]));
        assert!(has_seq(&args, &["--setenv", "TERM", "xterm"]));
        assert!(has_seq(&args, &["--hostname", "addt"]));
        assert!(args.contains(&"--die-with-parent".to_string()));
        assert!(!args.contains(&"--unshare-net".to_string()));
        assert_eq!(&args[args.len() - 2..], &["--", "/bin/bash"]);

        let clearenv = args.iter().position(|a| a == "--clearenv").unwrap();
        let home = args.iter().position(|a| a == "HOME").unwrap();
        assert!(clearenv < home);
    }

    #[test]
    fn test_unshare_net_and_required_mounts() {
        let dir = TempDir::new().unwrap();
        let spec = RunSpec::new("addt-bwrap-x", dir.path());
        let mut layout = layout(&dir);
        layout.unshare_net = true;
        let args = bwrap_args(&spec, &layout).unwrap();
        assert!(args.contains(&"--unshare-net".to_string()));

        layout
            .mounts
            .push(VolumeMount::new(dir.path().join("gone"), "/run/secrets").required());
        assert!(bwrap_args(&spec, &layout).is_err());
    }

    #[tokio::test]
    async fn test_layout_secrets() {
        let dir = TempDir::new().unwrap();
        let paths = AddtPaths::with_root(dir.path().join(".addt"), dir.path());
        let provider = BwrapProvider::new(paths);
        let mut spec = RunSpec::new("addt-bwrap-x", dir.path());
        spec.command = Some("claude".to_string());
        spec.secrets
            .insert("ANTHROPIC_API_KEY".to_string(), SecretString::new("sk-1"));

        let mut session = SessionResources::new();
        let plain = provider.layout(&spec, &mut session, false).await.unwrap();
        assert_eq!(plain.env["ANTHROPIC_API_KEY"], "sk-1");
        assert_eq!(plain.command, vec!["claude"]);
        assert!(plain.home.is_dir());

        spec.security.isolate_secrets = true;
        let isolated = provider.layout(&spec, &mut session, false).await.unwrap();
        assert!(!isolated.env.contains_key("ANTHROPIC_API_KEY"));
        assert_eq!(isolated.command[0], "/bin/bash");
        assert_eq!(isolated.command[4], "/run/secrets/.secrets");
        assert!(isolated.command[2].contains("dd if=/dev/urandom of=\"$f\""));
        assert!(isolated.command[2].ends_with("exec \"$@\""));
        assert_eq!(isolated.command.last().unwrap(), "claude");
        assert!(isolated.mounts.iter().any(|m| m.target == SECRETS_MOUNT));
        session.cleanup();
    }

    #[tokio::test]
    async fn test_lifecycle_is_trivial() {
        let dir = TempDir::new().unwrap();
        let provider = BwrapProvider::new(AddtPaths::with_root(dir.path(), dir.path()));
        assert!(!provider.exists("addt-bwrap-x").await.unwrap());
        assert!(!provider.is_running("addt-bwrap-x").await.unwrap());
        assert!(provider.list().await.unwrap().is_empty());
        assert!(matches!(
            provider.stop("addt-bwrap-x").await,
            Err(SandboxError::Unsupported { .. })
        ));
        let image = provider
            .determine_image_name(&EffectiveConfig::default(), &ExtensionRegistry::embedded())
            .unwrap();
        assert_eq!(image, None);
    }
}
