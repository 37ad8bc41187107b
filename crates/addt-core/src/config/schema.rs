//! The composed, per-invocation configuration.

use super::keys::{parse_bool, parse_int, parse_list, KeyKind, KEYS};
use crate::error::ConfigError;
use crate::secret::SecretString;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

macro_rules! choice_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? } default $default:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown value '{}'", other)),
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }
    };
}

choice_enum!(
    /// Sandbox backend.
    ProviderKind {
        Docker => "docker",
        Podman => "podman",
        Orbstack => "orbstack",
        Bwrap => "bwrap",
    } default Docker
);

choice_enum!(
    /// How a credential agent is forwarded.
    ForwardMode {
        Off => "off",
        Agent => "agent",
        Keys => "keys",
        Proxy => "proxy",
    } default Off
);

choice_enum!(
    /// Where a GitHub token is taken from.
    TokenSource {
        Env => "env",
        GhAuth => "gh_auth",
    } default Env
);

choice_enum!(
    FirewallMode {
        Strict => "strict",
        Permissive => "permissive",
    } default Strict
);

choice_enum!(
    NetworkMode {
        Bridge => "bridge",
        None => "none",
        Host => "host",
    } default Bridge
);

choice_enum!(
    LogOutput {
        Stderr => "stderr",
        File => "file",
        Both => "both",
    } default Stderr
);

choice_enum!(
    /// Nested container runtime mode.
    DindMode {
        Off => "off",
        Host => "host",
        Isolated => "isolated",
    } default Off
);

impl ProviderKind {
    /// Whether this provider drives an OCI runtime.
    pub fn is_oci(&self) -> bool {
        !matches!(self, ProviderKind::Bwrap)
    }
}

/// Where a key's effective value came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[default]
    Default,
    Global,
    Project,
    Env,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::Default => "default",
            Source::Global => "global",
            Source::Project => "project",
            Source::Env => "env",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkdirConfig {
    /// Absolute host working directory.
    pub path: PathBuf,
    pub automount: bool,
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SshConfig {
    pub forward_mode: ForwardMode,
    pub allowed_keys: Vec<String>,
}

impl SshConfig {
    pub fn enabled(&self) -> bool {
        self.forward_mode != ForwardMode::Off
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GpgConfig {
    pub forward: ForwardMode,
    pub allowed_key_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GithubConfig {
    pub forward_token: bool,
    pub token_source: TokenSource,
    pub scope_token: bool,
    pub scope_repos: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GitConfig {
    pub disable_hooks: bool,
    pub forward_config: bool,
    pub config_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FirewallConfig {
    pub enabled: bool,
    pub mode: FirewallMode,
    pub allowed: Vec<String>,
    pub denied: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortsConfig {
    pub expose: Vec<String>,
    pub range_start: i64,
    pub forward: bool,
    pub inject_system_prompt: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityConfig {
    pub pids_limit: i64,
    pub no_new_privileges: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub read_only_rootfs: bool,
    pub isolate_secrets: bool,
    pub network_mode: NetworkMode,
    pub seccomp_profile: String,
    pub tmpfs_tmp_size: String,
    pub tmpfs_home_size: String,
    pub ulimit_nofile: String,
    pub ulimit_nproc: String,
    /// Minutes; 0 disables the limit.
    pub time_limit: i64,
    pub user_namespace: String,
    pub disable_ipc: bool,
    pub disable_devices: bool,
    pub memory_swap: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerConfig {
    pub cpus: String,
    pub memory: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogConfig {
    pub enabled: bool,
    pub output: LogOutput,
    pub level: String,
    pub dir: String,
    pub file: String,
    pub rotate: bool,
    pub max_size: String,
    pub max_files: i64,
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtelConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub protocol: String,
    pub service_name: String,
    pub headers: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DindConfig {
    pub mode: DindMode,
}

/// Per-extension overrides from `extensions.<name>.*`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtensionSettings {
    pub version: Option<String>,
    pub automount: Option<bool>,
    pub readonly: Option<bool>,
    /// Flag name → value.
    pub flags: BTreeMap<String, String>,
}

/// Host facts captured from the environment snapshot at composition time.
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    /// TERM, COLORTERM and locale variables that were set.
    pub terminal: BTreeMap<String, String>,
    pub ssh_auth_sock: Option<PathBuf>,
    /// `GNUPGHOME`, when set.
    pub gnupg_home: Option<PathBuf>,
    /// `DOCKER_HOST`, used to locate the host socket for DinD.
    pub docker_host: Option<String>,
    pub tmux: Option<String>,
    pub tmux_pane: Option<String>,
    /// GH_TOKEN or GITHUB_TOKEN from the host.
    pub github_token: Option<SecretString>,
    /// Values of extension-declared variables (secrets when isolated).
    pub secrets: BTreeMap<String, SecretString>,
    /// Other forwarded variables (env_vars and env file).
    pub forwarded: BTreeMap<String, SecretString>,
    pub user_home: PathBuf,
    pub addt_home: PathBuf,
    /// Name the binary was invoked as.
    pub invoked_as: Option<String>,
}

/// Configuration for one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub provider: ProviderKind,
    pub node_version: String,
    pub go_version: String,
    pub uv_version: String,
    /// Active extensions, order preserved, deduplicated.
    pub extensions: Vec<String>,
    pub extension_settings: BTreeMap<String, ExtensionSettings>,
    /// Command run inside the sandbox (`ADDT_COMMAND`).
    pub command: Option<String>,
    pub workdir: WorkdirConfig,
    pub persistent: bool,
    pub ssh: SshConfig,
    pub gpg: GpgConfig,
    pub github: GithubConfig,
    pub git: GitConfig,
    pub firewall: FirewallConfig,
    pub ports: PortsConfig,
    pub security: SecurityConfig,
    pub container: ContainerConfig,
    pub log: LogConfig,
    pub otel: OtelConfig,
    pub history_persist: bool,
    pub tmux_forward: bool,
    pub env_file: String,
    pub env_vars: Vec<String>,
    pub dind: DindConfig,

    #[serde(skip)]
    pub host: HostContext,

    #[serde(skip)]
    pub(crate) sources: BTreeMap<String, Source>,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        let mut config = Self::empty();
        for def in KEYS {
            if let Err(e) = config.apply(def.key, def.default) {
                tracing::error!("Invalid default for {}: {}", def.key, e);
            }
        }
        config.sources.clear();
        config
    }
}

impl EffectiveConfig {
    fn empty() -> Self {
        Self {
            provider: ProviderKind::default(),
            node_version: String::new(),
            go_version: String::new(),
            uv_version: String::new(),
            extensions: Vec::new(),
            extension_settings: BTreeMap::new(),
            command: None,
            workdir: WorkdirConfig {
                path: PathBuf::new(),
                automount: false,
                readonly: false,
            },
            persistent: false,
            ssh: SshConfig {
                forward_mode: ForwardMode::default(),
                allowed_keys: Vec::new(),
            },
            gpg: GpgConfig {
                forward: ForwardMode::default(),
                allowed_key_ids: Vec::new(),
            },
            github: GithubConfig {
                forward_token: false,
                token_source: TokenSource::default(),
                scope_token: false,
                scope_repos: Vec::new(),
            },
            git: GitConfig {
                disable_hooks: false,
                forward_config: false,
                config_path: String::new(),
            },
            firewall: FirewallConfig {
                enabled: false,
                mode: FirewallMode::default(),
                allowed: Vec::new(),
                denied: Vec::new(),
            },
            ports: PortsConfig {
                expose: Vec::new(),
                range_start: 0,
                forward: false,
                inject_system_prompt: false,
            },
            security: SecurityConfig {
                pids_limit: 0,
                no_new_privileges: false,
                cap_add: Vec::new(),
                cap_drop: Vec::new(),
                read_only_rootfs: false,
                isolate_secrets: false,
                network_mode: NetworkMode::default(),
                seccomp_profile: String::new(),
                tmpfs_tmp_size: String::new(),
                tmpfs_home_size: String::new(),
                ulimit_nofile: String::new(),
                ulimit_nproc: String::new(),
                time_limit: 0,
                user_namespace: String::new(),
                disable_ipc: false,
                disable_devices: false,
                memory_swap: String::new(),
            },
            container: ContainerConfig {
                cpus: String::new(),
                memory: String::new(),
            },
            log: LogConfig {
                enabled: false,
                output: LogOutput::default(),
                level: String::new(),
                dir: String::new(),
                file: String::new(),
                rotate: false,
                max_size: String::new(),
                max_files: 0,
                modules: Vec::new(),
            },
            otel: OtelConfig {
                enabled: false,
                endpoint: String::new(),
                protocol: String::new(),
                service_name: String::new(),
                headers: String::new(),
            },
            history_persist: false,
            tmux_forward: false,
            env_file: String::new(),
            env_vars: Vec::new(),
            dind: DindConfig {
                mode: DindMode::default(),
            },
            host: HostContext::default(),
            sources: BTreeMap::new(),
        }
    }

    /// Set a global key from its textual form.
    pub fn apply(&mut self, key: &str, raw: &str) -> Result<(), ConfigError> {
        let b = || parse_bool(key, raw);
        let i = || parse_int(key, raw);
        let s = || raw.to_string();
        let l = || parse_list(raw);

        match key {
            "provider" => self.provider = choice(key, raw)?,
            "node_version" => self.node_version = s(),
            "go_version" => self.go_version = s(),
            "uv_version" => self.uv_version = s(),
            "persistent" => self.persistent = b()?,
            "workdir.automount" => self.workdir.automount = b()?,
            "workdir.readonly" => self.workdir.readonly = b()?,
            "ssh.forward_mode" => self.ssh.forward_mode = choice(key, raw)?,
            "ssh.allowed_keys" => self.ssh.allowed_keys = l(),
            "gpg.forward" => self.gpg.forward = choice(key, raw)?,
            "gpg.allowed_key_ids" => self.gpg.allowed_key_ids = l(),
            "github.forward_token" => self.github.forward_token = b()?,
            "github.token_source" => self.github.token_source = choice(key, raw)?,
            "github.scope_token" => self.github.scope_token = b()?,
            "github.scope_repos" => self.github.scope_repos = l(),
            "git.disable_hooks" => self.git.disable_hooks = b()?,
            "git.forward_config" => self.git.forward_config = b()?,
            "git.config_path" => self.git.config_path = s(),
            "firewall.enabled" => self.firewall.enabled = b()?,
            "firewall.mode" => self.firewall.mode = choice(key, raw)?,
            "firewall.allowed" => self.firewall.allowed = l(),
            "firewall.denied" => self.firewall.denied = l(),
            "ports.expose" => self.ports.expose = l(),
            "ports.range_start" => self.ports.range_start = i()?,
            "ports.forward" => self.ports.forward = b()?,
            "ports.inject_system_prompt" => self.ports.inject_system_prompt = b()?,
            "security.pids_limit" => self.security.pids_limit = i()?,
            "security.no_new_privileges" => self.security.no_new_privileges = b()?,
            "security.cap_add" => self.security.cap_add = l(),
            "security.cap_drop" => self.security.cap_drop = l(),
            "security.read_only_rootfs" => self.security.read_only_rootfs = b()?,
            "security.isolate_secrets" => self.security.isolate_secrets = b()?,
            "security.network_mode" => self.security.network_mode = choice(key, raw)?,
            "security.seccomp_profile" => self.security.seccomp_profile = s(),
            "security.tmpfs_tmp_size" => self.security.tmpfs_tmp_size = s(),
            "security.tmpfs_home_size" => self.security.tmpfs_home_size = s(),
            "security.ulimit_nofile" => self.security.ulimit_nofile = s(),
            "security.ulimit_nproc" => self.security.ulimit_nproc = s(),
            "security.time_limit" => self.security.time_limit = i()?,
            "security.user_namespace" => self.security.user_namespace = s(),
            "security.disable_ipc" => self.security.disable_ipc = b()?,
            "security.disable_devices" => self.security.disable_devices = b()?,
            "security.memory_swap" => self.security.memory_swap = s(),
            "container.cpus" => self.container.cpus = s(),
            "container.memory" => self.container.memory = s(),
            "log.enabled" => self.log.enabled = b()?,
            "log.output" => self.log.output = choice(key, raw)?,
            "log.level" => self.log.level = checked_choice(key, raw)?,
            "log.dir" => self.log.dir = s(),
            "log.file" => self.log.file = s(),
            "log.rotate" => self.log.rotate = b()?,
            "log.max_size" => self.log.max_size = s(),
            "log.max_files" => self.log.max_files = i()?,
            "log.modules" => self.log.modules = l(),
            "otel.enabled" => self.otel.enabled = b()?,
            "otel.endpoint" => self.otel.endpoint = s(),
            "otel.protocol" => self.otel.protocol = checked_choice(key, raw)?,
            "otel.service_name" => self.otel.service_name = s(),
            "otel.headers" => self.otel.headers = s(),
            "history_persist" => self.history_persist = b()?,
            "tmux_forward" => self.tmux_forward = b()?,
            "env_file" => self.env_file = s(),
            "env_vars" => self.env_vars = l(),
            "dind.mode" => self.dind.mode = choice(key, raw)?,
            _ => {
                return Err(ConfigError::UnknownKey {
                    key: key.to_string(),
                    valid: KEYS.iter().map(|k| k.key).collect::<Vec<_>>().join(", "),
                })
            }
        }
        Ok(())
    }

    /// Render a global key's effective value as text.
    pub fn get(&self, key: &str) -> Option<String> {
        let list = |v: &[String]| v.join(",");
        let value = match key {
            "provider" => self.provider.to_string(),
            "node_version" => self.node_version.clone(),
            "go_version" => self.go_version.clone(),
            "uv_version" => self.uv_version.clone(),
            "persistent" => self.persistent.to_string(),
            "workdir.automount" => self.workdir.automount.to_string(),
            "workdir.readonly" => self.workdir.readonly.to_string(),
            "ssh.forward_mode" => self.ssh.forward_mode.to_string(),
            "ssh.allowed_keys" => list(&self.ssh.allowed_keys),
            "gpg.forward" => self.gpg.forward.to_string(),
            "gpg.allowed_key_ids" => list(&self.gpg.allowed_key_ids),
            "github.forward_token" => self.github.forward_token.to_string(),
            "github.token_source" => self.github.token_source.to_string(),
            "github.scope_token" => self.github.scope_token.to_string(),
            "github.scope_repos" => list(&self.github.scope_repos),
            "git.disable_hooks" => self.git.disable_hooks.to_string(),
            "git.forward_config" => self.git.forward_config.to_string(),
            "git.config_path" => self.git.config_path.clone(),
            "firewall.enabled" => self.firewall.enabled.to_string(),
            "firewall.mode" => self.firewall.mode.to_string(),
            "firewall.allowed" => list(&self.firewall.allowed),
            "firewall.denied" => list(&self.firewall.denied),
            "ports.expose" => list(&self.ports.expose),
            "ports.range_start" => self.ports.range_start.to_string(),
            "ports.forward" => self.ports.forward.to_string(),
            "ports.inject_system_prompt" => self.ports.inject_system_prompt.to_string(),
            "security.pids_limit" => self.security.pids_limit.to_string(),
            "security.no_new_privileges" => self.security.no_new_privileges.to_string(),
            "security.cap_add" => list(&self.security.cap_add),
            "security.cap_drop" => list(&self.security.cap_drop),
            "security.read_only_rootfs" => self.security.read_only_rootfs.to_string(),
            "security.isolate_secrets" => self.security.isolate_secrets.to_string(),
            "security.network_mode" => self.security.network_mode.to_string(),
            "security.seccomp_profile" => self.security.seccomp_profile.clone(),
            "security.tmpfs_tmp_size" => self.security.tmpfs_tmp_size.clone(),
            "security.tmpfs_home_size" => self.security.tmpfs_home_size.clone(),
            "security.ulimit_nofile" => self.security.ulimit_nofile.clone(),
            "security.ulimit_nproc" => self.security.ulimit_nproc.clone(),
            "security.time_limit" => self.security.time_limit.to_string(),
            "security.user_namespace" => self.security.user_namespace.clone(),
            "security.disable_ipc" => self.security.disable_ipc.to_string(),
            "security.disable_devices" => self.security.disable_devices.to_string(),
            "security.memory_swap" => self.security.memory_swap.clone(),
            "container.cpus" => self.container.cpus.clone(),
            "container.memory" => self.container.memory.clone(),
            "log.enabled" => self.log.enabled.to_string(),
            "log.output" => self.log.output.to_string(),
            "log.level" => self.log.level.clone(),
            "log.dir" => self.log.dir.clone(),
            "log.file" => self.log.file.clone(),
            "log.rotate" => self.log.rotate.to_string(),
            "log.max_size" => self.log.max_size.clone(),
            "log.max_files" => self.log.max_files.to_string(),
            "log.modules" => list(&self.log.modules),
            "otel.enabled" => self.otel.enabled.to_string(),
            "otel.endpoint" => self.otel.endpoint.clone(),
            "otel.protocol" => self.otel.protocol.clone(),
            "otel.service_name" => self.otel.service_name.clone(),
            "otel.headers" => self.otel.headers.clone(),
            "history_persist" => self.history_persist.to_string(),
            "tmux_forward" => self.tmux_forward.to_string(),
            "env_file" => self.env_file.clone(),
            "env_vars" => list(&self.env_vars),
            "dind.mode" => self.dind.mode.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Where a key's value came from.
    pub fn source_of(&self, key: &str) -> Source {
        self.sources.get(key).copied().unwrap_or_default()
    }

    pub(crate) fn record_source(&mut self, key: &str, source: Source) {
        self.sources.insert(key.to_string(), source);
    }

    /// Settings for one extension (defaults when never configured).
    pub fn extension(&self, name: &str) -> ExtensionSettings {
        self.extension_settings.get(name).cloned().unwrap_or_default()
    }

    /// First active extension, which determines the default command.
    pub fn primary_extension(&self) -> Option<&str> {
        self.extensions.first().map(String::as_str)
    }

    /// Whether SSH forwarding is on.
    pub fn ssh_enabled(&self) -> bool {
        self.ssh.enabled()
    }
}

fn choice<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    let kind = super::keys::lookup(key)
        .map(|d| d.kind)
        .unwrap_or(KeyKind::String);
    raw.parse::<T>()
        .map_err(|_| ConfigError::invalid(key, raw, kind.expected()))
}

fn checked_choice(key: &str, raw: &str) -> Result<String, ConfigError> {
    match super::keys::lookup(key).map(|d| d.kind) {
        Some(KeyKind::Choice(choices)) if !choices.contains(&raw) => Err(ConfigError::invalid(
            key,
            raw,
            KeyKind::Choice(choices).expected(),
        )),
        _ => Ok(raw.to_string()),
    }
}
