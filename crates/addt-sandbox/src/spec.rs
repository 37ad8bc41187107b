//! The hand-off from configuration to providers.

use addt_core::config::{
    ContainerConfig, DindMode, FirewallMode, ForwardMode, SecurityConfig,
};
use addt_core::SecretString;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Unprivileged user inside every sandbox.
pub const SANDBOX_USER: &str = "addt";

/// Home directory of [`SANDBOX_USER`].
pub const SANDBOX_HOME: &str = "/home/addt";

/// Mount point of the project working directory.
pub const WORKSPACE_DIR: &str = "/workspace";

/// A bind mount into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMount {
    pub source: PathBuf,
    pub target: String,
    pub readonly: bool,
    /// Fail instead of skipping when the source is missing.
    pub required: bool,
}

impl VolumeMount {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            readonly: false,
            required: false,
        }
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A container port published on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub container: u16,
    pub host: u16,
}

/// Credential agent forwarding settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentForward {
    pub mode: ForwardMode,
    pub allowed: Vec<String>,
    /// Whether the user set the mode explicitly; failures are then fatal.
    pub explicit: bool,
}

/// tmux session the host is running inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TmuxForward {
    /// Value of `TMUX` (`socket,pid,session`).
    pub tmux: String,
    pub pane: Option<String>,
}

/// Egress firewall settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FirewallSpec {
    pub enabled: bool,
    pub mode: FirewallMode,
    pub allowed: Vec<String>,
    pub denied: Vec<String>,
    /// Ports open under Podman pasta strict mode.
    pub allowed_ports: Vec<u16>,
}

/// Everything a provider needs to start one session.
#[derive(Debug, Clone, Serialize)]
pub struct RunSpec {
    pub name: String,
    pub interactive: bool,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub mount_workdir: bool,
    pub workdir_readonly: bool,
    pub volumes: Vec<VolumeMount>,
    /// Plain environment passed to the sandbox.
    pub env: BTreeMap<String, String>,
    /// Sensitive variables, materialised as files when isolation is on.
    #[serde(skip)]
    pub secrets: BTreeMap<String, SecretString>,
    pub ports: Vec<PortMapping>,
    pub persistent: bool,
    /// OCI image; `None` for bwrap.
    pub image: Option<String>,
    /// Command from `ADDT_COMMAND`, split on whitespace by the provider.
    pub command: Option<String>,
    pub ssh: AgentForward,
    pub ssh_auth_sock: Option<PathBuf>,
    pub gpg: AgentForward,
    /// Host `GNUPGHOME`, when set.
    pub gnupg_home: Option<PathBuf>,
    pub tmux: Option<TmuxForward>,
    pub git_config: Option<PathBuf>,
    pub git_disable_hooks: bool,
    pub history_persist: bool,
    pub security: SecurityConfig,
    pub container: ContainerConfig,
    pub firewall: FirewallSpec,
    pub dind: DindMode,
    /// Host `DOCKER_HOST`, locating the socket for DinD host mode.
    pub docker_host: Option<String>,
}

impl RunSpec {
    pub fn new(name: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            interactive: false,
            args: Vec::new(),
            workdir: workdir.into(),
            mount_workdir: true,
            workdir_readonly: false,
            volumes: Vec::new(),
            env: BTreeMap::new(),
            secrets: BTreeMap::new(),
            ports: Vec::new(),
            persistent: false,
            image: None,
            command: None,
            ssh: AgentForward::default(),
            ssh_auth_sock: None,
            gpg: AgentForward::default(),
            gnupg_home: None,
            tmux: None,
            git_config: None,
            git_disable_hooks: false,
            history_persist: false,
            security: addt_core::EffectiveConfig::default().security,
            container: addt_core::EffectiveConfig::default().container,
            firewall: FirewallSpec::default(),
            dind: DindMode::Off,
            docker_host: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_volume(mut self, volume: VolumeMount) -> Self {
        self.volumes.push(volume);
        self
    }

    /// Wall-clock limit from `security.time_limit` (minutes).
    pub fn time_limit(&self) -> Option<Duration> {
        u64::try_from(self.security.time_limit)
            .ok()
            .filter(|m| *m > 0)
            .map(|m| Duration::from_secs(m * 60))
    }

    /// The command to exec: `ADDT_COMMAND` words, or `None` for the image default.
    pub fn command_words(&self) -> Vec<String> {
        self.command
            .as_deref()
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// State of a listed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Running,
    Stopped,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A session known to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub name: String,
    pub status: EnvironmentStatus,
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_words() {
        let mut spec = RunSpec::new("addt-x", "/tmp/p");
        assert!(spec.command_words().is_empty());
        spec.command = Some("claude  --model  opus".to_string());
        assert_eq!(spec.command_words(), vec!["claude", "--model", "opus"]);
    }

    #[test]
    fn test_defaults_follow_config_defaults() {
        let spec = RunSpec::new("addt-x", "/tmp/p");
        assert_eq!(spec.security.pids_limit, 200);
        assert_eq!(spec.security.cap_drop, vec!["ALL".to_string()]);
        assert!(spec.mount_workdir);
        assert_eq!(spec.dind, DindMode::Off);
        assert_eq!(spec.time_limit(), None);
    }

    #[test]
    fn test_time_limit_minutes() {
        let mut spec = RunSpec::new("addt-x", "/tmp/p");
        spec.security.time_limit = 2;
        assert_eq!(spec.time_limit(), Some(Duration::from_secs(120)));
        spec.security.time_limit = -1;
        assert_eq!(spec.time_limit(), None);
    }
}
