//! The container runtime CLI (`docker`, `podman`, OrbStack's `docker`).

use crate::error::{Result, SandboxError};
use crate::ports;
use crate::process;
use crate::spec::{Environment, EnvironmentStatus, PortMapping};
use addt_core::config::ProviderKind;
use addt_core::id::NAME_PREFIX;
use addt_core::AddtPaths;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Docker context OrbStack registers.
const ORBSTACK_CONTEXT: &str = "orbstack";

/// A resolved runtime binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runtime {
    kind: ProviderKind,
    binary: PathBuf,
}

impl Runtime {
    pub fn new(kind: ProviderKind, binary: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            binary: binary.into(),
        }
    }

    /// Locate the runtime binary for `kind`.
    ///
    /// Podman prefers a copy under `<addt_home>/bin`.
    pub fn detect(kind: ProviderKind, paths: &AddtPaths) -> Result<Self> {
        let (program, hint) = match kind {
            ProviderKind::Podman => {
                let bundled = paths.bin_dir().join("podman");
                if bundled.is_file() {
                    return Ok(Self::new(kind, bundled));
                }
                ("podman", "Install Podman: https://podman.io/docs/installation")
            }
            ProviderKind::Orbstack => ("docker", "Install OrbStack: https://orbstack.dev"),
            ProviderKind::Docker => ("docker", "Install Docker: https://docs.docker.com/get-docker/"),
            ProviderKind::Bwrap => {
                return Err(SandboxError::config("bwrap is not a container runtime"));
            }
        };

        let binary = which::which(program).map_err(|_| SandboxError::prerequisite(program, hint))?;
        debug!("Using {} at {}", kind, binary.display());
        Ok(Self::new(kind, binary))
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Short runtime name used in volume names and the DinD data path.
    pub fn backend_name(&self) -> &'static str {
        match self.kind {
            ProviderKind::Podman => "podman",
            _ => "docker",
        }
    }

    /// A command for this runtime with global flags applied.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if self.kind == ProviderKind::Orbstack {
            cmd.args(["--context", ORBSTACK_CONTEXT]);
        }
        cmd
    }

    /// Build a command from `args`.
    pub fn command_with(&self, args: &[String]) -> Command {
        let mut cmd = self.command();
        cmd.args(args);
        cmd
    }

    async fn succeeds(&self, args: &[&str]) -> Result<bool> {
        let mut cmd = self.command();
        cmd.args(args).stdout(Stdio::null()).stderr(Stdio::null());
        Ok(process::capture(cmd).await?.status.success())
    }

    async fn stdout(&self, args: &[&str]) -> Result<String> {
        let mut cmd = self.command();
        cmd.args(args);
        let output = process::capture(cmd).await?;
        if !output.status.success() {
            return Err(SandboxError::RuntimeUnavailable(format!(
                "{} {} failed: {}",
                self.kind,
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Fail unless the daemon answers.
    pub async fn check_daemon(&self) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("info").stdout(Stdio::null());
        let output = process::capture(cmd).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr.lines().find(|l| !l.trim().is_empty()).unwrap_or("no response");
        Err(SandboxError::RuntimeUnavailable(format!(
            "{} daemon is not reachable: {}",
            self.kind,
            reason.trim()
        )))
    }

    pub async fn image_exists(&self, tag: &str) -> Result<bool> {
        self.succeeds(&["image", "inspect", tag]).await
    }

    /// Labels of an image; empty if it has none.
    pub async fn image_labels(&self, tag: &str) -> Result<BTreeMap<String, String>> {
        let raw = self
            .stdout(&["image", "inspect", "--format", "{{json .Config.Labels}}", tag])
            .await?;
        Ok(parse_labels(&raw))
    }

    pub async fn container_exists(&self, name: &str) -> Result<bool> {
        self.succeeds(&["container", "inspect", name]).await
    }

    /// Ports a container publishes on the host.
    pub async fn published_ports(&self, name: &str) -> Result<Vec<PortMapping>> {
        Ok(ports::parse_published(&self.stdout(&["port", name]).await?))
    }

    pub async fn container_running(&self, name: &str) -> Result<bool> {
        let mut cmd = self.command();
        cmd.args(["container", "inspect", "--format", "{{.State.Running}}", name]);
        let output = process::capture(cmd).await?;
        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    /// Every container whose name starts with `addt-`.
    pub async fn list(&self) -> Result<Vec<Environment>> {
        let raw = self
            .stdout(&[
                "ps",
                "-a",
                "--filter",
                &format!("name={}", NAME_PREFIX),
                "--format",
                "{{.Names}}\t{{.State}}\t{{.CreatedAt}}",
            ])
            .await?;
        Ok(raw.lines().filter_map(parse_ps_line).collect())
    }

    async fn lifecycle(&self, verb: &str, name: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg(verb);
        if verb == "rm" {
            cmd.arg("-f");
        }
        cmd.arg(name).stdout(Stdio::null());
        let output = process::capture(cmd).await?;
        if output.status.success() {
            debug!("{} {}", verb, name);
            return Ok(());
        }
        Err(SandboxError::RuntimeUnavailable(format!(
            "{} {} failed: {}",
            verb,
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.lifecycle("start", name).await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.lifecycle("stop", name).await
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.lifecycle("rm", name).await
    }

    /// Remove a named volume; a missing volume is not an error.
    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["volume", "rm", "-f", name]).stdout(Stdio::null());
        let output = process::capture(cmd).await?;
        if !output.status.success() {
            warn!(
                "Failed to remove volume {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Run `command` in a running container; true if it exits zero.
    pub async fn exec_succeeds(&self, name: &str, command: &[&str]) -> Result<bool> {
        let mut args = vec!["exec", name];
        args.extend_from_slice(command);
        self.succeeds(&args).await
    }

    /// Last lines of a container's output.
    pub async fn logs_tail(&self, name: &str, lines: usize) -> Result<String> {
        let mut cmd = self.command();
        cmd.args(["logs", "--tail", &lines.to_string(), name]);
        let output = process::capture(cmd).await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text.trim().to_string())
    }

    /// Start a detached container from `args` (a full `run -d ...` line).
    pub async fn run_detached(&self, name: &str, args: &[String]) -> Result<()> {
        let output = process::capture(self.command_with(args)).await?;
        if output.status.success() {
            debug!("Created container {}", name);
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already in use") {
            return Err(SandboxError::NameInUse(name.to_string()));
        }
        Err(SandboxError::RuntimeUnavailable(format!(
            "failed to create {}: {}",
            name,
            stderr.trim()
        )))
    }

    /// Run a shell snippet in a throwaway container and capture its stdout.
    pub async fn probe(&self, image: &str, script: &str) -> Result<String> {
        self.stdout(&["run", "--rm", "--entrypoint", "/bin/sh", image, "-c", script])
            .await
    }
}

/// Parse `{{json .Config.Labels}}` output.
fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    serde_json::from_str::<Option<BTreeMap<String, String>>>(raw.trim())
        .ok()
        .flatten()
        .unwrap_or_default()
}

/// Parse one `ps` line: name, state and creation time separated by tabs.
fn parse_ps_line(line: &str) -> Option<Environment> {
    let mut fields = line.split('\t');
    let name = fields.next()?.trim();
    if !name.starts_with(NAME_PREFIX) {
        return None;
    }
    let status = match fields.next().map(str::trim) {
        Some("running") => EnvironmentStatus::Running,
        _ => EnvironmentStatus::Stopped,
    };
    let created_at = fields.next().and_then(parse_created_at);
    Some(Environment {
        name: name.to_string(),
        status,
        created_at,
    })
}

/// Parse `2024-05-01 12:34:56[.frac] +0200 CEST`.
fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let mut parts = raw.split_whitespace();
    let date = parts.next()?;
    let time = parts.next()?.split('.').next()?;
    let offset = parts.next()?;
    DateTime::parse_from_str(&format!("{} {} {}", date, time, offset), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
