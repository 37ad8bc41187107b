//! Runtime command lines.
//!
//! An ephemeral session is one `run --rm`. A persistent container is started
//! once, detached, with the entrypoint idling after network and nested-daemon
//! setup; every session then `exec`s the entrypoint inside it. Files that
//! belong to a single session live under the container's session root,
//! bound at [`SESSION_MOUNT`], and are linked into place by the entrypoint.

use super::build::HostUser;
use crate::error::{Result, SandboxError};
use crate::secrets;
use crate::spec::{PortMapping, VolumeMount, SANDBOX_HOME, WORKSPACE_DIR};
use addt_core::config::{ContainerConfig, SecurityConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a persistent container sees its session root.
pub const SESSION_MOUNT: &str = "/run/addt";

/// Image entrypoint.
pub const ENTRYPOINT: &str = "/usr/local/bin/docker-entrypoint.sh";

const SHELL: &str = "/bin/bash";

/// Entrypoint switches.
pub const KEEPALIVE_VAR: &str = "ADDT_KEEPALIVE";
pub const SESSION_EXEC_VAR: &str = "ADDT_SESSION_EXEC";
pub const LINKS_VAR: &str = "ADDT_LINKS";
pub const SHELL_VAR: &str = "ADDT_SHELL";
pub const SECRETS_FILE_VAR: &str = "ADDT_SECRETS_FILE";

const RUN_TMPFS_SIZE: &str = "64m";

pub fn tty_flag(tty: bool) -> &'static str {
    if tty {
        "-it"
    } else {
        "-i"
    }
}

fn bind_spec(mount: &VolumeMount) -> String {
    let mut spec = format!("{}:{}", mount.source.display(), mount.target);
    if mount.readonly {
        spec.push_str(":ro");
    }
    spec
}

/// `-v` arguments. Missing sources are skipped unless the mount is required.
pub fn volume_args(mounts: &[VolumeMount]) -> Result<Vec<String>> {
    let mut args = Vec::new();
    for mount in mounts {
        if !mount.source.exists() {
            if mount.required {
                return Err(SandboxError::config(format!(
                    "mount source {} does not exist",
                    mount.source.display()
                )));
            }
            debug!("Skipping mount of missing {}", mount.source.display());
            continue;
        }
        args.push("-v".to_string());
        args.push(bind_spec(mount));
    }
    Ok(args)
}

pub fn env_args(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter()
        .flat_map(|(k, v)| ["-e".to_string(), format!("{}={}", k, v)])
        .collect()
}

pub fn port_args(ports: &[PortMapping]) -> Vec<String> {
    ports
        .iter()
        .flat_map(|p| ["-p".to_string(), format!("{}:{}", p.host, p.container)])
        .collect()
}

/// Capabilities, limits, filesystem hardening and resources.
pub fn security_args(
    security: &SecurityConfig,
    container: &ContainerConfig,
    user: HostUser,
) -> Vec<String> {
    let mut args = Vec::new();
    let mut push = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };

    for cap in &security.cap_drop {
        push("--cap-drop", cap.clone());
    }
    for cap in &security.cap_add {
        push("--cap-add", cap.clone());
    }
    if security.no_new_privileges {
        push("--security-opt", "no-new-privileges".to_string());
    }
    if !security.seccomp_profile.is_empty() {
        push("--security-opt", format!("seccomp={}", security.seccomp_profile));
    }
    if security.pids_limit > 0 {
        push("--pids-limit", security.pids_limit.to_string());
    }
    if !security.ulimit_nofile.is_empty() {
        push("--ulimit", format!("nofile={}", security.ulimit_nofile));
    }
    if !security.ulimit_nproc.is_empty() {
        push("--ulimit", format!("nproc={}", security.ulimit_nproc));
    }
    if security.disable_ipc {
        push("--ipc", "private".to_string());
    }
    if !security.user_namespace.is_empty() {
        push("--userns", security.user_namespace.clone());
    }
    if !container.cpus.is_empty() {
        push("--cpus", container.cpus.clone());
    }
    if !container.memory.is_empty() {
        push("--memory", container.memory.clone());
    }
    if !security.memory_swap.is_empty() {
        push("--memory-swap", security.memory_swap.clone());
    }
    if security.read_only_rootfs {
        args.push("--read-only".to_string());
        let mut tmpfs = |spec: String| {
            args.push("--tmpfs".to_string());
            args.push(spec);
        };
        tmpfs(format!("/tmp:rw,noexec,nosuid,size={}", security.tmpfs_tmp_size));
        tmpfs(format!(
            "{}:rw,exec,nosuid,size={},uid={},gid={}",
            SANDBOX_HOME, security.tmpfs_home_size, user.uid, user.gid
        ));
        tmpfs(format!("/run:rw,noexec,nosuid,size={}", RUN_TMPFS_SIZE));
    }
    args
}

/// Bootstrap run by `bash -c` when an ephemeral shell bypasses the entrypoint.
pub fn shell_bootstrap(firewall: bool, dind: bool, secrets_file: Option<&str>) -> Option<String> {
    if !firewall && !dind && secrets_file.is_none() {
        return None;
    }
    let mut script = String::from("set -e\n");
    if firewall {
        script.push_str("sudo -n /usr/local/bin/init-firewall.sh\n");
    }
    if dind {
        script.push_str(concat!(
            "sudo -n /usr/bin/dockerd >/tmp/dockerd.log 2>&1 &\n",
            "for _ in $(seq 1 30); do [ -S /var/run/docker.sock ] && break; sleep 1; done\n",
            "sudo -n /usr/bin/chmod 0666 /var/run/docker.sock || true\n",
        ));
    }
    if let Some(file) = secrets_file {
        script.push_str(&secrets::load_and_scrub(file));
    }
    script.push_str("exec /bin/bash \"$@\"\n");
    Some(script)
}

/// How a new container runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// Attached, removed on exit.
    Ephemeral,
    /// Detached and idle; sessions attach with `exec`.
    Keepalive,
}

/// What the new container executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// Image entrypoint with the session arguments.
    Command(Vec<String>),
    /// Interactive bash, optionally through a bootstrap script.
    Shell {
        bootstrap: Option<String>,
        args: Vec<String>,
    },
}

/// A `run` invocation for a new container.
#[derive(Debug, Clone)]
pub struct RunCommand {
    pub name: String,
    pub image: String,
    pub launch: Launch,
    pub tty: bool,
    /// Host workdir and whether it is read-only.
    pub workdir: Option<(PathBuf, bool)>,
    pub mounts: Vec<VolumeMount>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    /// Security, network and DinD arguments, in order.
    pub runtime_args: Vec<String>,
    pub entry: Entry,
}

impl RunCommand {
    pub fn to_args(&self) -> Result<Vec<String>> {
        let mut args = vec!["run".to_string()];
        match self.launch {
            Launch::Ephemeral => {
                args.push("--rm".to_string());
                args.push(tty_flag(self.tty).to_string());
            }
            Launch::Keepalive => args.push("-d".to_string()),
        }
        args.push("--init".to_string());
        args.push("--name".to_string());
        args.push(self.name.clone());

        if let Some((workdir, readonly)) = &self.workdir {
            let mount = VolumeMount::new(workdir, WORKSPACE_DIR)
                .readonly(*readonly)
                .required();
            args.extend(volume_args(std::slice::from_ref(&mount))?);
            args.push("-w".to_string());
            args.push(WORKSPACE_DIR.to_string());
        }
        args.extend(volume_args(&self.mounts)?);
        args.extend(env_args(&self.env));
        args.extend(port_args(&self.ports));
        args.extend(self.runtime_args.iter().cloned());

        match &self.entry {
            Entry::Command(command) => {
                args.push(self.image.clone());
                args.extend(command.iter().cloned());
            }
            Entry::Shell { bootstrap, args: shell_args } => {
                args.push("--entrypoint".to_string());
                args.push(SHELL.to_string());
                args.push(self.image.clone());
                if let Some(script) = bootstrap {
                    args.push("-c".to_string());
                    args.push(script.clone());
                    args.push("addt-shell".to_string());
                }
                args.extend(shell_args.iter().cloned());
            }
        }
        Ok(args)
    }
}

/// An `exec` of the entrypoint inside a running persistent container.
pub fn exec_args(
    name: &str,
    tty: bool,
    workdir: bool,
    env: &BTreeMap<String, String>,
    args: &[String],
) -> Vec<String> {
    let mut out = vec!["exec".to_string(), tty_flag(tty).to_string()];
    out.extend(env_args(env));
    if workdir {
        out.push("-w".to_string());
        out.push(WORKSPACE_DIR.to_string());
    }
    out.push(name.to_string());
    out.push(ENTRYPOINT.to_string());
    out.extend(args.iter().cloned());
    out
}

/// Session mounts of a persistent container, rewritten for [`SESSION_MOUNT`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Relocated {
    /// Mounts outside the session root; bound only when the container is created.
    pub fixed: Vec<VolumeMount>,
    /// `target=source` pairs for the entrypoint to link.
    pub links: Vec<String>,
}

fn strip_path_prefix<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = value.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

/// Express mounts under `root` as paths below [`SESSION_MOUNT`].
///
/// Targets in the sandbox home become links; any other target is dropped and
/// environment values pointing into it are rewritten to the session root.
/// `ADDT_LINKS` is set when links were produced.
pub fn relocate(
    root: &Path,
    mounts: Vec<VolumeMount>,
    env: &mut BTreeMap<String, String>,
) -> Relocated {
    let mut out = Relocated::default();
    for mount in mounts {
        let Ok(rel) = mount.source.strip_prefix(root) else {
            out.fixed.push(mount);
            continue;
        };
        let inside = format!("{}/{}", SESSION_MOUNT, rel.display());
        if strip_path_prefix(&mount.target, SANDBOX_HOME).is_some() {
            out.links.push(format!("{}={}", mount.target, inside));
            continue;
        }
        for value in env.values_mut() {
            if let Some(rest) = strip_path_prefix(value, &mount.target) {
                *value = format!("{}{}", inside, rest);
            }
        }
    }
    if !out.links.is_empty() {
        env.insert(LINKS_VAR.to_string(), out.links.join(","));
    }
    out
}
