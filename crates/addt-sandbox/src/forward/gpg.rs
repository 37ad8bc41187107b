//! GPG forwarding.
//!
//! The sandbox `~/.gnupg` is always a filtered copy of the host keyring.
//! In `agent` mode its `S.gpg-agent` is a symlink into the host socket
//! directory; in `proxy` mode the filtering proxy listens inside the copy.

use super::{copy_filtered, Forwarding};
use crate::error::{Result, SandboxError};
use crate::session::SessionResources;
use crate::spec::{AgentForward, VolumeMount, SANDBOX_HOME};
use addt_core::config::ForwardMode;
use addt_proxy::gpg_agent::{find_upstream_socket, SOCKET_NAME};
use addt_proxy::GpgAgentProxy;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Where the host gpg-agent socket directory is mounted in `agent` mode.
pub const AGENT_MOUNT: &str = "/run/addt-gpg";

fn is_safe_file(name: &str, is_dir: bool, with_private_keys: bool) -> bool {
    if is_dir {
        return with_private_keys && name == "private-keys-v1.d";
    }
    matches!(
        name,
        "trustdb.gpg" | "pubring.kbx" | "pubring.gpg" | "sshcontrol" | "tofu.db"
    ) || (name.starts_with("gpg") && name.ends_with(".conf"))
}

fn copy_keyring(source: &Path, dest: &Path, with_private_keys: bool) -> io::Result<()> {
    copy_filtered(source, dest, |name, is_dir| {
        is_safe_file(name, is_dir, with_private_keys)
    })?;
    Ok(())
}

fn keyring_mount(dir: &Path) -> VolumeMount {
    VolumeMount::new(dir, format!("{}/.gnupg", SANDBOX_HOME)).readonly(true)
}

#[cfg(unix)]
fn link_agent_socket(keyring: &Path, upstream: &Path) -> io::Result<()> {
    let name = upstream
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| SOCKET_NAME.to_string());
    std::os::unix::fs::symlink(
        format!("{}/{}", AGENT_MOUNT, name),
        keyring.join(SOCKET_NAME),
    )
}

#[cfg(not(unix))]
fn link_agent_socket(_keyring: &Path, _upstream: &Path) -> io::Result<()> {
    Ok(())
}

/// Prepare GPG forwarding for a session.
pub async fn prepare(
    session: &mut SessionResources,
    forward: &AgentForward,
    user_home: &Path,
    gnupg_home: Option<&Path>,
) -> Result<Forwarding> {
    let mut out = Forwarding::default();
    if forward.mode == ForwardMode::Off {
        return Ok(out);
    }

    let source = gnupg_home
        .map(Path::to_path_buf)
        .unwrap_or_else(|| user_home.join(".gnupg"));
    let with_private_keys = forward.mode == ForwardMode::Keys;
    out.set_env("GPG_TTY", "/dev/console");

    let upstream = match forward.mode {
        ForwardMode::Agent | ForwardMode::Proxy => {
            let found = find_upstream_socket(gnupg_home, user_home);
            if found.is_none() {
                degrade(forward, "no gpg-agent socket found")?;
            }
            found
        }
        ForwardMode::Off | ForwardMode::Keys => None,
    };

    if forward.mode == ForwardMode::Proxy {
        if let Some(upstream) = &upstream {
            if let Some(dir) = start_proxy(session, forward, &source, upstream).await? {
                out.mount(keyring_mount(&dir));
                return Ok(out);
            }
        }
    }

    let dest = session.temp_dir("gnupg")?;
    copy_keyring(&source, &dest, with_private_keys)?;
    if forward.mode == ForwardMode::Agent {
        if let Some(upstream) = upstream.as_deref() {
            if let Some(host_dir) = upstream.parent() {
                link_agent_socket(&dest, upstream)?;
                out.mount(VolumeMount::new(host_dir, AGENT_MOUNT));
            }
        }
    }
    out.mount(keyring_mount(&dest));
    Ok(out)
}

/// Start the filtering proxy inside a fresh keyring copy.
///
/// Returns the keyring directory, or `None` when forwarding degraded.
async fn start_proxy(
    session: &mut SessionResources,
    forward: &AgentForward,
    source: &Path,
    upstream: &Path,
) -> Result<Option<PathBuf>> {
    let dir = session.socket_dir("gpg-agent")?;
    let path = dir.path().to_path_buf();
    if let Err(e) = copy_keyring(source, &path, false) {
        let _ = dir.remove();
        return Err(e.into());
    }

    let mut proxy = GpgAgentProxy::new(upstream, &forward.allowed);
    match proxy.start_in(dir).await {
        Ok(()) => {
            session.set_gpg_proxy(proxy);
            Ok(Some(path))
        }
        Err(source) if forward.explicit => Err(SandboxError::ProxyStart {
            feature: "GPG",
            source,
        }),
        Err(e) => {
            warn!("GPG agent forwarding disabled: {}", e);
            Ok(None)
        }
    }
}

fn degrade(forward: &AgentForward, reason: &str) -> Result<()> {
    if forward.explicit {
        return Err(SandboxError::config(format!(
            "gpg.forward={}: {}",
            forward.mode, reason
        )));
    }
    warn!("GPG agent forwarding disabled: {}", reason);
    Ok(())
}
