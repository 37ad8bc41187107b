//! SSH forwarding.
//!
//! | mode    | `~/.ssh` contents                  | agent                      |
//! |---------|------------------------------------|----------------------------|
//! | `off`   | nothing                            | none                       |
//! | `agent` | config, known_hosts, `*.pub`       | host socket bound directly |
//! | `keys`  | the above plus `id_*` private keys | none                       |
//! | `proxy` | config, known_hosts, `*.pub`       | filtering proxy            |
//!
//! The host `~/.ssh` itself is never mounted.

use super::{copy_filtered, Forwarding};
use crate::error::{Result, SandboxError};
use crate::session::SessionResources;
use crate::spec::{AgentForward, VolumeMount, SANDBOX_HOME};
use addt_core::config::{ForwardMode, ProviderKind};
use addt_proxy::ssh_agent::SOCKET_NAME;
use addt_proxy::SshAgentProxy;
use std::path::Path;
use tracing::warn;

/// Where the agent socket directory is mounted.
pub const AGENT_MOUNT: &str = "/run/addt-ssh";

/// Socket path used by Docker Desktop for the host agent on macOS.
const DOCKER_DESKTOP_AGENT: &str = "/run/host-services/ssh-auth.sock";

fn is_safe_file(name: &str, with_private_keys: bool) -> bool {
    matches!(name, "config" | "known_hosts" | "known_hosts2")
        || name.ends_with(".pub")
        || (with_private_keys && name.starts_with("id_"))
}

/// Copy the allowed subset of `~/.ssh` into a session directory.
fn safe_files(
    session: &mut SessionResources,
    user_home: &Path,
    with_private_keys: bool,
) -> Result<Option<VolumeMount>> {
    let ssh_dir = user_home.join(".ssh");
    if !ssh_dir.is_dir() {
        return Ok(None);
    }
    let dest = session.temp_dir("ssh-files")?;
    copy_filtered(&ssh_dir, &dest, |name, is_dir| {
        !is_dir && is_safe_file(name, with_private_keys)
    })?;
    Ok(Some(
        VolumeMount::new(dest, format!("{}/.ssh", SANDBOX_HOME)).readonly(true),
    ))
}

/// Prepare SSH forwarding for a session.
pub async fn prepare(
    session: &mut SessionResources,
    forward: &AgentForward,
    auth_sock: Option<&Path>,
    user_home: &Path,
    provider: ProviderKind,
) -> Result<Forwarding> {
    let mut out = Forwarding::default();
    if forward.mode == ForwardMode::Off {
        return Ok(out);
    }

    if let Some(mount) = safe_files(session, user_home, forward.mode == ForwardMode::Keys)? {
        out.mount(mount);
    }

    match forward.mode {
        ForwardMode::Off | ForwardMode::Keys => {}
        ForwardMode::Agent => {
            if cfg!(target_os = "macos") && provider == ProviderKind::Docker {
                out.mount(VolumeMount::new(DOCKER_DESKTOP_AGENT, DOCKER_DESKTOP_AGENT));
                out.set_env("SSH_AUTH_SOCK", DOCKER_DESKTOP_AGENT);
            } else if let Some(sock) = auth_sock.filter(|s| s.exists()) {
                let target = format!("{}/{}", AGENT_MOUNT, SOCKET_NAME);
                out.mount(VolumeMount::new(sock, target.clone()));
                out.set_env("SSH_AUTH_SOCK", target);
            } else {
                degrade(forward, "SSH_AUTH_SOCK is not set or the agent socket is missing")?;
            }
        }
        ForwardMode::Proxy => {
            let Some(sock) = auth_sock else {
                degrade(forward, "SSH_AUTH_SOCK is not set")?;
                return Ok(out);
            };
            let mut proxy = SshAgentProxy::new(sock, &forward.allowed);
            match proxy.start_in(session.socket_dir("ssh-agent")?).await {
                Ok(()) => {
                    if let Some(dir) = proxy.socket_dir() {
                        out.mount(VolumeMount::new(dir, AGENT_MOUNT).required());
                        out.set_env("SSH_AUTH_SOCK", format!("{}/{}", AGENT_MOUNT, SOCKET_NAME));
                    }
                    session.set_ssh_proxy(proxy);
                }
                Err(source) if forward.explicit => {
                    return Err(SandboxError::ProxyStart {
                        feature: "SSH",
                        source,
                    });
                }
                Err(e) => warn!("SSH agent forwarding disabled: {}", e),
            }
        }
    }

    Ok(out)
}

fn degrade(forward: &AgentForward, reason: &str) -> Result<()> {
    if forward.explicit {
        return Err(SandboxError::config(format!(
            "ssh.forward_mode={}: {}",
            forward.mode, reason
        )));
    }
    warn!("SSH agent forwarding disabled: {}", reason);
    Ok(())
}
