//! Nested container runtime (Docker-in-Docker) wiring.

use addt_core::config::DindMode;
use addt_core::id::NAME_PREFIX;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Fallback GIDs commonly owning the runtime socket.
const FALLBACK_SOCKET_GIDS: [u32; 2] = [102, 999];

/// Where the nested daemon keeps its state.
const NESTED_DATA_DIR: &str = "/var/lib/docker";

/// Socket path the nested daemon and host-socket mode expose.
pub const SANDBOX_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Runtime arguments and environment for a DinD mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DindSetup {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Named volume created for isolated mode.
    pub volume: Option<String>,
}

/// Name of the isolated-mode data volume for a session.
pub fn volume_name(backend: &str, session: &str) -> String {
    format!(
        "{}{}-{}",
        NAME_PREFIX,
        backend,
        session.strip_prefix(NAME_PREFIX).unwrap_or(session)
    )
}

/// Host runtime socket to bind in host mode.
pub fn host_socket(env_docker_host: Option<&str>) -> PathBuf {
    env_docker_host
        .and_then(|h| h.strip_prefix("unix://"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SANDBOX_DOCKER_SOCKET))
}

#[cfg(unix)]
fn socket_gid(socket: &Path) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(socket).ok().map(|m| m.gid())
}

#[cfg(not(unix))]
fn socket_gid(_socket: &Path) -> Option<u32> {
    None
}

/// Compose the DinD arguments for `mode`.
pub fn setup(mode: DindMode, backend: &str, session: &str, socket: &Path) -> DindSetup {
    let mut out = DindSetup::default();
    match mode {
        DindMode::Off => {}
        DindMode::Host => {
            out.args.push("-v".to_string());
            out.args
                .push(format!("{}:{}", socket.display(), SANDBOX_DOCKER_SOCKET));

            let mut gids: Vec<u32> = socket_gid(socket).into_iter().collect();
            for gid in FALLBACK_SOCKET_GIDS {
                if !gids.contains(&gid) {
                    gids.push(gid);
                }
            }
            for gid in gids {
                out.args.push("--group-add".to_string());
                out.args.push(gid.to_string());
            }
        }
        DindMode::Isolated => {
            let volume = volume_name(backend, session);
            out.args.push("--privileged".to_string());
            out.args.push("-v".to_string());
            out.args.push(format!("{}:{}", volume, NESTED_DATA_DIR));
            out.env
                .insert("ADDT_DOCKER_DIND_ENABLE".to_string(), "true".to_string());
            out.volume = Some(volume);
        }
    }
    out
}
