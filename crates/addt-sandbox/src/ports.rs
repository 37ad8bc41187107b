//! Host port allocation for published container ports.

use crate::error::{Result, SandboxError};
use crate::spec::PortMapping;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

pub const PORT_MAP_VAR: &str = "ADDT_PORT_MAP";
pub const PORT_HINT_VAR: &str = "ADDT_PORT_HINT";

/// Parse `ports.expose` entries into container ports.
pub fn parse_ports(entries: &[String]) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let port: u16 = entry
            .parse()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| SandboxError::config(format!("invalid port '{}'", entry)))?;
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    Ok(ports)
}

/// Whether something already listens on `localhost:port`.
pub async fn port_in_use(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Assign each container port a free host port, scanning up from `range_start`.
///
/// Host ports are pairwise distinct and each passed the probe when chosen.
pub async fn allocate(container_ports: &[u16], range_start: u16) -> Result<Vec<PortMapping>> {
    let mut taken = HashSet::new();
    let mut mappings = Vec::with_capacity(container_ports.len());
    let mut candidate = range_start.max(1);

    for &container in container_ports {
        let host = loop {
            if !taken.contains(&candidate) && !port_in_use(candidate).await {
                break candidate;
            }
            candidate = candidate.checked_add(1).ok_or_else(|| {
                SandboxError::config(format!(
                    "no free host port at or above {} for container port {}",
                    range_start, container
                ))
            })?;
        };
        taken.insert(host);
        debug!("Publishing container port {} on host port {}", container, host);
        mappings.push(PortMapping { container, host });
        candidate = candidate.saturating_add(1);
    }

    Ok(mappings)
}

/// `ADDT_PORT_MAP` value: `container:host[,container:host...]`.
pub fn port_map_env(mappings: &[PortMapping]) -> String {
    mappings
        .iter()
        .map(|m| format!("{}:{}", m.container, m.host))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse `<runtime> port <name>` output, e.g. `3000/tcp -> 0.0.0.0:41730`.
///
/// IPv4 and IPv6 bindings of the same port collapse into one mapping.
pub fn parse_published(output: &str) -> Vec<PortMapping> {
    let mut mappings: Vec<PortMapping> = Vec::new();
    for line in output.lines() {
        let Some((container, host)) = line.split_once("->") else {
            continue;
        };
        let container = container.trim();
        let container = match container.split_once('/') {
            Some((port, "tcp")) => port,
            Some(_) => continue,
            None => container,
        };
        let (Ok(container), Some(Ok(host))) = (
            container.parse::<u16>(),
            host.trim().rsplit(':').next().map(str::parse::<u16>),
        ) else {
            continue;
        };
        if !mappings.iter().any(|m| m.container == container) {
            mappings.push(PortMapping { container, host });
        }
    }
    mappings
}

/// Mappings a running container actually publishes, in `requested` order.
pub fn reconcile(requested: &[PortMapping], published: &[PortMapping]) -> Vec<PortMapping> {
    requested
        .iter()
        .filter_map(|r| published.iter().find(|p| p.container == r.container).copied())
        .collect()
}

/// Set the port variables from `mappings`, dropping both when it is empty.
pub fn apply_env(env: &mut BTreeMap<String, String>, mappings: &[PortMapping], hint: bool) {
    env.remove(PORT_MAP_VAR);
    env.remove(PORT_HINT_VAR);
    if mappings.is_empty() {
        return;
    }
    env.insert(PORT_MAP_VAR.to_string(), port_map_env(mappings));
    if hint {
        env.insert(PORT_HINT_VAR.to_string(), port_hint(mappings));
    }
}

/// Hint for the agent's system prompt describing where ports are reachable.
pub fn port_hint(mappings: &[PortMapping]) -> String {
    if mappings.is_empty() {
        return String::new();
    }
    let pairs = mappings
        .iter()
        .map(|m| format!("container port {} is reachable at http://localhost:{}", m.container, m.host))
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "You are running inside an addt sandbox. When you start a service, tell the user the host URL: {}.",
        pairs
    )
}
