//! The one-line status banner.

use crate::spec::RunSpec;
use addt_core::config::{DindMode, ForwardMode};
use addt_core::EffectiveConfig;

/// Summarise the enabled features of a session.
pub fn banner(provider: &str, config: &EffectiveConfig, spec: &RunSpec) -> String {
    let mut parts = vec![format!("addt: {}", provider)];

    if !config.extensions.is_empty() {
        parts.push(config.extensions.join(","));
    }
    if spec.mount_workdir {
        parts.push(if spec.workdir_readonly { "workdir RO" } else { "workdir RW" }.to_string());
    }
    if spec.secrets.contains_key("GH_TOKEN") {
        parts.push("GH".to_string());
    }
    if spec.ssh.mode != ForwardMode::Off {
        parts.push(format!("SSH {}", spec.ssh.mode));
    }
    if spec.gpg.mode != ForwardMode::Off {
        parts.push(format!("GPG {}", spec.gpg.mode));
    }
    if spec.dind != DindMode::Off {
        parts.push(format!("DinD {}", spec.dind));
    }
    if spec.firewall.enabled {
        parts.push(format!("firewall {}", spec.firewall.mode));
    }
    if !spec.ports.is_empty() {
        let ports: Vec<String> = spec
            .ports
            .iter()
            .map(|p| format!("{}:{}", p.container, p.host))
            .collect();
        parts.push(format!("ports {}", ports.join(",")));
    }
    if spec.persistent {
        parts.push(format!("persistent {}", spec.name));
    }

    parts.join(" | ")
}
