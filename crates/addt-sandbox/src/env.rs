//! Environment injected into every sandbox.

use addt_core::config::keys::extension_flag_export;
use addt_core::config::{OtelConfig, ProviderKind};
use addt_core::EffectiveConfig;
use std::collections::BTreeMap;

/// Built-in OTEL service name; only this value gets the extension suffix.
pub const DEFAULT_SERVICE_NAME: &str = "addt";

const DEFAULT_TERM: &str = "xterm-256color";

/// `TERM`, `COLORTERM`, locale variables and the current terminal size.
pub fn terminal_env(host_terminal: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = host_terminal.clone();
    env.entry("TERM".to_string())
        .or_insert_with(|| DEFAULT_TERM.to_string());

    if let Ok((cols, rows)) = crossterm::terminal::size() {
        if cols > 0 && rows > 0 {
            env.insert("COLUMNS".to_string(), cols.to_string());
            env.insert("LINES".to_string(), rows.to_string());
        }
    }
    env
}

/// Service name reported by the agent.
///
/// The built-in default becomes `<default>-<first_extension>`; anything the
/// user configured is kept verbatim.
pub fn otel_service_name(configured: &str, first_extension: &str) -> String {
    if configured == DEFAULT_SERVICE_NAME && !first_extension.is_empty() {
        format!("{}-{}", configured, first_extension)
    } else {
        configured.to_string()
    }
}

/// Point loopback endpoints at the host when the agent runs in a container.
pub fn sandbox_endpoint(endpoint: &str, provider: ProviderKind) -> String {
    let host = match provider {
        ProviderKind::Bwrap => return endpoint.to_string(),
        ProviderKind::Podman => "host.containers.internal",
        ProviderKind::Docker | ProviderKind::Orbstack => "host.docker.internal",
    };
    endpoint
        .replacen("://localhost", &format!("://{}", host), 1)
        .replacen("://127.0.0.1", &format!("://{}", host), 1)
}

/// `OTEL_*` variables, empty when telemetry is off.
pub fn otel_env(
    otel: &OtelConfig,
    first_extension: &str,
    provider: ProviderKind,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if !otel.enabled {
        return env;
    }

    let mut set = |k: &str, v: String| {
        env.insert(k.to_string(), v);
    };
    set("CLAUDE_CODE_ENABLE_TELEMETRY", "1".to_string());
    set("OTEL_METRICS_EXPORTER", "otlp".to_string());
    set("OTEL_LOGS_EXPORTER", "otlp".to_string());
    set(
        "OTEL_EXPORTER_OTLP_ENDPOINT",
        sandbox_endpoint(&otel.endpoint, provider),
    );
    set("OTEL_EXPORTER_OTLP_PROTOCOL", otel.protocol.clone());
    set(
        "OTEL_SERVICE_NAME",
        otel_service_name(&otel.service_name, first_extension),
    );
    set(
        "OTEL_RESOURCE_ATTRIBUTES",
        format!(
            "addt.extension={},addt.provider={}",
            first_extension,
            provider.as_str()
        ),
    );
    if !otel.headers.is_empty() {
        set("OTEL_EXPORTER_OTLP_HEADERS", otel.headers.clone());
    }
    env
}

/// `ADDT_EXTENSION_<NAME>_<FLAG>` for every configured extension flag.
pub fn extension_flag_env(config: &EffectiveConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for (name, settings) in &config.extension_settings {
        for (flag, value) in &settings.flags {
            env.insert(extension_flag_export(name, flag), value.clone());
        }
    }
    env
}
