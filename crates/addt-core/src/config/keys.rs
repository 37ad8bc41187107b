//! The config key table.
//!
//! Every dotted key addt understands is listed here with its kind and
//! default. Env var names, `config set` validation and `config list` output
//! all derive from this table.

use crate::env::env_stem;
use crate::error::ConfigError;
use crate::extensions::ExtensionRegistry;
use serde_yaml::Value;

/// Value kind of a config key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Bool,
    Int,
    String,
    /// Comma-separated in env vars, a YAML sequence in files.
    List,
    /// One of a fixed set of strings.
    Choice(&'static [&'static str]),
}

impl KeyKind {
    /// Human description used in error messages.
    pub fn expected(&self) -> String {
        match self {
            KeyKind::Bool => "true or false".to_string(),
            KeyKind::Int => "an integer".to_string(),
            KeyKind::String => "a string".to_string(),
            KeyKind::List => "a comma-separated list".to_string(),
            KeyKind::Choice(choices) => format!("one of {}", choices.join(", ")),
        }
    }
}

/// One entry of the key table.
#[derive(Debug, Clone, Copy)]
pub struct KeyDef {
    pub key: &'static str,
    pub kind: KeyKind,
    /// Default rendered as it would be typed on the command line.
    pub default: &'static str,
    pub description: &'static str,
}

pub const PROVIDERS: &[&str] = &["docker", "podman", "orbstack", "bwrap"];
pub const FORWARD_MODES: &[&str] = &["off", "agent", "keys", "proxy"];
pub const TOKEN_SOURCES: &[&str] = &["env", "gh_auth"];
pub const FIREWALL_MODES: &[&str] = &["strict", "permissive"];
pub const NETWORK_MODES: &[&str] = &["bridge", "none", "host"];
pub const LOG_OUTPUTS: &[&str] = &["stderr", "file", "both"];
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
pub const OTEL_PROTOCOLS: &[&str] = &["http/protobuf", "http/json", "grpc"];
pub const DIND_MODES: &[&str] = &["off", "host", "isolated"];

macro_rules! key {
    ($key:expr, $kind:expr, $default:expr, $desc:expr) => {
        KeyDef {
            key: $key,
            kind: $kind,
            default: $default,
            description: $desc,
        }
    };
}

/// Every global config key.
pub const KEYS: &[KeyDef] = &[
    key!("provider", KeyKind::Choice(PROVIDERS), "docker", "Sandbox backend"),
    key!("node_version", KeyKind::String, "22", "Node.js version in the base image"),
    key!("go_version", KeyKind::String, "1.23.4", "Go version in the base image"),
    key!("uv_version", KeyKind::String, "latest", "uv version in the base image"),
    key!("persistent", KeyKind::Bool, "false", "Reuse one named sandbox per project"),
    key!("workdir.automount", KeyKind::Bool, "true", "Mount the working directory at /workspace"),
    key!("workdir.readonly", KeyKind::Bool, "false", "Mount the working directory read-only"),
    key!("ssh.forward_mode", KeyKind::Choice(FORWARD_MODES), "proxy", "SSH forwarding mode"),
    key!("ssh.allowed_keys", KeyKind::List, "", "Public keys the SSH proxy exposes (empty = all)"),
    key!("gpg.forward", KeyKind::Choice(FORWARD_MODES), "off", "GPG forwarding mode"),
    key!("gpg.allowed_key_ids", KeyKind::List, "", "Key IDs the GPG proxy may use (empty = all)"),
    key!("github.forward_token", KeyKind::Bool, "true", "Forward a GitHub token as GH_TOKEN"),
    key!("github.token_source", KeyKind::Choice(TOKEN_SOURCES), "env", "Where the GitHub token comes from"),
    key!("github.scope_token", KeyKind::Bool, "false", "Restrict the token to github.scope_repos"),
    key!("github.scope_repos", KeyKind::List, "", "owner/repo paths the token may be used for"),
    key!("git.disable_hooks", KeyKind::Bool, "true", "Neutralise git hooks inside the sandbox"),
    key!("git.forward_config", KeyKind::Bool, "true", "Forward the host git config read-only"),
    key!("git.config_path", KeyKind::String, "", "Git config to forward (default ~/.gitconfig)"),
    key!("firewall.enabled", KeyKind::Bool, "false", "Filter egress by domain"),
    key!("firewall.mode", KeyKind::Choice(FIREWALL_MODES), "strict", "strict = allowlist, permissive = denylist"),
    key!("firewall.allowed", KeyKind::List, "", "Extra allowed domains"),
    key!("firewall.denied", KeyKind::List, "", "Extra denied domains"),
    key!("ports.expose", KeyKind::List, "", "Container ports published to the host"),
    key!("ports.range_start", KeyKind::Int, "30000", "First host port probed for publishing"),
    key!("ports.forward", KeyKind::Bool, "true", "Publish ports.expose to the host"),
    key!("ports.inject_system_prompt", KeyKind::Bool, "true", "Tell the agent where ports are reachable"),
    key!("security.pids_limit", KeyKind::Int, "200", "Maximum processes in the sandbox"),
    key!("security.no_new_privileges", KeyKind::Bool, "true", "Set no-new-privileges"),
    key!("security.cap_add", KeyKind::List, "", "Capabilities added after dropping"),
    key!("security.cap_drop", KeyKind::List, "ALL", "Capabilities dropped"),
    key!("security.read_only_rootfs", KeyKind::Bool, "false", "Read-only root filesystem"),
    key!("security.isolate_secrets", KeyKind::Bool, "false", "Pass secrets through /run/secrets instead of -e"),
    key!("security.network_mode", KeyKind::Choice(NETWORK_MODES), "bridge", "Container network mode"),
    key!("security.seccomp_profile", KeyKind::String, "", "Seccomp profile path"),
    key!("security.tmpfs_tmp_size", KeyKind::String, "256m", "Size of the /tmp tmpfs"),
    key!("security.tmpfs_home_size", KeyKind::String, "512m", "Size of the /home tmpfs"),
    key!("security.ulimit_nofile", KeyKind::String, "4096:8192", "nofile ulimit (soft:hard)"),
    key!("security.ulimit_nproc", KeyKind::String, "256:512", "nproc ulimit (soft:hard)"),
    key!("security.time_limit", KeyKind::Int, "0", "Minutes before the sandbox is stopped (0 = none)"),
    key!("security.user_namespace", KeyKind::String, "", "User namespace mode (--userns)"),
    key!("security.disable_ipc", KeyKind::Bool, "true", "Private IPC namespace"),
    key!("security.disable_devices", KeyKind::Bool, "true", "Minimal /dev instead of host devices"),
    key!("security.memory_swap", KeyKind::String, "", "Memory plus swap limit"),
    key!("container.cpus", KeyKind::String, "2", "CPU limit"),
    key!("container.memory", KeyKind::String, "4g", "Memory limit"),
    key!("log.enabled", KeyKind::Bool, "false", "Enable addt logging beyond warnings"),
    key!("log.output", KeyKind::Choice(LOG_OUTPUTS), "stderr", "Log destination"),
    key!("log.level", KeyKind::Choice(LOG_LEVELS), "info", "Log level"),
    key!("log.dir", KeyKind::String, "", "Log directory (default <addt_home>/logs)"),
    key!("log.file", KeyKind::String, "addt.log", "Log file name"),
    key!("log.rotate", KeyKind::Bool, "true", "Rotate the log file at start-up"),
    key!("log.max_size", KeyKind::String, "10M", "Rotate once the log exceeds this size"),
    key!("log.max_files", KeyKind::Int, "5", "Rotated files kept"),
    key!("log.modules", KeyKind::List, "", "Per-module filters (module or module=level)"),
    key!("otel.enabled", KeyKind::Bool, "false", "Export OpenTelemetry settings to the agent"),
    key!("otel.endpoint", KeyKind::String, "http://localhost:4318", "OTLP endpoint"),
    key!("otel.protocol", KeyKind::Choice(OTEL_PROTOCOLS), "http/protobuf", "OTLP protocol"),
    key!("otel.service_name", KeyKind::String, "addt", "Service name"),
    key!("otel.headers", KeyKind::String, "", "OTLP headers (k=v,k=v)"),
    key!("history_persist", KeyKind::Bool, "false", "Keep shell history per project"),
    key!("tmux_forward", KeyKind::Bool, "true", "Forward the host tmux socket"),
    key!("env_file", KeyKind::String, "", "Env file forwarded into the sandbox (default <workdir>/.env)"),
    key!("env_vars", KeyKind::List, "", "Extra host variables forwarded"),
    key!("dind.mode", KeyKind::Choice(DIND_MODES), "off", "Nested container runtime"),
];

/// Look up a global key.
pub fn lookup(key: &str) -> Option<&'static KeyDef> {
    KEYS.iter().find(|k| k.key == key)
}

/// A per-extension setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionField {
    Version,
    Automount,
    Readonly,
    /// A flag declared in the extension manifest.
    Flag(String),
}

impl ExtensionField {
    pub fn parse(field: &str) -> Self {
        match field {
            "version" => Self::Version,
            "automount" => Self::Automount,
            "readonly" => Self::Readonly,
            other => Self::Flag(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Version => "version",
            Self::Automount => "automount",
            Self::Readonly => "readonly",
            Self::Flag(f) => f,
        }
    }

    pub fn kind(&self) -> KeyKind {
        match self {
            Self::Version => KeyKind::String,
            Self::Automount | Self::Readonly => KeyKind::Bool,
            Self::Flag(_) => KeyKind::String,
        }
    }
}

/// A validated config key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigKey {
    Global(&'static str),
    Extension { name: String, field: ExtensionField },
}

impl ConfigKey {
    /// Dotted form.
    pub fn path(&self) -> String {
        match self {
            Self::Global(key) => key.to_string(),
            Self::Extension { name, field } => format!("extensions.{}.{}", name, field.name()),
        }
    }

    pub fn kind(&self) -> KeyKind {
        match self {
            Self::Global(key) => lookup(key).map(|d| d.kind).unwrap_or(KeyKind::String),
            Self::Extension { field, .. } => field.kind(),
        }
    }

    /// Environment variable overriding this key.
    pub fn env_var(&self) -> String {
        match self {
            Self::Global(key) => env_var_for(key),
            Self::Extension { name, field } => extension_env_var(name, field.name()),
        }
    }

    /// Default rendered as text; empty when the key has no default.
    pub fn default_value(&self, registry: &ExtensionRegistry) -> String {
        match self {
            Self::Global(key) => lookup(key).map(|d| d.default.to_string()).unwrap_or_default(),
            Self::Extension { name, field } => {
                let Some(ext) = registry.get(name) else {
                    return String::new();
                };
                match field {
                    ExtensionField::Version => ext.default_version.clone(),
                    ExtensionField::Automount => ext.auto_mount.to_string(),
                    ExtensionField::Readonly => ext.readonly.to_string(),
                    ExtensionField::Flag(_) => String::new(),
                }
            }
        }
    }
}

/// Resolve a dotted key against the table and the registry.
pub fn resolve(key: &str, registry: &ExtensionRegistry) -> Result<ConfigKey, ConfigError> {
    if let Some(def) = lookup(key) {
        return Ok(ConfigKey::Global(def.key));
    }

    if let Some(rest) = key.strip_prefix("extensions.") {
        if let Some((name, field)) = rest.split_once('.') {
            return resolve_extension(name, field, registry);
        }
    }

    Err(unknown_key(key))
}

/// Resolve `<field>` of extension `<name>`.
pub fn resolve_extension(
    name: &str,
    field: &str,
    registry: &ExtensionRegistry,
) -> Result<ConfigKey, ConfigError> {
    let ext = registry.get(name).ok_or_else(|| {
        ConfigError::Validation(format!("Unknown extension '{}'", name))
    })?;

    let field = ExtensionField::parse(field);
    if let ExtensionField::Flag(flag) = &field {
        if !ext.flags.iter().any(|f| &f.flag == flag) {
            let mut valid = vec!["version", "automount", "readonly"];
            valid.extend(ext.flags.iter().map(|f| f.flag.as_str()));
            return Err(ConfigError::UnknownKey {
                key: format!("extensions.{}.{}", name, flag),
                valid: valid.join(", "),
            });
        }
    }

    Ok(ConfigKey::Extension {
        name: name.to_string(),
        field,
    })
}

fn unknown_key(key: &str) -> ConfigError {
    let mut valid: Vec<&str> = KEYS.iter().map(|k| k.key).collect();
    valid.push("extensions.<name>.{version,automount,readonly,<flag>}");
    ConfigError::UnknownKey {
        key: key.to_string(),
        valid: valid.join(", "),
    }
}

/// `ADDT_` + key upper-cased with `.` replaced by `_`.
pub fn env_var_for(key: &str) -> String {
    format!("ADDT_{}", key.to_ascii_uppercase().replace('.', "_"))
}

/// `ADDT_<NAME>_<FIELD>` for per-extension settings.
pub fn extension_env_var(name: &str, field: &str) -> String {
    format!("ADDT_{}_{}", env_stem(name), env_stem(field))
}

/// Env var a flag is exported as inside the sandbox.
pub fn extension_flag_export(name: &str, flag: &str) -> String {
    format!("ADDT_EXTENSION_{}_{}", env_stem(name), env_stem(flag))
}

/// `true`/`false`, case-insensitive.
pub fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::invalid(key, raw, KeyKind::Bool.expected())),
    }
}

/// Signed decimal integer.
pub fn parse_int(key: &str, raw: &str) -> Result<i64, ConfigError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ConfigError::invalid(key, raw, KeyKind::Int.expected()))
}

/// Comma-separated list, trimmed, empty items dropped.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Render a YAML value as command-line text.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Sequence(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(","),
        Value::Mapping(_) | Value::Tagged(_) => serde_yaml::to_string(value)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Validate command-line text against a kind and convert it to the YAML
/// value stored in config files.
pub fn to_yaml_value(key: &str, kind: KeyKind, raw: &str) -> Result<Value, ConfigError> {
    match kind {
        KeyKind::Bool => Ok(Value::Bool(parse_bool(key, raw)?)),
        KeyKind::Int => Ok(Value::Number(parse_int(key, raw)?.into())),
        KeyKind::String => Ok(Value::String(raw.to_string())),
        KeyKind::List => Ok(Value::Sequence(
            parse_list(raw).into_iter().map(Value::String).collect(),
        )),
        KeyKind::Choice(choices) => {
            if choices.contains(&raw) {
                Ok(Value::String(raw.to_string()))
            } else {
                Err(ConfigError::invalid(key, raw, kind.expected()))
            }
        }
    }
}

/// Check a value read from a file against a kind.
pub fn check_yaml_value(key: &str, kind: KeyKind, value: &Value) -> Result<(), ConfigError> {
    let rendered = render_value(value);
    match (kind, value) {
        (KeyKind::Bool, Value::Bool(_)) => Ok(()),
        (KeyKind::Int, Value::Number(n)) if n.is_i64() => Ok(()),
        (KeyKind::List, Value::Sequence(_)) => Ok(()),
        (KeyKind::String, Value::Mapping(_) | Value::Sequence(_)) => {
            Err(ConfigError::invalid(key, &rendered, kind.expected()))
        }
        _ => to_yaml_value(key, kind, &rendered).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_unique_and_defaults_valid() {
        let mut seen = std::collections::HashSet::new();
        for def in KEYS {
            assert!(seen.insert(def.key), "duplicate key {}", def.key);
            if !def.default.is_empty() {
                to_yaml_value(def.key, def.kind, def.default)
                    .unwrap_or_else(|e| panic!("bad default for {}: {}", def.key, e));
            }
        }
    }

    #[test]
    fn test_env_var_names() {
        assert_eq!(env_var_for("security.pids_limit"), "ADDT_SECURITY_PIDS_LIMIT");
        assert_eq!(env_var_for("persistent"), "ADDT_PERSISTENT");
        assert_eq!(extension_env_var("claude-flow", "version"), "ADDT_CLAUDE_FLOW_VERSION");
        assert_eq!(extension_flag_export("claude", "yolo"), "ADDT_EXTENSION_CLAUDE_YOLO");
    }

    #[test]
    fn test_parse_values() {
        assert!(parse_bool("k", "TRUE").unwrap());
        assert!(!parse_bool("k", "False").unwrap());
        assert!(parse_bool("k", "yes").is_err());
        assert_eq!(parse_int("k", "-5").unwrap(), -5);
        assert!(parse_int("k", "5x").is_err());
        assert_eq!(parse_list(" a, b ,,c "), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_resolve_keys() {
        let registry = ExtensionRegistry::embedded();
        assert_eq!(
            resolve("security.pids_limit", &registry).unwrap(),
            ConfigKey::Global("security.pids_limit")
        );

        let key = resolve("extensions.claude.version", &registry).unwrap();
        assert_eq!(key.env_var(), "ADDT_CLAUDE_VERSION");
        assert_eq!(key.path(), "extensions.claude.version");

        let flag = resolve("extensions.claude.yolo", &registry).unwrap();
        assert_eq!(
            flag,
            ConfigKey::Extension {
                name: "claude".to_string(),
                field: ExtensionField::Flag("yolo".to_string())
            }
        );

        assert!(matches!(
            resolve("nope.key", &registry),
            Err(ConfigError::UnknownKey { .. })
        ));
        assert!(resolve("extensions.claude.bogus", &registry).is_err());
        assert!(resolve("extensions.nope.version", &registry).is_err());
    }

    #[test]
    fn test_to_yaml_value_validates() {
        assert_eq!(
            to_yaml_value("provider", KeyKind::Choice(PROVIDERS), "bwrap").unwrap(),
            Value::String("bwrap".into())
        );
        assert!(to_yaml_value("provider", KeyKind::Choice(PROVIDERS), "lxc").is_err());
        assert!(to_yaml_value("persistent", KeyKind::Bool, "maybe").is_err());
        assert_eq!(
            render_value(&to_yaml_value("l", KeyKind::List, "a,b").unwrap()),
            "a,b"
        );
    }

    #[test]
    fn test_check_yaml_value() {
        assert!(check_yaml_value("p", KeyKind::Bool, &Value::Bool(true)).is_ok());
        assert!(check_yaml_value("p", KeyKind::Bool, &Value::String("TRUE".into())).is_ok());
        assert!(check_yaml_value("p", KeyKind::Int, &Value::String("x".into())).is_err());
        assert!(check_yaml_value("p", KeyKind::String, &Value::Number(5.into())).is_ok());
    }
}
