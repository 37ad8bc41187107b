//! Environment variable handling.
//!
//! The process environment is read exactly once, into an [`EnvSnapshot`], when
//! composition starts. Everything downstream works from that snapshot.

use std::collections::HashMap;
use std::path::Path;

/// A frozen copy of the process environment.
pub type EnvSnapshot = HashMap<String, String>;

/// Capture the current process environment.
pub fn snapshot() -> EnvSnapshot {
    std::env::vars().collect()
}

/// Get a variable from a snapshot, returning None if not set or empty.
pub fn get_var<'a>(env: &'a EnvSnapshot, name: &str) -> Option<&'a str> {
    env.get(name).map(String::as_str).filter(|v| !v.is_empty())
}

/// Convert an extension name to its environment-variable stem (`my-ext` → `MY_EXT`).
pub fn env_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Parse `KEY=value` lines from an env file.
///
/// Blank lines and `#` comments are skipped, an optional `export ` prefix is
/// accepted, and matching single or double quotes around the value are removed.
pub fn parse_env_file(content: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            out.push((key.to_string(), value.to_string()));
        }
    }
    out
}

/// Load an env file; a missing file yields no entries.
pub fn load_env_file(path: &Path) -> Result<Vec<(String, String)>, std::io::Error> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(parse_env_file(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Host variables that describe the terminal and locale.
pub const TERMINAL_VARS: &[&str] = &[
    "TERM",
    "COLORTERM",
    "LANG",
    "LANGUAGE",
    "LC_ALL",
    "LC_CTYPE",
    "LC_MESSAGES",
    "TZ",
];

/// Common environment variable names.
pub mod vars {
    /// Comma-separated list of active extensions.
    pub const ADDT_EXTENSIONS: &str = "ADDT_EXTENSIONS";

    /// Command executed inside the sandbox.
    pub const ADDT_COMMAND: &str = "ADDT_COMMAND";

    /// addt home directory override.
    pub const ADDT_HOME: &str = "ADDT_HOME";

    /// Global config directory override.
    pub const ADDT_CONFIG_DIR: &str = "ADDT_CONFIG_DIR";

    /// Env file forwarded into the sandbox.
    pub const ADDT_ENV_FILE: &str = "ADDT_ENV_FILE";

    /// Provider selection.
    pub const ADDT_PROVIDER: &str = "ADDT_PROVIDER";

    /// Host GnuPG home override.
    pub const GNUPGHOME: &str = "GNUPGHOME";

    /// Host container runtime endpoint.
    pub const DOCKER_HOST: &str = "DOCKER_HOST";

    /// Host SSH agent socket.
    pub const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";

    /// Host tmux session.
    pub const TMUX: &str = "TMUX";

    /// Host tmux pane.
    pub const TMUX_PANE: &str = "TMUX_PANE";

    /// GitHub token.
    pub const GH_TOKEN: &str = "GH_TOKEN";

    /// Alternative GitHub token name.
    pub const GITHUB_TOKEN: &str = "GITHUB_TOKEN";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_var_ignores_empty() {
        let mut env = EnvSnapshot::new();
        env.insert("SET".into(), "value".into());
        env.insert("EMPTY".into(), String::new());

        assert_eq!(get_var(&env, "SET"), Some("value"));
        assert_eq!(get_var(&env, "EMPTY"), None);
        assert_eq!(get_var(&env, "MISSING"), None);
    }

    #[test]
    fn test_env_stem() {
        assert_eq!(env_stem("claude"), "CLAUDE");
        assert_eq!(env_stem("my-ext.v2"), "MY_EXT_V2");
    }

    #[test]
    fn test_parse_env_file() {
        let parsed = parse_env_file(
            "# comment\n\nFOO=bar\nexport QUOTED=\"a b\"\nSINGLE='x'\n=novalue\nEMPTY=\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("QUOTED".to_string(), "a b".to_string()),
                ("SINGLE".to_string(), "x".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_load_missing_env_file() {
        let entries = load_env_file(Path::new("/nonexistent/.env")).unwrap();
        assert!(entries.is_empty());
    }
}
