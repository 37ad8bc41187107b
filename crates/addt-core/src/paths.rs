//! Path resolution utilities.
//!
//! Everything addt persists lives under a single home directory
//! (`~/.addt`, overridable with `ADDT_HOME`):
//!
//! ```text
//! <addt_home>/
//!   config.yaml
//!   extensions/<name>/{config.yaml,install.sh,setup.sh}
//!   firewall/{allowed-domains.txt,denied-domains.txt,allowed-ports.txt}
//!   history/<sha256(workdir)[0:8]>/{bash_history,zsh_history}
//!   bwrap/home/
//!   bin/podman
//!   logs/
//! ```

use crate::env::vars;
use crate::error::ConfigError;
use crate::id;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Name of the project-level config file inside a workdir.
pub const PROJECT_CONFIG_FILE: &str = ".addt.yaml";

/// Name of the global config file inside the config directory.
pub const GLOBAL_CONFIG_FILE: &str = "config.yaml";

/// Resolved addt directories for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddtPaths {
    home: PathBuf,
    config_dir: PathBuf,
    user_home: PathBuf,
}

impl AddtPaths {
    /// Resolve paths from an environment snapshot.
    pub fn from_env(env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let user_home = env
            .get("HOME")
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .ok_or_else(|| {
                ConfigError::Validation("Could not determine home directory".to_string())
            })?;

        let home = env
            .get(vars::ADDT_HOME)
            .filter(|h| !h.is_empty())
            .map(|h| expand_tilde_with(h, &user_home))
            .unwrap_or_else(|| user_home.join(".addt"));

        let config_dir = env
            .get(vars::ADDT_CONFIG_DIR)
            .filter(|d| !d.is_empty())
            .map(|d| expand_tilde_with(d, &user_home))
            .unwrap_or_else(|| home.clone());

        Ok(Self {
            home,
            config_dir,
            user_home,
        })
    }

    /// Build paths rooted at an explicit directory (tests, tooling).
    pub fn with_root(home: impl Into<PathBuf>, user_home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            config_dir: home.clone(),
            home,
            user_home: user_home.into(),
        }
    }

    /// The addt home directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// The invoking user's home directory.
    pub fn user_home(&self) -> &Path {
        &self.user_home
    }

    /// Global config file (`<config_dir>/config.yaml`).
    pub fn global_config_file(&self) -> PathBuf {
        self.config_dir.join(GLOBAL_CONFIG_FILE)
    }

    /// Project config file (`<workdir>/.addt.yaml`).
    pub fn project_config_file(&self, workdir: &Path) -> PathBuf {
        workdir.join(PROJECT_CONFIG_FILE)
    }

    /// Local extensions directory.
    pub fn extensions_dir(&self) -> PathBuf {
        self.home.join("extensions")
    }

    /// Firewall rule files directory.
    pub fn firewall_dir(&self) -> PathBuf {
        self.home.join("firewall")
    }

    /// Shell history directory for a given workdir.
    pub fn history_dir(&self, workdir: &Path) -> PathBuf {
        self.home
            .join("history")
            .join(id::history_key(workdir))
    }

    /// Persistent home directory used by the bwrap provider.
    pub fn bwrap_home(&self) -> PathBuf {
        self.home.join("bwrap").join("home")
    }

    /// Stable per-session state of a persistent container.
    pub fn session_root(&self, name: &str) -> PathBuf {
        self.home.join("sessions").join(name)
    }

    /// Directory holding optional bundled runtime binaries.
    pub fn bin_dir(&self) -> PathBuf {
        self.home.join("bin")
    }

    /// Default log directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    /// Expand `~` relative to the invoking user's home.
    pub fn expand(&self, path: &str) -> PathBuf {
        expand_tilde_with(path, &self.user_home)
    }

    /// Ensure the persistent directories exist.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [
            self.home.clone(),
            self.extensions_dir(),
            self.firewall_dir(),
            self.home.join("history"),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Expand a leading `~` against the given home directory.
pub fn expand_tilde_with(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(path)
}

/// Expand a leading `~` against the current user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    match dirs::home_dir() {
        Some(home) => expand_tilde_with(path, &home),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_home() {
        let paths = AddtPaths::from_env(&env(&[("HOME", "/home/dev")])).unwrap();
        assert_eq!(paths.home(), Path::new("/home/dev/.addt"));
        assert_eq!(
            paths.global_config_file(),
            PathBuf::from("/home/dev/.addt/config.yaml")
        );
        assert_eq!(paths.bwrap_home(), PathBuf::from("/home/dev/.addt/bwrap/home"));
    }

    #[test]
    fn test_home_and_config_dir_overrides() {
        let paths = AddtPaths::from_env(&env(&[
            ("HOME", "/home/dev"),
            ("ADDT_HOME", "~/state"),
            ("ADDT_CONFIG_DIR", "/etc/addt"),
        ]))
        .unwrap();
        assert_eq!(paths.home(), Path::new("/home/dev/state"));
        assert_eq!(paths.global_config_file(), PathBuf::from("/etc/addt/config.yaml"));
        assert_eq!(paths.extensions_dir(), PathBuf::from("/home/dev/state/extensions"));
    }

    #[test]
    fn test_history_dir_is_keyed_by_workdir() {
        let paths = AddtPaths::with_root("/tmp/addt", "/home/dev");
        let a = paths.history_dir(Path::new("/work/a"));
        let b = paths.history_dir(Path::new("/work/b"));
        assert_ne!(a, b);
        assert_eq!(a.file_name().unwrap().len(), 8);
    }

    #[test]
    fn test_expand_tilde() {
        let home = Path::new("/home/dev");
        assert_eq!(expand_tilde_with("~/.ssh", home), PathBuf::from("/home/dev/.ssh"));
        assert_eq!(expand_tilde_with("~", home), PathBuf::from("/home/dev"));
        assert_eq!(expand_tilde_with("/abs", home), PathBuf::from("/abs"));
        assert!(!expand_tilde("~/test").to_string_lossy().starts_with('~'));
    }
}
