//! Extension manifest (`config.yaml`) format.

use crate::error::ExtensionError;
use serde::{Deserialize, Serialize};

/// A bind mount contributed by an extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionMount {
    /// Host path, may start with `~`.
    pub source: String,

    /// Path inside the sandbox.
    pub target: String,
}

/// A documented flag that maps onto an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionFlag {
    /// Flag name (`yolo`).
    pub flag: String,

    /// Help text.
    #[serde(default)]
    pub description: String,
}

/// A forwarded environment variable, optionally with a default value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvVarSpec {
    pub name: String,
    pub default: Option<String>,
}

impl EnvVarSpec {
    /// Parse `NAME` or `NAME=DEFAULT`.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('=') {
            Some((name, default)) => Self {
                name: name.trim().to_string(),
                default: Some(default.to_string()),
            },
            None => Self {
                name: raw.trim().to_string(),
                default: None,
            },
        }
    }
}

/// One extension, as described by its manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    /// Unique lowercase name.
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Command executed inside the sandbox.
    #[serde(default)]
    pub entrypoint: String,

    #[serde(default = "default_version")]
    pub default_version: String,

    /// Whether manifest mounts apply without explicit opt-in.
    #[serde(default, alias = "automount")]
    pub auto_mount: bool,

    /// Default read-only state of the manifest mounts.
    #[serde(default)]
    pub readonly: bool,

    /// Extensions that must be installed first.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Raw env var entries (`NAME` or `NAME=DEFAULT`).
    #[serde(default)]
    pub env_vars: Vec<String>,

    #[serde(default)]
    pub mounts: Vec<ExtensionMount>,

    #[serde(default)]
    pub flags: Vec<ExtensionFlag>,

    /// True when loaded from the addt home rather than the binary.
    #[serde(skip)]
    pub local: bool,
}

fn default_version() -> String {
    "latest".to_string()
}

impl Extension {
    /// Parse and validate a manifest.
    pub fn from_yaml(content: &str) -> Result<Self, ExtensionError> {
        let ext: Extension =
            serde_yaml::from_str(content).map_err(|e| ExtensionError::Manifest {
                name: "<unknown>".to_string(),
                message: e.to_string(),
            })?;
        ext.validate()?;
        Ok(ext)
    }

    /// Check name and dependency syntax.
    pub fn validate(&self) -> Result<(), ExtensionError> {
        if !is_valid_name(&self.name) {
            return Err(ExtensionError::Manifest {
                name: self.name.clone(),
                message: "name must be lowercase [a-z0-9-] and start with a letter".to_string(),
            });
        }
        if self.dependencies.iter().any(|d| d == &self.name) {
            return Err(ExtensionError::Cycle(self.name.clone()));
        }
        Ok(())
    }

    /// Forwarded env vars with defaults split out.
    pub fn env_var_specs(&self) -> Vec<EnvVarSpec> {
        self.env_vars
            .iter()
            .filter(|v| !v.trim().is_empty())
            .map(|v| EnvVarSpec::parse(v))
            .collect()
    }

    /// Forwarded env var names only.
    pub fn env_var_names(&self) -> Vec<String> {
        self.env_var_specs().into_iter().map(|s| s.name).collect()
    }

    /// Command used when none is configured: the entrypoint, or the name.
    pub fn command(&self) -> &str {
        if self.entrypoint.is_empty() {
            &self.name
        } else {
            &self.entrypoint
        }
    }
}

/// Extension names are lowercase `[a-z0-9-]`, starting with a letter.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Manifest written by `extensions new`.
pub fn scaffold_manifest(name: &str) -> String {
    format!(
        "name: {name}\n\
         description: {name} extension\n\
         entrypoint: {name}\n\
         default_version: latest\n\
         auto_mount: false\n\
         readonly: false\n\
         dependencies: []\n\
         env_vars: []\n\
         mounts: []\n\
         flags: []\n"
    )
}

/// Install script written by `extensions new`.
pub fn scaffold_install(name: &str) -> String {
    let stem = crate::env::env_stem(name);
    format!(
        "#!/usr/bin/env bash\n\
         set -euo pipefail\n\
         version=\"${{{stem}_VERSION:-latest}}\"\n\
         echo \"installing {name} $version\"\n"
    )
}

/// Argument transform written by `extensions new`.
pub fn scaffold_args() -> String {
    "# Sourced by the entrypoint; rewrite ADDT_ARGS here.\n:\n".to_string()
}
