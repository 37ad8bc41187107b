//! Config file CRUD over raw YAML trees.
//!
//! Files are kept as `serde_yaml::Value` so keys addt does not know about
//! survive `set` and `unset`.

use super::keys::{self, ConfigKey};
use crate::error::ConfigError;
use crate::extensions::ExtensionRegistry;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One YAML config file (global or project).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
    root: Value,
}

impl ConfigFile {
    /// Load a config file. A missing or blank file is an empty config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Self::parse(path, &content)
    }

    /// Parse file content.
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let root = if content.trim().is_empty() {
            Value::Mapping(Mapping::new())
        } else {
            let value: Value =
                serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
            match value {
                Value::Null => Value::Mapping(Mapping::new()),
                Value::Mapping(_) => value,
                _ => {
                    return Err(ConfigError::Parse {
                        path: path.to_path_buf(),
                        message: "top level must be a mapping".to_string(),
                    })
                }
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            root,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value at a dotted key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut node = &self.root;
        for part in key.split('.') {
            node = node.as_mapping()?.get(part)?;
        }
        match node {
            Value::Null => None,
            other => Some(other),
        }
    }

    /// Validate `raw` for `key` and store it.
    pub fn set(
        &mut self,
        key: &str,
        raw: &str,
        registry: &ExtensionRegistry,
    ) -> Result<ConfigKey, ConfigError> {
        let resolved = keys::resolve(key, registry)?;
        let value = keys::to_yaml_value(&resolved.path(), resolved.kind(), raw)?;
        self.set_value(&resolved.path(), value);
        Ok(resolved)
    }

    /// Store a value without validation, creating intermediate mappings.
    pub fn set_value(&mut self, key: &str, value: Value) {
        let parts: Vec<&str> = key.split('.').collect();
        insert_path(&mut self.root, &parts, value);
    }

    /// Remove a key, pruning parents left empty. Returns whether it existed.
    pub fn unset(&mut self, key: &str) -> bool {
        let parts: Vec<&str> = key.split('.').collect();
        remove_path(&mut self.root, &parts)
    }

    /// Every leaf as `dotted.key → value`.
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        flatten_into(&self.root, "", &mut out);
        out
    }

    /// Write atomically through a temp file.
    pub fn save(&self) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(&self.root).map_err(|e| ConfigError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("yaml.tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }
}

fn insert_path(node: &mut Value, parts: &[&str], value: Value) {
    if !node.is_mapping() {
        *node = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(map) = node else {
        return;
    };
    let Some((first, rest)) = parts.split_first() else {
        return;
    };
    let key = Value::String(first.to_string());

    if rest.is_empty() {
        map.insert(key, value);
        return;
    }

    let child = map
        .entry(key)
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    insert_path(child, rest, value);
}

fn remove_path(node: &mut Value, parts: &[&str]) -> bool {
    let Value::Mapping(map) = node else {
        return false;
    };
    let Some((first, rest)) = parts.split_first() else {
        return false;
    };
    let key = Value::String(first.to_string());

    if rest.is_empty() {
        return map.remove(&key).is_some();
    }

    let Some(child) = map.get_mut(&key) else {
        return false;
    };
    let removed = remove_path(child, rest);
    if removed && child.as_mapping().is_some_and(Mapping::is_empty) {
        map.remove(&key);
    }
    removed
}

fn flatten_into(node: &Value, prefix: &str, out: &mut BTreeMap<String, Value>) {
    match node {
        Value::Mapping(map) => {
            for (k, v) in map {
                let Some(k) = k.as_str() else { continue };
                let path = if prefix.is_empty() {
                    k.to_string()
                } else {
                    format!("{}.{}", prefix, k)
                };
                flatten_into(v, &path, out);
            }
        }
        Value::Null => {}
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_unset_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let registry = ExtensionRegistry::embedded();

        let mut file = ConfigFile::load(&path).unwrap();
        file.set("security.pids_limit", "300", &registry).unwrap();
        file.set("extensions.claude.version", "1.0.5", &registry).unwrap();
        file.save().unwrap();

        let mut file = ConfigFile::load(&path).unwrap();
        assert_eq!(
            keys::render_value(file.get("security.pids_limit").unwrap()),
            "300"
        );
        assert_eq!(
            keys::render_value(file.get("extensions.claude.version").unwrap()),
            "1.0.5"
        );

        assert!(file.unset("extensions.claude.version"));
        assert!(file.get("extensions").is_none());
        assert!(!file.unset("extensions.claude.version"));
    }

    #[test]
    fn test_unknown_keys_survive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "custom:\n  thing: 1\npersistent: true\n").unwrap();
        let registry = ExtensionRegistry::embedded();

        let mut file = ConfigFile::load(&path).unwrap();
        file.set("persistent", "false", &registry).unwrap();
        file.save().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("custom"));
        assert!(content.contains("thing: 1"));
        assert!(content.contains("persistent: false"));
    }

    #[test]
    fn test_set_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        let registry = ExtensionRegistry::embedded();
        let mut file = ConfigFile::load(&dir.path().join("c.yaml")).unwrap();

        assert!(matches!(
            file.set("nope", "1", &registry),
            Err(ConfigError::UnknownKey { .. })
        ));
        assert!(matches!(
            file.set("persistent", "sure", &registry),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(file.flatten().is_empty());
    }

    #[test]
    fn test_malformed_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "persistent: [unclosed\n").unwrap();
        assert!(matches!(
            ConfigFile::load(&path),
            Err(ConfigError::Parse { .. })
        ));

        fs::write(&path, "   \n").unwrap();
        assert!(ConfigFile::load(&path).unwrap().flatten().is_empty());
    }

    #[test]
    fn test_flatten_nested() {
        let file = ConfigFile::parse(
            Path::new("x.yaml"),
            "ssh:\n  forward_mode: agent\n  allowed_keys: [a, b]\nextensions:\n  codex:\n    automount: false\n",
        )
        .unwrap();
        let flat = file.flatten();
        assert_eq!(keys::render_value(&flat["ssh.forward_mode"]), "agent");
        assert_eq!(keys::render_value(&flat["ssh.allowed_keys"]), "a,b");
        assert_eq!(flat["extensions.codex.automount"], Value::Bool(false));
    }
}
