//! Extension registry: embedded manifests plus local overrides.

use super::manifest::Extension;
use crate::assets;
use crate::error::ExtensionError;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// All known extensions, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ExtensionRegistry {
    extensions: BTreeMap<String, Extension>,
    local_dir: Option<PathBuf>,
}

impl ExtensionRegistry {
    /// Registry holding only the extensions embedded in the binary.
    pub fn embedded() -> Self {
        let mut registry = Self::default();
        for name in assets::embedded_extension_names() {
            let path = format!("{}/{}/config.yaml", assets::EXTENSIONS_DIR, name);
            let Some(raw) = assets::file(&path) else {
                continue;
            };
            match std::str::from_utf8(raw)
                .map_err(|e| e.to_string())
                .and_then(|s| Extension::from_yaml(s).map_err(|e| e.to_string()))
            {
                Ok(ext) => registry.insert(ext),
                Err(e) => debug!("Skipping embedded extension {}: {}", name, e),
            }
        }
        registry
    }

    /// Embedded extensions overlaid with `<dir>/<name>/config.yaml`.
    ///
    /// Malformed local manifests are skipped, never fatal.
    pub fn load(local_dir: &Path) -> Self {
        let mut registry = Self::embedded();
        registry.local_dir = Some(local_dir.to_path_buf());

        let entries = match fs::read_dir(local_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("No local extensions at {}: {}", local_dir.display(), e);
                return registry;
            }
        };

        for entry in entries.flatten() {
            let manifest = entry.path().join("config.yaml");
            if !manifest.is_file() {
                continue;
            }
            let content = match fs::read_to_string(&manifest) {
                Ok(c) => c,
                Err(e) => {
                    debug!("Skipping {}: {}", manifest.display(), e);
                    continue;
                }
            };
            match Extension::from_yaml(&content) {
                Ok(mut ext) => {
                    ext.local = true;
                    debug!("Loaded local extension {}", ext.name);
                    registry.insert(ext);
                }
                Err(e) => debug!("Skipping {}: {}", manifest.display(), e),
            }
        }

        registry
    }

    /// Add or replace an extension.
    pub fn insert(&mut self, ext: Extension) {
        self.extensions.insert(ext.name.clone(), ext);
    }

    /// Directory local extensions were loaded from.
    pub fn local_dir(&self) -> Option<&Path> {
        self.local_dir.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<&Extension> {
        self.extensions.get(name)
    }

    /// Look up an extension or fail with `NotFound`.
    pub fn require(&self, name: &str) -> Result<&Extension, ExtensionError> {
        self.get(name)
            .ok_or_else(|| ExtensionError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    /// Every extension, sorted by name.
    pub fn list(&self) -> Vec<&Extension> {
        self.extensions.values().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.extensions.keys().cloned().collect()
    }

    /// Fail fast on any unknown name.
    pub fn validate_names(&self, names: &[String]) -> Result<(), ExtensionError> {
        for name in names {
            self.require(name)?;
        }
        Ok(())
    }

    /// The requested extensions plus their dependencies, dependencies first.
    ///
    /// Order among independent extensions follows the request order.
    pub fn resolve_order(&self, requested: &[String]) -> Result<Vec<String>, ExtensionError> {
        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut visiting = Vec::new();

        for name in requested {
            self.visit(name, &mut visiting, &mut done, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        visiting: &mut Vec<String>,
        done: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<(), ExtensionError> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(pos) = visiting.iter().position(|n| n == name) {
            let mut cycle: Vec<&str> = visiting[pos..].iter().map(String::as_str).collect();
            cycle.push(name);
            return Err(ExtensionError::Cycle(cycle.join(" -> ")));
        }

        let ext = self.require(name)?;
        visiting.push(name.to_string());
        for dep in &ext.dependencies {
            self.visit(dep, visiting, done, order)?;
        }
        visiting.pop();

        done.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }

    /// Union of env var names the given extensions forward, first occurrence wins.
    pub fn env_var_names(&self, names: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        names
            .iter()
            .filter_map(|n| self.get(n))
            .flat_map(|ext| ext.env_var_specs())
            .filter(|spec| seen.insert(spec.name.clone()))
            .map(|spec| spec.name)
            .collect()
    }
}
