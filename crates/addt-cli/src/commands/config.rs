//! Config command implementation.

use crate::context::Context;
use addt_core::config::keys::{self, ConfigKey};
use addt_core::config::{ConfigFile, KEYS};
use addt_core::{EffectiveConfig, ExtensionRegistry};
use clap::Args;
use console::style;

/// Config command arguments.
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(clap::Subcommand)]
pub enum ConfigCommand {
    /// Edit ~/.addt/config.yaml
    Global {
        #[command(subcommand)]
        command: ScopedCommand,
    },

    /// Edit the settings of one extension
    Extension {
        /// Extension name
        name: String,

        /// Write to the global file instead of the project
        #[arg(long)]
        global: bool,

        #[command(subcommand)]
        command: ScopedCommand,
    },

    /// Edit .addt.yaml in the current directory
    #[command(flatten)]
    Project(ScopedCommand),
}

#[derive(clap::Subcommand)]
pub enum ScopedCommand {
    /// Show every key
    List,

    /// Show one key
    Get {
        /// Dotted key
        key: String,
    },

    /// Set a key
    Set {
        /// Dotted key
        key: String,
        /// New value
        value: String,
    },

    /// Remove a key from the file
    Unset {
        /// Dotted key
        key: String,
    },
}

/// Which file a scoped command reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileScope {
    Global,
    Project,
}

/// Run the config command.
pub async fn run(args: ConfigArgs) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let lines = match args.command {
        ConfigCommand::Global { command } => {
            let mut file = ctx.loader.global_file().clone();
            scoped(&mut file, FileScope::Global, &ctx, command)?
        }
        ConfigCommand::Project(command) => {
            let mut file = ctx.loader.project_file().clone();
            scoped(&mut file, FileScope::Project, &ctx, command)?
        }
        ConfigCommand::Extension {
            name,
            global,
            command,
        } => {
            let mut file = if global {
                ctx.loader.global_file().clone()
            } else {
                ctx.loader.project_file().clone()
            };
            extension_scoped(&mut file, &ctx.registry, &name, command)?
        }
    };
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

fn scoped(
    file: &mut ConfigFile,
    scope: FileScope,
    ctx: &Context,
    command: ScopedCommand,
) -> anyhow::Result<Vec<String>> {
    match command {
        ScopedCommand::List => {
            let mut out = vec![style(file.path().display()).dim().to_string()];
            if scope == FileScope::Project {
                out.extend(effective_rows(&ctx.base_config()?));
            } else {
                out.extend(file_rows(file, &ctx.registry));
            }
            Ok(out)
        }
        ScopedCommand::Get { key } => {
            let resolved = keys::resolve(&key, &ctx.registry)?;
            let value = match (&resolved, scope) {
                (ConfigKey::Global(k), FileScope::Project) => {
                    ctx.base_config()?.get(k).unwrap_or_default()
                }
                _ => file_value(file, &resolved, &ctx.registry),
            };
            Ok(vec![value])
        }
        ScopedCommand::Set { key, value } => set(file, &ctx.registry, &key, &value),
        ScopedCommand::Unset { key } => unset(file, &ctx.registry, &key),
    }
}

fn extension_scoped(
    file: &mut ConfigFile,
    registry: &ExtensionRegistry,
    name: &str,
    command: ScopedCommand,
) -> anyhow::Result<Vec<String>> {
    let ext = registry.require(name)?;
    let qualify = |field: &str| format!("extensions.{}.{}", name, field);

    match command {
        ScopedCommand::List => {
            let mut fields = vec!["version", "automount", "readonly"];
            fields.extend(ext.flags.iter().map(|f| f.flag.as_str()));
            let mut out = vec![style(file.path().display()).dim().to_string()];
            for field in fields {
                let key = keys::resolve_extension(name, field, registry)?;
                out.push(format!(
                    "{:<28} {:<20} {}",
                    field,
                    file_value(file, &key, registry),
                    style(key.env_var()).dim()
                ));
            }
            Ok(out)
        }
        ScopedCommand::Get { key } => {
            let resolved = keys::resolve(&qualify(&key), registry)?;
            Ok(vec![file_value(file, &resolved, registry)])
        }
        ScopedCommand::Set { key, value } => set(file, registry, &qualify(&key), &value),
        ScopedCommand::Unset { key } => unset(file, registry, &qualify(&key)),
    }
}

/// Validate and store a value, then save.
fn set(
    file: &mut ConfigFile,
    registry: &ExtensionRegistry,
    key: &str,
    value: &str,
) -> anyhow::Result<Vec<String>> {
    let resolved = file.set(key, value, registry)?;
    file.save()?;
    Ok(vec![format!("Set {} = {}", resolved.path(), value)])
}

fn unset(file: &mut ConfigFile, registry: &ExtensionRegistry, key: &str) -> anyhow::Result<Vec<String>> {
    let resolved = keys::resolve(key, registry)?;
    if !file.unset(&resolved.path()) {
        return Ok(vec![format!(
            "{} is not set in {}",
            resolved.path(),
            file.path().display()
        )]);
    }
    file.save()?;
    Ok(vec![format!("Unset {}", resolved.path())])
}

/// Value stored in `file`, or the default.
fn file_value(file: &ConfigFile, key: &ConfigKey, registry: &ExtensionRegistry) -> String {
    file.get(&key.path())
        .map(keys::render_value)
        .unwrap_or_else(|| key.default_value(registry))
}

/// `key value source` for every global key.
fn effective_rows(config: &EffectiveConfig) -> Vec<String> {
    KEYS.iter()
        .map(|def| {
            let value = config.get(def.key).unwrap_or_default();
            format!("{:<28} {:<20} {}", def.key, value, style(config.source_of(def.key)).dim())
        })
        .collect()
}

/// `key value` for every global key, file value or default; file-only
/// extension keys follow.
fn file_rows(file: &ConfigFile, registry: &ExtensionRegistry) -> Vec<String> {
    let mut out: Vec<String> = KEYS
        .iter()
        .map(|def| {
            let (value, marker) = match file.get(def.key) {
                Some(v) => (keys::render_value(v), ""),
                None => (def.default.to_string(), " (default)"),
            };
            format!("{:<28} {}{}", def.key, value, style(marker).dim())
        })
        .collect();

    for (key, value) in file.flatten() {
        if key.starts_with("extensions.") && keys::resolve(&key, registry).is_ok() {
            out.push(format!("{:<28} {}", key, keys::render_value(&value)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_in(dir: &TempDir) -> ConfigFile {
        ConfigFile::load(&dir.path().join("config.yaml")).unwrap()
    }

    #[test]
    fn test_set_and_unset_global_key() {
        let dir = TempDir::new().unwrap();
        let registry = ExtensionRegistry::embedded();
        let mut file = file_in(&dir);

        let out = set(&mut file, &registry, "firewall.enabled", "true").unwrap();
        assert_eq!(out, vec!["Set firewall.enabled = true"]);

        let reloaded = file_in(&dir);
        let key = keys::resolve("firewall.enabled", &registry).unwrap();
        assert_eq!(file_value(&reloaded, &key, &registry), "true");

        let mut reloaded = reloaded;
        let out = unset(&mut reloaded, &registry, "firewall.enabled").unwrap();
        assert_eq!(out, vec!["Unset firewall.enabled"]);
        assert_eq!(file_value(&file_in(&dir), &key, &registry), "false");
    }

    #[test]
    fn test_set_rejects_bad_value() {
        let dir = TempDir::new().unwrap();
        let registry = ExtensionRegistry::embedded();
        let mut file = file_in(&dir);
        assert!(set(&mut file, &registry, "persistent", "maybe").is_err());
        assert!(set(&mut file, &registry, "no.such.key", "1").is_err());
        assert!(!dir.path().join("config.yaml").exists());
    }

    #[test]
    fn test_extension_scope_qualifies_keys() {
        let dir = TempDir::new().unwrap();
        let registry = ExtensionRegistry::embedded();
        let mut file = file_in(&dir);

        extension_scoped(
            &mut file,
            &registry,
            "claude",
            ScopedCommand::Set {
                key: "version".into(),
                value: "1.0.0".into(),
            },
        )
        .unwrap();

        let reloaded = file_in(&dir);
        assert_eq!(
            reloaded.get("extensions.claude.version"),
            Some(&serde_yaml::Value::String("1.0.0".into()))
        );

        let mut reloaded = reloaded;
        let got = extension_scoped(
            &mut reloaded,
            &registry,
            "claude",
            ScopedCommand::Get {
                key: "version".into(),
            },
        )
        .unwrap();
        assert_eq!(got, vec!["1.0.0"]);

        let unknown = extension_scoped(
            &mut reloaded,
            &registry,
            "no-such-extension",
            ScopedCommand::List,
        );
        assert!(unknown.is_err());
    }

    #[test]
    fn test_effective_rows_show_source() {
        let config = EffectiveConfig::default();
        let rows = effective_rows(&config);
        assert_eq!(rows.len(), KEYS.len());
        let provider = rows.iter().find(|r| r.starts_with("provider ")).unwrap();
        assert!(provider.contains("docker"));
        assert!(provider.contains("default"));
    }
}
