//! Firewall allow and deny lists.
//!
//! Global lists live in `<addt_home>/firewall/*.txt`; project lists are the
//! `firewall.allowed` and `firewall.denied` keys of `.addt.yaml`.

use crate::context::Context;
use addt_core::config::ConfigFile;
use addt_sandbox::{FirewallLists, ListKind};
use clap::Args;
use console::style;
use serde_yaml::Value;

/// Firewall command arguments.
#[derive(Args)]
pub struct FirewallArgs {
    #[command(subcommand)]
    pub scope: Scope,
}

#[derive(clap::Subcommand)]
pub enum Scope {
    /// Lists shared by every project
    Global {
        #[command(subcommand)]
        command: ListCommand,
    },

    /// Lists of the current project
    Project {
        #[command(subcommand)]
        command: ListCommand,
    },
}

#[derive(clap::Subcommand)]
pub enum ListCommand {
    /// Show the allow and deny lists
    List,

    /// Allow a domain
    Allow {
        /// Domain, optionally `*.`-prefixed
        domain: String,
    },

    /// Deny a domain
    Deny {
        /// Domain, optionally `*.`-prefixed
        domain: String,
    },

    /// Remove a domain from both lists
    Remove {
        /// Domain to remove
        domain: String,
    },
}

/// Lower-case and validate a domain entry.
pub fn normalize_domain(raw: &str) -> anyhow::Result<String> {
    let domain = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    let valid = !domain.is_empty()
        && !domain.contains(|c: char| c.is_whitespace() || c == '/' || c == ':')
        && !domain.trim_start_matches("*.").contains('*');
    if !valid {
        anyhow::bail!("'{}' is not a domain", raw);
    }
    Ok(domain)
}

/// Storage for one scope's lists.
trait DomainLists {
    fn read(&self, kind: ListKind) -> anyhow::Result<Vec<String>>;
    fn add(&mut self, kind: ListKind, domain: &str) -> anyhow::Result<bool>;
    fn remove(&mut self, kind: ListKind, domain: &str) -> anyhow::Result<bool>;
}

impl DomainLists for FirewallLists {
    fn read(&self, kind: ListKind) -> anyhow::Result<Vec<String>> {
        Ok(FirewallLists::read(self, kind)?)
    }

    fn add(&mut self, kind: ListKind, domain: &str) -> anyhow::Result<bool> {
        Ok(FirewallLists::add(self, kind, domain)?)
    }

    fn remove(&mut self, kind: ListKind, domain: &str) -> anyhow::Result<bool> {
        Ok(FirewallLists::remove(self, kind, domain)?)
    }
}

/// Project lists stored as YAML sequences in the project config file.
pub struct ProjectLists {
    file: ConfigFile,
}

impl ProjectLists {
    pub fn new(file: ConfigFile) -> Self {
        Self { file }
    }

    fn write(&mut self, kind: ListKind, entries: Vec<String>) -> anyhow::Result<()> {
        if entries.is_empty() {
            self.file.unset(kind.config_key());
        } else {
            self.file.set_value(
                kind.config_key(),
                Value::Sequence(entries.into_iter().map(Value::String).collect()),
            );
        }
        self.file.save()?;
        Ok(())
    }
}

impl DomainLists for ProjectLists {
    fn read(&self, kind: ListKind) -> anyhow::Result<Vec<String>> {
        let entries = match self.file.get(kind.config_key()) {
            Some(Value::Sequence(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_ascii_lowercase)
                .collect(),
            Some(Value::String(s)) => addt_core::config::keys::parse_list(s),
            _ => Vec::new(),
        };
        Ok(entries)
    }

    fn add(&mut self, kind: ListKind, domain: &str) -> anyhow::Result<bool> {
        let mut entries = self.read(kind)?;
        if entries.iter().any(|e| e == domain) {
            return Ok(false);
        }
        entries.push(domain.to_string());
        self.write(kind, entries)?;
        Ok(true)
    }

    fn remove(&mut self, kind: ListKind, domain: &str) -> anyhow::Result<bool> {
        let mut entries = self.read(kind)?;
        let before = entries.len();
        entries.retain(|e| e != domain);
        if entries.len() == before {
            return Ok(false);
        }
        self.write(kind, entries)?;
        Ok(true)
    }
}

/// Apply one list command; returns the lines to print.
fn apply(lists: &mut dyn DomainLists, command: ListCommand) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    match command {
        ListCommand::List => {
            for (kind, title) in [(ListKind::Allowed, "Allowed"), (ListKind::Denied, "Denied")] {
                out.push(format!("{}:", title));
                let entries = lists.read(kind)?;
                if entries.is_empty() {
                    out.push("  (none)".to_string());
                }
                out.extend(entries.into_iter().map(|e| format!("  {}", e)));
            }
        }

        ListCommand::Allow { domain } => {
            let domain = normalize_domain(&domain)?;
            lists.remove(ListKind::Denied, &domain)?;
            if lists.add(ListKind::Allowed, &domain)? {
                out.push(format!("Allowed {}", domain));
            } else {
                out.push(format!("{} is already allowed", domain));
            }
        }

        ListCommand::Deny { domain } => {
            let domain = normalize_domain(&domain)?;
            lists.remove(ListKind::Allowed, &domain)?;
            if lists.add(ListKind::Denied, &domain)? {
                out.push(format!("Denied {}", domain));
            } else {
                out.push(format!("{} is already denied", domain));
            }
        }

        ListCommand::Remove { domain } => {
            let domain = normalize_domain(&domain)?;
            let allowed = lists.remove(ListKind::Allowed, &domain)?;
            let denied = lists.remove(ListKind::Denied, &domain)?;
            if allowed || denied {
                out.push(format!("Removed {}", domain));
            } else {
                out.push(format!("{} is not listed", domain));
            }
        }
    }
    Ok(out)
}

/// Run the firewall command.
pub async fn run(args: FirewallArgs) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let lines = match args.scope {
        Scope::Global { command } => {
            let mut lists = FirewallLists::new(ctx.paths.firewall_dir());
            lists.ensure_defaults()?;
            println!("{}", style(lists.dir().display()).dim());
            apply(&mut lists, command)?
        }
        Scope::Project { command } => {
            let file = ctx.loader.project_file().clone();
            println!("{}", style(file.path().display()).dim());
            apply(&mut ProjectLists::new(file), command)?
        }
    };
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}
