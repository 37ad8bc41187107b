//! Extension listing and scaffolding.

use crate::context::Context;
use addt_core::extensions::{self, Extension};
use addt_core::ExtensionRegistry;
use clap::Args;
use console::style;

/// Extensions command arguments.
#[derive(Args)]
pub struct ExtensionsArgs {
    #[command(subcommand)]
    pub command: ExtensionsCommand,
}

#[derive(clap::Subcommand)]
pub enum ExtensionsCommand {
    /// List available extensions
    List,

    /// Show one extension's manifest
    Info {
        /// Extension name
        name: String,
    },

    /// Scaffold a local extension under ~/.addt/extensions
    New {
        /// Extension name
        name: String,
    },
}

/// Run the extensions command.
pub async fn run(args: ExtensionsArgs) -> anyhow::Result<()> {
    let ctx = Context::load()?;

    match args.command {
        ExtensionsCommand::List => {
            for line in list_rows(&ctx.registry) {
                println!("{}", line);
            }
        }

        ExtensionsCommand::Info { name } => {
            for line in info(&ctx.registry, &name)? {
                println!("{}", line);
            }
        }

        ExtensionsCommand::New { name } => {
            let dir = extensions::create_local(&ctx.paths.extensions_dir(), &name)?;
            println!("{} Created {}", style("✓").green(), dir.display());
            println!("  Edit config.yaml and install.sh, then run: addt build {}", name);
        }
    }

    Ok(())
}

fn origin(ext: &Extension) -> &'static str {
    if ext.local {
        "local"
    } else {
        "built-in"
    }
}

fn list_rows(registry: &ExtensionRegistry) -> Vec<String> {
    let mut out = vec![format!(
        "{}",
        style(format!("{:<16} {:<10} {}", "NAME", "SOURCE", "DESCRIPTION")).bold()
    )];
    for ext in registry.list() {
        out.push(format!("{:<16} {:<10} {}", ext.name, origin(ext), ext.description));
    }
    out
}

fn info(registry: &ExtensionRegistry, name: &str) -> anyhow::Result<Vec<String>> {
    let ext = registry.require(name)?;
    let order = registry.resolve_order(&[name.to_string()])?;

    let mut out = vec![
        format!("{} ({})", style(&ext.name).bold(), origin(ext)),
        format!("  Description: {}", ext.description),
        format!("  Command:     {}", ext.command()),
        format!("  Version:     {}", ext.default_version),
        format!("  Automount:   {}", ext.auto_mount),
        format!("  Read-only:   {}", ext.readonly),
        format!("  Install:     {}", order.join(" -> ")),
    ];

    let specs = ext.env_var_specs();
    if !specs.is_empty() {
        out.push("  Env vars:".to_string());
        for spec in specs {
            match spec.default {
                Some(default) => out.push(format!("    {} (default: {})", spec.name, default)),
                None => out.push(format!("    {}", spec.name)),
            }
        }
    }

    if !ext.mounts.is_empty() {
        out.push("  Mounts:".to_string());
        for mount in &ext.mounts {
            out.push(format!("    {} -> {}", mount.source, mount.target));
        }
    }

    if !ext.flags.is_empty() {
        out.push("  Flags:".to_string());
        for flag in &ext.flags {
            out.push(format!("    {:<14} {}", flag.flag, flag.description));
        }
    }

    Ok(out)
}
