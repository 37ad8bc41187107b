//! addt command-line interface.

pub mod commands;
pub mod context;
pub mod logging;

use clap::{Args, Parser, Subcommand};

/// Flags accepted anywhere on the command line.
const GLOBAL_FLAGS: [&str; 2] = ["--addt-rebuild", "--addt-rebuild-base"];

/// addt - run AI coding agents in a sandbox
#[derive(Parser)]
#[command(name = "addt")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub build: BuildFlags,

    #[command(subcommand)]
    pub command: Commands,
}

/// Image rebuild switches.
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct BuildFlags {
    /// Rebuild the extension image
    #[arg(long = "addt-rebuild", global = true)]
    pub rebuild: bool,

    /// Rebuild the base image as well
    #[arg(long = "addt-rebuild-base", global = true)]
    pub rebuild_base: bool,
}

impl BuildFlags {
    pub fn options(&self) -> addt_sandbox::BuildOptions {
        addt_sandbox::BuildOptions {
            rebuild: self.rebuild || self.rebuild_base,
            rebuild_base: self.rebuild_base,
            no_cache: false,
        }
    }
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run an extension's agent in the sandbox
    Run(commands::run::RunArgs),

    /// Open an interactive shell in the sandbox
    Shell(commands::run::RunArgs),

    /// Build the image for an extension
    Build(commands::build::BuildArgs),

    /// Rebuild an extension image without cache
    Update(commands::build::UpdateArgs),

    /// Manage persistent sandboxes
    Containers(commands::containers::ContainersArgs),

    /// Edit firewall allow and deny lists
    Firewall(commands::firewall::FirewallArgs),

    /// Configuration management
    Config(commands::config::ConfigArgs),

    /// Inspect and scaffold extensions
    Extensions(commands::extensions::ExtensionsArgs),

    /// Run diagnostics
    Doctor(commands::doctor::DoctorArgs),

    /// Show version information
    Version,
}

/// Run the CLI with the given arguments.
pub async fn run(cli: Cli, invoked_as: Option<String>) -> anyhow::Result<()> {
    let build = cli.build;
    match cli.command {
        Commands::Run(args) => commands::run::run(args, build, false, invoked_as).await,
        Commands::Shell(args) => commands::run::run(args, build, true, invoked_as).await,
        Commands::Build(args) => commands::build::run(args, build).await,
        Commands::Update(args) => commands::build::update(args).await,
        Commands::Containers(args) => commands::containers::run(args).await,
        Commands::Firewall(args) => commands::firewall::run(args).await,
        Commands::Config(args) => commands::config::run(args).await,
        Commands::Extensions(args) => commands::extensions::run(args).await,
        Commands::Doctor(args) => commands::doctor::run(args).await,
        Commands::Version => {
            println!("addt {}", addt_core::ADDT_VERSION);
            Ok(())
        }
    }
}

/// Process exit code for a failed command.
///
/// Sandbox errors carry their own code; the sandboxed process's exit status
/// is propagated unchanged.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<addt_sandbox::SandboxError>()
        .map(addt_sandbox::SandboxError::exit_code)
        .unwrap_or(1)
}

/// Whether the error should be reported; a non-zero agent exit is not.
pub fn should_report(err: &anyhow::Error) -> bool {
    !matches!(
        err.downcast_ref::<addt_sandbox::SandboxError>(),
        Some(addt_sandbox::SandboxError::RuntimeExit(_))
    )
}

/// Rewrite argv before parsing.
///
/// `--addt-*` flags are moved in front of the subcommand so they are not
/// swallowed by the agent's arguments. When invoked through an
/// `addt-<ext>` alias the remaining words become `run <ext> ...`.
pub fn normalize_args(argv: Vec<String>, alias: Option<&str>) -> Vec<String> {
    let mut iter = argv.into_iter();
    let program = iter.next().unwrap_or_else(|| "addt".to_string());

    let (flags, rest): (Vec<String>, Vec<String>) =
        iter.partition(|arg| GLOBAL_FLAGS.contains(&arg.as_str()));

    let mut out = vec![program];
    out.extend(flags);
    if let Some(ext) = alias {
        out.push("run".to_string());
        out.push(ext.to_string());
    }
    out.extend(rest);
    out
}
