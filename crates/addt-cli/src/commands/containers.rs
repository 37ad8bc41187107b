//! Persistent sandbox lifecycle.

use crate::context::Context;
use addt_sandbox::{Environment, EnvironmentStatus, Orchestrator};
use clap::Args;
use console::style;
use tracing::warn;

/// Containers command arguments.
#[derive(Args)]
pub struct ContainersArgs {
    #[command(subcommand)]
    pub command: ContainersCommand,
}

#[derive(clap::Subcommand)]
pub enum ContainersCommand {
    /// List addt sandboxes
    List,

    /// Stop a sandbox
    Stop {
        /// Sandbox name
        name: String,
    },

    /// Remove a sandbox and its state
    Rm {
        /// Sandbox name
        name: String,
    },

    /// Remove every addt sandbox
    Clean,
}

/// One table row for `containers list`.
pub fn format_row(env: &Environment) -> String {
    let created = env
        .created_at
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{:<56} {:<8} {}", env.name, env.status.to_string(), created)
}

/// Run the containers command.
pub async fn run(args: ContainersArgs) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let config = ctx.base_config()?;
    let mut orchestrator = Orchestrator::new(&config, ctx.paths.clone());
    orchestrator.initialize(&config).await?;
    let backend = orchestrator.backend();

    match args.command {
        ContainersCommand::List => {
            let envs = backend.list().await?;
            if envs.is_empty() {
                println!("No addt sandboxes ({})", backend.name());
                return Ok(());
            }
            println!("{}", style(format!("{:<56} {:<8} {}", "NAME", "STATUS", "CREATED")).bold());
            for env in &envs {
                println!("{}", format_row(env));
            }
        }

        ContainersCommand::Stop { name } => {
            if !backend.exists(&name).await? {
                anyhow::bail!("No sandbox named {}", name);
            }
            if backend.is_running(&name).await? {
                backend.stop(&name).await?;
                println!("Stopped {}", name);
            } else {
                println!("{} is not running", name);
            }
        }

        ContainersCommand::Rm { name } => {
            if !backend.exists(&name).await? {
                anyhow::bail!("No sandbox named {}", name);
            }
            backend.remove(&name).await?;
            println!("Removed {}", name);
        }

        ContainersCommand::Clean => {
            let envs = backend.list().await?;
            let mut removed = 0;
            for env in &envs {
                match backend.remove(&env.name).await {
                    Ok(()) => {
                        removed += 1;
                        println!("Removed {}", env.name);
                    }
                    Err(e) => warn!("Failed to remove {}: {}", env.name, e),
                }
            }
            let running = envs
                .iter()
                .filter(|e| e.status == EnvironmentStatus::Running)
                .count();
            println!(
                "{} {} of {} sandboxes removed ({} were running)",
                style("Done:").green(),
                removed,
                envs.len(),
                running
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_format_row() {
        let env = Environment {
            name: "addt-persistent-app-1234abcd".to_string(),
            status: EnvironmentStatus::Running,
            created_at: None,
        };
        let row = format_row(&env);
        assert!(row.starts_with("addt-persistent-app-1234abcd "));
        assert!(row.contains(" running "));
        assert!(row.ends_with(" -"));

        let dated = Environment {
            created_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()),
            status: EnvironmentStatus::Stopped,
            ..env
        };
        let row = format_row(&dated);
        assert!(row.contains("stopped"));
        assert!(row.contains("2024-05-0"));
    }
}
