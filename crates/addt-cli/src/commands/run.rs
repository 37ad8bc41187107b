//! `run` and `shell`.

use crate::context::Context;
use crate::BuildFlags;
use addt_core::config::ExtensionSelection;
use addt_sandbox::{Orchestrator, SandboxError, SessionMode};
use clap::Args;
use tracing::debug;

/// Run and shell arguments.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Extension to start
    pub extension: String,

    /// Arguments passed through to the agent (or bash)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Run the extension command, or a shell when `shell` is set.
pub async fn run(
    args: RunArgs,
    build: BuildFlags,
    shell: bool,
    invoked_as: Option<String>,
) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    ctx.paths.ensure_dirs()?;

    let selection = ExtensionSelection {
        invoked_as,
        requested: Some(args.extension),
    };
    let config = ctx.compose(&selection)?;
    debug!(
        "Provider {} with extensions {}",
        config.provider,
        config.extensions.join(",")
    );

    let mode = if shell { SessionMode::Shell } else { SessionMode::Run };
    let mut orchestrator = Orchestrator::new(&config, ctx.paths.clone());
    let code = orchestrator
        .run(&config, &ctx.registry, mode, args.args, build.options())
        .await?;

    if code != 0 {
        return Err(SandboxError::RuntimeExit(code).into());
    }
    Ok(())
}
