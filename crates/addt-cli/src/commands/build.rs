//! `build` and `update`.

use crate::context::Context;
use crate::BuildFlags;
use addt_core::config::keys::extension_env_var;
use addt_core::config::ExtensionSelection;
use addt_core::env;
use addt_sandbox::{BuildOptions, Orchestrator};
use clap::Args;
use console::style;

/// Build arguments.
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Extension whose image is built
    pub extension: String,
}

/// Update arguments.
#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Extension to rebuild
    pub extension: String,

    /// Version to install instead of the configured one
    pub version: Option<String>,
}

async fn build_with(ctx: Context, extension: String, options: BuildOptions) -> anyhow::Result<()> {
    ctx.paths.ensure_dirs()?;
    let config = ctx.compose(&ExtensionSelection::requested(extension))?;
    let mut orchestrator = Orchestrator::new(&config, ctx.paths.clone());

    match orchestrator.build(&config, &ctx.registry, options).await? {
        Some(tag) => println!("{} {}", style("Image ready:").green(), tag),
        None => println!(
            "The {} provider runs without images; nothing to build",
            config.provider
        ),
    }
    Ok(())
}

/// Build the extension image if it is missing or stale.
pub async fn run(args: BuildArgs, build: BuildFlags) -> anyhow::Result<()> {
    build_with(Context::load()?, args.extension, build.options()).await
}

/// Rebuild without cache, optionally pinning a version for this build.
pub async fn update(args: UpdateArgs) -> anyhow::Result<()> {
    let workdir = std::env::current_dir()?;
    let mut snapshot = env::snapshot();
    if let Some(version) = &args.version {
        snapshot.insert(extension_env_var(&args.extension, "version"), version.clone());
    }
    let ctx = Context::from_env(snapshot, &workdir)?;
    let options = BuildOptions {
        rebuild: true,
        rebuild_base: false,
        no_cache: true,
    };
    build_with(ctx, args.extension, options).await
}
