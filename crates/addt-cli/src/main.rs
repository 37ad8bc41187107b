//! addt CLI entry point.

use addt_cli::context::Context;
use addt_cli::{exit_code, logging, normalize_args, run, should_report, Cli};
use addt_core::config::ExtensionSelection;
use clap::Parser;
use console::style;
use std::path::Path;

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let invoked_as = argv
        .first()
        .and_then(|arg| Path::new(arg).file_name())
        .map(|name| name.to_string_lossy().into_owned());

    // `addt-<ext>` symlinks behave like `addt run <ext>`.
    let selection = ExtensionSelection {
        invoked_as: invoked_as.clone(),
        requested: None,
    };
    let registry = Context::load_registry();
    let alias = selection.alias_extension(&registry).map(str::to_string);
    let cli = Cli::parse_from(normalize_args(argv, alias.as_deref()));

    init_logging();

    let code = match run(cli, invoked_as).await {
        Ok(()) => 0,
        Err(e) => {
            if should_report(&e) {
                eprintln!("{} {:#}", style("Error:").red().bold(), e);
            }
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

/// Configure logging from the global and project config files.
fn init_logging() {
    let configured = Context::load().and_then(|ctx| {
        let config = ctx.base_config()?;
        logging::init(&config.log, &ctx.paths)
    });
    if let Err(e) = configured {
        logging::init_fallback();
        tracing::warn!("Logging falls back to stderr: {:#}", e);
    }
}
