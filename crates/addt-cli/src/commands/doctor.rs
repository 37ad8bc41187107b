//! Diagnostic commands.

use crate::context::Context;
use addt_core::config::{ExtensionSelection, ForwardMode, ProviderKind};
use addt_core::EffectiveConfig;
use addt_sandbox::oci::Runtime;
use addt_sandbox::Provider;
use clap::Args;
use console::{style, Emoji};

static CHECK: Emoji = Emoji("✓", "+");
static CROSS: Emoji = Emoji("✗", "x");
static WARN: Emoji = Emoji("⚠", "!");

/// Doctor command arguments.
#[derive(Args)]
pub struct DoctorArgs {
    /// Also check that the extension image has been built
    #[arg(long)]
    pub full: bool,
}

#[derive(Default)]
struct Tally {
    errors: usize,
    warnings: usize,
}

impl Tally {
    fn ok(&self, msg: impl std::fmt::Display) {
        println!("  {} {}", style(CHECK).green(), msg);
    }

    fn warn(&mut self, msg: impl std::fmt::Display) {
        println!("  {} {}", style(WARN).yellow(), msg);
        self.warnings += 1;
    }

    fn error(&mut self, msg: impl std::fmt::Display) {
        println!("  {} {}", style(CROSS).red(), msg);
        self.errors += 1;
    }
}

/// Run the doctor command.
pub async fn run(args: DoctorArgs) -> anyhow::Result<()> {
    println!("addt doctor\n");
    let mut tally = Tally::default();

    println!("Checking directories...");
    let ctx = match Context::load() {
        Ok(ctx) => ctx,
        Err(e) => {
            tally.error(format!("Cannot read configuration: {:#}", e));
            return summary(&tally);
        }
    };
    if ctx.paths.home().exists() {
        tally.ok(format!("addt home: {}", ctx.paths.home().display()));
    } else {
        tally.warn(format!(
            "addt home missing: {} (created on first run)",
            ctx.paths.home().display()
        ));
    }

    println!("\nChecking configuration...");
    let config = match ctx.compose(&ExtensionSelection::default()) {
        Ok(config) => {
            tally.ok(format!(
                "Configuration valid (provider {}, extensions {})",
                config.provider,
                config.extensions.join(",")
            ));
            config
        }
        Err(e) => {
            tally.error(format!("Configuration invalid: {:#}", e));
            return summary(&tally);
        }
    };

    println!("\nChecking provider...");
    check_provider(&config, &ctx, &mut tally).await;

    println!("\nChecking forwarding...");
    check_forwarding(&config, &ctx, &mut tally);

    if args.full {
        println!("\nChecking images...");
        check_image(&config, &ctx, &mut tally).await;
    }

    summary(&tally)
}

async fn check_provider(config: &EffectiveConfig, ctx: &Context, tally: &mut Tally) {
    if config.provider == ProviderKind::Bwrap {
        if cfg!(target_os = "linux") {
            tally.ok("Linux host");
        } else {
            tally.error("bwrap needs a Linux host");
        }
        match which::which("bwrap") {
            Ok(path) => tally.ok(format!("bwrap: {}", path.display())),
            Err(_) => tally.error("bwrap not found (apt install bubblewrap / dnf install bubblewrap)"),
        }
        match which::which("socat") {
            Ok(path) => tally.ok(format!("socat: {}", path.display())),
            Err(_) if config.firewall.enabled => {
                tally.error("socat not found; the bwrap firewall needs it")
            }
            Err(_) => tally.warn("socat not found; needed when the firewall is enabled"),
        }
        return;
    }

    let runtime = match Runtime::detect(config.provider, &ctx.paths) {
        Ok(runtime) => {
            tally.ok(format!("{}: {}", config.provider, runtime.binary().display()));
            runtime
        }
        Err(e) => {
            tally.error(e);
            return;
        }
    };
    match runtime.check_daemon().await {
        Ok(()) => tally.ok("Daemon is reachable"),
        Err(e) => tally.error(e),
    }
}

fn check_forwarding(config: &EffectiveConfig, ctx: &Context, tally: &mut Tally) {
    match &config.host.ssh_auth_sock {
        Some(sock) if sock.exists() => tally.ok(format!("SSH agent: {}", sock.display())),
        Some(sock) => tally.warn(format!("SSH_AUTH_SOCK points at a missing socket: {}", sock.display())),
        None => tally.warn("SSH_AUTH_SOCK not set; ssh forwarding falls back to keys"),
    }

    if config.gpg.forward != ForwardMode::Off {
        match addt_proxy::gpg_agent::find_upstream_socket(
            config.host.gnupg_home.as_deref(),
            ctx.paths.user_home(),
        ) {
            Some(sock) => tally.ok(format!("gpg-agent: {}", sock.display())),
            None => tally.warn("gpg forwarding is enabled but no gpg-agent socket was found"),
        }
    }
}

async fn check_image(config: &EffectiveConfig, ctx: &Context, tally: &mut Tally) {
    let provider = Provider::new(config.provider, &ctx.paths);
    let tag = match provider.backend().determine_image_name(config, &ctx.registry) {
        Ok(Some(tag)) => tag,
        Ok(None) => {
            tally.ok(format!("{} runs without images", provider.backend().name()));
            return;
        }
        Err(e) => {
            tally.error(e);
            return;
        }
    };
    let Ok(runtime) = Runtime::detect(config.provider, &ctx.paths) else {
        return;
    };
    match runtime.image_exists(&tag).await {
        Ok(true) => tally.ok(format!("Image {} is built", tag)),
        Ok(false) => tally.warn(format!("Image {} not built yet; run 'addt build'", tag)),
        Err(e) => tally.error(e),
    }
}

fn summary(tally: &Tally) -> anyhow::Result<()> {
    println!("\nSummary:");
    if tally.errors == 0 && tally.warnings == 0 {
        println!("  {} All checks passed!", style(CHECK).green());
    } else {
        if tally.errors > 0 {
            println!("  {} {} error(s)", style(CROSS).red(), tally.errors);
        }
        if tally.warnings > 0 {
            println!("  {} {} warning(s)", style(WARN).yellow(), tally.warnings);
        }
    }

    if tally.errors > 0 {
        anyhow::bail!("{} check(s) failed", tally.errors);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_fails_on_errors() {
        let mut tally = Tally::default();
        tally.warn("only a warning");
        assert!(summary(&tally).is_ok());

        tally.error("broken");
        assert_eq!(tally.errors, 1);
        assert_eq!(tally.warnings, 1);
        assert!(summary(&tally).is_err());
    }
}
