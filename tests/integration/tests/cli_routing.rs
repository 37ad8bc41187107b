//! Command-line routing through argv normalisation and clap.

use addt_cli::{normalize_args, Cli, Commands};
use addt_core::config::ExtensionSelection;
use addt_core::ExtensionRegistry;
use clap::{CommandFactory, Parser};

fn argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

/// What `main` does before dispatch.
fn route(words: &[&str]) -> Result<Cli, clap::Error> {
    let argv = argv(words);
    let selection = ExtensionSelection {
        invoked_as: argv.first().cloned(),
        requested: None,
    };
    let registry = ExtensionRegistry::embedded();
    let alias = selection.alias_extension(&registry).map(str::to_string);
    Cli::try_parse_from(normalize_args(argv, alias.as_deref()))
}

#[test]
fn test_help_lists_commands() {
    let help = Cli::command().render_help().to_string();
    for command in ["run", "shell", "build", "containers", "firewall", "config", "doctor"] {
        assert!(help.contains(command), "help should mention '{}': {}", command, help);
    }
}

#[test]
fn test_unknown_command_is_rejected() {
    assert!(route(&["addt", "nonexistent-command"]).is_err());
}

#[test]
fn test_alias_binary_runs_extension() {
    let cli = route(&["addt-gemini", "--yolo", "explain this"]).unwrap();
    match cli.command {
        Commands::Run(args) => {
            assert_eq!(args.extension, "gemini");
            assert_eq!(args.args, vec!["--yolo", "explain this"]);
        }
        _ => panic!("Expected Run command"),
    }
}

#[test]
fn test_rebuild_flag_after_agent_args() {
    let cli = route(&["addt", "shell", "codex", "-c", "ls", "--addt-rebuild"]).unwrap();
    assert!(cli.build.rebuild);
    match cli.command {
        Commands::Shell(args) => {
            assert_eq!(args.extension, "codex");
            assert_eq!(args.args, vec!["-c", "ls"]);
        }
        _ => panic!("Expected Shell command"),
    }
}

#[test]
fn test_plain_binary_name_is_not_an_alias() {
    let cli = route(&["addt", "version"]).unwrap();
    assert!(matches!(cli.command, Commands::Version));
    assert!(!cli.build.rebuild);
}

#[test]
fn test_unknown_alias_suffix_is_not_an_alias() {
    let cli = route(&["addt-dev", "version"]).unwrap();
    assert!(matches!(cli.command, Commands::Version));

    // Usage, not `run dev`.
    assert!(route(&["addt-dev"]).is_err());
}
