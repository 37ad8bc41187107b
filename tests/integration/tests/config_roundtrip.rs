//! Config files written by `config set` feed composition.

use addt_core::config::{ConfigFile, ExtensionSelection, FirewallMode, Source};
use addt_core::ExtensionRegistry;
use addt_integration_tests::Workspace;

#[test]
fn test_set_values_are_composed() {
    let ws = Workspace::new();
    let registry = ExtensionRegistry::embedded();

    let mut global = ConfigFile::load(&ws.paths.global_config_file()).unwrap();
    global.set("firewall.mode", "permissive", &registry).unwrap();
    global.set("security.pids_limit", "64", &registry).unwrap();
    global.save().unwrap();

    let mut project = ConfigFile::load(&ws.paths.project_config_file(&ws.workdir)).unwrap();
    project.set("security.pids_limit", "128", &registry).unwrap();
    project.set("extensions.claude.version", "1.2.3", &registry).unwrap();
    project.save().unwrap();

    let config = ws
        .loader(&[])
        .compose(&registry, &ExtensionSelection::requested("claude"))
        .unwrap();
    assert_eq!(config.firewall.mode, FirewallMode::Permissive);
    assert_eq!(config.source_of("firewall.mode"), Source::Global);
    assert_eq!(config.security.pids_limit, 128);
    assert_eq!(config.source_of("security.pids_limit"), Source::Project);
    assert_eq!(config.extension("claude").version.as_deref(), Some("1.2.3"));
}

#[test]
fn test_env_overrides_files() {
    let ws = Workspace::new();
    ws.write_global("persistent: false\n");
    ws.write_project("persistent: false\n");

    let config = ws.loader(&[("ADDT_PERSISTENT", "true")]).compose_base().unwrap();
    assert!(config.persistent);
    assert_eq!(config.source_of("persistent"), Source::Env);
}

#[test]
fn test_unknown_keys_survive_set() {
    let ws = Workspace::new();
    let registry = ExtensionRegistry::embedded();
    ws.write_project("custom:\n  note: keep me\n");

    let path = ws.paths.project_config_file(&ws.workdir);
    let mut file = ConfigFile::load(&path).unwrap();
    file.set("persistent", "true", &registry).unwrap();
    file.save().unwrap();

    let reloaded = ConfigFile::load(&path).unwrap();
    assert_eq!(
        reloaded.get("custom.note").and_then(|v| v.as_str()),
        Some("keep me")
    );
    assert!(ws.loader(&[]).compose_base().unwrap().persistent);
}

#[test]
fn test_invalid_file_value_is_rejected() {
    let ws = Workspace::new();
    ws.write_project("security:\n  pids_limit: lots\n");
    assert!(ws.loader(&[]).compose_base().is_err());
}
