//! Session naming and extension registry overrides.

use addt_core::config::{ExtensionSelection, ProviderKind};
use addt_core::ExtensionRegistry;
use addt_integration_tests::Workspace;
use addt_sandbox::{build_spec, Provider};
use std::fs;

fn exts(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_persistent_names_are_stable() {
    let ws = Workspace::new();
    let docker = Provider::new(ProviderKind::Docker, &ws.paths);
    let bwrap = Provider::new(ProviderKind::Bwrap, &ws.paths);

    let a = docker
        .backend()
        .generate_persistent_name(&ws.workdir, &exts(&["claude", "codex"]));
    let b = docker
        .backend()
        .generate_persistent_name(&ws.workdir, &exts(&["codex", "claude"]));
    assert_eq!(a, b);
    assert!(a.starts_with("addt-persistent-my-project-"));

    let other = docker
        .backend()
        .generate_persistent_name(&ws.workdir, &exts(&["claude"]));
    assert_ne!(a, other);

    let sandboxed = bwrap
        .backend()
        .generate_persistent_name(&ws.workdir, &exts(&["claude", "codex"]));
    assert!(sandboxed.starts_with("addt-bwrap-persistent-my-project-"));
    assert!(sandboxed.ends_with(&a["addt-persistent-my-project-".len()..]));
}

#[test]
fn test_ephemeral_names_share_the_session_hash() {
    let ws = Workspace::new();
    let docker = Provider::new(ProviderKind::Docker, &ws.paths);
    let persistent = docker
        .backend()
        .generate_persistent_name(&ws.workdir, &exts(&["claude"]));
    let ephemeral = docker
        .backend()
        .generate_ephemeral_name(&ws.workdir, &exts(&["claude"]));

    let hash = &persistent[persistent.len() - 8..];
    assert!(ephemeral.starts_with(&format!("addt-my-project-{}-", hash)));
    assert!(ephemeral.ends_with(&format!("-{}", std::process::id())));
}

#[test]
fn test_local_extension_overrides_builtin() {
    let ws = Workspace::new();
    let dir = ws.paths.extensions_dir().join("claude");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("config.yaml"),
        "name: claude\ndescription: patched\nentrypoint: claude-dev\n",
    )
    .unwrap();

    let registry = ExtensionRegistry::load(&ws.paths.extensions_dir());
    let claude = registry.get("claude").unwrap();
    assert!(claude.local);
    assert_eq!(claude.description, "patched");
    assert!(registry.get("codex").is_some_and(|ext| !ext.local));

    let config = ws
        .loader(&[])
        .compose(&registry, &ExtensionSelection::requested("claude"))
        .unwrap();
    assert_eq!(config.command.as_deref(), Some("claude-dev"));
}

#[tokio::test]
async fn test_bwrap_spec_from_composed_config() {
    let ws = Workspace::new();
    ws.write_project("persistent: true\nhistory_persist: false\n");
    let registry = ExtensionRegistry::embedded();
    let config = ws
        .loader(&[("ADDT_PROVIDER", "bwrap")])
        .compose(&registry, &ExtensionSelection::requested("codex"))
        .unwrap();
    let provider = Provider::new(config.provider, &ws.paths);

    let spec = build_spec(
        provider.backend(),
        &config,
        &registry,
        &ws.paths,
        None,
        vec!["--help".to_string()],
    )
    .await
    .unwrap();

    assert!(spec.persistent);
    assert!(spec.name.starts_with("addt-bwrap-persistent-my-project-"));
    assert_eq!(spec.env["ADDT_EXTENSIONS"], "codex");
    assert_eq!(spec.args, vec!["--help"]);
    assert!(spec.image.is_none());
}
