//! Git configuration forwarding and hook neutralisation.

use super::Forwarding;
use crate::spec::{VolumeMount, SANDBOX_HOME};
use addt_core::config::GitConfig;
use addt_core::paths::expand_tilde_with;
use std::path::{Path, PathBuf};

/// Host gitconfig to forward, if enabled and present.
pub fn host_gitconfig(git: &GitConfig, user_home: &Path) -> Option<PathBuf> {
    if !git.forward_config {
        return None;
    }
    let path = if git.config_path.is_empty() {
        user_home.join(".gitconfig")
    } else {
        expand_tilde_with(&git.config_path, user_home)
    };
    path.is_file().then_some(path)
}

/// Mount `~/.gitconfig` as `.gitconfig.host` and flag hook disabling.
pub fn prepare(gitconfig: Option<&Path>, disable_hooks: bool) -> Forwarding {
    let mut out = Forwarding::default();
    if let Some(path) = gitconfig {
        out.mount(
            VolumeMount::new(path, format!("{}/.gitconfig.host", SANDBOX_HOME)).readonly(true),
        );
    }
    if disable_hooks {
        out.set_env("ADDT_GIT_DISABLE_HOOKS", "true");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use addt_core::EffectiveConfig;
    use tempfile::TempDir;

    #[test]
    fn test_host_gitconfig() {
        let home = TempDir::new().unwrap();
        let mut git = EffectiveConfig::default().git;
        assert!(host_gitconfig(&git, home.path()).is_none());

        std::fs::write(home.path().join(".gitconfig"), "[user]\n").unwrap();
        assert_eq!(
            host_gitconfig(&git, home.path()),
            Some(home.path().join(".gitconfig"))
        );

        std::fs::write(home.path().join("alt"), "").unwrap();
        git.config_path = "~/alt".to_string();
        assert_eq!(host_gitconfig(&git, home.path()), Some(home.path().join("alt")));

        git.forward_config = false;
        assert!(host_gitconfig(&git, home.path()).is_none());
    }

    #[test]
    fn test_prepare() {
        let out = prepare(Some(Path::new("/h/.gitconfig")), true);
        assert_eq!(out.mounts[0].target, "/home/addt/.gitconfig.host");
        assert!(out.mounts[0].readonly);
        assert_eq!(out.env["ADDT_GIT_DISABLE_HOOKS"], "true");
        assert!(prepare(None, false).is_empty());
    }
}
