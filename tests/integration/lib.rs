//! Shared fixtures for the integration tests.

use addt_core::config::ConfigLoader;
use addt_core::env::EnvSnapshot;
use addt_core::AddtPaths;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A throwaway user home holding an addt home and a project directory.
pub struct Workspace {
    pub paths: AddtPaths,
    pub workdir: PathBuf,
    dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let workdir = dir.path().join("my-project");
        fs::create_dir_all(&workdir).unwrap();
        let paths = AddtPaths::with_root(dir.path().join(".addt"), dir.path());
        paths.ensure_dirs().unwrap();
        Self { paths, workdir, dir }
    }

    pub fn user_home(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_global(&self, content: &str) {
        fs::write(self.paths.global_config_file(), content).unwrap();
    }

    pub fn write_project(&self, content: &str) {
        fs::write(self.paths.project_config_file(&self.workdir), content).unwrap();
    }

    /// Loader over this workspace with `HOME` plus `vars` as the environment.
    pub fn loader(&self, vars: &[(&str, &str)]) -> ConfigLoader {
        ConfigLoader::new(self.paths.clone(), &self.workdir, self.env(vars)).unwrap()
    }

    pub fn env(&self, vars: &[(&str, &str)]) -> EnvSnapshot {
        let mut env: EnvSnapshot = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.insert("HOME".to_string(), self.user_home().display().to_string());
        env
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}
