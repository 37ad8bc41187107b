//! Shell history persistence per project.

use crate::spec::{VolumeMount, SANDBOX_HOME};
use addt_core::AddtPaths;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

const HISTORY_FILES: [(&str, &str); 2] = [
    ("bash_history", ".bash_history"),
    ("zsh_history", ".zsh_history"),
];

/// Create the project's history files and return their mounts.
pub fn history_mounts(paths: &AddtPaths, workdir: &Path) -> io::Result<Vec<VolumeMount>> {
    let dir = paths.history_dir(workdir);
    std::fs::create_dir_all(&dir)?;

    let mut mounts = Vec::new();
    for (file, target) in HISTORY_FILES {
        let path = dir.join(file);
        OpenOptions::new().create(true).append(true).open(&path)?;
        mounts.push(VolumeMount::new(path, format!("{}/{}", SANDBOX_HOME, target)));
    }
    Ok(mounts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_history_files_created_per_project() {
        let root = TempDir::new().unwrap();
        let paths = AddtPaths::with_root(root.path().join(".addt"), root.path());

        let a = history_mounts(&paths, Path::new("/src/a")).unwrap();
        let b = history_mounts(&paths, Path::new("/src/b")).unwrap();

        assert_eq!(a.len(), 2);
        assert!(a[0].source.exists());
        assert_eq!(a[0].target, "/home/addt/.bash_history");
        assert_eq!(a[1].target, "/home/addt/.zsh_history");
        assert_ne!(a[0].source, b[0].source);

        std::fs::write(&a[0].source, "ls\n").unwrap();
        let again = history_mounts(&paths, Path::new("/src/a")).unwrap();
        assert_eq!(std::fs::read_to_string(&again[0].source).unwrap(), "ls\n");
    }
}
