//! Embedded build assets.
//!
//! The `assets/` tree ships inside the binary: base and extension
//! Dockerfiles, the sandbox entrypoint, the firewall initialiser, the shared
//! extension installer, and the built-in extensions. Two content hashes over
//! that tree identify the images built from it.

use include_dir::{include_dir, Dir, DirEntry};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

static ASSETS: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/assets");

/// Files that make up the base image identity.
pub const BASE_FILES: &[&str] = &["Dockerfile.base", "docker-entrypoint.sh", "init-firewall.sh"];

/// Top-level files that make up the extension image identity.
pub const EXT_FILES: &[&str] = &["Dockerfile", "install.sh"];

/// Directory (relative to the assets root) holding extension trees.
pub const EXTENSIONS_DIR: &str = "extensions";

/// Embedded file contents by path relative to the assets root.
pub fn file(path: &str) -> Option<&'static [u8]> {
    ASSETS.get_file(path).map(|f| f.contents())
}

/// Names of the extensions embedded in the binary.
pub fn embedded_extension_names() -> Vec<String> {
    let mut names: Vec<String> = ASSETS
        .get_dir(EXTENSIONS_DIR)
        .map(|dir| {
            dir.dirs()
                .filter_map(|d| d.path().file_name())
                .map(|n| n.to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Files of the extensions tree, keyed by path relative to the assets root.
///
/// Each directory under `local_dir` replaces the embedded extension of the
/// same name wholesale, so a local override never mixes with embedded files.
pub fn extension_tree(local_dir: Option<&Path>) -> std::io::Result<BTreeMap<PathBuf, Vec<u8>>> {
    let mut tree = BTreeMap::new();
    if let Some(dir) = ASSETS.get_dir(EXTENSIONS_DIR) {
        collect_embedded(dir, &mut tree);
    }

    let Some(local_dir) = local_dir else {
        return Ok(tree);
    };
    if !local_dir.is_dir() {
        return Ok(tree);
    }

    let mut local_names: Vec<PathBuf> = fs::read_dir(local_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    local_names.sort();

    for ext_dir in local_names {
        let Some(name) = ext_dir.file_name() else {
            continue;
        };
        let prefix = Path::new(EXTENSIONS_DIR).join(name);
        tree.retain(|path, _| !path.starts_with(&prefix));
        collect_local(&ext_dir, &prefix, &mut tree)?;
    }

    Ok(tree)
}

fn collect_embedded(dir: &Dir<'static>, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
    for entry in dir.entries() {
        match entry {
            DirEntry::Dir(sub) => collect_embedded(sub, out),
            DirEntry::File(file) => {
                out.insert(file.path().to_path_buf(), file.contents().to_vec());
            }
        }
    }
}

fn collect_local(
    dir: &Path,
    prefix: &Path,
    out: &mut BTreeMap<PathBuf, Vec<u8>>,
) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let rel = prefix.join(entry.file_name());
        if path.is_dir() {
            collect_local(&path, &rel, out)?;
        } else if path.is_file() {
            out.insert(rel, fs::read(&path)?);
        }
    }
    Ok(())
}

/// SHA-256 over the base image inputs.
pub fn base_assets_hash() -> String {
    let files: BTreeMap<PathBuf, Vec<u8>> = BASE_FILES
        .iter()
        .map(|name| {
            (
                PathBuf::from(name),
                file(name).map(<[u8]>::to_vec).unwrap_or_default(),
            )
        })
        .collect();
    hash_tree(&files)
}

/// SHA-256 over the extension image inputs, local overrides included.
pub fn ext_assets_hash(local_dir: Option<&Path>) -> std::io::Result<String> {
    let mut files = extension_tree(local_dir)?;
    for name in EXT_FILES {
        files.insert(
            PathBuf::from(name),
            file(name).map(<[u8]>::to_vec).unwrap_or_default(),
        );
    }
    Ok(hash_tree(&files))
}

/// Deterministic digest of a sorted path → contents map.
///
/// Path bytes are part of the digest so renames change the hash.
pub fn hash_tree(files: &BTreeMap<PathBuf, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (path, contents) in files {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update((contents.len() as u64).to_be_bytes());
        hasher.update(contents);
    }
    hex::encode(hasher.finalize())
}

/// Materialise a complete build context under `dest`.
///
/// Shell scripts are written executable.
pub fn write_build_context(dest: &Path, local_dir: Option<&Path>) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;

    for name in BASE_FILES.iter().chain(EXT_FILES.iter()) {
        if let Some(contents) = file(name) {
            write_file(&dest.join(name), contents)?;
        }
    }

    for (rel, contents) in extension_tree(local_dir)? {
        write_file(&dest.join(rel), &contents)?;
    }

    Ok(())
}

fn write_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;

    #[cfg(unix)]
    if path.extension().is_some_and(|e| e == "sh") {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_embedded_assets_present() {
        for name in BASE_FILES.iter().chain(EXT_FILES.iter()) {
            assert!(file(name).is_some(), "missing asset {name}");
        }
        let names = embedded_extension_names();
        assert!(names.contains(&"claude".to_string()));
        assert!(names.contains(&"debug".to_string()));
    }

    #[test]
    fn test_hashes_are_stable() {
        assert_eq!(base_assets_hash(), base_assets_hash());
        assert_eq!(base_assets_hash().len(), 64);
        assert_eq!(ext_assets_hash(None).unwrap(), ext_assets_hash(None).unwrap());
        assert_ne!(base_assets_hash(), ext_assets_hash(None).unwrap());
    }

    #[test]
    fn test_hash_includes_paths() {
        let mut a = BTreeMap::new();
        a.insert(PathBuf::from("a.sh"), b"echo".to_vec());
        let mut b = BTreeMap::new();
        b.insert(PathBuf::from("b.sh"), b"echo".to_vec());
        assert_ne!(hash_tree(&a), hash_tree(&b));
    }

    #[test]
    fn test_local_extension_changes_ext_hash() {
        let dir = TempDir::new().unwrap();
        let ext = dir.path().join("mine");
        fs::create_dir_all(&ext).unwrap();
        fs::write(ext.join("config.yaml"), "name: mine\nentrypoint: mine\n").unwrap();

        let with_local = ext_assets_hash(Some(dir.path())).unwrap();
        assert_ne!(with_local, ext_assets_hash(None).unwrap());
        assert_eq!(base_assets_hash(), base_assets_hash());
    }

    #[test]
    fn test_local_override_replaces_embedded_files() {
        let dir = TempDir::new().unwrap();
        let ext = dir.path().join("claude");
        fs::create_dir_all(&ext).unwrap();
        fs::write(ext.join("config.yaml"), "name: claude\nentrypoint: claude\n").unwrap();

        let tree = extension_tree(Some(dir.path())).unwrap();
        assert!(tree.contains_key(Path::new("extensions/claude/config.yaml")));
        assert!(!tree.contains_key(Path::new("extensions/claude/install.sh")));
        assert!(tree.contains_key(Path::new("extensions/codex/install.sh")));
    }

    #[test]
    fn test_write_build_context() {
        let dir = TempDir::new().unwrap();
        write_build_context(dir.path(), None).unwrap();

        assert!(dir.path().join("Dockerfile.base").is_file());
        assert!(dir.path().join("extensions/claude/config.yaml").is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("docker-entrypoint.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
