//! Extensions: named add-ons contributing an entrypoint, install script,
//! mounts, env vars and flags.

mod manifest;
mod registry;

pub use manifest::{
    is_valid_name, scaffold_args, scaffold_install, scaffold_manifest, EnvVarSpec, Extension,
    ExtensionFlag, ExtensionMount,
};
pub use registry::ExtensionRegistry;

use crate::error::ExtensionError;
use std::fs;
use std::path::{Path, PathBuf};

/// Scaffold a new local extension under `extensions_dir/<name>`.
///
/// Refuses to overwrite an existing directory.
pub fn create_local(extensions_dir: &Path, name: &str) -> Result<PathBuf, crate::Error> {
    if !is_valid_name(name) {
        return Err(ExtensionError::Manifest {
            name: name.to_string(),
            message: "name must be lowercase [a-z0-9-] and start with a letter".to_string(),
        }
        .into());
    }

    let dir = extensions_dir.join(name);
    if dir.exists() {
        return Err(ExtensionError::AlreadyExists(dir).into());
    }

    fs::create_dir_all(&dir)?;
    fs::write(dir.join("config.yaml"), scaffold_manifest(name))?;
    fs::write(dir.join("install.sh"), scaffold_install(name))?;
    fs::write(dir.join("args.sh"), scaffold_args())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir.join("install.sh"), fs::Permissions::from_mode(0o755))?;
    }

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_local_extension() {
        let dir = TempDir::new().unwrap();
        let created = create_local(dir.path(), "mytool").unwrap();
        assert!(created.join("config.yaml").is_file());
        assert!(created.join("install.sh").is_file());

        let registry = ExtensionRegistry::load(dir.path());
        assert!(registry.get("mytool").unwrap().local);

        assert!(create_local(dir.path(), "mytool").is_err());
        assert!(create_local(dir.path(), "Bad Name").is_err());
    }
}
