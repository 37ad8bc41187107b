//! Private socket directories.
//!
//! Every proxy listens inside its own `0700` directory under the system temp
//! dir. The directory records its owning process in `owner.pid` so stale
//! directories left by a crashed run can be told apart from live ones.

use rand::Rng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the file recording the owning process.
pub const PID_FILE: &str = "owner.pid";

/// A `0700` directory removed by [`SocketDir::remove`].
#[derive(Debug)]
pub struct SocketDir {
    path: PathBuf,
}

impl SocketDir {
    /// Create `addt-<label>-<pid>-<random>` under the system temp dir.
    pub fn create(label: &str) -> io::Result<Self> {
        Self::create_in(&std::env::temp_dir(), label)
    }

    /// Create the directory under `parent`.
    pub fn create_in(parent: &Path, label: &str) -> io::Result<Self> {
        let suffix: u32 = rand::thread_rng().gen();
        let path = parent.join(format!(
            "addt-{}-{}-{:08x}",
            label,
            std::process::id(),
            suffix
        ));

        create_private_dir(&path)?;
        fs::write(path.join(PID_FILE), format!("{}\n", std::process::id()))?;

        debug!("Created socket directory {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a socket inside the directory.
    pub fn socket(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Remove the directory and everything in it. Safe to call repeatedly.
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {
                debug!("Removed socket directory {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Create a directory readable only by the current user.
pub fn create_private_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)?;
        // `mode` is filtered by the umask; set it explicitly.
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    #[cfg(not(unix))]
    fs::create_dir_all(path)?;

    Ok(())
}
