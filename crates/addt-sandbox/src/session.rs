//! Session-scoped resources and their teardown.
//!
//! A session owns every temp directory and proxy created while preparing a
//! run. [`SessionResources::cleanup`] releases all of them and may be called
//! any number of times.
//!
//! Persistent OCI sessions place their directories under a stable root that
//! is bound into the container once; the root itself outlives the session.

use addt_proxy::{GpgAgentProxy, HttpProxy, SocketDir, SshAgentProxy};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Temp directories and proxies owned by one session.
#[derive(Default)]
pub struct SessionResources {
    root: Option<PathBuf>,
    temp_dirs: Vec<SocketDir>,
    ssh_proxy: Option<SshAgentProxy>,
    gpg_proxy: Option<GpgAgentProxy>,
    http_proxy: Option<HttpProxy>,
}

impl SessionResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session whose directories live under `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> io::Result<Self> {
        let mut session = Self::default();
        session.set_root(root)?;
        Ok(session)
    }

    /// Move future directories under `root`. Directories already created stay where they are.
    pub fn set_root(&mut self, root: impl Into<PathBuf>) -> io::Result<()> {
        let root = root.into();
        addt_proxy::socket_dir::create_private_dir(&root)?;
        self.root = Some(root);
        Ok(())
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// A fresh `0700` directory, untracked; proxies take ownership of these.
    pub fn socket_dir(&self, label: &str) -> io::Result<SocketDir> {
        match &self.root {
            Some(root) => SocketDir::create_in(root, label),
            None => SocketDir::create(label),
        }
    }

    /// Create a tracked `0700` temp directory with an owner PID file.
    pub fn temp_dir(&mut self, label: &str) -> io::Result<PathBuf> {
        let dir = self.socket_dir(label)?;
        let path = dir.path().to_path_buf();
        self.temp_dirs.push(dir);
        Ok(path)
    }

    /// Track a directory created elsewhere (tests, callers with their own parent).
    pub fn track(&mut self, dir: SocketDir) -> PathBuf {
        let path = dir.path().to_path_buf();
        self.temp_dirs.push(dir);
        path
    }

    pub fn temp_dirs(&self) -> Vec<&Path> {
        self.temp_dirs.iter().map(SocketDir::path).collect()
    }

    pub fn set_ssh_proxy(&mut self, proxy: SshAgentProxy) {
        if let Some(mut old) = self.ssh_proxy.replace(proxy) {
            old.stop();
        }
    }

    pub fn set_gpg_proxy(&mut self, proxy: GpgAgentProxy) {
        if let Some(mut old) = self.gpg_proxy.replace(proxy) {
            old.stop();
        }
    }

    pub fn set_http_proxy(&mut self, proxy: HttpProxy) {
        if let Some(mut old) = self.http_proxy.replace(proxy) {
            old.stop();
        }
    }

    pub fn has_proxies(&self) -> bool {
        self.ssh_proxy.is_some() || self.gpg_proxy.is_some() || self.http_proxy.is_some()
    }

    /// Stop proxies and remove every tracked directory. Idempotent.
    pub fn cleanup(&mut self) {
        if let Some(mut proxy) = self.ssh_proxy.take() {
            proxy.stop();
        }
        if let Some(mut proxy) = self.gpg_proxy.take() {
            proxy.stop();
        }
        if let Some(mut proxy) = self.http_proxy.take() {
            proxy.stop();
        }

        for dir in self.temp_dirs.drain(..) {
            match dir.remove() {
                Ok(()) => debug!("Removed session directory {}", dir.path().display()),
                Err(e) => warn!("Failed to remove {}: {}", dir.path().display(), e),
            }
        }
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        self.cleanup();
    }
}
