//! Host credential and session forwarding.
//!
//! Each forwarder turns a slice of the [`RunSpec`](crate::spec::RunSpec) into
//! mounts and environment shared by both providers. Failures of optional
//! features degrade to a single warning.

pub mod git;
pub mod github;
pub mod gpg;
pub mod ssh;
pub mod tmux;

use crate::error::Result;
use crate::session::SessionResources;
use crate::spec::{RunSpec, VolumeMount};
use addt_core::config::ProviderKind;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

/// Mounts and environment contributed by a forwarder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Forwarding {
    pub mounts: Vec<VolumeMount>,
    pub env: BTreeMap<String, String>,
}

impl Forwarding {
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.env.is_empty()
    }

    pub fn mount(&mut self, mount: VolumeMount) {
        self.mounts.push(mount);
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn extend(&mut self, other: Forwarding) {
        self.mounts.extend(other.mounts);
        self.env.extend(other.env);
    }
}

/// SSH, GPG, git and tmux forwarding for one session.
pub async fn prepare_all(
    session: &mut SessionResources,
    spec: &RunSpec,
    user_home: &Path,
    provider: ProviderKind,
) -> Result<Forwarding> {
    let mut out = ssh::prepare(
        session,
        &spec.ssh,
        spec.ssh_auth_sock.as_deref(),
        user_home,
        provider,
    )
    .await?;
    out.extend(gpg::prepare(session, &spec.gpg, user_home, spec.gnupg_home.as_deref()).await?);
    out.extend(git::prepare(spec.git_config.as_deref(), spec.git_disable_hooks));
    out.extend(tmux::prepare(spec.tmux.as_ref()));
    Ok(out)
}

/// Copy the regular files of `src` accepted by `keep` into `dest`.
///
/// Only the top level is copied; directories are copied when `keep` accepts
/// them. Returns the number of entries copied.
pub(crate) fn copy_filtered(
    src: &Path,
    dest: &Path,
    keep: impl Fn(&str, bool) -> bool,
) -> io::Result<usize> {
    let mut copied = 0;
    let entries = match fs::read_dir(src) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type()?;
        let is_dir = file_type.is_dir();
        if !(file_type.is_file() || is_dir) || !keep(&name, is_dir) {
            continue;
        }
        let target = dest.join(&name);
        if is_dir {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
        copied += 1;
    }
    Ok(copied)
}

fn copy_dir(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dest.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
