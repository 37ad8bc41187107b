//! tmux socket forwarding.

use super::Forwarding;
use crate::spec::{TmuxForward, VolumeMount};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Socket path from a `TMUX` value (`socket,pid,session`).
pub fn socket_path(tmux: &str) -> Option<PathBuf> {
    let socket = tmux.split(',').next()?.trim();
    (!socket.is_empty()).then(|| PathBuf::from(socket))
}

/// Bind the tmux socket directory at the same path and forward `TMUX`/`TMUX_PANE`.
pub fn prepare(tmux: Option<&TmuxForward>) -> Forwarding {
    let mut out = Forwarding::default();
    let Some(tmux) = tmux else {
        return out;
    };
    let Some(dir) = socket_path(&tmux.tmux)
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
    else {
        warn!("tmux forwarding disabled: cannot parse TMUX");
        return out;
    };
    if !dir.is_dir() {
        warn!("tmux forwarding disabled: {} is gone", dir.display());
        return out;
    }

    out.mount(VolumeMount::new(&dir, dir.to_string_lossy().into_owned()));
    out.set_env("TMUX", tmux.tmux.clone());
    if let Some(pane) = &tmux.pane {
        out.set_env("TMUX_PANE", pane.clone());
    }
    out
}
