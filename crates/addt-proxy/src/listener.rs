//! Shared Unix-socket accept loop.

use crate::error::{ProxyError, Result};
use crate::socket_dir::SocketDir;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// A bound listener with its accept loop running on the tokio runtime.
///
/// Each accepted connection runs on its own task. Stopping closes the
/// listener; connections already accepted finish on their own.
#[derive(Debug)]
pub(crate) struct ProxyListener {
    name: &'static str,
    socket_dir: SocketDir,
    socket_path: PathBuf,
    running: Arc<Mutex<bool>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ProxyListener {
    /// Bind `socket_name` inside `socket_dir` and start accepting.
    pub(crate) fn bind<H, Fut>(
        name: &'static str,
        socket_dir: SocketDir,
        socket_name: &str,
        handler: H,
    ) -> Result<Self>
    where
        H: Fn(UnixStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let socket_path = socket_dir.socket(socket_name);
        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => l,
            Err(source) => {
                let _ = socket_dir.remove();
                return Err(ProxyError::Bind {
                    path: socket_path,
                    source,
                });
            }
        };

        let running = Arc::new(Mutex::new(true));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(accept_loop(
            name,
            listener,
            Arc::new(handler),
            running.clone(),
            shutdown_rx,
        ));

        info!("{} proxy listening on {}", name, socket_path.display());
        Ok(Self {
            name,
            socket_dir,
            socket_path,
            running,
            shutdown: Some(shutdown_tx),
        })
    }

    pub(crate) fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub(crate) fn socket_dir(&self) -> &Path {
        self.socket_dir.path()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.lock().map(|r| *r).unwrap_or(false)
    }

    /// Close the listener and remove the socket directory. Idempotent.
    pub(crate) fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
            debug!("{} proxy stopping", self.name);
        }
        if let Ok(mut running) = self.running.lock() {
            *running = false;
        }
        if let Err(e) = self.socket_dir.remove() {
            warn!(
                "Failed to remove {} socket directory {}: {}",
                self.name,
                self.socket_dir.path().display(),
                e
            );
        }
    }
}

impl Drop for ProxyListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop<H, Fut>(
    name: &'static str,
    listener: UnixListener,
    handler: Arc<H>,
    running: Arc<Mutex<bool>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) where
    H: Fn(UnixStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let fut = (*handler)(stream);
                        tokio::spawn(async move {
                            if let Err(e) = fut.await {
                                debug!("{} proxy connection ended: {}", name, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("{} proxy failed to accept connection: {}", name, e);
                        break;
                    }
                }
            }
            _ = &mut shutdown_rx => {
                break;
            }
        }
    }

    if let Ok(mut r) = running.lock() {
        *r = false;
    }
    info!("{} proxy shut down", name);
}
