//! Foreground child processes: runtime clients, `bwrap`, builds and probes.

use crate::error::{Result, SandboxError};
use std::process::{ExitStatus, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Set while [`run_foreground`] has a child; signals then belong to the child.
static FOREGROUND: AtomicBool = AtomicBool::new(false);

struct ForegroundGuard;

impl ForegroundGuard {
    fn enter() -> Self {
        FOREGROUND.store(true, Ordering::SeqCst);
        Self
    }
}

impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        FOREGROUND.store(false, Ordering::SeqCst);
    }
}

/// Resolves when addt itself should stop: SIGINT, SIGTERM or SIGHUP arrived
/// while no foreground child was running. Yields `128 + signo`.
pub async fn interrupted() -> Result<i32> {
    #[cfg(unix)]
    {
        let mut signals = signals::Relay::new()?;
        loop {
            let signal = signals.recv().await;
            if FOREGROUND.load(Ordering::SeqCst) {
                continue;
            }
            debug!("Received {} outside a foreground child", signal);
            return Ok(128 + signal as i32);
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(130)
    }
}

/// Exit code of a finished process; `128 + signo` when killed by a signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

fn program(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

fn spawn_error(cmd: &Command, e: std::io::Error) -> SandboxError {
    let program = program(cmd);
    if e.kind() == std::io::ErrorKind::NotFound {
        SandboxError::prerequisite(program, "Install it or check PATH.")
    } else {
        SandboxError::Io(e)
    }
}

/// Run a command to completion, capturing stdout and stderr.
pub async fn capture(mut cmd: Command) -> Result<Output> {
    debug!("Executing {:?}", cmd.as_std());
    cmd.stdin(Stdio::null());
    cmd.output().await.map_err(|e| spawn_error(&cmd, e))
}

/// Run a command with inherited stdio and return its exit status.
pub async fn status(mut cmd: Command) -> Result<ExitStatus> {
    debug!("Executing {:?}", cmd.as_std());
    cmd.status().await.map_err(|e| spawn_error(&cmd, e))
}

/// Run the sandbox client in the foreground.
///
/// SIGINT, SIGTERM and SIGHUP received by addt are relayed to the child.
/// When `time_limit` elapses the child gets SIGTERM and, after
/// [`KILL_GRACE`], SIGKILL. Returns the child's exit code.
pub async fn run_foreground(mut cmd: Command, time_limit: Option<Duration>) -> Result<i32> {
    debug!("Executing {:?}", cmd.as_std());
    let mut child = cmd.spawn().map_err(|e| spawn_error(&cmd, e))?;
    let _foreground = ForegroundGuard::enter();

    let deadline = async {
        match time_limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    #[cfg(unix)]
    let mut signals = signals::Relay::new()?;

    loop {
        #[cfg(unix)]
        let relay = signals.recv();
        #[cfg(not(unix))]
        let relay = std::future::pending::<()>();

        tokio::select! {
            status = child.wait() => return Ok(exit_code(status?)),
            _ = &mut deadline => {
                warn!("Time limit reached, stopping the sandbox");
                return terminate(&mut child).await;
            }
            signal = relay => {
                #[cfg(unix)]
                signals::send(child.id(), signal);
                #[cfg(not(unix))]
                let _ = signal;
            }
        }
    }
}

/// SIGTERM, then SIGKILL after the grace period.
async fn terminate(child: &mut Child) -> Result<i32> {
    #[cfg(unix)]
    signals::send(child.id(), nix::sys::signal::Signal::SIGTERM);
    #[cfg(not(unix))]
    child.start_kill()?;

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(status) => Ok(exit_code(status?)),
        Err(_) => {
            warn!("Sandbox ignored SIGTERM, killing it");
            child.kill().await?;
            Ok(exit_code(child.wait().await?))
        }
    }
}

#[cfg(unix)]
mod signals {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::debug;

    /// Signals addt relays to its foreground child.
    pub(super) struct Relay {
        interrupt: tokio::signal::unix::Signal,
        terminate: tokio::signal::unix::Signal,
        hangup: tokio::signal::unix::Signal,
    }

    impl Relay {
        pub(super) fn new() -> std::io::Result<Self> {
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
                hangup: signal(SignalKind::hangup())?,
            })
        }

        pub(super) async fn recv(&mut self) -> Signal {
            tokio::select! {
                _ = self.interrupt.recv() => Signal::SIGINT,
                _ = self.terminate.recv() => Signal::SIGTERM,
                _ = self.hangup.recv() => Signal::SIGHUP,
            }
        }
    }

    pub(super) fn send(pid: Option<u32>, signal: Signal) {
        let Some(pid) = pid else {
            return;
        };
        debug!("Relaying {} to {}", signal, pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
            debug!("Failed to signal {}: {}", pid, e);
        }
    }
}
