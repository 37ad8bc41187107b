//! Signal handling around a session.
//!
//! Everything here raises real signals at the test process, so it lives in
//! its own binary and runs as a single sequential test.

#![cfg(unix)]

use addt_sandbox::orchestrator::until_interrupted;
use addt_sandbox::process::run_foreground;
use addt_sandbox::SessionResources;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::process::Command;

fn raise_later(signal: Signal, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        kill(Pid::this(), signal).unwrap();
    });
}

#[tokio::test]
async fn test_signals_relay_to_child_else_release_session() {
    // A foreground child gets the signal; addt keeps waiting for its exit.
    let mut child = Command::new("/bin/sh");
    child.arg("-c").arg("trap 'exit 7' TERM; while :; do sleep 0.1; done");
    raise_later(Signal::SIGTERM, Duration::from_millis(500));
    let code = until_interrupted(run_foreground(child, None)).await.unwrap();
    assert_eq!(code, 7);

    // Outside a child, e.g. during a build, the work is abandoned.
    let mut session = SessionResources::new();
    let secrets = session.temp_dir("secrets").unwrap();
    let proxy = session.temp_dir("ssh").unwrap();
    raise_later(Signal::SIGINT, Duration::from_millis(200));
    let code = until_interrupted(async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(0)
    })
    .await
    .unwrap();
    assert_eq!(code, 130);

    session.cleanup();
    assert!(!secrets.exists());
    assert!(!proxy.exists());

    raise_later(Signal::SIGTERM, Duration::from_millis(200));
    let code = until_interrupted(std::future::pending()).await.unwrap();
    assert_eq!(code, 143);
}
