//! GPG-agent (Assuan) filtering proxy.
//!
//! Assuan is line oriented: each command is one `\n` terminated line and a
//! response is any number of status/data lines ending in `OK`, `ERR` or
//! `END`. The proxy tracks the key selected with `SIGKEY`/`SETKEY` and refuses
//! `PKSIGN`/`PKDECRYPT` for keys outside the allowed list.

use crate::error::{ProxyError, Result};
use crate::listener::ProxyListener;
use crate::socket_dir::SocketDir;
use crate::ssh_agent::dial_unix;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

/// Socket file name inside the proxy directory.
pub const SOCKET_NAME: &str = "S.gpg-agent";

/// Reply sent when a key is refused.
pub const DENIED_REPLY: &str = "ERR 67108903 Key not allowed by proxy\n";

/// Longest Assuan line accepted (the protocol limit is 1000 bytes).
const MAX_LINE_LEN: usize = 64 * 1024;

/// Locate the host gpg-agent socket.
///
/// Asks `gpgconf` first, then falls back to `$GNUPGHOME`, `~/.gnupg` and
/// `/run/user/<uid>/gnupg`.
pub fn find_upstream_socket(gnupg_home: Option<&Path>, user_home: &Path) -> Option<PathBuf> {
    if let Ok(output) = Command::new("gpgconf")
        .args(["--list-dirs", "agent-socket"])
        .output()
    {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() && Path::new(&path).exists() {
                return Some(PathBuf::from(path));
            }
        }
    }

    let mut candidates = Vec::new();
    if let Some(home) = gnupg_home {
        candidates.push(home.join("S.gpg-agent"));
    }
    candidates.push(user_home.join(".gnupg").join("S.gpg-agent"));
    #[cfg(unix)]
    candidates.push(
        PathBuf::from(format!("/run/user/{}", nix::unistd::getuid()))
            .join("gnupg")
            .join("S.gpg-agent"),
    );

    candidates.into_iter().find(|p| p.exists())
}

/// Normalize a key ID or fingerprint for comparison.
fn normalize_key(id: &str) -> String {
    let id = id.trim();
    let id = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .unwrap_or(id);
    id.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Which keys the sandbox may sign or decrypt with.
#[derive(Debug, Clone, Default)]
pub struct KeyIdFilter {
    allowed: Vec<String>,
}

impl KeyIdFilter {
    /// An empty list allows every key.
    pub fn new(allowed: &[String]) -> Self {
        Self {
            allowed: allowed
                .iter()
                .map(|k| normalize_key(k))
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Whether `current` (the selected key, possibly empty) may be used.
    ///
    /// Matches on equality, or either side being a suffix of the other so
    /// short and long key IDs match full fingerprints.
    pub fn allows(&self, current: &str) -> bool {
        if self.is_passthrough() {
            return true;
        }
        let current = normalize_key(current);
        if current.is_empty() {
            return false;
        }
        self.allowed
            .iter()
            .any(|a| *a == current || current.ends_with(a.as_str()) || a.ends_with(&current))
    }
}

/// Per-connection Assuan state.
#[derive(Debug, Default)]
pub(crate) struct AssuanSession {
    current_key: String,
}

/// What to do with one client command line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    Forward,
    Deny,
}

impl AssuanSession {
    /// Inspect a client line, updating the selected key.
    pub(crate) fn inspect(&mut self, line: &str, filter: &KeyIdFilter) -> Verdict {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let mut parts = trimmed.splitn(2, ' ');
        let command = parts.next().unwrap_or("").to_ascii_uppercase();
        let arg = parts.next().unwrap_or("").trim();

        match command.as_str() {
            "SIGKEY" | "SETKEY" => {
                self.current_key = arg.to_string();
                Verdict::Forward
            }
            "PKSIGN" | "PKDECRYPT" => {
                if filter.allows(&self.current_key) {
                    Verdict::Forward
                } else {
                    debug!(
                        "GPG proxy denied {} with key '{}'",
                        command, self.current_key
                    );
                    Verdict::Deny
                }
            }
            _ => Verdict::Forward,
        }
    }
}

/// Whether an upstream line ends a response.
pub(crate) fn is_terminator(line: &str) -> bool {
    let line = line.trim_end_matches(['\r', '\n']);
    line == "OK"
        || line.starts_with("OK ")
        || line == "ERR"
        || line.starts_with("ERR ")
        || line == "END"
}

fn is_inquire(line: &str) -> bool {
    line.starts_with("INQUIRE ")
}

/// Read one line including its `\n`. `None` on EOF.
///
/// At most `MAX_LINE_LEN + 1` bytes are buffered before the line is rejected.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() > MAX_LINE_LEN {
        return Err(ProxyError::protocol("Assuan line too long"));
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Filtering proxy in front of the host gpg-agent.
pub struct GpgAgentProxy {
    upstream: PathBuf,
    filter: Arc<KeyIdFilter>,
    listener: Option<ProxyListener>,
}

impl GpgAgentProxy {
    pub fn new(upstream: impl Into<PathBuf>, allowed_key_ids: &[String]) -> Self {
        Self {
            upstream: upstream.into(),
            filter: Arc::new(KeyIdFilter::new(allowed_key_ids)),
            listener: None,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        self.start_in(SocketDir::create("gpg")?).await
    }

    pub async fn start_in(&mut self, socket_dir: SocketDir) -> Result<()> {
        if self.is_running() {
            let _ = socket_dir.remove();
            return Err(ProxyError::AlreadyRunning);
        }
        if !self.upstream.exists() {
            let _ = socket_dir.remove();
            return Err(ProxyError::upstream(format!(
                "gpg-agent socket {} not found",
                self.upstream.display()
            )));
        }

        let upstream = self.upstream.clone();
        let filter = self.filter.clone();
        let listener = ProxyListener::bind("gpg-agent", socket_dir, SOCKET_NAME, move |client| {
            handle_connection(client, upstream.clone(), filter.clone())
        })?;
        self.listener = Some(listener);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.listener.as_ref().is_some_and(ProxyListener::is_running)
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.listener.as_ref().map(ProxyListener::socket_path)
    }

    pub fn socket_dir(&self) -> Option<&Path> {
        self.listener.as_ref().map(ProxyListener::socket_dir)
    }

    pub fn stop(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
    }
}

async fn handle_connection(
    client: UnixStream,
    upstream_path: PathBuf,
    filter: Arc<KeyIdFilter>,
) -> Result<()> {
    let upstream = dial_unix(&upstream_path).await?;
    let (client_read, mut client_write) = client.into_split();
    let (upstream_read, mut upstream_write) = upstream.into_split();
    let mut client_read = BufReader::new(client_read);
    let mut upstream_read = BufReader::new(upstream_read);

    // Greeting.
    relay_response(
        &mut upstream_read,
        &mut client_write,
        &mut client_read,
        &mut upstream_write,
    )
    .await?;

    let mut session = AssuanSession::default();
    while let Some(line) = read_line(&mut client_read).await? {
        match session.inspect(&line, &filter) {
            Verdict::Deny => write_line(&mut client_write, DENIED_REPLY).await?,
            Verdict::Forward => {
                write_line(&mut upstream_write, &line).await?;
                let closed = relay_response(
                    &mut upstream_read,
                    &mut client_write,
                    &mut client_read,
                    &mut upstream_write,
                )
                .await?;
                if closed {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Copy upstream lines to the client until a terminator.
///
/// `INQUIRE` lines hand the turn to the client: its data lines are relayed
/// upstream until it sends `END` or `CAN`. Returns `true` if upstream closed.
async fn relay_response<UR, CW, CR, UW>(
    upstream_read: &mut UR,
    client_write: &mut CW,
    client_read: &mut CR,
    upstream_write: &mut UW,
) -> Result<bool>
where
    UR: AsyncBufRead + Unpin,
    CW: AsyncWrite + Unpin,
    CR: AsyncBufRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    loop {
        let Some(line) = read_line(upstream_read).await? else {
            return Ok(true);
        };
        write_line(client_write, &line).await?;

        if is_terminator(&line) {
            return Ok(false);
        }
        if is_inquire(&line) {
            loop {
                let Some(reply) = read_line(client_read).await? else {
                    return Ok(true);
                };
                write_line(upstream_write, &reply).await?;
                let trimmed = reply.trim_end_matches(['\r', '\n']);
                if trimmed == "END" || trimmed == "CAN" {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    const FPR: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

    #[test]
    fn test_key_matching() {
        let filter = KeyIdFilter::new(&["89abcdef01234567".to_string()]);
        assert!(filter.allows(FPR));
        assert!(filter.allows("0x89ABCDEF01234567"));
        assert!(filter.allows("01234567"));
        assert!(!filter.allows("FFFFFFFFFFFFFFFF"));
        assert!(!filter.allows(""));

        let open = KeyIdFilter::new(&[]);
        assert!(open.allows(""));
        assert!(open.allows(FPR));
    }

    #[test]
    fn test_session_tracks_key() {
        let filter = KeyIdFilter::new(&[FPR.to_string()]);
        let mut session = AssuanSession::default();

        assert_eq!(session.inspect("PKSIGN\n", &filter), Verdict::Deny);
        assert_eq!(session.inspect(&format!("SIGKEY {}\n", FPR), &filter), Verdict::Forward);
        assert_eq!(session.inspect("pksign\n", &filter), Verdict::Forward);
        assert_eq!(session.inspect("SETKEY DEADBEEF\n", &filter), Verdict::Forward);
        assert_eq!(session.inspect("PKDECRYPT\n", &filter), Verdict::Deny);
        assert_eq!(session.inspect("GETINFO version\n", &filter), Verdict::Forward);
    }

    #[tokio::test]
    async fn test_overlong_line_is_bounded() {
        let mut input: &[u8] = b"GETINFO version\n";
        assert_eq!(read_line(&mut input).await.unwrap().unwrap(), "GETINFO version\n");
        assert!(read_line(&mut input).await.unwrap().is_none());

        let flood = vec![b'A'; 4 * MAX_LINE_LEN];
        let mut input: &[u8] = &flood;
        assert!(read_line(&mut input).await.is_err());
        assert_eq!(input.len(), flood.len() - MAX_LINE_LEN - 1);
    }

    #[test]
    fn test_terminators() {
        assert!(is_terminator("OK\n"));
        assert!(is_terminator("OK Pleased to meet you\n"));
        assert!(is_terminator("ERR 1 nope\n"));
        assert!(is_terminator("END\n"));
        assert!(!is_terminator("S PROGRESS\n"));
        assert!(!is_terminator("D data\n"));
        assert!(!is_terminator("OKAY\n"));
    }

    /// Scripted agent: greets, answers PKSIGN with data and counts them.
    fn spawn_fake_agent(path: &Path, signs: Arc<AtomicUsize>) {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let signs = signs.clone();
                tokio::spawn(async move {
                    let (r, mut w) = stream.into_split();
                    let mut r = BufReader::new(r);
                    w.write_all(b"OK Pleased to meet you\n").await.unwrap();
                    while let Ok(Some(line)) = read_line(&mut r).await {
                        let reply: &[u8] = if line.starts_with("PKSIGN") {
                            signs.fetch_add(1, Ordering::SeqCst);
                            b"S INQUIRE_MAXLEN 1024\nD (7:sig-val)\nOK\n"
                        } else {
                            b"OK\n"
                        };
                        if w.write_all(reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
    }

    async fn exchange(
        reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
        writer: &mut tokio::net::unix::OwnedWriteHalf,
        line: &str,
    ) -> Vec<String> {
        writer.write_all(line.as_bytes()).await.unwrap();
        let mut lines = Vec::new();
        loop {
            let l = read_line(reader).await.unwrap().unwrap();
            let done = is_terminator(&l);
            lines.push(l);
            if done {
                return lines;
            }
        }
    }

    #[tokio::test]
    async fn test_proxy_denies_unlisted_key() {
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("S.upstream");
        let signs = Arc::new(AtomicUsize::new(0));
        spawn_fake_agent(&upstream, signs.clone());

        let mut proxy = GpgAgentProxy::new(&upstream, &["01234567".to_string()]);
        proxy
            .start_in(SocketDir::create_in(dir.path(), "gpg").unwrap())
            .await
            .unwrap();
        assert!(proxy.socket_path().unwrap().ends_with(SOCKET_NAME));

        let stream = UnixStream::connect(proxy.socket_path().unwrap()).await.unwrap();
        let (r, mut w) = stream.into_split();
        let mut r = BufReader::new(r);

        let greeting = read_line(&mut r).await.unwrap().unwrap();
        assert!(greeting.starts_with("OK"));

        exchange(&mut r, &mut w, "SIGKEY AAAAAAAAAAAAAAAA\n").await;
        let reply = exchange(&mut r, &mut w, "PKSIGN\n").await;
        assert_eq!(reply, vec![DENIED_REPLY.to_string()]);
        assert_eq!(signs.load(Ordering::SeqCst), 0);

        exchange(&mut r, &mut w, &format!("SIGKEY {}\n", FPR)).await;
        let reply = exchange(&mut r, &mut w, "PKSIGN\n").await;
        assert_eq!(reply.last().unwrap(), "OK\n");
        assert!(reply.iter().any(|l| l.starts_with("D ")));
        assert_eq!(signs.load(Ordering::SeqCst), 1);

        proxy.stop();
    }
}
