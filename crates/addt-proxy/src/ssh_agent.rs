//! SSH-agent filtering proxy.
//!
//! Sits between the sandbox and the host agent and restricts which keys the
//! sandbox can list and sign with. Wire format: every message is a 4-byte
//! big-endian length followed by a 1-byte type and the payload.

use crate::error::{ProxyError, Result};
use crate::listener::ProxyListener;
use crate::socket_dir::SocketDir;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, warn};

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;
pub const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
pub const SSH_AGENT_SIGN_RESPONSE: u8 = 14;
pub const SSH_AGENTC_ADD_IDENTITY: u8 = 17;
pub const SSH_AGENTC_REMOVE_IDENTITY: u8 = 18;
pub const SSH_AGENTC_REMOVE_ALL_IDENTITIES: u8 = 19;
pub const SSH_AGENTC_ADD_ID_CONSTRAINED: u8 = 25;

/// Socket file name inside the proxy directory.
pub const SOCKET_NAME: &str = "agent.sock";

/// Largest message accepted from either side.
const MAX_MESSAGE_LEN: usize = 256 * 1024;

/// How long to keep retrying the upstream agent.
const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const UPSTREAM_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Read one framed message body (type byte included). `None` on clean EOF.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_MESSAGE_LEN {
        return Err(ProxyError::protocol(format!("invalid message length {}", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one framed message body.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| ProxyError::protocol("message too large"))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// One key from an identities answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub blob: Vec<u8>,
    pub comment: Vec<u8>,
}

/// Cursor over SSH wire-format fields.
struct WireReader<'a> {
    data: &'a [u8],
}

impl<'a> WireReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn u32(&mut self) -> Result<u32> {
        if self.data.len() < 4 {
            return Err(ProxyError::protocol("truncated u32"));
        }
        let (head, rest) = self.data.split_at(4);
        self.data = rest;
        Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
    }

    fn string(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        if self.data.len() < len {
            return Err(ProxyError::protocol("truncated string"));
        }
        let (head, rest) = self.data.split_at(len);
        self.data = rest;
        Ok(head)
    }
}

fn put_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

/// Parse an `IDENTITIES_ANSWER` body.
pub fn parse_identities(body: &[u8]) -> Result<Vec<Identity>> {
    let (&kind, rest) = body
        .split_first()
        .ok_or_else(|| ProxyError::protocol("empty identities answer"))?;
    if kind != SSH_AGENT_IDENTITIES_ANSWER {
        return Err(ProxyError::protocol(format!(
            "expected identities answer, got type {}",
            kind
        )));
    }

    let mut reader = WireReader::new(rest);
    let count = reader.u32()? as usize;
    let mut identities = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let blob = reader.string()?.to_vec();
        let comment = reader.string()?.to_vec();
        identities.push(Identity { blob, comment });
    }
    Ok(identities)
}

/// Build an `IDENTITIES_ANSWER` body.
pub fn encode_identities(identities: &[Identity]) -> Vec<u8> {
    let mut out = vec![SSH_AGENT_IDENTITIES_ANSWER];
    out.extend_from_slice(&(identities.len() as u32).to_be_bytes());
    for id in identities {
        put_string(&mut out, &id.blob);
        put_string(&mut out, &id.comment);
    }
    out
}

/// Key blob targeted by a `SIGN_REQUEST` body.
pub fn sign_request_key(body: &[u8]) -> Result<&[u8]> {
    match body.split_first() {
        Some((&SSH_AGENTC_SIGN_REQUEST, rest)) => WireReader::new(rest).string(),
        _ => Err(ProxyError::protocol("not a sign request")),
    }
}

/// `SHA256:<base64>` fingerprint of a key blob, as printed by `ssh-add -l`.
pub fn fingerprint(blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(blob)))
}

/// Which keys the sandbox may see and use.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    blobs: HashSet<Vec<u8>>,
    fingerprints: HashSet<String>,
}

impl KeyFilter {
    /// Build a filter from allowed-key entries.
    ///
    /// An entry is a public key line (`ssh-ed25519 AAAA... comment`), a bare
    /// base64 key blob, or a `SHA256:` fingerprint. An empty list allows
    /// every key.
    pub fn new(entries: &[String]) -> Self {
        let mut filter = Self::default();
        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if entry.starts_with("SHA256:") {
                filter.fingerprints.insert(entry.to_string());
                continue;
            }

            let fields: Vec<&str> = entry.split_whitespace().collect();
            let candidate = match fields.as_slice() {
                [single] => *single,
                [_, blob, ..] => *blob,
                [] => continue,
            };
            match STANDARD.decode(candidate) {
                Ok(blob) => {
                    filter.blobs.insert(blob);
                }
                Err(_) => warn!("Ignoring unparseable allowed SSH key entry"),
            }
        }
        filter
    }

    /// True when no restriction applies.
    pub fn is_passthrough(&self) -> bool {
        self.blobs.is_empty() && self.fingerprints.is_empty()
    }

    pub fn allows(&self, blob: &[u8]) -> bool {
        self.is_passthrough()
            || self.blobs.contains(blob)
            || self.fingerprints.contains(&fingerprint(blob))
    }
}

/// Filtering proxy in front of the host SSH agent.
pub struct SshAgentProxy {
    upstream: PathBuf,
    filter: Arc<KeyFilter>,
    listener: Option<ProxyListener>,
}

impl SshAgentProxy {
    pub fn new(upstream: impl Into<PathBuf>, allowed_keys: &[String]) -> Self {
        Self {
            upstream: upstream.into(),
            filter: Arc::new(KeyFilter::new(allowed_keys)),
            listener: None,
        }
    }

    /// Bind the proxy socket in a fresh private directory.
    pub async fn start(&mut self) -> Result<()> {
        self.start_in(SocketDir::create("ssh")?).await
    }

    /// Bind the proxy socket in the given directory.
    pub async fn start_in(&mut self, socket_dir: SocketDir) -> Result<()> {
        if self.is_running() {
            let _ = socket_dir.remove();
            return Err(ProxyError::AlreadyRunning);
        }
        if !self.upstream.exists() {
            let _ = socket_dir.remove();
            return Err(ProxyError::upstream(format!(
                "SSH agent socket {} not found",
                self.upstream.display()
            )));
        }

        let upstream = self.upstream.clone();
        let filter = self.filter.clone();
        let listener = ProxyListener::bind("ssh-agent", socket_dir, SOCKET_NAME, move |client| {
            handle_connection(client, upstream.clone(), filter.clone())
        })?;
        self.listener = Some(listener);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.listener.as_ref().is_some_and(ProxyListener::is_running)
    }

    /// Socket to expose as `SSH_AUTH_SOCK`.
    pub fn socket_path(&self) -> Option<&Path> {
        self.listener.as_ref().map(ProxyListener::socket_path)
    }

    /// Directory holding the socket, for bind-mounting.
    pub fn socket_dir(&self) -> Option<&Path> {
        self.listener.as_ref().map(ProxyListener::socket_dir)
    }

    /// Close the listener and remove the socket directory. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
    }
}

/// Connect to a Unix socket, retrying until the dial timeout elapses.
pub(crate) async fn dial_unix(path: &Path) -> Result<UnixStream> {
    let deadline = tokio::time::Instant::now() + UPSTREAM_DIAL_TIMEOUT;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if tokio::time::Instant::now() >= deadline => {
                return Err(ProxyError::upstream(format!("{}: {}", path.display(), e)));
            }
            Err(e) => {
                debug!("Upstream {} not ready: {}", path.display(), e);
                tokio::time::sleep(UPSTREAM_RETRY_INTERVAL).await;
            }
        }
    }
}

async fn handle_connection(
    mut client: UnixStream,
    upstream_path: PathBuf,
    filter: Arc<KeyFilter>,
) -> Result<()> {
    let mut upstream = dial_unix(&upstream_path).await?;

    // Strictly request/response: message i is answered before i+1 is read.
    while let Some(request) = read_message(&mut client).await? {
        let reply = process_request(&request, &mut upstream, &filter).await?;
        write_message(&mut client, &reply).await?;
    }
    Ok(())
}

/// Answer one client request, consulting upstream only when allowed.
pub(crate) async fn process_request<S>(
    request: &[u8],
    upstream: &mut S,
    filter: &KeyFilter,
) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let failure = vec![SSH_AGENT_FAILURE];
    let kind = request[0];

    match kind {
        SSH_AGENTC_REQUEST_IDENTITIES => {
            let reply = forward(request, upstream).await?;
            if filter.is_passthrough() || reply.first() != Some(&SSH_AGENT_IDENTITIES_ANSWER) {
                return Ok(reply);
            }
            let identities = parse_identities(&reply)?;
            let total = identities.len();
            let allowed: Vec<Identity> = identities
                .into_iter()
                .filter(|id| filter.allows(&id.blob))
                .collect();
            debug!("SSH proxy exposing {} of {} keys", allowed.len(), total);
            Ok(encode_identities(&allowed))
        }
        SSH_AGENTC_SIGN_REQUEST => {
            let blob = sign_request_key(request)?;
            if !filter.allows(blob) {
                debug!("SSH proxy denied signature with {}", fingerprint(blob));
                return Ok(failure);
            }
            forward(request, upstream).await
        }
        SSH_AGENTC_ADD_IDENTITY
        | SSH_AGENTC_ADD_ID_CONSTRAINED
        | SSH_AGENTC_REMOVE_IDENTITY
        | SSH_AGENTC_REMOVE_ALL_IDENTITIES
            if !filter.is_passthrough() =>
        {
            debug!("SSH proxy denied key management message {}", kind);
            Ok(failure)
        }
        _ => forward(request, upstream).await,
    }
}

async fn forward<S>(request: &[u8], upstream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(upstream, request).await?;
    read_message(upstream)
        .await?
        .ok_or_else(|| ProxyError::upstream("SSH agent closed the connection"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    fn key(tag: u8) -> Identity {
        let mut blob = Vec::new();
        put_string(&mut blob, b"ssh-ed25519");
        put_string(&mut blob, &[tag; 32]);
        Identity {
            blob,
            comment: format!("key{}", tag).into_bytes(),
        }
    }

    fn sign_request(blob: &[u8]) -> Vec<u8> {
        let mut body = vec![SSH_AGENTC_SIGN_REQUEST];
        put_string(&mut body, blob);
        put_string(&mut body, b"data to sign");
        body.extend_from_slice(&0u32.to_be_bytes());
        body
    }

    /// In-process agent holding two keys; counts sign requests it sees.
    fn spawn_fake_agent(path: &Path, signs: Arc<AtomicUsize>) {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let signs = signs.clone();
                tokio::spawn(async move {
                    while let Ok(Some(msg)) = read_message(&mut stream).await {
                        let reply = match msg[0] {
                            SSH_AGENTC_REQUEST_IDENTITIES => encode_identities(&[key(1), key(2)]),
                            SSH_AGENTC_SIGN_REQUEST => {
                                signs.fetch_add(1, Ordering::SeqCst);
                                let mut r = vec![SSH_AGENT_SIGN_RESPONSE];
                                put_string(&mut r, b"signature");
                                r
                            }
                            _ => vec![SSH_AGENT_SUCCESS],
                        };
                        if write_message(&mut stream, &reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
    }

    async fn request(client: &mut UnixStream, body: &[u8]) -> Vec<u8> {
        write_message(client, body).await.unwrap();
        read_message(client).await.unwrap().unwrap()
    }

    #[test]
    fn test_identity_codec() {
        let ids = vec![key(1), key(2)];
        let encoded = encode_identities(&ids);
        assert_eq!(parse_identities(&encoded).unwrap(), ids);
        assert!(parse_identities(&[SSH_AGENT_IDENTITIES_ANSWER, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_sign_request_key() {
        let k = key(7);
        assert_eq!(sign_request_key(&sign_request(&k.blob)).unwrap(), &k.blob[..]);
        assert!(sign_request_key(&[SSH_AGENTC_REQUEST_IDENTITIES]).is_err());
    }

    #[test]
    fn test_key_filter_entries() {
        let k1 = key(1);
        let k2 = key(2);
        let line = format!("ssh-ed25519 {} me@host", STANDARD.encode(&k1.blob));

        let filter = KeyFilter::new(&[line]);
        assert!(filter.allows(&k1.blob));
        assert!(!filter.allows(&k2.blob));

        let filter = KeyFilter::new(&[fingerprint(&k2.blob)]);
        assert!(filter.allows(&k2.blob));
        assert!(!filter.allows(&k1.blob));

        let filter = KeyFilter::new(&[]);
        assert!(filter.is_passthrough());
        assert!(filter.allows(&k1.blob));
    }

    #[tokio::test]
    async fn test_proxy_filters_identities_and_signatures() {
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("upstream.sock");
        let signs = Arc::new(AtomicUsize::new(0));
        spawn_fake_agent(&upstream, signs.clone());

        let allowed = vec![STANDARD.encode(key(1).blob)];
        let mut proxy = SshAgentProxy::new(&upstream, &allowed);
        proxy
            .start_in(SocketDir::create_in(dir.path(), "ssh").unwrap())
            .await
            .unwrap();
        let socket = proxy.socket_path().unwrap().to_path_buf();

        let mut client = UnixStream::connect(&socket).await.unwrap();

        let reply = request(&mut client, &[SSH_AGENTC_REQUEST_IDENTITIES]).await;
        let ids = parse_identities(&reply).unwrap();
        assert_eq!(ids, vec![key(1)]);

        let reply = request(&mut client, &sign_request(&key(2).blob)).await;
        assert_eq!(reply, vec![SSH_AGENT_FAILURE]);
        assert_eq!(signs.load(Ordering::SeqCst), 0);

        let reply = request(&mut client, &sign_request(&key(1).blob)).await;
        assert_eq!(reply[0], SSH_AGENT_SIGN_RESPONSE);
        assert_eq!(signs.load(Ordering::SeqCst), 1);

        let reply = request(&mut client, &[SSH_AGENTC_REMOVE_ALL_IDENTITIES]).await;
        assert_eq!(reply, vec![SSH_AGENT_FAILURE]);

        let socket_dir = proxy.socket_dir().unwrap().to_path_buf();
        proxy.stop();
        proxy.stop();
        assert!(!socket_dir.exists());
    }

    #[tokio::test]
    async fn test_empty_allow_list_is_passthrough() {
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("upstream.sock");
        let signs = Arc::new(AtomicUsize::new(0));
        spawn_fake_agent(&upstream, signs.clone());

        let mut proxy = SshAgentProxy::new(&upstream, &[]);
        proxy
            .start_in(SocketDir::create_in(dir.path(), "ssh").unwrap())
            .await
            .unwrap();
        assert!(matches!(
            proxy
                .start_in(SocketDir::create_in(dir.path(), "ssh").unwrap())
                .await,
            Err(ProxyError::AlreadyRunning)
        ));

        let mut client = UnixStream::connect(proxy.socket_path().unwrap()).await.unwrap();
        let reply = request(&mut client, &[SSH_AGENTC_REQUEST_IDENTITIES]).await;
        assert_eq!(parse_identities(&reply).unwrap().len(), 2);

        let reply = request(&mut client, &sign_request(&key(2).blob)).await;
        assert_eq!(reply[0], SSH_AGENT_SIGN_RESPONSE);
        proxy.stop();
    }

    #[tokio::test]
    async fn test_missing_upstream_fails_start() {
        let dir = TempDir::new().unwrap();
        let mut proxy = SshAgentProxy::new(dir.path().join("missing.sock"), &[]);
        let err = proxy
            .start_in(SocketDir::create_in(dir.path(), "ssh").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnavailable(_)));
    }
}
