//! Filtering HTTP/CONNECT proxy for network-unshared sandboxes.
//!
//! Listens on a Unix socket; inside the sandbox `socat` bridges
//! `127.0.0.1:3128` to it. `CONNECT` requests are tunnelled after a policy
//! check, plain HTTP requests are rewritten to origin form and relayed.

use crate::error::{ProxyError, Result};
use crate::listener::ProxyListener;
use crate::policy::{normalize_host, DomainPolicy};
use crate::socket_dir::SocketDir;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;
use url::Url;

/// Socket file name inside the proxy directory.
pub const SOCKET_NAME: &str = "proxy.sock";

/// Port `socat` listens on inside the sandbox.
pub const SANDBOX_PROXY_PORT: u16 = 3128;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Headers that only concern the hop to the proxy.
const HOP_HEADERS: [&str; 5] = [
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "connection",
    "keep-alive",
];

/// Parsed request head plus any bytes read past it.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub leftover: Vec<u8>,
}

/// Read a request head terminated by an empty line. `None` on EOF.
pub(crate) async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<RequestHead>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    let end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(ProxyError::protocol("request head too large"));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::protocol("connection closed mid-request"));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..end]).into_owned();
    let leftover = buf[end + 4..].to_vec();
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::protocol(format!(
            "malformed request line '{}'",
            request_line
        )));
    };

    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Ok(Some(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        leftover,
    }))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn respond<W: AsyncWrite + Unpin>(writer: &mut W, status: &str, body: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn dial(host: &str, port: u16) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {}:{} timed out", host, port),
        )),
    }
}

/// Egress proxy enforcing a [`DomainPolicy`].
pub struct HttpProxy {
    policy: Arc<DomainPolicy>,
    listener: Option<ProxyListener>,
}

impl HttpProxy {
    pub fn new(policy: DomainPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
            listener: None,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        self.start_in(SocketDir::create("proxy")?).await
    }

    pub async fn start_in(&mut self, socket_dir: SocketDir) -> Result<()> {
        if self.is_running() {
            let _ = socket_dir.remove();
            return Err(ProxyError::AlreadyRunning);
        }
        let policy = self.policy.clone();
        let listener = ProxyListener::bind("http", socket_dir, SOCKET_NAME, move |client| {
            handle_connection(client, policy.clone())
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

async fn handle_connection(mut client: UnixStream, policy: Arc<DomainPolicy>) -> Result<()> {
    let Some(head) = read_head(&mut client).await? else {
        return Ok(());
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(client, head, &policy).await
    } else {
        handle_plain(client, head, &policy).await
    }
}

async fn handle_connect(
    mut client: UnixStream,
    head: RequestHead,
    policy: &DomainPolicy,
) -> Result<()> {
    let Some((host, port)) = split_authority(&head.target) else {
        return respond(&mut client, "400 Bad Request", "invalid CONNECT target\n").await;
    };

    if !policy.is_allowed(&host) {
        debug!("HTTP proxy denied CONNECT to {}", host);
        return respond(&mut client, "403 Forbidden", "Blocked by addt firewall\n").await;
    }

    let mut target = match dial(&host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("HTTP proxy failed to reach {}:{}: {}", host, port, e);
            return respond(&mut client, "502 Bad Gateway", "upstream unreachable\n").await;
        }
    };

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    if !head.leftover.is_empty() {
        target.write_all(&head.leftover).await?;
    }

    tokio::io::copy_bidirectional(&mut client, &mut target).await?;
    Ok(())
}

async fn handle_plain(mut client: UnixStream, head: RequestHead, policy: &DomainPolicy) -> Result<()> {
    let url = match Url::parse(&head.target) {
        Ok(url) if url.scheme() == "http" => url,
        _ => return respond(&mut client, "400 Bad Request", "absolute http:// URL required\n").await,
    };
    let Some(host) = url.host_str().map(normalize_host) else {
        return respond(&mut client, "400 Bad Request", "missing host\n").await;
    };
    let port = url.port_or_known_default().unwrap_or(80);

    if !policy.is_allowed(&host) {
        debug!("HTTP proxy denied {} {}", head.method, host);
        return respond(&mut client, "403 Forbidden", "Blocked by addt firewall\n").await;
    }

    let mut target = match dial(&host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("HTTP proxy failed to reach {}:{}: {}", host, port, e);
            return respond(&mut client, "502 Bad Gateway", "upstream unreachable\n").await;
        }
    };

    target.write_all(&origin_form_head(&head, &url)).await?;
    if !head.leftover.is_empty() {
        target.write_all(&head.leftover).await?;
    }

    tokio::io::copy_bidirectional(&mut client, &mut target).await?;
    Ok(())
}

/// Rewrite an absolute-form request for the origin server.
pub(crate) fn origin_form_head(head: &RequestHead, url: &Url) -> Vec<u8> {
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let mut out = format!("{} {} {}\r\n", head.method, path, head.version);
    let mut has_host = false;
    for (name, value) in &head.headers {
        let lower = name.to_ascii_lowercase();
        if HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if lower == "host" {
            has_host = true;
        }
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !has_host {
        let authority = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            _ => String::new(),
        };
        out.push_str(&format!("Host: {}\r\n", authority));
    }
    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

/// Split `host:port` (with optional IPv6 brackets).
fn split_authority(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
