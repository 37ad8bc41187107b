//! Egress domain policy.

use std::fmt;
use std::str::FromStr;

/// How hosts missing from both lists are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PolicyMode {
    /// Only listed hosts are reachable.
    #[default]
    Strict,
    /// Everything not denied is reachable.
    Permissive,
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Permissive => write!(f, "permissive"),
        }
    }
}

impl FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "permissive" => Ok(Self::Permissive),
            other => Err(format!("unknown firewall mode '{}'", other)),
        }
    }
}

const LOOPBACK: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// Allow/deny lists with exact and `*.suffix` patterns.
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    mode: PolicyMode,
    allowed: Vec<String>,
    denied: Vec<String>,
}

impl DomainPolicy {
    pub fn new(mode: PolicyMode, allowed: &[String], denied: &[String]) -> Self {
        let clean = |list: &[String]| -> Vec<String> {
            list.iter()
                .map(|p| p.trim().trim_end_matches('.').to_ascii_lowercase())
                .filter(|p| !p.is_empty() && !p.starts_with('#'))
                .collect()
        };
        Self {
            mode,
            allowed: clean(allowed),
            denied: clean(denied),
        }
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    /// Whether connections to `host` are allowed. Denials always win.
    pub fn is_allowed(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if LOOPBACK.contains(&host.as_str()) {
            return true;
        }
        if self.denied.iter().any(|p| pattern_matches(p, &host)) {
            return false;
        }
        match self.mode {
            PolicyMode::Permissive => true,
            PolicyMode::Strict => self.allowed.iter().any(|p| pattern_matches(p, &host)),
        }
    }
}

/// Lowercase a host, dropping any port, IPv6 brackets and trailing dot.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        host
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// `*.x.y` matches any subdomain of `x.y` but not `x.y` itself.
fn pattern_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .strip_suffix(suffix)
            .is_some_and(|head| head.len() > 1 && head.ends_with('.')),
        None => pattern == host,
    }
}
