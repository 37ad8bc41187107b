//! Egress firewall lists and their per-session rendering.
//!
//! Global lists live in `<addt_home>/firewall/` as one entry per line.
//! Project lists live in `.addt.yaml` under `firewall.allowed` and
//! `firewall.denied`. A session gets a merged copy of both, bound read-only
//! at `/etc/addt/firewall` for `init-firewall.sh`.

use crate::session::SessionResources;
use crate::spec::VolumeMount;
use addt_core::config::FirewallMode;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const ALLOWED_DOMAINS_FILE: &str = "allowed-domains.txt";
pub const DENIED_DOMAINS_FILE: &str = "denied-domains.txt";
pub const ALLOWED_PORTS_FILE: &str = "allowed-ports.txt";

/// Mount point of the session rules inside the container.
pub const RULES_MOUNT: &str = "/etc/addt/firewall";

/// Seed for a fresh global allow list.
pub const DEFAULT_ALLOWED_DOMAINS: &[&str] = &[
    "api.anthropic.com",
    "statsig.anthropic.com",
    "sentry.io",
    "api.openai.com",
    "generativelanguage.googleapis.com",
    "github.com",
    "*.github.com",
    "*.githubusercontent.com",
    "registry.npmjs.org",
    "pypi.org",
    "files.pythonhosted.org",
    "proxy.golang.org",
    "sum.golang.org",
];

/// Ports open under pasta strict mode unless `allowed-ports.txt` says otherwise.
pub const DEFAULT_ALLOWED_PORTS: &[u16] = &[22, 53, 80, 443];

/// Which list an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Allowed,
    Denied,
}

impl ListKind {
    fn file_name(self) -> &'static str {
        match self {
            Self::Allowed => ALLOWED_DOMAINS_FILE,
            Self::Denied => DENIED_DOMAINS_FILE,
        }
    }

    /// Config key holding the project list.
    pub fn config_key(self) -> &'static str {
        match self {
            Self::Allowed => "firewall.allowed",
            Self::Denied => "firewall.denied",
        }
    }
}

/// Parse a list file: one entry per line, `#` comments, blank lines ignored.
pub fn parse_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Global firewall lists in a directory.
#[derive(Debug, Clone)]
pub struct FirewallLists {
    dir: PathBuf,
}

impl FirewallLists {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory and seed the allow list if it does not exist.
    pub fn ensure_defaults(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let allowed = self.dir.join(ALLOWED_DOMAINS_FILE);
        if !allowed.exists() {
            let mut content = String::from("# Domains reachable when the firewall is enabled\n");
            for domain in DEFAULT_ALLOWED_DOMAINS {
                content.push_str(domain);
                content.push('\n');
            }
            fs::write(allowed, content)?;
        }
        Ok(())
    }

    pub fn read(&self, kind: ListKind) -> io::Result<Vec<String>> {
        match fs::read_to_string(self.dir.join(kind.file_name())) {
            Ok(content) => Ok(parse_list(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Add an entry, returning false if it was already present.
    pub fn add(&self, kind: ListKind, entry: &str) -> io::Result<bool> {
        let entry = entry.trim().to_ascii_lowercase();
        let mut entries = self.read(kind)?;
        if entries.contains(&entry) {
            return Ok(false);
        }
        entries.push(entry);
        self.write(kind, &entries)?;
        Ok(true)
    }

    /// Remove an entry from a list, returning whether it was present.
    pub fn remove(&self, kind: ListKind, entry: &str) -> io::Result<bool> {
        let entry = entry.trim().to_ascii_lowercase();
        let mut entries = self.read(kind)?;
        let before = entries.len();
        entries.retain(|e| *e != entry);
        if entries.len() == before {
            return Ok(false);
        }
        self.write(kind, &entries)?;
        Ok(true)
    }

    fn write(&self, kind: ListKind, entries: &[String]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(kind.file_name());
        let temp = path.with_extension("txt.tmp");
        let mut content = entries.join("\n");
        content.push('\n');
        fs::write(&temp, content)?;
        fs::rename(&temp, &path)
    }

    /// Ports for pasta strict mode.
    pub fn allowed_ports(&self) -> io::Result<Vec<u16>> {
        match fs::read_to_string(self.dir.join(ALLOWED_PORTS_FILE)) {
            Ok(content) => Ok(parse_list(&content)
                .iter()
                .filter_map(|p| p.parse().ok())
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DEFAULT_ALLOWED_PORTS.to_vec()),
            Err(e) => Err(e),
        }
    }
}

/// Union of two lists, order preserved, duplicates dropped.
pub fn merge(first: &[String], second: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for entry in first.iter().chain(second) {
        let entry = entry.trim().to_ascii_lowercase();
        if !entry.is_empty() && !out.contains(&entry) {
            out.push(entry);
        }
    }
    out
}

/// Write the effective lists into `dir`, creating it world-readable.
pub fn write_rules(dir: &Path, allowed: &[String], denied: &[String]) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let render = |entries: &[String]| {
        let mut s = entries.join("\n");
        s.push('\n');
        s
    };
    fs::write(dir.join(ALLOWED_DOMAINS_FILE), render(allowed))?;
    fs::write(dir.join(DENIED_DOMAINS_FILE), render(denied))?;
    #[cfg(unix)]
    {
        // The container user differs from the host user.
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Write the effective lists to a session directory and return its mount.
pub fn session_rules(
    session: &mut SessionResources,
    allowed: &[String],
    denied: &[String],
) -> io::Result<VolumeMount> {
    let dir = session.temp_dir("firewall")?;
    write_rules(&dir, allowed, denied)?;
    Ok(VolumeMount::new(dir, RULES_MOUNT).readonly(true).required())
}

/// Podman `--network` value enforcing the firewall with pasta.
pub fn pasta_network(mode: FirewallMode, ports: &[u16]) -> String {
    match mode {
        FirewallMode::Permissive => "pasta".to_string(),
        FirewallMode::Strict => {
            let mut value = String::from("pasta:");
            let opts: Vec<String> = ports.iter().map(|p| format!("-T,{}", p)).collect();
            value.push_str(&opts.join(","));
            value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_global_list_editing() {
        let dir = TempDir::new().unwrap();
        let lists = FirewallLists::new(dir.path().join("firewall"));
        lists.ensure_defaults().unwrap();

        let allowed = lists.read(ListKind::Allowed).unwrap();
        assert!(allowed.contains(&"api.anthropic.com".to_string()));

        assert!(lists.add(ListKind::Denied, "Evil.COM").unwrap());
        assert!(!lists.add(ListKind::Denied, "evil.com").unwrap());
        assert_eq!(lists.read(ListKind::Denied).unwrap(), vec!["evil.com"]);

        assert!(lists.remove(ListKind::Denied, "evil.com").unwrap());
        assert!(!lists.remove(ListKind::Denied, "evil.com").unwrap());
        assert!(lists.read(ListKind::Denied).unwrap().is_empty());

        // Seeding never clobbers edits.
        lists.remove(ListKind::Allowed, "sentry.io").unwrap();
        lists.ensure_defaults().unwrap();
        assert!(!lists.read(ListKind::Allowed).unwrap().contains(&"sentry.io".to_string()));
    }

    #[test]
    fn test_parse_and_merge() {
        assert_eq!(
            parse_list("# c\n\n a.com \nB.com\n"),
            vec!["a.com".to_string(), "b.com".to_string()]
        );
        let merged = merge(
            &["a.com".to_string(), "b.com".to_string()],
            &["B.com".to_string(), "c.com".to_string()],
        );
        assert_eq!(merged, vec!["a.com", "b.com", "c.com"]);
    }

    #[test]
    fn test_allowed_ports() {
        let dir = TempDir::new().unwrap();
        let lists = FirewallLists::new(dir.path());
        assert_eq!(lists.allowed_ports().unwrap(), DEFAULT_ALLOWED_PORTS.to_vec());
        fs::write(dir.path().join(ALLOWED_PORTS_FILE), "443\n# ssh\n8443\nnope\n").unwrap();
        assert_eq!(lists.allowed_ports().unwrap(), vec![443, 8443]);
    }

    #[test]
    fn test_pasta_network() {
        assert_eq!(pasta_network(FirewallMode::Permissive, &[443]), "pasta");
        assert_eq!(
            pasta_network(FirewallMode::Strict, &[53, 443]),
            "pasta:-T,53,-T,443"
        );
    }

    #[test]
    fn test_session_rules() {
        let mut session = SessionResources::new();
        let mount = session_rules(
            &mut session,
            &["github.com".to_string()],
            &["evil.com".to_string()],
        )
        .unwrap();
        assert_eq!(mount.target, RULES_MOUNT);
        assert!(mount.readonly);
        assert_eq!(
            fs::read_to_string(mount.source.join(ALLOWED_DOMAINS_FILE)).unwrap(),
            "github.com\n"
        );
        session.cleanup();
        assert!(!mount.source.exists());
    }
}
