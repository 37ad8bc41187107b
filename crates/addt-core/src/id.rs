//! Session naming and content hashing.
//!
//! Session names are derived from the workdir and the active extension set:
//!
//! ```text
//! addt-[<backend>-]<prefix>-<workdir_slug>-<hash8>[-<YYYYMMDD-HHMMSS>-<pid>]
//! ```
//!
//! where `hash8` is the first 8 hex characters of
//! `MD5(workdir + "|" + sorted_extensions_csv)`.

use chrono::{DateTime, Local};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Prefix shared by every name addt hands to a runtime.
pub const NAME_PREFIX: &str = "addt-";

/// Maximum length of the workdir slug.
const SLUG_MAX_LEN: usize = 20;

/// Hex-encoded SHA-256 of the input bytes.
pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// First 8 hex characters of `SHA-256(workdir)`, used for history directories.
pub fn history_key(workdir: &Path) -> String {
    sha256_hex(workdir.to_string_lossy().as_bytes())[..8].to_string()
}

/// Lowercased workdir basename with anything outside `[a-z0-9-]` replaced by `-`.
pub fn workdir_slug(workdir: &Path) -> String {
    let base = workdir
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let replaced: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = replaced.trim_matches('-');
    let truncated: String = trimmed.chars().take(SLUG_MAX_LEN).collect();
    let truncated = truncated.trim_end_matches('-');

    if truncated.is_empty() {
        "root".to_string()
    } else {
        truncated.to_string()
    }
}

/// `MD5(workdir + "|" + sorted_extensions_csv)` truncated to 8 hex characters.
pub fn session_hash(workdir: &Path, extensions: &[String]) -> String {
    let mut sorted: Vec<&str> = extensions.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let input = format!("{}|{}", workdir.to_string_lossy(), sorted.join(","));
    let digest = md5::compute(input.as_bytes());
    format!("{:x}", digest)[..8].to_string()
}

/// Stable name for a persistent session.
///
/// `backend` is `None` for OCI runtimes and `Some("bwrap")` for the process sandbox.
pub fn persistent_name(backend: Option<&str>, workdir: &Path, extensions: &[String]) -> String {
    format!(
        "{}{}persistent-{}-{}",
        NAME_PREFIX,
        backend_part(backend),
        workdir_slug(workdir),
        session_hash(workdir, extensions)
    )
}

/// Unique name for an ephemeral session.
pub fn ephemeral_name(
    backend: Option<&str>,
    workdir: &Path,
    extensions: &[String],
    now: DateTime<Local>,
    pid: u32,
) -> String {
    format!(
        "{}{}{}-{}-{}-{}",
        NAME_PREFIX,
        backend_part(backend),
        workdir_slug(workdir),
        session_hash(workdir, extensions),
        now.format("%Y%m%d-%H%M%S"),
        pid
    )
}

fn backend_part(backend: Option<&str>) -> String {
    match backend {
        Some(b) if !b.is_empty() => format!("{b}-"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn exts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_workdir_slug() {
        assert_eq!(workdir_slug(Path::new("/home/u/My Project")), "my-project");
        assert_eq!(workdir_slug(Path::new("/x/__weird__")), "weird");
        assert_eq!(
            workdir_slug(Path::new("/x/a-really-long-project-name-here")),
            "a-really-long-projec"
        );
        assert_eq!(workdir_slug(Path::new("/")), "root");
    }

    #[test]
    fn test_session_hash_is_order_independent() {
        let p = Path::new("/work/app");
        assert_eq!(
            session_hash(p, &exts(&["codex", "claude"])),
            session_hash(p, &exts(&["claude", "codex"]))
        );
        assert_ne!(
            session_hash(p, &exts(&["claude"])),
            session_hash(p, &exts(&["codex"]))
        );
        assert_ne!(
            session_hash(Path::new("/work/app"), &exts(&["claude"])),
            session_hash(Path::new("/other/app"), &exts(&["claude"]))
        );
    }

    #[test]
    fn test_session_hash_matches_md5_definition() {
        let p = Path::new("/work/app");
        let expected = format!("{:x}", md5::compute(b"/work/app|claude,codex"));
        assert_eq!(session_hash(p, &exts(&["codex", "claude"])), &expected[..8]);
    }

    #[test]
    fn test_persistent_name() {
        let p = Path::new("/work/app");
        let name = persistent_name(None, p, &exts(&["claude"]));
        assert!(name.starts_with("addt-persistent-app-"));
        assert_eq!(name.len(), "addt-persistent-app-".len() + 8);

        let bwrap = persistent_name(Some("bwrap"), p, &exts(&["claude"]));
        assert!(bwrap.starts_with("addt-bwrap-persistent-app-"));
        assert_eq!(persistent_name(None, p, &exts(&["claude"])), name);
    }

    #[test]
    fn test_ephemeral_name_embeds_time_and_pid() {
        let now = Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let name = ephemeral_name(None, Path::new("/w/app"), &exts(&["debug"]), now, 4242);
        assert!(name.starts_with("addt-app-"));
        assert!(name.ends_with("-20260304-050607-4242"));
    }

    #[test]
    fn test_history_key() {
        let key = history_key(Path::new("/work/app"));
        assert_eq!(key.len(), 8);
        assert_eq!(key, &sha256_hex(b"/work/app")[..8]);
    }
}
