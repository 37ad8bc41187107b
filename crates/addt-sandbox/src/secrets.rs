//! Secret materialisation.
//!
//! With `security.isolate_secrets` on, sensitive variables never appear on
//! the runtime command line. Each one is written to its own file in a `0700`
//! directory bound at `/run/secrets`, together with a `.secrets` script the
//! entrypoint sources once, scrubs and unlinks.

use crate::session::SessionResources;
use crate::spec::VolumeMount;
use addt_core::SecretString;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// Mount point of the secrets directory.
pub const SECRETS_MOUNT: &str = "/run/secrets";

/// File sourced by the entrypoint.
pub const SECRETS_SCRIPT: &str = ".secrets";

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Write `secrets` into `dir`. Empty values are skipped.
pub fn write_secrets(dir: &Path, secrets: &BTreeMap<String, SecretString>) -> io::Result<usize> {
    let mut script = String::new();
    let mut written = 0;

    for (name, value) in secrets {
        if value.is_empty() {
            continue;
        }
        write_private(&dir.join(name), value.expose_secret())?;
        script.push_str(&format!(
            "export {}={}\n",
            name,
            shell_quote(value.expose_secret())
        ));
        written += 1;
    }

    write_private(&dir.join(SECRETS_SCRIPT), &script)?;
    Ok(written)
}

fn write_private(path: &Path, content: &str) -> io::Result<()> {
    fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Shell that sources `file`, overwrites it with random bytes of its size and
/// unlinks it. `file` is inserted verbatim, so it may be a quoted variable.
pub fn load_and_scrub(file: &str) -> String {
    format!(
        concat!(
            "if [ -f {f} ]; then set -a; . {f}; set +a; ",
            "n=\"$(stat -c %s {f} 2>/dev/null || echo 0)\"; ",
            "if [ \"$n\" -gt 0 ]; then ",
            "dd if=/dev/urandom of={f} bs=1 count=\"$n\" conv=notrunc status=none 2>/dev/null || true; ",
            "fi; rm -f {f}; fi\n"
        ),
        f = file
    )
}

/// Materialise secrets into a session directory.
///
/// Returns the `/run/secrets` mount, or `None` when nothing is secret. The
/// mount is writable: `.secrets` is scrubbed and unlinked inside the sandbox
/// on first exec, which a read-only bind would refuse.
pub fn materialize(
    session: &mut SessionResources,
    secrets: &BTreeMap<String, SecretString>,
) -> io::Result<Option<VolumeMount>> {
    if secrets.values().all(SecretString::is_empty) {
        return Ok(None);
    }

    let dir = session.temp_dir("secrets")?;
    let count = write_secrets(&dir, secrets)?;
    debug!("Materialised {} secrets in {}", count, dir.display());

    Ok(Some(VolumeMount::new(dir, SECRETS_MOUNT).required()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn secrets(pairs: &[(&str, &str)]) -> BTreeMap<String, SecretString> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), SecretString::new(*v)))
            .collect()
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$HOME `x`"), "'$HOME `x`'");
    }

    #[test]
    fn test_write_secrets_skips_empty() {
        let dir = TempDir::new().unwrap();
        let count = write_secrets(
            dir.path(),
            &secrets(&[("ANTHROPIC_API_KEY", "sk-1"), ("EMPTY", ""), ("GH_TOKEN", "gh'x")]),
        )
        .unwrap();

        assert_eq!(count, 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("ANTHROPIC_API_KEY")).unwrap(),
            "sk-1"
        );
        assert!(!dir.path().join("EMPTY").exists());

        let script = fs::read_to_string(dir.path().join(SECRETS_SCRIPT)).unwrap();
        assert!(script.contains("export ANTHROPIC_API_KEY='sk-1'\n"));
        assert!(script.contains(r"export GH_TOKEN='gh'\''x'"));
        assert!(!script.contains("EMPTY"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join(SECRETS_SCRIPT))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_materialize_nothing_secret() {
        let mut session = SessionResources::new();
        assert!(materialize(&mut session, &secrets(&[("A", "")]))
            .unwrap()
            .is_none());
        assert!(session.temp_dirs().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_loader_sources_then_unlinks() {
        let dir = TempDir::new().unwrap();
        write_secrets(dir.path(), &secrets(&[("ANTHROPIC_API_KEY", "sk-1")])).unwrap();
        let file = dir.path().join(SECRETS_SCRIPT);

        let script = format!(
            "{}echo \"key=$ANTHROPIC_API_KEY\"",
            load_and_scrub(&shell_quote(&file.to_string_lossy()))
        );
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        let out = crate::process::capture(cmd).await.unwrap();

        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "key=sk-1");
        assert!(!file.exists());
        assert!(dir.path().join("ANTHROPIC_API_KEY").exists());
    }

    #[test]
    fn test_loader_overwrites_before_unlink() {
        let snippet = load_and_scrub("\"$f\"");
        let dd = snippet.find("dd if=/dev/urandom of=\"$f\"").unwrap();
        let rm = snippet.find("rm -f \"$f\"").unwrap();
        assert!(dd < rm);
        assert!(snippet.contains("conv=notrunc"));
        assert!(snippet.starts_with("if [ -f \"$f\" ]; then set -a; . \"$f\"; set +a;"));
    }

    #[test]
    fn test_materialize_tracks_dir() {
        let mut session = SessionResources::new();
        let mount = materialize(&mut session, &secrets(&[("A", "1")]))
            .unwrap()
            .unwrap();
        assert_eq!(mount.target, SECRETS_MOUNT);
        // `.secrets` must stay unlinkable from inside the sandbox.
        assert!(!mount.readonly);
        assert!(mount.source.join("A").exists());

        session.cleanup();
        assert!(!mount.source.exists());
    }
}
