//! Tracing subscriber set-up from the `log.*` keys.

use addt_core::config::{LogConfig, LogOutput};
use addt_core::AddtPaths;
use anyhow::Context as _;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when logging is disabled.
const QUIET_FILTER: &str = "warn";

/// Filter directives for `config`: `addt=<level>` plus `log.modules`.
pub fn filter_directives(config: &LogConfig) -> String {
    if !config.enabled {
        return QUIET_FILTER.to_string();
    }
    let mut directives = vec![format!("addt={}", config.level)];
    for module in &config.modules {
        let (name, level) = match module.split_once('=') {
            Some((name, level)) => (name.trim(), level.trim()),
            None => (module.trim(), config.level.as_str()),
        };
        if name.is_empty() {
            continue;
        }
        let target = if name.starts_with("addt") {
            name.replace('-', "_")
        } else {
            format!("addt_{}", name.replace('-', "_"))
        };
        directives.push(format!("{}={}", target, level));
    }
    directives.join(",")
}

/// Parse `10M`, `512K`, `1G` or a plain byte count.
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last()?.to_ascii_uppercase() {
        'K' => (&raw[..raw.len() - 1], 1024),
        'M' => (&raw[..raw.len() - 1], 1024 * 1024),
        'G' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

/// Log file location: `log.dir` (default `<addt_home>/logs`) joined with `log.file`.
pub fn log_path(config: &LogConfig, paths: &AddtPaths) -> PathBuf {
    let dir = if config.dir.is_empty() {
        paths.logs_dir()
    } else {
        paths.expand(&config.dir)
    };
    dir.join(&config.file)
}

/// Shift `path` to `path.1`, `.1` to `.2` and so on once it exceeds `max_size`.
///
/// At most `max_files` rotated files are kept.
pub fn rotate(path: &Path, max_size: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if size <= max_size {
        return Ok(false);
    }

    let numbered = |n: usize| PathBuf::from(format!("{}.{}", path.display(), n));
    if max_files == 0 {
        fs::remove_file(path)?;
        return Ok(true);
    }

    let oldest = numbered(max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..max_files).rev() {
        let from = numbered(n);
        if from.exists() {
            fs::rename(&from, numbered(n + 1))?;
        }
    }
    fs::rename(path, numbered(1))?;
    Ok(true)
}

fn open_log_file(config: &LogConfig, paths: &AddtPaths) -> anyhow::Result<File> {
    let path = log_path(config, paths);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create log directory {}", parent.display()))?;
    }
    if config.rotate {
        let max_size = parse_size(&config.max_size).unwrap_or(10 * 1024 * 1024);
        let max_files = usize::try_from(config.max_files).unwrap_or(0);
        rotate(&path, max_size, max_files)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Cannot open log file {}", path.display()))
}

/// Install the process-wide subscriber.
///
/// `RUST_LOG` wins over the configured level.
pub fn init(config: &LogConfig, paths: &AddtPaths) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let (to_stderr, to_file) = if !config.enabled {
        (true, false)
    } else {
        match config.output {
            LogOutput::Stderr => (true, false),
            LogOutput::File => (false, true),
            LogOutput::Both => (true, true),
        }
    };

    let file_layer = if to_file {
        let file = open_log_file(config, paths)?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false),
        )
    } else {
        None
    };
    let stderr_layer = to_stderr.then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Logging already initialised")?;
    Ok(())
}

/// Warnings to stderr only; used before the configuration could be read.
pub fn init_fallback() {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(QUIET_FILTER)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init();
}
