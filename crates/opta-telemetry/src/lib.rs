//! Structured logging for the daemon.
//!
//! One registry, two JSON layers: stdout (optional) and an append-only
//! `daemon.log` that `optad logs` tails.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. `RUST_LOG` takes precedence.
    pub log_level: Level,
    /// Per-module level overrides, e.g. `("opta_upstream", DEBUG)`.
    pub module_levels: Vec<(String, Level)>,
    pub stdout: bool,
    /// Append-only JSON log. `None` disables the file layer.
    pub log_file: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            stdout: true,
            log_file: None,
        }
    }
}

/// Keeps the log file handle alive for the life of the process.
pub struct TelemetryGuard {
    log_file: Option<PathBuf>,
    _file: Option<Arc<File>>,
}

impl TelemetryGuard {
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

/// Parse a level name from settings, defaulting to INFO.
pub fn parse_level(name: &str) -> Level {
    name.parse().unwrap_or(Level::INFO)
}

fn filter_directives(config: &TelemetryConfig) -> String {
    let mut filter = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

fn env_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives))
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let directives = filter_directives(&config);

    let stdout_layer = config.stdout.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter(&directives))
    });

    let file = match &config.log_file {
        Some(path) => Some(Arc::new(open_log_file(path)?)),
        None => None,
    };
    let file_layer = file.clone().map(|writer| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_current_span(true)
            .with_writer(writer)
            .with_filter(env_filter(&directives))
    });

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInitialized)?;

    Ok(TelemetryGuard {
        log_file: config.log_file,
        _file: file,
    })
}

fn open_log_file(path: &Path) -> Result<File, TelemetryError> {
    let wrap = |source| TelemetryError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(wrap)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(wrap)
}

/// Last `n` lines of a log file, oldest first. A missing file is empty.
pub fn read_log_tail(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut tail = VecDeque::with_capacity(n.min(4096));
    if n == 0 {
        return Ok(Vec::new());
    }
    for line in BufReader::new(file).lines() {
        if tail.len() == n {
            let _ = tail.pop_front();
        }
        tail.push_back(line?);
    }
    Ok(tail.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("opta_upstream".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(filter_directives(&config), "warn,opta_upstream=debug");
    }

    #[test]
    fn parse_level_falls_back_to_info() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("loud"), Level::INFO);
    }

    #[test]
    fn tail_returns_last_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let mut f = File::create(&path).unwrap();
        for i in 0..10 {
            writeln!(f, "line {i}").unwrap();
        }
        let tail = read_log_tail(&path, 3).unwrap();
        assert_eq!(tail, vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn tail_of_short_file_returns_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        std::fs::write(&path, "a\nb\n").unwrap();
        assert_eq!(read_log_tail(&path, 50).unwrap(), vec!["a", "b"]);
        assert!(read_log_tail(&path, 0).unwrap().is_empty());
    }

    #[test]
    fn tail_of_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_log_tail(&dir.path().join("missing.log"), 5)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn log_file_parent_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/daemon.log");
        let _file = open_log_file(&path).unwrap();
        assert!(path.exists());
    }
}
