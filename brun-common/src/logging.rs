//! Structured logging initialization shared by the brun binaries.
//!
//! Every binary (`brun`, `brun-runner`) calls [`init_logging`] once at startup
//! with a [`LogConfig`] built from the environment and its own CLI flags.

use crate::config::{ConfigSource, EnvError, EnvParser, Sourced};
use anyhow::Result;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, fmt,
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    util::SubscriberInitExt,
};

/// Logging output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-friendly, multi-line logs.
    Pretty,
    /// JSON lines for machine parsing.
    Json,
    /// Single-line logs.
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

/// Configuration for logging initialization.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (trace, debug, info, warn, error, off).
    pub level: String,
    /// Where `level` came from.
    pub level_source: ConfigSource,
    /// Console output format.
    pub format: LogFormat,
    /// Optional file that receives a copy of every log line.
    pub file_path: Option<PathBuf>,
    /// Roll the log file daily instead of truncating it at startup.
    pub rolling: bool,
    /// Per-target log level overrides.
    pub targets: BTreeMap<String, String>,
    /// Include target in log output.
    pub with_target: bool,
    /// Include thread names in log output.
    pub with_thread_names: bool,
    /// Write console logs to stderr instead of stdout.
    pub use_stderr: bool,
    /// Rejected `BRUN_LOG_*` values, reported once logging is up.
    pub env_errors: Vec<EnvError>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            level_source: ConfigSource::Default,
            format: LogFormat::Compact,
            file_path: None,
            rolling: true,
            targets: BTreeMap::new(),
            with_target: false,
            with_thread_names: true,
            use_stderr: false,
            env_errors: Vec::new(),
        }
    }
}

impl LogConfig {
    /// Build a logging configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - BRUN_LOG_LEVEL
    /// - BRUN_LOG_FORMAT (pretty|json|compact)
    /// - BRUN_LOG_FILE (path to a log file)
    /// - BRUN_LOG_TARGETS (comma-separated target=level list)
    pub fn from_env(default_level: &str) -> Self {
        Self::from_parser(&mut EnvParser::new(), default_level)
    }

    pub fn from_parser(parser: &mut EnvParser, default_level: &str) -> Self {
        let level = parser.get_log_level("LOG_LEVEL", default_level);
        let mut config = Self {
            level: level.value,
            level_source: level.source,
            ..Self::default()
        };

        if let Some(format) = parser.get_optional_string("LOG_FORMAT").value {
            match LogFormat::parse(&format) {
                Some(parsed) => config.format = parsed,
                None => parser.record(EnvError::InvalidValue {
                    var: "BRUN_LOG_FORMAT".to_string(),
                    expected: "pretty, json or compact".to_string(),
                    value: format,
                }),
            }
        }

        if let Some(path) = parser.get_optional_string("LOG_FILE").value {
            config.file_path = Some(PathBuf::from(path));
        }

        if let Some(targets) = parser.get_optional_string("LOG_TARGETS").value {
            config.targets = parse_target_overrides(&targets);
        }

        config.env_errors = parser.take_errors();
        config
    }

    /// Override the base log level from the command line.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        let level = Sourced::new(self.level, self.level_source).override_with(Some(level.into()));
        self.level = level.value;
        self.level_source = level.source;
        self
    }

    /// Write console logs to stderr.
    pub fn with_stderr(mut self) -> Self {
        self.use_stderr = true;
        self
    }

    /// Also write every log line to `path`, truncating it at startup.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self.rolling = false;
        self
    }

    /// Build the effective EnvFilter, honoring RUST_LOG if set.
    pub fn env_filter(&self) -> EnvFilter {
        if std::env::var_os("RUST_LOG").is_some()
            && let Ok(filter) = EnvFilter::try_from_default_env()
        {
            return filter;
        }

        let mut filter = self.level.clone();
        for (target, level) in &self.targets {
            filter.push_str(&format!(",{}={}", target, level));
        }
        EnvFilter::new(filter)
    }
}

/// Guards required to keep background logging workers alive.
pub struct LoggingGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize tracing-based logging for the current process.
///
/// Returns guards that must be kept alive for the duration of the program
/// (particularly when file logging is enabled). Calling this twice is
/// harmless; the second subscriber is discarded.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let filter = config.env_filter();
    let (writer, file_guard) = build_writer(config)?;
    let ansi = file_guard.is_none() && config.format != LogFormat::Json;

    let builder = fmt::Subscriber::builder()
        .with_writer(writer)
        .with_target(config.with_target)
        .with_thread_names(config.with_thread_names)
        .with_env_filter(filter)
        .with_ansi(ansi);

    match config.format {
        LogFormat::Pretty => finish_subscriber(builder.pretty().finish(), file_guard),
        LogFormat::Json => finish_subscriber(builder.json().finish(), file_guard),
        LogFormat::Compact => finish_subscriber(builder.compact().finish(), file_guard),
    }
}

fn build_writer(config: &LogConfig) -> Result<(BoxMakeWriter, Option<WorkerGuard>)> {
    let base_writer = if config.use_stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };

    let Some(path) = config.file_path.as_ref() else {
        return Ok((base_writer, None));
    };

    let (non_blocking, guard) = if config.rolling {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path.file_name().unwrap_or_else(|| OsStr::new("brun.log"));
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name))
    } else {
        let file = std::fs::File::create(path)?;
        tracing_appender::non_blocking(file)
    };

    let writer = BoxMakeWriter::new(base_writer.and(non_blocking));
    Ok((writer, Some(guard)))
}

fn finish_subscriber<S>(subscriber: S, file_guard: Option<WorkerGuard>) -> Result<LoggingGuards>
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = subscriber.try_init()
        && !err.to_string().contains("already initialized")
        && !err.to_string().contains("global default")
    {
        return Err(err.into());
    }

    Ok(LoggingGuards {
        _file_guard: file_guard,
    })
}

fn parse_target_overrides(value: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for entry in value.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((target, level)) = entry.split_once('=') else {
            continue;
        };
        let target = target.trim();
        let level = level.trim().to_lowercase();
        if target.is_empty() || !is_valid_level(&level) {
            continue;
        }
        map.insert(target.to_string(), level);
    }
    map
}

pub(crate) fn is_valid_level(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error" | "off")
}
