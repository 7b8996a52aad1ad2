//! # Logging
//!
//! `tracing` subscriber setup for the armtrap binary and for anything else
//! embedding the trap engine.
//!
//! Logs go to stderr so that command output on stdout stays clean. A file
//! sink can be added; it is written through a non-blocking appender whose
//! [`WorkerGuard`] must stay alive for buffered lines to be flushed.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: filter directives (`debug`, `armtrap_core=trace`, ...)
//! - `ARMTRAP_LOG_FORMAT`: `pretty` (default) or `json`
//! - `ARMTRAP_LOG_FILE`: log file path, or a directory to get a dated
//!   `YYYY-MM-DD-armtrap.log` inside it
//!
//! ## Example
//!
//! ```rust,no_run
//! use armtrap_utils::logging::{init_logging, LogSettings};
//!
//! let _guard = init_logging(&LogSettings::from_env())?;
//! tracing::info!("ready");
//! # Ok::<(), armtrap_utils::logging::LoggingError>(())
//! ```

use std::env;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Local;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const LOG_FORMAT_VAR: &str = "ARMTRAP_LOG_FORMAT";

/// Environment variable naming the log file or directory.
pub const LOG_FILE_VAR: &str = "ARMTRAP_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Resolved logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings
{
    /// Explicit level; overrides `RUST_LOG` when set
    pub level: Option<LogLevel>,
    /// Output format
    pub format: LogFormat,
    /// Optional file sink
    pub file: Option<PathBuf>,
}

impl LogSettings
{
    /// Settings from `ARMTRAP_LOG_FORMAT` and `ARMTRAP_LOG_FILE`.
    ///
    /// An unparsable format falls back to pretty output.
    pub fn from_env() -> Self
    {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`LogSettings::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self
    {
        let format = lookup(LOG_FORMAT_VAR)
            .and_then(|value| value.parse().ok())
            .unwrap_or_default();
        let file = lookup(LOG_FILE_VAR).filter(|value| !value.is_empty()).map(PathBuf::from);
        Self {
            level: None,
            format,
            file,
        }
    }

    fn filter(&self) -> EnvFilter
    {
        match self.level {
            Some(level) => EnvFilter::new(Level::from(level).to_string()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
        }
    }
}

/// Where a file sink actually writes: `(directory, file name)`.
///
/// A path naming an existing directory gets a dated file inside it.
pub fn resolve_log_file(path: &Path) -> (PathBuf, String)
{
    if path.is_dir() {
        let name = format!("{}-armtrap.log", Local::now().format("%Y-%m-%d"));
        return (path.to_path_buf(), name);
    }

    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path
        .file_name()
        .map_or_else(|| "armtrap.log".to_string(), |name| name.to_string_lossy().into_owned());
    (directory, name)
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    let base = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stderr);
    match format {
        LogFormat::Pretty => base.with_ansi(io::stderr().is_terminal()).with_filter(filter).boxed(),
        LogFormat::Json => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, filter: EnvFilter, path: &Path) -> Result<(BoxedLayer, WorkerGuard), LoggingError>
{
    let (directory, name) = resolve_log_file(path);
    std::fs::create_dir_all(&directory)?;
    let appender = tracing_appender::rolling::never(directory, name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let base = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false)
        .with_writer(writer);
    let layer = match format {
        LogFormat::Pretty => base.with_filter(filter).boxed(),
        LogFormat::Json => base.json().with_current_span(true).with_filter(filter).boxed(),
    };
    Ok((layer, guard))
}

/// Install the global subscriber.
///
/// Returns the file appender's guard when a file sink is configured; keep
/// it until the process exits.
///
/// ## Errors
///
/// - `InitializationFailed` if a global subscriber is already set
/// - `FileError` if the log directory cannot be created
pub fn init_logging(settings: &LogSettings) -> Result<Option<WorkerGuard>, LoggingError>
{
    let mut layers: Vec<BoxedLayer> = vec![console_layer(settings.format, settings.filter())];
    let mut guard = None;
    if let Some(path) = &settings.file {
        let (layer, file_guard) = file_layer(settings.format, settings.filter(), path)?;
        layers.push(layer);
        guard = Some(file_guard);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
    Ok(guard)
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Unknown value for `ARMTRAP_LOG_FORMAT` or `--log-format`
    #[error("invalid log format '{0}', expected 'pretty' or 'json'")]
    InvalidFormat(String),

    /// Unknown level name
    #[error("invalid log level '{0}', expected error, warn, info, debug or trace")]
    InvalidLevel(String),

    /// A global subscriber was already installed
    #[error("failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// The log file or its directory could not be created
    #[error("log file error: {0}")]
    FileError(#[from] io::Error),
}
