//! # Logging Utilities
//!
//! Structured logging for the Grapnel tools, built on `tracing`.
//!
//! - Pretty output for terminals, JSON lines for log collectors
//! - Filtering through `RUST_LOG` or an explicit level
//! - Optional copy of every event in a file, written off-thread
//!
//! Console output goes to stderr; stdout is reserved for command results.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use grapnel_utils::{init_logging, LoggingConfig};
//!
//! let _guard = init_logging(&LoggingConfig::from_env()).expect("Failed to initialize logging");
//! tracing::info!("attached");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: filter directives (e.g., `RUST_LOG=debug`, `RUST_LOG=grapnel_core=trace`)
//! - `GRAPNEL_LOG_FORMAT`: `pretty` (default) or `json`
//! - `GRAPNEL_LOG_FILE`: file to copy events into; a directory gets a dated
//!   `YYYY-MM-DD-grapnel.log` inside it

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const FORMAT_ENV: &str = "GRAPNEL_LOG_FORMAT";
/// Environment variable naming the log file.
pub const FILE_ENV: &str = "GRAPNEL_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable, one event per line
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
        match s.to_lowercase().as_str() {
            "pretty" | "text" | "dev" => Ok(LogFormat::Pretty),
            "json" | "prod" => Ok(LogFormat::Json),
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
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Everything [`init_logging`] needs to know
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingConfig
{
    /// Explicit level; overrides `RUST_LOG` when set.
    pub level: Option<LogLevel>,
    pub format: LogFormat,
    /// File (or directory) to copy events into.
    pub file: Option<PathBuf>,
}

impl LoggingConfig
{
    /// Read the format and file from the environment.
    ///
    /// Unparseable values fall back to the defaults; `RUST_LOG` itself is
    /// consulted later by the filter.
    pub fn from_env() -> Self
    {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self
    {
        Self {
            level: None,
            format: lookup(FORMAT_ENV)
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            file: lookup(FILE_ENV).filter(|s| !s.is_empty()).map(PathBuf::from),
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self
    {
        self.level = Some(level);
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self
    {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self
    {
        self.file = Some(file.into());
        self
    }

    /// Filter used for every layer.
    ///
    /// Priority: explicit level, then `RUST_LOG`, then `info`.
    fn filter(&self) -> EnvFilter
    {
        if let Some(level) = self.level {
            return EnvFilter::new(Level::from(level).to_string());
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    }
}

/// Keeps the background file writer alive
///
/// Events still queued for the file are flushed when this is dropped, so hold
/// it until the program exits.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug, Default)]
pub struct LoggingGuard
{
    file_writer: Option<WorkerGuard>,
    file: Option<PathBuf>,
}

impl LoggingGuard
{
    /// Path events are copied to, if file logging is on.
    pub fn file(&self) -> Option<&Path>
    {
        self.file.as_deref()
    }
}

/// Install the global subscriber described by `config`.
///
/// ## Errors
///
/// - `InitializationFailed` if a global subscriber is already set
/// - `FileError` if the log directory cannot be created
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError>
{
    let mut layers: Vec<BoxedLayer> = vec![console_layer(config.format, config.filter())];
    let mut guard = LoggingGuard::default();

    if let Some(requested) = &config.file {
        let path = resolve_log_file(requested)?;
        let dir = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let name = path.file_name().unwrap_or_default();
        let (writer, worker) = tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, name));
        layers.push(file_layer(config.format, config.filter(), writer));
        guard.file_writer = Some(worker);
        guard.file = Some(path);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
    Ok(guard)
}

/// Concrete file for a requested log path.
///
/// An existing directory gets `YYYY-MM-DD-grapnel.log` inside it; anything
/// else is used as given, with its parent directory created.
pub fn resolve_log_file(requested: &Path) -> Result<PathBuf, LoggingError>
{
    if requested.is_dir() {
        return Ok(requested.join(dated_file_name()));
    }
    if let Some(parent) = requested.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(requested.to_path_buf())
}

fn dated_file_name() -> String
{
    format!("{}-grapnel.log", Utc::now().format("%Y-%m-%d"))
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stderr);
    match format {
        LogFormat::Pretty => layer.with_ansi(true).with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, filter: EnvFilter, writer: tracing_appender::non_blocking::NonBlocking) -> BoxedLayer
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());
    match format {
        LogFormat::Pretty => layer.with_ansi(false).with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Unknown log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    #[error("Unknown log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
    InvalidLevel(String),

    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
