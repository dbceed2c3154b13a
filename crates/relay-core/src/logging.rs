//! Logging context handed to every relay component.
//!
//! A `Logger` is built once (usually from [`LogConfig`]) and cloned into each
//! `Connection`, `PeerEndpoint`, `PeerRegistry` and `Discovery` at
//! construction. Events go through `tracing`: either a private dispatcher
//! (stderr plus an optional append-mode file) or, for `Logger::default()`,
//! whatever global subscriber the process installed.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::Dispatch;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt as fmt_layer;
use tracing_subscriber::layer::SubscriberExt;

/// How many error-level messages are kept for `recent_errors()`.
pub const MAX_RECENT_ERRORS: usize = 100;

/// Severity of a log event, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    /// Closest `tracing` filter. `Critical` has no tracing counterpart and
    /// maps to `ERROR`.
    pub fn level_filter(&self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            _ => Err(RelayError::Configuration(format!("Unknown log level: {}", s))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum level that gets written (default: INFO)
    #[serde(default = "default_level")]
    pub level: LogLevel,

    /// Optional file that receives a copy of every event, opened in append mode
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: None,
        }
    }
}

fn default_level() -> LogLevel {
    LogLevel::Info
}

struct LoggerInner {
    min_level: LogLevel,
    /// None = forward to the global default subscriber
    dispatch: Option<Dispatch>,
    recent_errors: Mutex<VecDeque<String>>,
}

/// Cheaply cloneable logging context.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::with_level(LogLevel::Debug)
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("min_level", &self.inner.min_level)
            .field("private_sink", &self.inner.dispatch.is_some())
            .finish()
    }
}

impl Logger {
    /// Build a logger with its own sink: stderr, plus `config.file` if set.
    ///
    /// Fails with a configuration error if the log file cannot be opened.
    pub fn new(config: &LogConfig) -> Result<Self> {
        let file_layer = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        RelayError::Configuration(format!(
                            "Failed to open log file {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                Some(fmt_layer::layer().with_ansi(false).with_writer(Mutex::new(file)))
            }
            None => None,
        };

        let subscriber = tracing_subscriber::registry()
            .with(config.level.level_filter())
            .with(fmt_layer::layer().with_writer(std::io::stderr))
            .with(file_layer);

        Ok(Self {
            inner: Arc::new(LoggerInner {
                min_level: config.level,
                dispatch: Some(Dispatch::new(subscriber)),
                recent_errors: Mutex::new(VecDeque::new()),
            }),
        })
    }

    /// Logger that forwards to the process-wide `tracing` subscriber,
    /// dropping events below `min_level`.
    pub fn with_level(min_level: LogLevel) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                min_level,
                dispatch: None,
                recent_errors: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn min_level(&self) -> LogLevel {
        self.inner.min_level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.inner.min_level
    }

    /// Emit one event. Never fails; sink errors are swallowed by the writer.
    pub fn log(&self, level: LogLevel, message: impl Display) {
        if !self.enabled(level) {
            return;
        }

        if level >= LogLevel::Error {
            self.remember_error(&message);
        }

        match &self.inner.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, || emit(level, &message)),
            None => emit(level, &message),
        }
    }

    pub fn debug(&self, message: impl Display) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Display) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Display) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Display) {
        self.log(LogLevel::Error, message);
    }

    pub fn critical(&self, message: impl Display) {
        self.log(LogLevel::Critical, message);
    }

    /// Most recent error-level messages (oldest first), each prefixed with a
    /// local timestamp.
    pub fn recent_errors(&self) -> Vec<String> {
        self.inner
            .recent_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn remember_error(&self, message: &dyn Display) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut errors = self
            .inner
            .recent_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if errors.len() >= MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        errors.push_back(format!("[{}] {}", timestamp, message));
    }
}

fn emit(level: LogLevel, message: &dyn Display) {
    match level {
        LogLevel::Debug => tracing::debug!("{}", message),
        LogLevel::Info => tracing::info!("{}", message),
        LogLevel::Warning => tracing::warn!("{}", message),
        LogLevel::Error => tracing::error!("{}", message),
        LogLevel::Critical => tracing::error!(critical = true, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Critical);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("Warning".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("critical".parse::<LogLevel>().unwrap(), LogLevel::Critical);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_level_deserializes_from_uppercase() {
        let config: LogConfig = serde_json::from_str(r#"{"level": "WARNING"}"#).unwrap();
        assert_eq!(config.level, LogLevel::Warning);
        assert!(config.file.is_none());
    }

    #[test]
    fn test_events_below_min_level_are_dropped() {
        let logger = Logger::with_level(LogLevel::Critical);
        logger.error("not recorded");
        assert!(logger.recent_errors().is_empty());

        logger.critical("recorded");
        let errors = logger.recent_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].ends_with("recorded"));
    }

    #[test]
    fn test_recent_errors_are_bounded() {
        let logger = Logger::with_level(LogLevel::Debug);
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            logger.error(format_args!("error {}", i));
        }
        logger.info("info is not kept");

        let errors = logger.recent_errors();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert!(errors[0].ends_with("error 5"));
        assert!(errors.last().unwrap().ends_with(&format!("error {}", MAX_RECENT_ERRORS + 4)));
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.log");
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "existing line").unwrap();
        }

        let logger = Logger::new(&LogConfig {
            level: LogLevel::Info,
            file: Some(path.clone()),
        })
        .unwrap();
        logger.debug("filtered out");
        logger.info("hello file sink");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("existing line"));
        assert!(contents.contains("hello file sink"));
        assert!(!contents.contains("filtered out"));
    }

    #[test]
    fn test_unopenable_log_file_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-dir").join("relay.log");

        let err = Logger::new(&LogConfig {
            level: LogLevel::Info,
            file: Some(path),
        })
        .unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));
    }
}
