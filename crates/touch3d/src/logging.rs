//! Process-wide `tracing` subscriber setup.
//!
//! `RUST_LOG` wins over the configured level when it is set.

use tracing::Level;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

/// Log line layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
}

/// Logging configuration.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Minimum level when no filter applies.
    pub level: Level,
    /// Output layout.
    pub format: LogFormat,
    /// Filter directives, e.g. `"touch3d_core=debug"`.
    pub filter: Option<String>,
    /// Include the emitting thread's name (worker threads are named).
    pub thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            filter: None,
            thread_names: true,
        }
    }
}

impl LogConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the minimum level.
    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Sets the output layout.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets explicit filter directives.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Installs the global subscriber, writing to stderr.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: LogConfig) -> Result<(), TryInitError> {
    let filter = build_filter(&config);
    let builder = fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_thread_names(config.thread_names);

    match config.format {
        LogFormat::Pretty => builder.pretty().finish().try_init(),
        LogFormat::Compact => builder.compact().finish().try_init(),
    }
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    match &config.filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::new(config.level.as_str().to_ascii_lowercase()),
    }
}
