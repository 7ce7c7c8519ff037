//! Logging configuration using tracing

use crate::config::LoggingConfig;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::{Identity, Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Log format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (default for interactive runs)
    #[default]
    Pretty,
    /// JSON format (for log aggregation)
    Json,
    /// Compact single-line format
    Compact,
}

impl LogFormat {
    /// Parse a format name; unknown names fall back to pretty
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level (default: info)
    pub level: String,
    /// Log format
    pub format: LogFormat,
    /// Include span events (enter/exit)
    pub with_spans: bool,
    /// Include target (module path)
    pub with_target: bool,
    /// Write to stderr instead of stdout
    pub stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: LogFormat::Pretty,
            with_spans: false,
            with_target: true,
            stderr: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[logging]` section of the agent config
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self::new()
            .level(&config.level)
            .format(LogFormat::parse(&config.format))
    }

    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.with_spans = true;
        self
    }

    /// Send log output to stderr, leaving stdout to command output
    pub fn to_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }
}

/// Initialize the global tracing subscriber with default settings
pub fn init_logging() {
    init_logging_with_config(LogConfig::default());
}

/// Initialize the global tracing subscriber with custom configuration
///
/// A subscriber that is already installed is left in place.
pub fn init_logging_with_config(config: LogConfig) {
    init_logging_with_layer(config, None::<Identity>);
}

/// Initialize the global tracing subscriber with an extra layer
///
/// The extra layer (e.g. a log forwarder) sees the same events as the
/// console output, after level filtering.
pub fn init_logging_with_layer<L>(config: LogConfig, extra: Option<L>)
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let span_events = if config.with_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let writer = if config.stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };

    let registry = tracing_subscriber::registry().with(extra).with(env_filter);

    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_span_events(span_events)
                    .with_target(config.with_target),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(writer)
                    .with_span_events(span_events)
                    .with_target(config.with_target),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_writer(writer)
                    .with_span_events(span_events)
                    .with_target(config.with_target),
            )
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
