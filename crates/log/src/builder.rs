//! Logger builder implementation

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, DisplayConfig, Format, WriterConfig};
use crate::error::{LogError, LogResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Logger builder
#[derive(Debug)]
pub struct LoggerBuilder {
    config: Config,
}

/// Guard that keeps the logger's root span entered
///
/// Drop it at the end of `main`.
#[derive(Debug)]
pub struct LoggerGuard {
    _root_span: Option<tracing::span::EnteredSpan>,
}

impl LoggerGuard {
    pub(crate) fn noop() -> Self {
        Self { _root_span: None }
    }
}

/// Finish a fmt layer, dropping timestamps when the display config asks for it.
macro_rules! finish_layer {
    ($layer:expr, $display:expr) => {
        if $display.time {
            $layer.boxed()
        } else {
            $layer.without_time().boxed()
        }
    };
}

impl LoggerBuilder {
    /// Create builder from config
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Build and initialize the global subscriber
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Filter string cannot be parsed
    /// - A global subscriber is already installed
    pub fn build(self) -> LogResult<LoggerGuard> {
        let filter = EnvFilter::try_new(&self.config.level)
            .map_err(|e| LogError::Filter(format!("{}: {e}", self.config.level)))?;

        let fmt_layer = make_fmt_layer(&self.config);

        Registry::default()
            .with(fmt_layer)
            .with(filter)
            .try_init()
            .map_err(|e| LogError::Init(e.to_string()))?;

        let root_span = self.config.service.as_deref().map(|service| {
            tracing::info_span!("enclave", service = %service).entered()
        });

        tracing::debug!(
            level = %self.config.level,
            format = ?self.config.format,
            "logger initialized"
        );

        Ok(LoggerGuard {
            _root_span: root_span,
        })
    }
}

fn make_writer(config: WriterConfig) -> BoxMakeWriter {
    match config {
        WriterConfig::Stderr => BoxMakeWriter::new(std::io::stderr),
        WriterConfig::Stdout => BoxMakeWriter::new(std::io::stdout),
    }
}

fn make_fmt_layer(config: &Config) -> BoxedLayer {
    let display: &DisplayConfig = &config.display;
    let base = tracing_subscriber::fmt::layer()
        .with_writer(make_writer(config.writer))
        .with_ansi(display.colors)
        .with_target(display.target)
        .with_file(display.source)
        .with_line_number(display.source)
        .with_thread_names(display.thread_names);

    match config.format {
        Format::Pretty => finish_layer!(base.pretty(), display),
        Format::Compact => finish_layer!(base.compact(), display),
        Format::Json => finish_layer!(base.json().flatten_event(display.flatten), display),
    }
}
