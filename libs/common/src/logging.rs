//! Logging bootstrap for services
//!
//! Console output uses a compact `timestamp [LEVEL] message` format. When a
//! log directory is configured, the same events are also written to a
//! daily-rolling file, optionally as JSON.

use std::path::PathBuf;

use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{
        self,
        format::{FmtSpan, Writer},
        FmtContext, FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    EnvFilter, Layer, Registry,
};

use crate::error::{Error, Result};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2026-10-15T00:50:44.809123Z [INFO] Cycle finished`
pub struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the log file prefix
    pub service_name: String,
    /// Filter directive (`info`, `debug,meter_protocols=trace`, ...)
    pub level: String,
    /// Write a daily-rolling log file into this directory
    pub log_dir: Option<PathBuf>,
    /// Write the file log as JSON lines
    pub enable_json: bool,
    /// Colored console output
    pub ansi: bool,
    /// Rolled files kept on disk
    pub max_log_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "service".to_string(),
            level: "info".to_string(),
            log_dir: None,
            enable_json: false,
            ansi: true,
            max_log_files: 30,
        }
    }
}

/// Keeps the background file writer alive; flushes on drop
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Build the subscriber described by `config` without installing it
pub fn build_subscriber(
    config: &LogConfig,
) -> Result<(Box<dyn Subscriber + Send + Sync>, LogGuard)> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| Error::Logging(format!("invalid log level '{}': {e}", config.level)))?;

    // stderr keeps stdout free for command output
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![fmt::layer()
        .with_ansi(config.ansi)
        .with_writer(std::io::stderr)
        .event_format(BracketedLevelFormat)
        .boxed()];

    let mut file_guard = None;
    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)?;
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(&config.service_name)
            .filename_suffix("log")
            .max_log_files(config.max_log_files)
            .build(dir)
            .map_err(|e| Error::Logging(format!("cannot open log file in {}: {e}", dir.display())))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let file_layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        layers.push(file_layer);
    }

    let subscriber = tracing_subscriber::registry().with(layers).with(filter);
    Ok((Box::new(subscriber), LogGuard { _file: file_guard }))
}

/// Install the global subscriber
pub fn init_with_config(config: &LogConfig) -> Result<LogGuard> {
    let (subscriber, guard) = build_subscriber(config)?;
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Logging(e.to_string()))?;
    Ok(guard)
}
