//! Diagnostic logging (tracing). The job console and per-job log files live in
//! `job_logger`; this module only configures the process-wide subscriber.

use crate::anyhow_loc;
use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::fmt;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILE: &str = "magnum-jobs.log";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(anyhow_loc!(
                "Invalid log level '{}'. Valid options are: error, warn, info, debug, trace",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
    Simple,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            "simple" => Ok(LogFormat::Simple),
            _ => Err(anyhow_loc!(
                "Invalid log format '{}'. Valid options are: pretty, json, compact, simple",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    File { path: Utf8PathBuf },
    Both { path: Utf8PathBuf },
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    #[serde(default = "default_log_output")]
    pub output: LogOutput,
}

fn default_log_level() -> LogLevel {
    LogLevel::Warn
}

fn default_log_format() -> LogFormat {
    LogFormat::Simple
}

fn default_log_output() -> LogOutput {
    LogOutput::Stdout
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
        }
    }
}

/// `LEVEL message` lines without span context, so diagnostics blend in with
/// the job console.
pub struct PlainEventFormat;

impl<S, N> FormatEvent<S, N> for PlainEventFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = event.metadata().level();

        if writer.has_ansi_escapes() {
            let color_code = match *level {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{}{:>5}\x1b[0m ", color_code, level)?;
        } else {
            write!(writer, "{:>5} ", level)?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

type FilteredRegistry = tracing_subscriber::layer::Layered<EnvFilter, tracing_subscriber::Registry>;

fn stdout_layer(format: LogFormat) -> Box<dyn Layer<FilteredRegistry> + Send + Sync + 'static> {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .without_time()
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        LogFormat::Simple => tracing_subscriber::fmt::layer().event_format(PlainEventFormat).boxed(),
    }
}

fn file_writer(path: &Utf8Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let dir = path.parent().filter(|p| !p.as_str().is_empty()).unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().unwrap_or(DEFAULT_LOG_FILE);
    let file_appender = tracing_appender::rolling::never(dir.as_std_path(), file_name);
    tracing_appender::non_blocking(file_appender)
}

/// Install the global subscriber. For file outputs the returned guard must be
/// held until exit, otherwise buffered lines are lost.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(config.level.as_str())?;

    let guard = match &config.output {
        LogOutput::Stdout => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer(config.format))
                .try_init()?;
            None
        }
        LogOutput::File { path } => {
            let (non_blocking, guard) = file_writer(path);
            let file_layer = tracing_subscriber::fmt::layer().json().with_writer(non_blocking).boxed();
            tracing_subscriber::registry().with(filter).with(file_layer).try_init()?;
            Some(guard)
        }
        LogOutput::Both { path } => {
            let (non_blocking, guard) = file_writer(path);
            let file_layer = tracing_subscriber::fmt::layer().json().with_writer(non_blocking).boxed();
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer(config.format))
                .with(file_layer)
                .try_init()?;
            Some(guard)
        }
    };

    tracing::debug!("Logging initialized with {} level", config.level.as_str());

    Ok(guard)
}

// Timing utilities

/// Enters a span and records how long it stayed entered.
pub struct TimingGuard {
    span: tracing::span::EnteredSpan,
    start: std::time::Instant,
}

impl TimingGuard {
    pub fn new(span: tracing::Span) -> Self {
        Self {
            span: span.entered(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.span.record("duration_ms", duration.as_millis() as u64);
    }
}

#[macro_export]
macro_rules! timed_span {
    ($level:expr, $name:expr) => {
        $crate::timed_span!($level, $name,)
    };
    ($level:expr, $name:expr, $($fields:tt)*) => {{
        let span = tracing::span!($level, $name, duration_ms = tracing::field::Empty, $($fields)*);
        $crate::logging::TimingGuard::new(span)
    }};
}
