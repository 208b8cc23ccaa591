//! Logging.

use std::path::Path;

use bulwark_config::GenericConfiguration;
use bulwark_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::time::ChronoLocal, layer::SubscriberExt as _, registry::LookupSpan, util::SubscriberInitExt as _, EnvFilter,
    Layer,
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %Z";

/// Logs a message to standard error and exits the process with a non-zero exit code.
///
/// Meant for failures that happen before logging is initialized.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Logging configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfiguration {
    /// Filtering directives, in `EnvFilter` syntax.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether to emit JSON instead of human-readable lines.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub log_format_json: bool,

    /// Path of a file to additionally write logs to.
    ///
    /// Defaults to unset, logging to the console only.
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: false,
            log_file: None,
        }
    }
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// `BULWARK_LOG_LEVEL`, `BULWARK_LOG_FORMAT_JSON` and `BULWARK_LOG_FILE` apply when the configuration was loaded
    /// with the `BULWARK` environment prefix.
    pub fn try_from_config(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed::<Self>()?)
    }

    fn level_filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .parse_lossy(&self.log_level)
    }
}

/// Initializes the logging subsystem for `tracing`.
///
/// Console output is human-readable by default and JSON when `log_format_json` is set. When `log_file` is set, logs
/// are also written to that file through a non-blocking writer; the returned guard must be held for as long as logs
/// should be flushed to it.
///
/// # Errors
///
/// If the logging subsystem was already initialized, or the log file cannot be set up, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<Option<WorkerGuard>, GenericError> {
    let (file_layer, guard) = match config.log_file.as_deref() {
        Some(log_file) => {
            let (layer, guard) = initialize_file_layer(log_file)?;
            (Some(layer.with_filter(config.level_filter())), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(file_layer);
    if config.log_format_json {
        registry
            .with(initialize_tracing_json().with_filter(config.level_filter()))
            .try_init()?;
    } else {
        registry
            .with(initialize_tracing_pretty().with_filter(config.level_filter()))
            .try_init()?;
    }

    Ok(guard)
}

fn initialize_file_layer<S>(log_file: &str) -> Result<(impl Layer<S>, WorkerGuard), GenericError>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let path = Path::new(log_file);
    let file_name = path
        .file_name()
        .ok_or_else(|| generic_error!("Log file path '{}' does not name a file.", log_file))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    std::fs::create_dir_all(directory)
        .with_error_context(|| format!("Failed to create log directory '{}'.", directory.display()))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = tracing_subscriber::fmt::Layer::new()
        .with_writer(writer)
        .with_ansi(false)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_target(true);

    Ok((layer, guard))
}

fn initialize_tracing_json<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
}

fn initialize_tracing_pretty<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_target(true)
        .with_thread_names(true)
}
