//! Logging.

use std::path::Path;

use serde::Deserialize;
use tally_config::GenericConfiguration;
use tally_error::{generic_error, ErrorContext as _, GenericError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, MakeWriter},
    layer::SubscriberExt as _,
    registry::LookupSpan,
    util::SubscriberInitExt as _,
    EnvFilter, Layer,
};

fn default_log_level() -> String {
    LevelFilter::INFO.to_string()
}

const fn default_true() -> bool {
    true
}

/// Logging configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfiguration {
    /// Filtering directives, in `EnvFilter` syntax.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether to emit logs as JSON objects rather than human-readable lines.
    #[serde(default)]
    pub log_format_json: bool,

    /// Whether to log to standard output.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_true")]
    pub log_to_console: bool,

    /// File to additionally log to. Empty disables file logging.
    #[serde(default)]
    pub log_file: String,
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: false,
            log_to_console: true,
            log_file: String::new(),
        }
    }
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    fn env_filter(&self) -> Result<EnvFilter, GenericError> {
        if self.log_level.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(&self.log_level)
            .error_context("Failed to parse valid log level.")
    }
}

/// Keeps the non-blocking log writers alive.
///
/// Must be held until the application is about to exit, so that buffered log lines are flushed.
#[derive(Default)]
pub struct LoggingGuard {
    worker_guards: Vec<WorkerGuard>,
}

impl LoggingGuard {
    fn add_worker_guard(&mut self, guard: WorkerGuard) {
        self.worker_guards.push(guard);
    }
}

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the global `tracing` subscriber.
///
/// One output layer is configured per enabled destination (console, file), all sharing a single filter so events are
/// filtered once rather than per output.
///
/// # Errors
///
/// If the log level is invalid, the log file cannot be opened, or a global subscriber was already installed, an error
/// is returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<LoggingGuard, GenericError> {
    let filter = config.env_filter()?;

    let mut configured_layers = Vec::new();
    let mut logging_guard = LoggingGuard::default();

    if config.log_to_console {
        let (nb_stdout, guard) = tracing_appender::non_blocking(std::io::stdout());
        logging_guard.add_worker_guard(guard);

        configured_layers.push(build_formatting_layer(config, nb_stdout, true));
    }

    if !config.log_file.is_empty() {
        let path = Path::new(&config.log_file);
        let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| generic_error!("Log file '{}' has no file name.", config.log_file))?;

        let appender = tracing_appender::rolling::never(directory, file_name);
        let (nb_appender, guard) = tracing_appender::non_blocking(appender);
        logging_guard.add_worker_guard(guard);

        configured_layers.push(build_formatting_layer(config, nb_appender, false));
    }

    tracing_subscriber::registry()
        .with(configured_layers.with_filter(filter))
        .try_init()
        .error_context("Logging subsystem already initialized.")?;

    Ok(logging_guard)
}

fn build_formatting_layer<S, W>(
    config: &LoggingConfiguration, writer: W, ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    if config.log_format_json {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .with_ansi(ansi)
            .with_target(true)
            .with_writer(writer)
            .boxed()
    }
}
