//! Logging setup and convenience macros
//!
//! Everything logs through `tracing`; records emitted with the `log` crate are
//! bridged by `tracing-log`, so both sets of macros end up in the same sink.

use crate::config::settings::LoggingConfig;
use crate::error::Error;
use log::{debug, error, info, trace, warn, LevelFilter};
use std::sync::Once;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, FmtSubscriber};

static INIT: Once = Once::new();

fn bridge_log_records(level: LevelFilter) {
    // The subscriber may already have installed the bridge itself.
    let _ = LogTracer::init();
    log::set_max_level(level);
}

fn level_filter(level: &str) -> LevelFilter {
    level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info)
}

/// Initialize the global logger from `RUST_LOG`
/// This should be called once at the start of the application
pub fn init_logger() {
    INIT.call_once(|| {
        let _ = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .try_init();

        bridge_log_records(LevelFilter::Debug);
    });
}

/// Initialize logger with a fixed maximum level
pub fn init_logger_with_level(level: Level) {
    INIT.call_once(|| {
        let _ = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .try_init();

        bridge_log_records(match level {
            Level::ERROR => LevelFilter::Error,
            Level::WARN => LevelFilter::Warn,
            Level::INFO => LevelFilter::Info,
            Level::DEBUG => LevelFilter::Debug,
            Level::TRACE => LevelFilter::Trace,
        });
    });
}

/// Initialize logger from configuration
///
/// `RUST_LOG` wins over `log_level` when set. With file logging enabled a daily
/// rolling file is written under `log_dir`; the returned guard must be kept alive
/// for the file writer to flush.
pub fn init_logger_with_config(log_level: &str, logging: &LoggingConfig) -> Option<WorkerGuard> {
    let mut guard = None;

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level));

        let console = fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true);

        let file = if logging.enable_file_logging {
            let appender = tracing_appender::rolling::daily(&logging.log_dir, "chain-proxy.log");
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false).with_target(true))
        } else {
            None
        };

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(file)
            .try_init();

        bridge_log_records(level_filter(log_level));
    });

    guard
}

/// Log a socket-level error for `context`.
///
/// Expected disconnects (reset, abort, broken pipe) go to DEBUG, other I/O
/// errors to INFO with the details at DEBUG, everything else to ERROR.
pub fn log_connection_error(context: &str, err: &Error) {
    if err.is_expected_disconnect() {
        debug!("{}: connection closed by peer: {}", context, err);
    } else if matches!(err, Error::Io(_)) {
        info!("I/O error on {}: {}", context, err);
        debug!("{}: I/O error details: {:?}", context, err);
    } else {
        error!("Unexpected error on {}: {}", context, err);
    }
}

/// Log an error message
pub fn log_error(message: &str) {
    error!("{}", message);
}

/// Log an info message
pub fn log_info(message: &str) {
    info!("{}", message);
}

/// Log a warning message
pub fn log_warning(message: &str) {
    warn!("{}", message);
}

/// Log a debug message
pub fn log_debug(message: &str) {
    debug!("{}", message);
}

/// Log a trace message
pub fn log_trace(message: &str) {
    trace!("{}", message);
}

/// Convenience macro for logging errors
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error(&format!($($arg)*));
    };
}

/// Convenience macro for logging info messages
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info(&format!($($arg)*));
    };
}

/// Convenience macro for logging warning messages
#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::logging::log_warning(&format!($($arg)*));
    };
}

/// Convenience macro for logging debug messages
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug(&format!($($arg)*));
    };
}

/// Convenience macro for logging trace messages
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::logging::log_trace(&format!($($arg)*));
    };
}
