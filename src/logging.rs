use crate::config::ensure_private_dir;
use std::path::Path;
use std::sync::{LazyLock, Mutex};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{
    fmt::{self},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

static LOGGER_INITIALIZED: std::sync::Once = std::sync::Once::new();

// Keep the guard alive for the lifetime of the program
static FILE_APPENDER_GUARD: LazyLock<Mutex<Option<tracing_appender::non_blocking::WorkerGuard>>> =
    LazyLock::new(|| Mutex::new(None));

pub const LOG_FILE_NAME: &str = "uploader.log";

/// Install the console and rolling-file subscribers. Safe to call more than once.
pub fn init_logging(logs_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    ensure_private_dir(logs_dir)?;

    LOGGER_INITIALIZED.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));

        // Console logging - compact format
        let console_layer = fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .with_filter(env_filter.clone());

        // File logging, one JSON object per line, rotated daily
        let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if let Ok(mut guard_mutex) = FILE_APPENDER_GUARD.lock() {
            *guard_mutex = Some(guard);
        }

        let file_layer = fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_filter(env_filter);

        // Another subscriber may already be installed (tests, embedding apps)
        let _ = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init();
    });

    Ok(())
}

pub fn log_event(component: &str, level: &str, message: &str) {
    match level {
        "ERROR" => error!(component = component, "{}", message),
        "WARN" => warn!(component = component, "{}", message),
        "DEBUG" => debug!(component = component, "{}", message),
        _ => info!(component = component, "{}", message),
    }
}

// Convenience functions for different log levels
pub fn log_debug(component: &str, message: &str) {
    log_event(component, "DEBUG", message)
}

pub fn log_info(component: &str, message: &str) {
    log_event(component, "INFO", message)
}

pub fn log_warn(component: &str, message: &str) {
    log_event(component, "WARN", message)
}

pub fn log_error(component: &str, message: &str) {
    log_event(component, "ERROR", message)
}
