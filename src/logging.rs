//! # Structured Logging
//!
//! Console output for operators plus a JSON log file per process under `log/`, both
//! filtered by the same environment-derived level. `RUST_LOG` overrides the level when
//! set.
//!
//! The file layer writes through a non-blocking appender. Its guard is held in a static
//! until [`flush_logs`] takes and drops it, which drains buffered lines to disk; call it
//! before the process exits.

use chrono::Utc;
use parking_lot::{const_mutex, Mutex};
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::config::detect_environment;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();
static FILE_WRITER_GUARD: Mutex<Option<WorkerGuard>> = const_mutex(None);

/// Initialise the global subscriber once per process. Later calls are no-ops, and an
/// already installed global subscriber (a test harness, an embedding application) is
/// left in place.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = detect_environment();
        let log_level = log_level_for(&environment);

        let log_dir = PathBuf::from("log");
        let file_layer = match std::fs::create_dir_all(&log_dir) {
            Ok(()) => {
                let file_name = format!(
                    "{}.{}.{}.log",
                    environment,
                    process::id(),
                    Utc::now().format("%Y%m%d_%H%M%S")
                );
                let appender = tracing_appender::rolling::never(&log_dir, file_name);
                Some(tracing_appender::non_blocking(appender))
            }
            Err(e) => {
                eprintln!("imagebatch: log directory unavailable, file logging disabled: {e}");
                None
            }
        };

        let (file_writer, guard) = match file_layer {
            Some((writer, guard)) => (Some(writer), Some(guard)),
            None => (None, None),
        };

        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_filter(build_filter(&log_level));

        let file = file_writer.map(|writer| {
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(build_filter(&log_level))
        });

        if tracing_subscriber::registry()
            .with(console)
            .with(file)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            "🔧 Structured logging initialized"
        );

        *FILE_WRITER_GUARD.lock() = guard;
    });
}

/// Flush buffered file log lines and stop the file writer. Later events still reach the
/// console layer.
pub fn flush_logs() {
    if let Some(guard) = FILE_WRITER_GUARD.lock().take() {
        drop(guard);
    }
}

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn log_level_for(environment: &str) -> String {
    match environment {
        "production" => "info",
        _ => "debug",
    }
    .to_string()
}

/// Log a batch-level milestone
pub fn log_batch_operation(
    operation: &str,
    batch_uuid: Uuid,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        batch_uuid = %batch_uuid,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📦 BATCH_OPERATION"
    );
}

/// Log a unit-level milestone
pub fn log_unit_operation(
    operation: &str,
    batch_uuid: Uuid,
    image_unit_uuid: Uuid,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        batch_uuid = %batch_uuid,
        image_unit_uuid = %image_unit_uuid,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🖼️ UNIT_OPERATION"
    );
}

/// Log an error with the component and operation it interrupted
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(log_level_for("test"), "debug");
        assert_eq!(log_level_for("development"), "debug");
        assert_eq!(log_level_for("production"), "info");
    }

    #[test]
    fn test_flush_logs_releases_writer_guard() {
        let (_writer, guard) = tracing_appender::non_blocking(std::io::sink());
        *FILE_WRITER_GUARD.lock() = Some(guard);

        flush_logs();
        assert!(FILE_WRITER_GUARD.lock().is_none());

        // A second flush with nothing held is a no-op
        flush_logs();
        assert!(FILE_WRITER_GUARD.lock().is_none());
    }
}
