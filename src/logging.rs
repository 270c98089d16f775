//! Logging initialisation for vmscreen.
//!
//! When the `VMSCREEN_LOG` environment variable is set to `1`, structured
//! logs are also written to `vmscreen.log` in the log directory. Otherwise
//! only stderr output (filtered by `RUST_LOG`) is enabled.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Whether file logging was requested through the environment.
pub fn file_logging_requested() -> bool {
    std::env::var("VMSCREEN_LOG").as_deref() == Ok("1")
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main` with the resolved log directory (if any), store the
/// returned `LogGuard` in a local variable for the duration of the process.
pub fn init(log_dir: Option<&Path>) -> LogGuard {
    let file_guard = if file_logging_requested() {
        let dir = log_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(dir, "vmscreen.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}
