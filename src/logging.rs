//! Tracing setup.
//!
//! Human-readable events go to stderr. When a run directory is known, the
//! same events are also written as JSON lines to a daily-rolled file under
//! `<run>/logs/`.

use std::path::Path;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "RUNWRIGHT_LOG";

fn filter(verbose: u8) -> EnvFilter {
    let default = match verbose {
        0 => "runwright=info",
        1 => "runwright=debug",
        _ => "runwright=trace",
    };
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the whole invocation. Calling this twice is a no-op.
pub fn init(verbose: u8, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2)
        .compact()
        .with_filter(filter(verbose));

    let (file_layer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, "runwright.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(false)
                .with_filter(filter(verbose.max(1)));
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        debug!(verbose, "Logging initialized");
        guard
    } else {
        None
    }
}
