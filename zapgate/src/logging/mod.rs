//! Logging initialization.
//!
//! Console output plus a daily-rotated file under the log directory. The
//! filter comes from `RUST_LOG` with a gateway-centric default.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "zapgate=info,tower_http=warn,sqlx=warn";

/// Initialize logging with console and file layers.
///
/// The returned guard must be kept alive for the lifetime of the process;
/// dropping it stops the non-blocking file writer.
pub fn init_logging(log_dir: impl AsRef<Path>) -> Result<WorkerGuard> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "zapgate.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .map_err(|e| Error::config(format!("invalid log filter: {e}")))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .try_init()
        .map_err(|e| Error::config(format!("failed to initialize logging: {e}")))?;

    Ok(guard)
}
