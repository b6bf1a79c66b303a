use std::fs;
use std::path::Path;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::errors::{LauncherError, Result};

const LOG_FILE_PREFIX: &str = "game-updater.log";

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Installs the global subscriber: a daily rolling file under `log_dir`, plus
/// warnings on stderr when `echo_warnings` is set.
pub fn init(log_dir: &Path, echo_warnings: bool) -> Result<()> {
    fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_filter(filter);
    let stderr_layer = echo_warnings.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(LevelFilter::WARN)
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|err| LauncherError::Config(err.to_string()))?;

    tracing::info!(
        "logging initialized dir={} version={}",
        log_dir.display(),
        env!("CARGO_PKG_VERSION")
    );
    Ok(())
}
