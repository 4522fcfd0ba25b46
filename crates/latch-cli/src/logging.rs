//! Logging initialization and configuration.
//!
//! - **Production**: JSON logs to a daily rolling file + compact logs to stderr
//! - **Development**: Pretty logs to stderr
//!
//! Command output goes to stdout, so logs never do.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use latch_core::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the non-blocking writers alive for the lifetime of the program.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDERR_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize logging.
///
/// The filter comes from `RUST_LOG`, then `LATCH_LOG_LEVEL`, then the
/// configured level.
///
/// # Errors
///
/// Returns an error if the filter cannot be parsed.
pub fn init(config: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        "debug".to_string()
    } else {
        std::env::var("LATCH_LOG_LEVEL").unwrap_or_else(|_| config.level.clone())
    };

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&level))?;

    if config.production {
        init_production(env_filter, &log_directory(config.directory.as_deref()));
    } else {
        init_development(env_filter);
    }

    Ok(())
}

fn init_production(env_filter: EnvFilter, log_dir: &Path) {
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir).ok();
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "latch");
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_stderr)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDERR_GUARD.set(stderr_guard);
}

fn init_development(env_filter: EnvFilter) {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .init();
}

/// Configured directory, else the platform data dir, else `./logs`.
fn log_directory(configured: Option<&Path>) -> PathBuf {
    if let Some(dir) = configured {
        return dir.to_path_buf();
    }
    directories::ProjectDirs::from("", "", "latch")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("./logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_prefers_configured() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(log_directory(Some(dir.path())), dir.path());
    }

    #[test]
    fn test_log_directory_is_valid_path() {
        assert!(!log_directory(None).as_os_str().is_empty());
    }
}
