//! Logging for the reporter.
//!
//! The reporter shares stderr with the test runner, so by default only
//! warnings go there. Setting `IDE_MOCHA_REPORTER_LOG` sends everything at
//! debug level to a file instead: a path, or `1` for the default location.

use std::env;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "IDE_MOCHA_REPORTER_LOG";
const DEFAULT_LOG_RELATIVE_DIR: &str = ".ide-mocha/logs";
const DEFAULT_LOG_FILE: &str = "reporter.log";

/// Keep the returned guard alive until exit so buffered lines are flushed.
pub fn init() -> Option<WorkerGuard> {
    match log_file_path(env::var(LOG_ENV).ok().as_deref()) {
        Some(path) => match init_file(&path) {
            Some(guard) => Some(guard),
            None => {
                init_stderr();
                None
            }
        },
        None => {
            init_stderr();
            None
        }
    }
}

fn init_stderr() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn init_file(path: &Path) -> Option<WorkerGuard> {
    let directory = path.parent()?;
    let file_name = path.file_name()?;
    fs_err::create_dir_all(directory).ok()?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}

fn log_file_path(value: Option<&str>) -> Option<PathBuf> {
    let value = value.map(str::trim).filter(|value| !value.is_empty())?;
    if matches!(value, "0" | "false" | "FALSE" | "no" | "NO") {
        return None;
    }
    if matches!(value, "1" | "true" | "TRUE" | "yes" | "YES") {
        let home = dirs::home_dir()?;
        return Some(home.join(DEFAULT_LOG_RELATIVE_DIR).join(DEFAULT_LOG_FILE));
    }
    Some(PathBuf::from(value))
}
