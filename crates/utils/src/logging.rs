//! tracing bootstrap shared by the policy and its test harnesses

use std::env;
use std::path::Path;
use std::sync::OnceLock;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_PREFIX: &str = "corepin.log";
const ENABLE_LOG_ENV_VAR: &str = "COREPIN_ENABLE_LOG";
const LOG_PATH_ENV_VAR: &str = "COREPIN_LOG_PATH";
const LOG_LEVEL_ENV_VAR: &str = "COREPIN_LOG_LEVEL";
const LOG_OFF: &str = "off";
const MAX_LOG_FILES: usize = 7;

// keeps the non-blocking writer thread alive for the process lifetime
static LOG_WORKER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter() -> EnvFilter {
    match env::var(ENABLE_LOG_ENV_VAR).as_deref() {
        Ok(LOG_OFF) | Ok("0") | Ok("false") => EnvFilter::new(LOG_OFF),
        _ => EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .with_env_var(LOG_LEVEL_ENV_VAR)
            .from_env_lossy(),
    }
}

/// Install the global tracing subscriber. Logs go to stdout unless
/// `COREPIN_LOG_PATH` points at a file or directory, in which case a
/// daily-rolling non-blocking appender is used instead.
pub fn init() {
    let filter = env_filter();

    match env::var(LOG_PATH_ENV_VAR) {
        Ok(path) => {
            let path = Path::new(&path);
            let (dir, prefix) = if path.is_dir() {
                (path, DEFAULT_LOG_PREFIX.to_string())
            } else {
                let dir = path.parent().expect("log path has no parent directory");
                let prefix = path
                    .file_name()
                    .expect("log path has no file name")
                    .to_string_lossy()
                    .into_owned();
                (dir, prefix)
            };

            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(MAX_LOG_FILES)
                .build(dir)
                .expect("failed to create rolling file appender");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            LOG_WORKER_GUARD
                .set(guard)
                .expect("logging initialized twice");

            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(filter)
                .init();
        }
    }
}
