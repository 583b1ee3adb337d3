//! Logging setup driven by [`ServerConfig`].
//!
//! Production writes JSON to a daily rolling file in `server.log_dir` and a
//! compact copy to stdout for the journal. Development logs pretty output to
//! stdout with span events. `server.log_level` is the filter unless
//! `RUST_LOG` is set.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use beacon_core::ServerConfig;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Prefix for rolling log files (`beacon-server.YYYY-MM-DD`).
const LOG_FILE_PREFIX: &str = "beacon-server";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if `log_level` is not a valid filter, the log directory
/// cannot be created, or a global subscriber is already set.
pub fn init(settings: &ServerConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| filter(&settings.log_level))?;

    if settings.production {
        let log_dir = settings.log_dir();
        init_production(env_filter, &log_dir)?;
        info!(log_dir = %log_dir.display(), "File logging enabled");
        Ok(())
    } else {
        init_development(env_filter)
    }
}

fn filter(log_level: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_new(log_level).with_context(|| format!("Invalid log level '{log_level}'"))
}

fn init_production(env_filter: EnvFilter, log_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_stdout)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()?;

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);
    Ok(())
}

fn init_development(env_filter: EnvFilter) -> anyhow::Result<()> {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .try_init()?;
    Ok(())
}
