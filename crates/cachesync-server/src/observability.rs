//! Log setup.
//!
//! Logging starts before the configuration is read, so the filter sits behind a
//! reload layer: `init_tracing` installs a bootstrap level and
//! `apply_logging_level` swaps in `logging.level` once config is loaded.
//! `RUST_LOG`, when set, wins over both.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

const BOOTSTRAP_LEVEL: &str = "info";

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

fn rust_log_filter() -> Option<EnvFilter> {
    std::env::var_os("RUST_LOG")?;
    EnvFilter::try_from_default_env().ok()
}

pub fn init_tracing() {
    let filter = rust_log_filter().unwrap_or_else(|| EnvFilter::new(BOOTSTRAP_LEVEL));
    let (filter, handle) = reload::Layer::new(filter);
    if FILTER_HANDLE.set(handle).is_err() {
        return;
    }

    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_err()
    {
        eprintln!("Warning: a global tracing subscriber was already installed");
    }
}

/// Replace the active filter with `level`. Returns whether it was applied.
pub fn apply_logging_level(level: &str) -> bool {
    if rust_log_filter().is_some() {
        tracing::debug!(level, "RUST_LOG is set, ignoring logging.level");
        return false;
    }
    let Some(handle) = FILTER_HANDLE.get() else {
        return false;
    };
    match handle.modify(|filter| *filter = EnvFilter::new(level)) {
        Ok(()) => {
            tracing::info!(level, "log level applied");
            true
        }
        Err(e) => {
            tracing::warn!(level, error = %e, "failed to apply log level");
            false
        }
    }
}
