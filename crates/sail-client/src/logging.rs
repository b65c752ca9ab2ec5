//! Process-wide log output.
//!
//! The library logs through the `log` macros. [`init`] installs a
//! `tracing` subscriber that prints to stderr and forwards `log` records
//! into it. `RUST_LOG` overrides the level picked here.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogLevel;

/// Level used when neither `RUST_LOG` nor the meta config sets one.
pub const DEFAULT_LEVEL: LogLevel = LogLevel::Warn;

/// Filter directive for `level`, falling back to [`DEFAULT_LEVEL`].
pub fn default_filter(level: Option<LogLevel>) -> &'static str {
    level.unwrap_or(DEFAULT_LEVEL).as_filter()
}

/// Installs the global subscriber. Returns false if one was already set.
pub fn init(level: Option<LogLevel>) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    let subscriber = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return false;
    }
    if let Err(e) = tracing_log::LogTracer::init() {
        tracing::debug!("log bridge already installed: {}", e);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter(None), "warn");
        assert_eq!(default_filter(Some(LogLevel::Debug)), "debug");
        assert_eq!(default_filter(Some(LogLevel::Error)), "error");
    }
}
