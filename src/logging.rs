//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log filter:
//! 1. the level passed by the caller (if provided)
//! 2. the `PTG_LOG` environment variable, in `EnvFilter` syntax
//!    (e.g. "info", "ptg::deps=trace")
//! 3. default to `info`

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt};

/// Environment variable read when no level is given.
pub const LOG_ENV: &str = "PTG_LOG";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoggingError {
    #[error("cannot install the log subscriber: {0}")]
    Install(String),
}

/// Install the global subscriber, writing to stderr.
///
/// # Errors
/// If a global subscriber is already installed.
pub fn init_logging(level: Option<Level>) -> Result<(), LoggingError> {
    let filter = match level {
        Some(level) => EnvFilter::default().add_directive(LevelFilter::from_level(level).into()),
        None => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")),
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))
}
