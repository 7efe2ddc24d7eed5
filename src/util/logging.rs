//! Logging initialization and configuration.

use crate::config::LogFormat;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
///
/// # Arguments
///
/// * `level` - Log level filter (e.g., "info", "debug")
/// * `format` - Log output format (json or pretty)
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(level: &str, format: &LogFormat) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        // Only one global subscriber per process; whichever call loses must error
        let first = init_logging("debug", &LogFormat::Pretty);
        let second = init_logging("debug", &LogFormat::Json);
        assert!(first.is_ok() || second.is_err());
        assert!(second.is_err());
    }
}
