//! Configuration validation.

use crate::config::Config;

/// Validate the configuration.
///
/// Checks for:
/// - A known log level
/// - Non-zero timeouts
/// - A port search span of at least one port
/// - A metrics path rooted at `/`
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if config.listen.port_search == 0 {
        errors.push("listen.port_search must be at least 1".to_string());
    }

    if config.relay.connect_timeout.is_zero() {
        errors.push("relay.connect_timeout must be greater than zero".to_string());
    }

    if config.relay.idle_timeout.is_zero() {
        errors.push("relay.idle_timeout must be greater than zero".to_string());
    }

    if config.http.header_read_timeout.is_zero() {
        errors.push("http.header_read_timeout must be greater than zero".to_string());
    }

    if config.metrics.enabled && !config.metrics.path.starts_with('/') {
        errors.push(format!(
            "metrics.path '{}' must start with '/'",
            config.metrics.path
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_valid_config() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.global.log_level = "loud".to_string();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("invalid log level"));
    }

    #[test]
    fn test_zero_port_search() {
        let mut config = Config::default();
        config.listen.port_search = 0;
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("port_search"));
    }

    #[test]
    fn test_zero_timeouts() {
        let mut config = Config::default();
        config.relay.connect_timeout = Duration::ZERO;
        config.relay.idle_timeout = Duration::ZERO;
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("connect_timeout"));
        assert!(err.contains("idle_timeout"));
    }

    #[test]
    fn test_metrics_path_checked_only_when_enabled() {
        let mut config = Config::default();
        config.metrics.path = "metrics".to_string();
        assert!(validate_config(&config).is_ok());

        config.metrics.enabled = true;
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("must start with '/'"));
    }
}
