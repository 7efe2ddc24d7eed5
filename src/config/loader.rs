//! Configuration file loading.

use crate::config::{validate_config, Config};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Load configuration from a YAML file.
///
/// This function reads the file, parses the YAML, and validates the configuration.
/// Every section is optional, so an empty document yields the defaults.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse and validate configuration from a YAML string.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    // serde_yaml rejects an empty document, treat it as "all defaults"
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };

    validate_config(&config).map_err(ConfigError::ValidationError)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_full_config() {
        let yaml = r#"
global:
  log_level: debug
  log_format: json
listen:
  host: "127.0.0.1"
  port_search: 4
relay:
  connect_timeout: 3s
  idle_timeout: 90s
http:
  keep_alive: true
metrics:
  enabled: true
  address: "127.0.0.1:9191"
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.global.log_level, "debug");
        assert_eq!(config.listen.port_search, 4);
        assert_eq!(config.relay.idle_timeout, Duration::from_secs(90));
        assert!(config.http.keep_alive);
        assert_eq!(config.metrics.address.port(), 9191);
        assert_eq!(config.metrics.path, "/metrics");
    }

    #[test]
    fn test_load_empty_file() {
        let file = NamedTempFile::new().unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.relay.idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/path/config.yaml");
        assert!(matches!(result.unwrap_err(), ConfigError::ReadError(_)));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let result = parse_config("not: valid: yaml: {{{}}}");
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_fails_validation() {
        let result = parse_config("relay:\n  idle_timeout: 0s\n");
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(_)
        ));
    }
}
