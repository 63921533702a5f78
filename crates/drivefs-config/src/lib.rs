mod defaults;
mod env;
pub mod types;
mod validation;

use std::path::Path;

pub use types::*;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Missing environment variables: {0:?}")]
    MissingEnvVars(Vec<String>),

    #[error("Invalid value for '{0}': {1}")]
    InvalidValue(String, String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DriveConfig {
    /// Parse a configuration from a YAML string.
    /// Environment variables in the format `${VAR_NAME}` will be interpolated.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let interpolated = env::interpolate_env(yaml)?;

        // An empty document means "all defaults".
        if interpolated.trim().is_empty() {
            return Ok(DriveConfig::default());
        }

        let config: DriveConfig = serde_yaml::from_str(&interpolated)?;
        Ok(config)
    }

    /// Load a configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
name: personal
auth:
  token_file: /var/lib/drivefs/token
mount:
  mountpoint: /mnt/drive
"#;

        let config = DriveConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.name, Some("personal".to_string()));
        assert_eq!(config.auth.token_file, "/var/lib/drivefs/token");
        assert_eq!(config.mount.mountpoint, Some("/mnt/drive".to_string()));
        // Untouched sections keep their defaults
        assert_eq!(config.listing.page_size, 200);
        assert_eq!(config.upload.part_size, ByteSize(10 * 1024 * 1024));
    }

    #[test]
    fn test_parse_empty_document_uses_defaults() {
        let config = DriveConfig::from_yaml("").unwrap();
        assert_eq!(config.auth.refresh_interval.as_duration(), Duration::from_secs(120));
        assert_eq!(config.retry.read_attempts, 5);
        assert!(config.cache.enabled);
        assert!(config.cache.ttl.is_none());
    }

    #[test]
    fn test_parse_with_env_vars() {
        std::env::set_var("DRIVEFS_TEST_REFRESH", "0123456789abcdef0123456789abcdef");

        let yaml = r#"
auth:
  refresh_token: ${DRIVEFS_TEST_REFRESH}
"#;

        let config = DriveConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.auth.refresh_token.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
    }

    #[test]
    fn test_parse_tuning_sections() {
        let yaml = r#"
upload:
  part_size: 4MiB
  rapid_min_size: 20KiB
retry:
  read_attempts: 3
  read_delay: 250ms
  backoff: linear
cache:
  ttl: 10m
"#;

        let config = DriveConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.upload.part_size, ByteSize(4 * 1024 * 1024));
        assert_eq!(config.upload.rapid_min_size, ByteSize(20 * 1024));
        assert_eq!(config.retry.read_attempts, 3);
        assert_eq!(config.retry.read_delay.as_duration(), Duration::from_millis(250));
        assert_eq!(config.retry.backoff, BackoffStrategy::Linear);
        assert_eq!(
            config.cache.ttl.map(|t| t.as_duration()),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn test_parse_rejects_bad_duration() {
        let yaml = r#"
auth:
  refresh_interval: soon
"#;
        assert!(matches!(
            DriveConfig::from_yaml(yaml),
            Err(ConfigError::YamlError(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("drivefs-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("drivefs.yaml");
        std::fs::write(&path, "listing:\n  page_size: 50\n").unwrap();

        let config = DriveConfig::from_file(&path).unwrap();
        assert_eq!(config.listing.page_size, 50);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_from_file_missing() {
        let err = DriveConfig::from_file(Path::new("/nonexistent/drivefs.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
