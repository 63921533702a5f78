use crate::types::DriveConfig;
use crate::ConfigError;

/// Smallest part size the remote accepts for multipart uploads.
const MIN_PART_SIZE: u64 = 100 * 1024;

/// Largest listing page the remote serves.
const MAX_PAGE_SIZE: u32 = 200;

impl DriveConfig {
    /// Validate the configuration and return a list of errors.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.listing.page_size == 0 || self.listing.page_size > MAX_PAGE_SIZE {
            errors.push(ConfigError::InvalidValue(
                "listing.page_size".to_string(),
                format!("must be between 1 and {}", MAX_PAGE_SIZE),
            ));
        }

        if self.upload.part_size.as_u64() < MIN_PART_SIZE {
            errors.push(ConfigError::InvalidValue(
                "upload.part_size".to_string(),
                format!("must be at least {} bytes", MIN_PART_SIZE),
            ));
        }

        if self.upload.rapid_min_size >= self.upload.rapid_max_size {
            errors.push(ConfigError::InvalidValue(
                "upload.rapid_min_size".to_string(),
                "must be smaller than upload.rapid_max_size".to_string(),
            ));
        }

        for (field, attempts) in [
            ("retry.read_attempts", self.retry.read_attempts),
            ("retry.part_attempts", self.retry.part_attempts),
            ("retry.renew_attempts", self.retry.renew_attempts),
        ] {
            if attempts == 0 {
                errors.push(ConfigError::InvalidValue(
                    field.to_string(),
                    "must allow at least one attempt".to_string(),
                ));
            }
        }

        for (field, mode) in [
            ("mount.dir_mode", self.mount.dir_mode),
            ("mount.file_mode", self.mount.file_mode),
        ] {
            if mode > 0o7777 {
                errors.push(ConfigError::InvalidValue(
                    field.to_string(),
                    format!("{:o} is not a permission mode", mode),
                ));
            }
        }

        if self.auth.refresh_interval.as_duration().is_zero() {
            errors.push(ConfigError::InvalidValue(
                "auth.refresh_interval".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        if self.auth.refresh_token.is_none() && self.auth.token_file.trim().is_empty() {
            errors.push(ConfigError::InvalidConfig(
                "either auth.refresh_token or auth.token_file must be set".to_string(),
            ));
        }

        if self.mount.fs_name.trim().is_empty() {
            errors.push(ConfigError::InvalidValue(
                "mount.fs_name".to_string(),
                "must not be empty".to_string(),
            ));
        }

        errors
    }

    /// Validate and return Ok(()) if valid, or Err with the first error.
    pub fn validate_or_err(&self) -> Result<(), ConfigError> {
        match self.validate().into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
