use std::path::PathBuf;

use crate::types::DriveConfig;

impl DriveConfig {
    /// Apply default inference rules to the configuration.
    /// This mutates the config in place.
    pub fn apply_defaults(&mut self) {
        // 1. Staging directory falls back to the system temp dir
        if self.mount.staging_dir.is_none() {
            self.mount.staging_dir = Some(default_staging_dir().to_string_lossy().into_owned());
        }

        // 2. An inline token that is blank counts as absent
        if self
            .auth
            .refresh_token
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            self.auth.refresh_token = None;
        }

        // 3. Base URLs are joined with paths, so drop trailing slashes
        let trimmed = self.api.base_url.trim_end_matches('/').len();
        self.api.base_url.truncate(trimmed);
    }

    /// Returns a new config with all defaults applied.
    pub fn effective(&self) -> DriveConfig {
        let mut config = self.clone();
        config.apply_defaults();
        config
    }

    /// Staging directory after defaults.
    pub fn staging_dir(&self) -> PathBuf {
        self.mount
            .staging_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_staging_dir)
    }
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("drivefs-staging")
}
