//! Per-mount shared state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use drivefs_config::DriveConfig;
use drivefs_core::{create_cache, CloudClient, MetadataCache, RetrySettings, SharedCache};

use crate::inode::InodeTree;

/// Tunables the filesystem layer reads on every request.
#[derive(Debug, Clone)]
pub struct MountSettings {
    pub attr_ttl: Duration,
    pub dir_mode: u16,
    pub file_mode: u16,
    pub part_size: u64,
    /// Exclusive lower bound for the rapid-upload probe.
    pub rapid_min_size: u64,
    /// Inclusive upper bound for the rapid-upload probe.
    pub rapid_max_size: u64,
    pub retry: RetrySettings,
    pub staging_dir: PathBuf,
}

impl MountSettings {
    pub fn from_config(config: &DriveConfig) -> Self {
        MountSettings {
            attr_ttl: config.mount.attr_ttl.as_duration(),
            dir_mode: config.mount.dir_mode,
            file_mode: config.mount.file_mode,
            part_size: config.upload.part_size.as_u64(),
            rapid_min_size: config.upload.rapid_min_size.as_u64(),
            rapid_max_size: config.upload.rapid_max_size.as_u64(),
            retry: RetrySettings::from_config(&config.retry),
            staging_dir: config.staging_dir(),
        }
    }

    /// Is a file of `size` bytes eligible for the rapid-upload probe?
    pub fn rapid_candidate(&self, size: u64) -> bool {
        size > self.rapid_min_size && size <= self.rapid_max_size
    }
}

impl Default for MountSettings {
    fn default() -> Self {
        Self::from_config(&DriveConfig::default().effective())
    }
}

/// Everything a request needs: the client, the shared cache, the inode
/// graph and the settings. The client carries the credential cell.
pub struct DriveContext {
    pub client: Arc<dyn CloudClient>,
    pub cache: SharedCache,
    pub tree: InodeTree,
    pub settings: MountSettings,
}

impl DriveContext {
    pub fn new(client: Arc<dyn CloudClient>, cache: SharedCache, settings: MountSettings) -> Self {
        DriveContext {
            client,
            cache,
            tree: InodeTree::new(),
            settings,
        }
    }

    pub fn from_config(client: Arc<dyn CloudClient>, config: &DriveConfig) -> Self {
        Self::new(
            client,
            create_cache(&config.cache),
            MountSettings::from_config(config),
        )
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }
}
