//! Shared fixture: a filesystem core over an in-memory drive.

use std::sync::Arc;

use drivefs_core::{MetadataCache, RetrySettings};
use drivefs_fuse::{DriveContext, DriveFsCore, MountSettings};
use drivefs_remote::MemoryDrive;
use tempfile::TempDir;

pub struct Mounted {
    pub drive: Arc<MemoryDrive>,
    pub fs: Arc<DriveFsCore>,
    _staging: TempDir,
}

pub fn mount(drive: MemoryDrive) -> Mounted {
    let drive = Arc::new(drive);
    let staging = tempfile::tempdir().unwrap();
    let settings = MountSettings {
        retry: RetrySettings::none(),
        staging_dir: staging.path().to_path_buf(),
        ..MountSettings::default()
    };
    let ctx = DriveContext::new(drive.clone(), Arc::new(MetadataCache::unbounded()), settings);
    Mounted {
        drive,
        fs: Arc::new(DriveFsCore::new(ctx)),
        _staging: staging,
    }
}

/// Open, write `content` at offset zero, and release a new file.
pub async fn write_file(fs: &DriveFsCore, parent: u64, name: &str, content: &[u8]) -> u64 {
    let (snap, fh) = fs.do_create(parent, name).await.unwrap();
    if !content.is_empty() {
        let written = fs.do_write(fh, 0, content).await.unwrap();
        assert_eq!(written as usize, content.len());
    }
    fs.do_release(fh).await.unwrap();
    snap.id
}

/// Names returned by a full readdir, excluding "." and "..".
pub async fn list_names(fs: &DriveFsCore, ino: u64) -> Vec<String> {
    let fh = fs.do_opendir(ino).unwrap();
    let entries = fs.do_readdir(fh, 0).await.unwrap();
    fs.do_releasedir(fh).unwrap();
    entries
        .iter()
        .filter(|e| e.name != "." && e.name != "..")
        .map(|e| e.name.clone())
        .collect()
}
