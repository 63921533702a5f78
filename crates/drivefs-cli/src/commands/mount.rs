//! Mount command.

use std::path::PathBuf;

use drivefs_config::DriveConfig;
use drivefs_fuse::{DriveContext, DriveFsCore};
use tracing::info;

use super::Session;

/// Mount arguments.
pub struct MountArgs {
    /// Mount point; falls back to `mount.mountpoint`.
    pub mountpoint: Option<PathBuf>,
}

/// Authenticate, start the token refresher, and serve the mount until it
/// is unmounted.
pub async fn run(
    config: DriveConfig,
    cli_token: Option<String>,
    args: MountArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let mountpoint = args
        .mountpoint
        .or_else(|| config.mount.mountpoint.as_ref().map(PathBuf::from))
        .ok_or("No mount point given. Pass one or set mount.mountpoint")?;
    if !mountpoint.exists() {
        std::fs::create_dir_all(&mountpoint)?;
    }

    let session = Session::connect(&config, cli_token).await?;
    let refresher = session.spawn_refresher();
    info!(
        mountpoint = %mountpoint.display(),
        drive = %session.cell.load().drive_id,
        "authenticated"
    );

    let ctx = DriveContext::new(
        session.cloud(),
        session.cache.clone(),
        drivefs_fuse::MountSettings::from_config(&config),
    );
    let core = DriveFsCore::new(ctx);
    let mount_config = config.mount.clone();

    // fuser blocks the calling thread until unmount.
    let result = tokio::task::spawn_blocking(move || serve(core, &mountpoint, &mount_config)).await;
    refresher.abort();
    result??;
    Ok(())
}

#[cfg(unix)]
fn serve(
    core: DriveFsCore,
    mountpoint: &std::path::Path,
    config: &drivefs_config::MountConfig,
) -> Result<(), String> {
    core.mount(mountpoint, config).map_err(|e| e.to_string())
}

#[cfg(not(unix))]
fn serve(
    _core: DriveFsCore,
    _mountpoint: &std::path::Path,
    _config: &drivefs_config::MountConfig,
) -> Result<(), String> {
    Err("mounting is only supported on Unix hosts".to_string())
}
