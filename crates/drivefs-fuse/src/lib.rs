//! FUSE filesystem over a cloud drive.
//!
//! Maps the drive's id-addressed folder tree to a POSIX namespace: stable
//! inode numbers, paged directory listings, streamed reads, and whole-file
//! uploads staged locally and committed on flush.
//!
//! # Architecture
//!
//! - `inode`: the inode graph and its lock discipline
//! - `dir_handle` / `file_handle`: per-open state
//! - `upload`: rapid and multipart upload
//! - `common`: `DriveFsCore`, every filesystem operation as an async `do_*`
//! - `unix_fuse`: `fuser::Filesystem` impl for macOS/Linux
//!
//! # Example
//!
//! ```ignore
//! use drivefs_fuse::{DriveContext, DriveFsCore};
//!
//! let ctx = DriveContext::from_config(client, &config);
//! DriveFsCore::new(ctx).mount(&mountpoint, &config.mount)?;
//! ```

pub mod async_bridge;
pub mod common;
pub mod context;
pub mod dir_handle;
pub mod file_handle;
pub mod inode;
pub mod resolver;
#[cfg(unix)]
pub mod unix_fuse;
pub mod upload;

pub use async_bridge::{init_runtime, spawn};
pub use common::{DriveFsCore, MountError, StatFs};
pub use context::{DriveContext, MountSettings};
pub use dir_handle::DirEntry;
pub use inode::{InodeSnapshot, InodeTree, NO_PARENT, ROOT_INO};
pub use resolver::{split_path, PathResolver};
pub use upload::{upload, UploadOutcome};
