//! Platform-neutral filesystem operations.
//!
//! [`DriveFsCore`] holds the per-mount context and the open handle tables.
//! The host adapter turns kernel callbacks into `do_*` calls and their
//! errors into errno values.

use std::collections::HashMap;
#[cfg(unix)]
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

#[cfg(unix)]
use drivefs_config::MountConfig;
use drivefs_core::{CacheKey, DriveError, DriveResult, FileKind, Quota, RemoteFile};

use crate::context::{DriveContext, MountSettings};
use crate::dir_handle::{fetch_listing, refresh_directory, DirEntry, DirHandle};
use crate::file_handle::FileHandle;
use crate::inode::{AttrExpiry, InodeSnapshot, NewInode};

/// How long a fetched quota answers statfs.
const QUOTA_TTL: Duration = Duration::from_secs(30);

pub const BLOCK_SIZE: u32 = 4096;
pub const IO_SIZE: u32 = 2 * 1024 * 1024;
pub const MAX_INODES: u64 = 1_000_000_000;
pub const NAME_MAX: u32 = 255;

/// Errors that end a mount.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("mount failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Drive(#[from] DriveError),
}

/// Filesystem statistics for statfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    /// Preferred I/O size.
    pub bsize: u32,
    pub namelen: u32,
    /// Unit of the block counts.
    pub frsize: u32,
}

impl StatFs {
    pub fn from_quota(quota: &Quota) -> Self {
        let block = BLOCK_SIZE as u64;
        StatFs {
            blocks: quota.total / block,
            bfree: quota.free() / block,
            bavail: quota.free() / block,
            files: MAX_INODES,
            ffree: MAX_INODES,
            bsize: IO_SIZE,
            namelen: NAME_MAX,
            frsize: BLOCK_SIZE,
        }
    }
}

/// Temporary name for a destination being replaced by `src`.
fn aside_name(name: &str, src: u64) -> String {
    format!(".{}.replaced-{}", name, src)
}

fn other_kind(kind: FileKind) -> FileKind {
    match kind {
        FileKind::File => FileKind::Folder,
        FileKind::Folder => FileKind::File,
    }
}

/// The mounted drive.
pub struct DriveFsCore {
    ctx: DriveContext,
    dirs: Mutex<HashMap<u64, Arc<DirHandle>>>,
    files: Mutex<HashMap<u64, Arc<FileHandle>>>,
    next_fh: AtomicU64,
    quota: Mutex<Option<(Quota, Instant)>>,
}

impl DriveFsCore {
    pub fn new(ctx: DriveContext) -> Self {
        DriveFsCore {
            ctx,
            dirs: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            quota: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &DriveContext {
        &self.ctx
    }

    pub fn settings(&self) -> &MountSettings {
        &self.ctx.settings
    }

    pub fn open_file_count(&self) -> usize {
        self.files.lock().len()
    }

    fn allocate_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn file_handle(&self, fh: u64) -> DriveResult<Arc<FileHandle>> {
        self.files
            .lock()
            .get(&fh)
            .cloned()
            .ok_or_else(|| DriveError::invariant(format!("unknown file handle {}", fh)))
    }

    fn dir_handle(&self, fh: u64) -> DriveResult<Arc<DirHandle>> {
        self.dirs
            .lock()
            .get(&fh)
            .cloned()
            .ok_or_else(|| DriveError::invariant(format!("unknown directory handle {}", fh)))
    }

    fn dir_remote_id(&self, ino: u64) -> DriveResult<String> {
        let dir = self.ctx.tree.snapshot(ino)?;
        if !dir.is_dir() {
            return Err(DriveError::WrongKind {
                name: dir.name,
                expected: FileKind::Folder,
            });
        }
        dir.remote_id
            .ok_or_else(|| DriveError::invariant(format!("directory inode {} has no remote id", ino)))
    }

    /// Remote entries named `name` under `parent_id`, both kinds. Only
    /// non-empty results are cached.
    async fn search(&self, parent_id: &str, name: &str) -> DriveResult<Arc<Vec<RemoteFile>>> {
        if let Some(hit) = self.ctx.cache.search(parent_id, name) {
            return Ok(hit);
        }
        let mut items = self
            .ctx
            .client
            .search(parent_id, name, FileKind::Folder)
            .await?;
        items.extend(
            self.ctx
                .client
                .search(parent_id, name, FileKind::File)
                .await?,
        );
        if !items.is_empty() {
            self.ctx.cache.set_search(parent_id, name, items.clone());
        }
        Ok(Arc::new(items))
    }

    /// Child `name` of `parent`, asking the remote when the tree does not know
    /// it. A cached listing is merged; otherwise the name is searched for.
    async fn child(&self, parent: u64, name: &str, kind: Option<FileKind>) -> DriveResult<Option<u64>> {
        let tree = &self.ctx.tree;
        if let Some(ino) = tree.find_child(parent, name, kind)? {
            return Ok(Some(ino));
        }
        let remote = self.dir_remote_id(parent)?;
        if self.ctx.cache.listing(&remote).is_some() {
            refresh_directory(&self.ctx, parent).await?;
        } else {
            let ttl = self.ctx.settings.attr_ttl;
            for item in self.search(&remote, name).await?.iter() {
                if item.name == name && kind.map_or(true, |k| k == item.kind) {
                    tree.upsert_child(parent, item, ttl)?;
                    self.ctx.cache.set_file(item);
                }
            }
        }
        tree.find_child(parent, name, kind)
    }

    fn invalidate_entry(&self, parent_remote: &str, name: &str) {
        self.ctx.cache.invalidate_listing(parent_remote);
        self.ctx.cache.invalidate_search(parent_remote, name);
    }

    /// Fail with NotEmpty if the directory has remote or unflushed children.
    async fn ensure_empty(&self, ino: u64) -> DriveResult<()> {
        let snap = self.ctx.tree.snapshot(ino)?;
        if let Some(remote) = &snap.remote_id {
            let items = fetch_listing(self.ctx.client.as_ref(), &self.ctx.cache, remote).await?;
            if !items.is_empty() {
                return Err(DriveError::NotEmpty(snap.name));
            }
        }
        let unflushed = self
            .ctx
            .tree
            .children(ino)?
            .iter()
            .filter(|c| !c.is_synthetic())
            .any(|c| {
                self.ctx
                    .tree
                    .snapshot(c.ino)
                    .map(|s| s.remote_id.is_none())
                    .unwrap_or(false)
            });
        if unflushed {
            return Err(DriveError::NotEmpty(snap.name));
        }
        Ok(())
    }

    /// Trash a remote object, treating an already missing one as gone.
    async fn trash(&self, remote_id: &str) -> DriveResult<()> {
        match self.ctx.client.trash(remote_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(file = %remote_id, "already gone remotely"),
            Err(e) => return Err(e),
        }
        self.ctx.cache.invalidate_file(remote_id);
        Ok(())
    }

    /// Move `remote_id` from folder `from` to `to`, then give it `new_name`.
    /// A failed rename moves it back.
    async fn relocate(
        &self,
        remote_id: &str,
        from: &str,
        to: &str,
        new_name: Option<&str>,
    ) -> DriveResult<()> {
        let client = &self.ctx.client;
        if from != to {
            client.move_file(remote_id, to).await?;
        }
        if let Some(new_name) = new_name {
            if let Err(e) = client.rename(remote_id, new_name).await {
                if from != to {
                    if let Err(undo) = client.move_file(remote_id, from).await {
                        warn!(file = %remote_id, error = %undo, "could not move source back");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    // ====== Lookup & Attributes ======

    pub async fn do_lookup(&self, parent: u64, name: &str) -> DriveResult<InodeSnapshot> {
        debug!(parent, name, "lookup");
        let ino = self
            .child(parent, name, None)
            .await?
            .ok_or_else(|| DriveError::NotFound(name.to_string()))?;
        self.do_getattr(ino).await?;
        self.ctx.tree.ref_inode(ino)?;
        self.ctx.tree.snapshot(ino)
    }

    pub fn do_forget(&self, ino: u64, nlookup: u64) -> DriveResult<()> {
        if self.ctx.tree.forget(ino, nlookup)? {
            debug!(ino, "inode forgotten");
        }
        Ok(())
    }

    /// Attributes of `ino`, re-fetched once they have expired.
    pub async fn do_getattr(&self, ino: u64) -> DriveResult<InodeSnapshot> {
        let snap = self.ctx.tree.snapshot(ino)?;
        if snap.expiry.is_fresh() || snap.local_dirty {
            return Ok(snap);
        }
        let Some(remote_id) = snap.remote_id.clone() else {
            return Ok(snap);
        };
        let file = match self.ctx.cache.file(&remote_id) {
            Some(file) => file,
            None => {
                let file = self.ctx.client.detail(&remote_id).await?;
                self.ctx.cache.set_file(&file);
                file
            }
        };
        let inode = self.ctx.tree.lookup(ino)?;
        inode
            .lock()
            .apply_remote(&file, AttrExpiry::after(self.ctx.settings.attr_ttl));
        Ok(inode.snapshot())
    }

    /// Apply a size change. Other attributes are not settable.
    pub async fn do_setattr(
        &self,
        ino: u64,
        size: Option<u64>,
        fh: Option<u64>,
    ) -> DriveResult<InodeSnapshot> {
        if let Some(size) = size {
            let snap = self.ctx.tree.snapshot(ino)?;
            if snap.is_dir() {
                return Err(DriveError::WrongKind {
                    name: snap.name,
                    expected: FileKind::File,
                });
            }
            let open = {
                let files = self.files.lock();
                fh.and_then(|fh| files.get(&fh).cloned())
                    .or_else(|| files.values().find(|h| h.ino == ino).cloned())
            };
            match open {
                Some(handle) => handle.truncate(&self.ctx, size).await?,
                None => {
                    let handle = FileHandle::new(ino);
                    self.ctx.tree.open_handle(ino)?;
                    let result = async {
                        handle.truncate(&self.ctx, size).await?;
                        handle.flush(&self.ctx).await
                    }
                    .await;
                    self.ctx.tree.close_handle(ino)?;
                    result?;
                }
            }
        }
        self.do_getattr(ino).await
    }

    // ====== Namespace ======

    pub async fn do_mkdir(&self, parent: u64, name: &str) -> DriveResult<InodeSnapshot> {
        debug!(parent, name, "mkdir");
        let parent_remote = self.dir_remote_id(parent)?;
        if self.child(parent, name, Some(FileKind::Folder)).await?.is_some() {
            return Err(DriveError::AlreadyExists(name.to_string()));
        }
        let folder = self.ctx.client.mkdir(&parent_remote, name).await?;
        self.invalidate_entry(&parent_remote, name);
        self.ctx.cache.set_file(&folder);

        let inode = self
            .ctx
            .tree
            .insert(parent, NewInode::from_remote(&folder, self.ctx.settings.attr_ttl))?;
        self.ctx.tree.ref_inode(inode.id)?;
        Ok(inode.snapshot())
    }

    /// Create a local file and open it. The remote file appears when the
    /// handle is flushed.
    pub async fn do_create(&self, parent: u64, name: &str) -> DriveResult<(InodeSnapshot, u64)> {
        debug!(parent, name, "create");
        self.dir_remote_id(parent)?;
        if self.child(parent, name, Some(FileKind::File)).await?.is_some() {
            return Err(DriveError::AlreadyExists(name.to_string()));
        }
        let inode = self.ctx.tree.insert(parent, NewInode::local_file(name))?;
        self.ctx.tree.ref_inode(inode.id)?;
        self.ctx.tree.open_handle(inode.id)?;

        let fh = self.allocate_fh();
        self.files
            .lock()
            .insert(fh, Arc::new(FileHandle::created(inode.id)));
        Ok((inode.snapshot(), fh))
    }

    pub async fn do_unlink(&self, parent: u64, name: &str) -> DriveResult<()> {
        debug!(parent, name, "unlink");
        let parent_remote = self.dir_remote_id(parent)?;
        let Some(ino) = self.child(parent, name, Some(FileKind::File)).await? else {
            if self.child(parent, name, Some(FileKind::Folder)).await?.is_some() {
                return Err(DriveError::WrongKind {
                    name: name.to_string(),
                    expected: FileKind::File,
                });
            }
            return Err(DriveError::NotFound(name.to_string()));
        };

        if let Some(remote_id) = self.ctx.tree.snapshot(ino)?.remote_id {
            self.trash(&remote_id).await?;
        }
        self.invalidate_entry(&parent_remote, name);
        self.ctx.tree.detach(parent, name, FileKind::File)?;
        self.ctx.tree.collect(ino)?;
        Ok(())
    }

    pub async fn do_rmdir(&self, parent: u64, name: &str) -> DriveResult<()> {
        debug!(parent, name, "rmdir");
        let parent_remote = self.dir_remote_id(parent)?;
        let Some(ino) = self.child(parent, name, Some(FileKind::Folder)).await? else {
            if self.child(parent, name, Some(FileKind::File)).await?.is_some() {
                return Err(DriveError::WrongKind {
                    name: name.to_string(),
                    expected: FileKind::Folder,
                });
            }
            return Err(DriveError::NotFound(name.to_string()));
        };

        self.ensure_empty(ino).await?;
        if let Some(remote_id) = self.ctx.tree.snapshot(ino)?.remote_id {
            self.trash(&remote_id).await?;
            self.ctx.cache.invalidate_listing(&remote_id);
        }
        self.invalidate_entry(&parent_remote, name);
        self.ctx.tree.detach(parent, name, FileKind::Folder)?;
        self.ctx.tree.collect(ino)?;
        Ok(())
    }

    /// POSIX rename: a same-kind destination is replaced, a non-empty
    /// destination directory refuses, a cross-kind destination is an error.
    pub async fn do_rename(
        &self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> DriveResult<()> {
        debug!(parent, name, new_parent, new_name, "rename");
        let tree = &self.ctx.tree;
        let old_remote = self.dir_remote_id(parent)?;
        let new_remote = self.dir_remote_id(new_parent)?;

        let src = self
            .child(parent, name, None)
            .await?
            .ok_or_else(|| DriveError::NotFound(name.to_string()))?;
        let src_snap = tree.snapshot(src)?;
        let kind = src_snap.kind;
        if parent == new_parent && name == new_name {
            return Ok(());
        }

        let dst = self.child(new_parent, new_name, Some(kind)).await?;
        if dst.is_none()
            && self
                .child(new_parent, new_name, Some(other_kind(kind)))
                .await?
                .is_some()
        {
            return Err(DriveError::WrongKind {
                name: new_name.to_string(),
                expected: kind,
            });
        }

        let mut replaced = None;
        if let Some(dst) = dst {
            if dst == src {
                return Ok(());
            }
            if kind.is_folder() {
                self.ensure_empty(dst).await?;
            }
            replaced = Some((dst, tree.snapshot(dst)?.remote_id));
        }

        // The replaced destination moves out of the way under a temporary
        // name and is trashed only after the source has landed.
        let aside = match replaced.as_ref().and_then(|(_, id)| id.clone()) {
            Some(dst_remote) => {
                let temp = aside_name(new_name, src);
                self.ctx.client.rename(&dst_remote, &temp).await?;
                Some((dst_remote, temp))
            }
            None => None,
        };

        if let Some(remote_id) = &src_snap.remote_id {
            let target_name = (name != new_name).then_some(new_name);
            match self
                .relocate(remote_id, &old_remote, &new_remote, target_name)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() && src_snap.open_handles > 0 => {
                    debug!(ino = src, "source not yet on the remote, rename completes on flush");
                }
                Err(e) => {
                    if let Some((dst_remote, _)) = &aside {
                        if let Err(undo) = self.ctx.client.rename(dst_remote, new_name).await {
                            warn!(file = %dst_remote, error = %undo, "could not restore replaced destination");
                        }
                    }
                    self.invalidate_entry(&new_remote, new_name);
                    return Err(e);
                }
            }
            self.ctx.cache.invalidate_file(remote_id);
            self.ctx.cache.delete(&CacheKey::Path(remote_id.clone()));
        }

        if let Some((dst_remote, temp)) = &aside {
            if let Err(e) = self.trash(dst_remote).await {
                warn!(file = %dst_remote, name = %temp, error = %e, "replaced destination left behind");
            }
        }

        if replaced.is_some() {
            tree.detach(new_parent, new_name, kind)?;
        }
        tree.rename_local(parent, name, kind, new_parent, new_name)?;
        if let Some((dst, _)) = replaced {
            tree.collect(dst)?;
        }
        self.invalidate_entry(&old_remote, name);
        self.invalidate_entry(&new_remote, new_name);
        Ok(())
    }

    // ====== Directories ======

    pub fn do_opendir(&self, ino: u64) -> DriveResult<u64> {
        self.dir_remote_id(ino)?;
        let fh = self.allocate_fh();
        self.dirs.lock().insert(fh, Arc::new(DirHandle::new(ino)));
        Ok(fh)
    }

    pub async fn do_readdir(&self, fh: u64, offset: i64) -> DriveResult<Arc<Vec<DirEntry>>> {
        let handle = self.dir_handle(fh)?;
        handle.read_directory(&self.ctx, offset).await
    }

    pub fn do_releasedir(&self, fh: u64) -> DriveResult<()> {
        self.dirs
            .lock()
            .remove(&fh)
            .map(|_| ())
            .ok_or_else(|| DriveError::invariant(format!("unknown directory handle {}", fh)))
    }

    // ====== Files ======

    pub async fn do_open(&self, ino: u64, truncate: bool) -> DriveResult<u64> {
        let snap = self.ctx.tree.snapshot(ino)?;
        if snap.is_dir() {
            return Err(DriveError::WrongKind {
                name: snap.name,
                expected: FileKind::File,
            });
        }
        let handle = Arc::new(FileHandle::new(ino));
        self.ctx.tree.open_handle(ino)?;
        if truncate {
            if let Err(e) = handle.truncate(&self.ctx, 0).await {
                self.ctx.tree.close_handle(ino)?;
                return Err(e);
            }
        }
        let fh = self.allocate_fh();
        self.files.lock().insert(fh, handle);
        Ok(fh)
    }

    pub async fn do_read(&self, fh: u64, offset: u64, size: u32) -> DriveResult<Vec<u8>> {
        self.file_handle(fh)?.read(&self.ctx, offset, size).await
    }

    pub async fn do_write(&self, fh: u64, offset: u64, data: &[u8]) -> DriveResult<u32> {
        self.file_handle(fh)?.write(&self.ctx, offset, data).await
    }

    pub async fn do_flush(&self, fh: u64) -> DriveResult<()> {
        self.file_handle(fh)?.flush(&self.ctx).await
    }

    pub async fn do_fsync(&self, fh: u64) -> DriveResult<()> {
        self.do_flush(fh).await
    }

    /// Close a handle, uploading pending writes first.
    pub async fn do_release(&self, fh: u64) -> DriveResult<()> {
        let handle = self
            .files
            .lock()
            .remove(&fh)
            .ok_or_else(|| DriveError::invariant(format!("unknown file handle {}", fh)))?;
        let result = handle.flush(&self.ctx).await;
        if let Err(e) = &result {
            warn!(ino = handle.ino, error = %e, "upload on release failed");
        }
        self.ctx.tree.close_handle(handle.ino)?;
        self.ctx.tree.collect(handle.ino)?;
        result
    }

    // ====== Filesystem ======

    pub async fn do_statfs(&self) -> DriveResult<StatFs> {
        let cached = *self.quota.lock();
        let quota = match cached {
            Some((quota, at)) if at.elapsed() < QUOTA_TTL => quota,
            _ => {
                let quota = self.ctx.client.quota().await?;
                *self.quota.lock() = Some((quota, Instant::now()));
                quota
            }
        };
        Ok(StatFs::from_quota(&quota))
    }

    /// Mount at `mountpoint` and serve requests until unmounted.
    #[cfg(unix)]
    pub fn mount(self, mountpoint: &Path, config: &MountConfig) -> Result<(), MountError> {
        use crate::unix_fuse::UnixFuse;
        use fuser::MountOption;

        let mut options = vec![
            MountOption::FSName(config.fs_name.clone()),
            MountOption::DefaultPermissions,
        ];
        if config.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        if config.allow_other {
            options.push(MountOption::AllowOther);
        }

        crate::async_bridge::init_runtime()?;
        info!(mountpoint = %mountpoint.display(), "mounting drive");
        fuser::mount2(UnixFuse::new(self), mountpoint, &options)?;
        info!(mountpoint = %mountpoint.display(), "drive unmounted");
        Ok(())
    }
}
