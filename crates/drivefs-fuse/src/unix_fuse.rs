//! Unix FUSE binding using the `fuser` crate.
//!
//! Every request is dispatched as its own task on the shared runtime and
//! replied to from that task.

use std::ffi::OsStr;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, error, warn};

use drivefs_core::{DriveError, FileKind};

use crate::async_bridge;
use crate::common::{DriveFsCore, BLOCK_SIZE};
use crate::context::MountSettings;
use crate::inode::{InodeSnapshot, NO_PARENT, ROOT_INO};

/// Map an error to the errno the kernel sees. Invariant violations are
/// logged here, once per failed request.
pub fn errno_for(e: &DriveError, op: &str) -> i32 {
    match e {
        DriveError::NotFound(_) => libc::ENOENT,
        DriveError::AlreadyExists(_) => libc::EEXIST,
        DriveError::NotEmpty(_) => libc::ENOTEMPTY,
        DriveError::WrongKind {
            expected: FileKind::Folder,
            ..
        } => libc::ENOTDIR,
        DriveError::WrongKind {
            expected: FileKind::File,
            ..
        } => libc::EISDIR,
        DriveError::Invariant(msg) => {
            error!(op, error = %msg, "invariant violated");
            libc::EIO
        }
        DriveError::Io(io) => io.raw_os_error().unwrap_or(libc::EIO),
        other => {
            warn!(op, error = %other, "request failed");
            libc::EIO
        }
    }
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::File => FileType::RegularFile,
        FileKind::Folder => FileType::Directory,
    }
}

/// Convert an inode snapshot to the attributes reported to the kernel.
pub fn to_file_attr(snap: &InodeSnapshot, settings: &MountSettings, uid: u32, gid: u32) -> FileAttr {
    let (perm, nlink) = if snap.is_dir() {
        (settings.dir_mode, 2)
    } else {
        (settings.file_mode, 1)
    };
    FileAttr {
        ino: snap.id,
        size: snap.attrs.size,
        blocks: snap.attrs.size.div_ceil(512),
        atime: snap.attrs.mtime,
        mtime: snap.attrs.mtime,
        ctime: snap.attrs.mtime,
        crtime: snap.attrs.crtime,
        kind: file_type(snap.kind),
        perm,
        nlink,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// `fuser` adapter around [`DriveFsCore`].
pub struct UnixFuse {
    core: Arc<DriveFsCore>,
    uid: u32,
    gid: u32,
}

impl UnixFuse {
    pub fn new(core: DriveFsCore) -> Self {
        // SAFETY: getuid/getgid cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        UnixFuse {
            core: Arc::new(core),
            uid,
            gid,
        }
    }

    fn ttl(&self) -> Duration {
        self.core.settings().attr_ttl
    }

    fn dispatch<F>(&self, op: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // A dropped reply answers EIO.
        if let Err(e) = async_bridge::spawn(future) {
            error!(op, error = %e, "cannot dispatch request");
        }
    }

    /// Context an entry/attr reply needs inside a task.
    fn attr_ctx(&self) -> (Arc<DriveFsCore>, Duration, u32, u32) {
        (self.core.clone(), self.ttl(), self.uid, self.gid)
    }
}

macro_rules! utf8_or_einval {
    ($name:expr, $reply:expr) => {
        match $name.to_str() {
            Some(n) => n.to_string(),
            None => {
                $reply.error(libc::EINVAL);
                return;
            }
        }
    };
}

impl Filesystem for UnixFuse {
    fn destroy(&mut self) {
        debug!(open_files = self.core.open_file_count(), "filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = utf8_or_einval!(name, reply);
        let (core, ttl, uid, gid) = self.attr_ctx();
        self.dispatch("lookup", async move {
            match core.do_lookup(parent, &name).await {
                Ok(snap) => {
                    let attr = to_file_attr(&snap, core.settings(), uid, gid);
                    reply.entry(&ttl, &attr, 0);
                }
                Err(e) => reply.error(errno_for(&e, "lookup")),
            }
        });
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        if let Err(e) = self.core.do_forget(ino, nlookup) {
            errno_for(&e, "forget");
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let (core, ttl, uid, gid) = self.attr_ctx();
        self.dispatch("getattr", async move {
            match core.do_getattr(ino).await {
                Ok(snap) => reply.attr(&ttl, &to_file_attr(&snap, core.settings(), uid, gid)),
                Err(e) => reply.error(errno_for(&e, "getattr")),
            }
        });
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(ino, ?size, "setattr");
        let (core, ttl, uid, gid) = self.attr_ctx();
        self.dispatch("setattr", async move {
            match core.do_setattr(ino, size, fh).await {
                Ok(snap) => reply.attr(&ttl, &to_file_attr(&snap, core.settings(), uid, gid)),
                Err(e) => reply.error(errno_for(&e, "setattr")),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = utf8_or_einval!(name, reply);
        let (core, ttl, uid, gid) = self.attr_ctx();
        self.dispatch("mkdir", async move {
            match core.do_mkdir(parent, &name).await {
                Ok(snap) => reply.entry(&ttl, &to_file_attr(&snap, core.settings(), uid, gid), 0),
                Err(e) => reply.error(errno_for(&e, "mkdir")),
            }
        });
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = utf8_or_einval!(name, reply);
        let core = self.core.clone();
        self.dispatch("unlink", async move {
            match core.do_unlink(parent, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno_for(&e, "unlink")),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = utf8_or_einval!(name, reply);
        let core = self.core.clone();
        self.dispatch("rmdir", async move {
            match core.do_rmdir(parent, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno_for(&e, "rmdir")),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = utf8_or_einval!(name, reply);
        let newname = utf8_or_einval!(newname, reply);
        let core = self.core.clone();
        self.dispatch("rename", async move {
            match core.do_rename(parent, &name, newparent, &newname).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno_for(&e, "rename")),
            }
        });
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let core = self.core.clone();
        let truncate = flags & libc::O_TRUNC != 0;
        self.dispatch("open", async move {
            match core.do_open(ino, truncate).await {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(errno_for(&e, "open")),
            }
        });
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = utf8_or_einval!(name, reply);
        let (core, ttl, uid, gid) = self.attr_ctx();
        self.dispatch("create", async move {
            match core.do_create(parent, &name).await {
                Ok((snap, fh)) => {
                    let attr = to_file_attr(&snap, core.settings(), uid, gid);
                    reply.created(&ttl, &attr, 0, fh, 0);
                }
                Err(e) => reply.error(errno_for(&e, "create")),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let core = self.core.clone();
        self.dispatch("read", async move {
            match core.do_read(fh, offset.max(0) as u64, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(errno_for(&e, "read")),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let core = self.core.clone();
        let data = data.to_vec();
        self.dispatch("write", async move {
            match core.do_write(fh, offset.max(0) as u64, &data).await {
                Ok(written) => reply.written(written),
                Err(e) => reply.error(errno_for(&e, "write")),
            }
        });
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let core = self.core.clone();
        self.dispatch("flush", async move {
            match core.do_flush(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno_for(&e, "flush")),
            }
        });
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let core = self.core.clone();
        self.dispatch("fsync", async move {
            match core.do_fsync(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno_for(&e, "fsync")),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let core = self.core.clone();
        self.dispatch("release", async move {
            match core.do_release(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno_for(&e, "release")),
            }
        });
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.core.do_opendir(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno_for(&e, "opendir")),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!(ino, offset, "readdir");
        let core = self.core.clone();
        self.dispatch("readdir", async move {
            match core.do_readdir(fh, offset).await {
                Ok(entries) => {
                    for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
                        let ino = if entry.ino == NO_PARENT { ROOT_INO } else { entry.ino };
                        if reply.add(ino, (i + 1) as i64, file_type(entry.kind), &entry.name) {
                            break;
                        }
                    }
                    reply.ok();
                }
                Err(e) => reply.error(errno_for(&e, "readdir")),
            }
        });
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.core.do_releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_for(&e, "releasedir")),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let core = self.core.clone();
        self.dispatch("statfs", async move {
            match core.do_statfs().await {
                Ok(st) => reply.statfs(
                    st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                    st.frsize,
                ),
                Err(e) => reply.error(errno_for(&e, "statfs")),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::{AttrExpiry, InodeAttrs};

    fn snapshot(kind: FileKind, size: u64) -> InodeSnapshot {
        InodeSnapshot {
            id: 42,
            kind,
            name: "x".to_string(),
            remote_id: Some("f-1".to_string()),
            remote_parent_id: Some("root".to_string()),
            parent: Some(ROOT_INO),
            attrs: InodeAttrs {
                size,
                ..InodeAttrs::empty()
            },
            expiry: AttrExpiry::Never,
            ref_count: 1,
            open_handles: 0,
            local_dirty: false,
        }
    }

    // ====== Attribute Conversion ======

    #[test]
    fn test_file_attr_conversion() {
        let settings = MountSettings::default();
        let attr = to_file_attr(&snapshot(FileKind::File, 1025), &settings, 1000, 100);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 1025);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.uid, 1000);
        assert_eq!(attr.gid, 100);
        assert_eq!(attr.blksize, 4096);
    }

    #[test]
    fn test_dir_attr_conversion() {
        let settings = MountSettings::default();
        let attr = to_file_attr(&snapshot(FileKind::Folder, 0), &settings, 0, 0);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.nlink, 2);
    }

    // ====== Errno Mapping ======

    #[test]
    fn test_errno_mapping() {
        let wrong = |expected| DriveError::WrongKind {
            name: "x".to_string(),
            expected,
        };
        assert_eq!(errno_for(&DriveError::NotFound("x".into()), "t"), libc::ENOENT);
        assert_eq!(errno_for(&DriveError::AlreadyExists("x".into()), "t"), libc::EEXIST);
        assert_eq!(errno_for(&DriveError::NotEmpty("x".into()), "t"), libc::ENOTEMPTY);
        assert_eq!(errno_for(&wrong(FileKind::Folder), "t"), libc::ENOTDIR);
        assert_eq!(errno_for(&wrong(FileKind::File), "t"), libc::EISDIR);
        assert_eq!(errno_for(&DriveError::invariant("bad"), "t"), libc::EIO);
        assert_eq!(
            errno_for(
                &DriveError::transient("list", std::io::Error::other("reset")),
                "t"
            ),
            libc::EIO
        );
        assert_eq!(
            errno_for(&DriveError::RemoteConflict("x".into()), "t"),
            libc::EIO
        );
    }
}
