//! Paginated directory listing and per-open-directory snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use drivefs_core::{CloudClient, DriveError, DriveResult, FileKind, MetadataCache, RemoteFile};

use crate::context::DriveContext;
use crate::inode::{ChildEntry, InodeTree};

/// Fetch every child of `parent_id`, following continuation markers until the
/// remote stops returning one. A cached listing is returned as is; a fetched
/// one is stored.
pub async fn fetch_listing(
    client: &dyn CloudClient,
    cache: &MetadataCache,
    parent_id: &str,
) -> DriveResult<Arc<Vec<RemoteFile>>> {
    if let Some(items) = cache.listing(parent_id) {
        trace!(parent = %parent_id, count = items.len(), "listing served from cache");
        return Ok(items);
    }

    let mut items = Vec::new();
    let mut marker: Option<String> = None;
    let mut pages = 0u32;
    loop {
        let page = client.list(parent_id, marker.as_deref(), None).await?;
        pages += 1;
        items.extend(page.items.iter().cloned());
        match page.continuation() {
            Some(next) if marker.as_deref() == Some(next) => {
                return Err(DriveError::Remote {
                    operation: "list".to_string(),
                    status: 200,
                    message: format!("marker {} repeated", next),
                });
            }
            Some(next) => marker = Some(next.to_string()),
            None => break,
        }
    }

    debug!(parent = %parent_id, count = items.len(), pages, "listing fetched");
    cache.set_listing(parent_id, items.clone());
    Ok(Arc::new(items))
}

/// Merge a listing into the tree under `dir_ino` and record every entry's
/// detail in the cache. Children gone from the listing are pruned. Returns
/// the child ids in listing order.
pub fn merge_listing(
    tree: &InodeTree,
    cache: &MetadataCache,
    dir_ino: u64,
    items: &[RemoteFile],
    ttl: std::time::Duration,
) -> DriveResult<Vec<u64>> {
    let merged = items
        .iter()
        .map(|item| {
            let ino = tree.upsert_child(dir_ino, item, ttl)?;
            cache.set_file(item);
            Ok(ino)
        })
        .collect::<DriveResult<Vec<u64>>>()?;

    let listed: HashSet<&str> = items.iter().map(|item| item.file_id.as_str()).collect();
    let pruned = tree.prune_missing(dir_ino, &listed)?;
    if !pruned.is_empty() {
        debug!(dir = dir_ino, count = pruned.len(), "pruned children gone from the remote");
    }
    Ok(merged)
}

/// List the remote directory behind `dir_ino` and merge it into the tree.
pub async fn refresh_directory(ctx: &DriveContext, dir_ino: u64) -> DriveResult<Vec<u64>> {
    let dir = ctx.tree.snapshot(dir_ino)?;
    if !dir.is_dir() {
        return Err(DriveError::WrongKind {
            name: dir.name,
            expected: FileKind::Folder,
        });
    }
    let Some(remote_id) = dir.remote_id else {
        return Ok(Vec::new());
    };
    let items = fetch_listing(ctx.client.as_ref(), &ctx.cache, &remote_id).await?;
    merge_listing(&ctx.tree, &ctx.cache, dir_ino, &items, ctx.settings.attr_ttl)
}

/// One entry handed to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub kind: FileKind,
}

impl From<&ChildEntry> for DirEntry {
    fn from(child: &ChildEntry) -> Self {
        DirEntry {
            ino: child.ino,
            name: child.name.clone(),
            kind: child.kind,
        }
    }
}

/// State of one open directory.
pub struct DirHandle {
    pub ino: u64,
    snapshot: Mutex<Option<Arc<Vec<DirEntry>>>>,
}

impl DirHandle {
    pub fn new(ino: u64) -> Self {
        DirHandle {
            ino,
            snapshot: Mutex::new(None),
        }
    }

    /// Entries for a readdir at `offset`. Offset zero lists the directory
    /// afresh; later offsets are served from the snapshot taken then.
    pub async fn read_directory(
        &self,
        ctx: &DriveContext,
        offset: i64,
    ) -> DriveResult<Arc<Vec<DirEntry>>> {
        if offset > 0 {
            if let Some(snapshot) = self.snapshot.lock().clone() {
                return Ok(snapshot);
            }
        }

        let listed = refresh_directory(ctx, self.ino).await?;
        let children = ctx.tree.children(self.ino)?;

        // "." and "..", then the listing order, then children not yet uploaded.
        let mut entries: Vec<DirEntry> = children
            .iter()
            .filter(|c| c.is_synthetic())
            .map(DirEntry::from)
            .collect();
        let by_ino: HashMap<u64, &ChildEntry> = children
            .iter()
            .filter(|c| !c.is_synthetic())
            .map(|c| (c.ino, c))
            .collect();
        let mut seen = HashSet::with_capacity(listed.len());
        for ino in &listed {
            if let Some(child) = by_ino.get(ino) {
                if seen.insert(*ino) {
                    entries.push(DirEntry::from(*child));
                }
            }
        }
        entries.extend(
            children
                .iter()
                .filter(|c| !c.is_synthetic() && !seen.contains(&c.ino))
                .filter(|c| {
                    ctx.tree
                        .snapshot(c.ino)
                        .map(|s| s.remote_id.is_none())
                        .unwrap_or(false)
                })
                .map(DirEntry::from),
        );

        let snapshot = Arc::new(entries);
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use drivefs_core::RetrySettings;
    use drivefs_remote::MemoryDrive;

    use crate::context::MountSettings;
    use crate::inode::{NewInode, ROOT_INO};

    fn context(drive: Arc<MemoryDrive>) -> DriveContext {
        let settings = MountSettings {
            retry: RetrySettings::none(),
            ..MountSettings::default()
        };
        DriveContext::new(drive, Arc::new(MetadataCache::unbounded()), settings)
    }

    fn names(entries: &[DirEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    // ====== Fetch ======

    #[tokio::test]
    async fn test_empty_listing_is_cached() {
        let drive = MemoryDrive::new();
        let cache = MetadataCache::unbounded();
        let items = fetch_listing(&drive, &cache, "root").await.unwrap();
        assert!(items.is_empty());
        assert!(cache.listing("root").is_some());

        fetch_listing(&drive, &cache, "root").await.unwrap();
        assert_eq!(drive.stats().list_calls, 1);
    }

    #[tokio::test]
    async fn test_listing_of_missing_folder_fails() {
        let drive = MemoryDrive::new();
        let cache = MetadataCache::unbounded();
        assert!(fetch_listing(&drive, &cache, "nope").await.is_err());
        assert!(cache.listing("nope").is_none());
    }

    // ====== Merge ======

    #[tokio::test]
    async fn test_merge_reuses_inodes() {
        let drive = Arc::new(MemoryDrive::new());
        drive.add_folder("root", "a");
        drive.add_file("root", "b.txt", b"b".to_vec());
        let ctx = context(drive.clone());

        let first = refresh_directory(&ctx, ROOT_INO).await.unwrap();
        ctx.cache.invalidate_listing("root");
        let second = refresh_directory(&ctx, ROOT_INO).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert!(ctx.cache.file(&drive.find("root", "b.txt").unwrap().file_id).is_some());
        ctx.tree.check_index_consistency(ROOT_INO).unwrap();
    }

    // ====== Read Directory ======

    #[tokio::test]
    async fn test_read_directory_order_and_snapshot() {
        let drive = Arc::new(MemoryDrive::new());
        drive.add_file("root", "old.txt", b"o".to_vec());
        drive.add_file("root", "new.txt", b"n".to_vec());
        let ctx = context(drive.clone());
        ctx.tree
            .insert(ROOT_INO, NewInode::local_file("draft.txt"))
            .unwrap();

        let handle = DirHandle::new(ROOT_INO);
        let entries = handle.read_directory(&ctx, 0).await.unwrap();
        assert_eq!(names(&entries), vec![".", "..", "new.txt", "old.txt", "draft.txt"]);
        assert_eq!(entries[0].ino, ROOT_INO);

        // Later offsets keep the snapshot even after the remote changes.
        drive.add_file("root", "later.txt", b"l".to_vec());
        ctx.cache.invalidate_listing("root");
        let continued = handle.read_directory(&ctx, 3).await.unwrap();
        assert!(Arc::ptr_eq(&entries, &continued));

        let restarted = handle.read_directory(&ctx, 0).await.unwrap();
        assert_eq!(restarted.len(), 6);
        assert_eq!(restarted[2].name, "later.txt");
    }

    #[tokio::test]
    async fn test_read_directory_on_file_fails() {
        let drive = Arc::new(MemoryDrive::new());
        let file = drive.add_file("root", "f", b"f".to_vec());
        let ctx = context(drive);
        let ino = ctx
            .tree
            .insert(ROOT_INO, NewInode::from_remote(&file, Duration::from_secs(1)))
            .unwrap()
            .id;

        let err = DirHandle::new(ino).read_directory(&ctx, 0).await.unwrap_err();
        assert!(matches!(
            err,
            DriveError::WrongKind {
                expected: FileKind::Folder,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_file_removed_remotely_leaves_directory() {
        let drive = Arc::new(MemoryDrive::new());
        let gone = drive.add_file("root", "gone.txt", b"g".to_vec());
        drive.add_file("root", "keep.txt", b"k".to_vec());
        let ctx = context(drive.clone());
        let handle = DirHandle::new(ROOT_INO);
        assert_eq!(handle.read_directory(&ctx, 0).await.unwrap().len(), 4);
        let gone_ino = ctx.tree.find_child(ROOT_INO, "gone.txt", None).unwrap().unwrap();

        drive.trash(&gone.file_id).await.unwrap();
        ctx.cache.clear();
        let entries = handle.read_directory(&ctx, 0).await.unwrap();
        assert_eq!(names(&entries), vec![".", "..", "keep.txt"]);
        assert_eq!(ctx.tree.find_child(ROOT_INO, "gone.txt", None).unwrap(), None);
        assert!(!ctx.tree.contains(gone_ino));
        ctx.tree.check_index_consistency(ROOT_INO).unwrap();
    }

    #[tokio::test]
    async fn test_open_file_removed_remotely_stays_addressable() {
        let drive = Arc::new(MemoryDrive::new());
        let gone = drive.add_file("root", "gone.txt", b"g".to_vec());
        let ctx = context(drive.clone());
        let handle = DirHandle::new(ROOT_INO);
        handle.read_directory(&ctx, 0).await.unwrap();
        let ino = ctx.tree.find_child(ROOT_INO, "gone.txt", None).unwrap().unwrap();
        ctx.tree.open_handle(ino).unwrap();

        drive.trash(&gone.file_id).await.unwrap();
        ctx.cache.clear();
        let entries = handle.read_directory(&ctx, 0).await.unwrap();
        assert_eq!(names(&entries), vec![".", ".."]);
        assert!(ctx.tree.contains(ino));
    }
}
