//! Inode arena for the mounted drive.
//!
//! The tree owns every inode by id. Directories hold `(name, kind, id)`
//! child entries and children hold their parent's id, never a pointer.
//! A secondary index maps `(parent remote id, name, kind)` to inode ids.
//!
//! Locking: the table lock guards the id map and the index; each inode has
//! its own lock for children and attributes. Inode locks are taken before
//! the table lock, several inode locks in ascending id order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, trace};

use drivefs_core::{DriveError, DriveResult, FileKind, RemoteFile, ROOT_FILE_ID};

/// Inode of the mount root.
pub const ROOT_INO: u64 = 1;

/// Parent id recorded in the root's `..` entry.
pub const NO_PARENT: u64 = 0;

/// When cached attributes stop being trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrExpiry {
    At(Instant),
    /// Pinned.
    Never,
}

impl AttrExpiry {
    pub fn after(ttl: Duration) -> Self {
        AttrExpiry::At(Instant::now() + ttl)
    }

    pub fn is_fresh(&self) -> bool {
        match self {
            AttrExpiry::Never => true,
            AttrExpiry::At(deadline) => Instant::now() < *deadline,
        }
    }

    /// Move the expiry forward to `other`. Never shortens, never unpins.
    pub fn extend(&mut self, other: AttrExpiry) {
        match (*self, other) {
            (AttrExpiry::Never, _) => {}
            (_, AttrExpiry::Never) => *self = AttrExpiry::Never,
            (AttrExpiry::At(current), AttrExpiry::At(next)) => {
                if next > current {
                    *self = AttrExpiry::At(next);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InodeAttrs {
    pub size: u64,
    pub mtime: SystemTime,
    pub crtime: SystemTime,
}

impl InodeAttrs {
    pub fn empty() -> Self {
        let now = SystemTime::now();
        InodeAttrs {
            size: 0,
            mtime: now,
            crtime: now,
        }
    }

    pub fn from_remote(file: &RemoteFile) -> Self {
        let mtime = file
            .updated_at
            .map(SystemTime::from)
            .unwrap_or_else(SystemTime::now);
        InodeAttrs {
            size: if file.is_folder() { 0 } else { file.size },
            mtime,
            crtime: file.created_at.map(SystemTime::from).unwrap_or(mtime),
        }
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
        self.mtime = SystemTime::now();
    }
}

/// One entry of a directory's children list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub name: String,
    pub kind: FileKind,
    pub ino: u64,
}

impl ChildEntry {
    pub fn is_synthetic(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Mutable part of an inode, behind the inode's own lock.
#[derive(Debug)]
pub struct InodeState {
    pub name: String,
    /// `None` until a locally created file is first uploaded.
    pub remote_id: Option<String>,
    pub remote_parent_id: Option<String>,
    /// `None` once detached from the tree.
    pub parent: Option<u64>,
    pub attrs: InodeAttrs,
    pub expiry: AttrExpiry,
    /// Present iff the inode is a directory.
    pub children: Option<Vec<ChildEntry>>,
    pub ref_count: u64,
    pub open_handles: u32,
    /// Local writes not yet uploaded; remote attributes must not overwrite them.
    pub local_dirty: bool,
    removed: bool,
}

impl InodeState {
    /// Merge attributes and identity from a remote record.
    pub fn apply_remote(&mut self, file: &RemoteFile, expiry: AttrExpiry) {
        self.remote_id = Some(file.file_id.clone());
        if !self.local_dirty {
            self.attrs = InodeAttrs::from_remote(file);
        }
        self.expiry.extend(expiry);
    }

    fn index_key(&self, kind: FileKind) -> Option<IndexKey> {
        self.remote_parent_id
            .as_ref()
            .map(|parent| (parent.clone(), self.name.clone(), kind))
    }

    fn real_children(&self) -> impl Iterator<Item = &ChildEntry> {
        self.children
            .iter()
            .flatten()
            .filter(|c| !c.is_synthetic())
    }
}

#[derive(Debug)]
pub struct Inode {
    pub id: u64,
    pub kind: FileKind,
    state: Mutex<InodeState>,
}

impl Inode {
    pub fn lock(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock()
    }

    pub fn snapshot(&self) -> InodeSnapshot {
        let state = self.state.lock();
        InodeSnapshot {
            id: self.id,
            kind: self.kind,
            name: state.name.clone(),
            remote_id: state.remote_id.clone(),
            remote_parent_id: state.remote_parent_id.clone(),
            parent: state.parent,
            attrs: state.attrs,
            expiry: state.expiry,
            ref_count: state.ref_count,
            open_handles: state.open_handles,
            local_dirty: state.local_dirty,
        }
    }
}

/// Point-in-time copy of an inode.
#[derive(Debug, Clone)]
pub struct InodeSnapshot {
    pub id: u64,
    pub kind: FileKind,
    pub name: String,
    pub remote_id: Option<String>,
    pub remote_parent_id: Option<String>,
    pub parent: Option<u64>,
    pub attrs: InodeAttrs,
    pub expiry: AttrExpiry,
    pub ref_count: u64,
    pub open_handles: u32,
    pub local_dirty: bool,
}

impl InodeSnapshot {
    pub fn is_dir(&self) -> bool {
        self.kind.is_folder()
    }
}

/// Description of an inode to insert.
#[derive(Debug, Clone)]
pub struct NewInode {
    pub name: String,
    pub kind: FileKind,
    pub remote_id: Option<String>,
    pub attrs: InodeAttrs,
    pub expiry: AttrExpiry,
}

impl NewInode {
    pub fn from_remote(file: &RemoteFile, ttl: Duration) -> Self {
        NewInode {
            name: file.name.clone(),
            kind: file.kind,
            remote_id: Some(file.file_id.clone()),
            attrs: InodeAttrs::from_remote(file),
            expiry: AttrExpiry::after(ttl),
        }
    }

    /// A file created locally and not yet uploaded.
    pub fn local_file(name: &str) -> Self {
        NewInode {
            name: name.to_string(),
            kind: FileKind::File,
            remote_id: None,
            attrs: InodeAttrs::empty(),
            expiry: AttrExpiry::Never,
        }
    }
}

type IndexKey = (String, String, FileKind);

struct Table {
    inodes: HashMap<u64, Arc<Inode>>,
    index: HashMap<IndexKey, u64>,
    next_id: u64,
}

/// The inode arena.
pub struct InodeTree {
    table: RwLock<Table>,
}

impl Default for InodeTree {
    fn default() -> Self {
        Self::new()
    }
}

fn synthetic_children(id: u64, parent: u64) -> Vec<ChildEntry> {
    vec![
        ChildEntry {
            name: ".".to_string(),
            kind: FileKind::Folder,
            ino: id,
        },
        ChildEntry {
            name: "..".to_string(),
            kind: FileKind::Folder,
            ino: parent,
        },
    ]
}

fn not_a_dir(state: &InodeState) -> DriveError {
    DriveError::WrongKind {
        name: state.name.clone(),
        expected: FileKind::Folder,
    }
}

impl InodeTree {
    /// Create a tree holding only the root.
    pub fn new() -> Self {
        let root = Arc::new(Inode {
            id: ROOT_INO,
            kind: FileKind::Folder,
            state: Mutex::new(InodeState {
                name: String::new(),
                remote_id: Some(ROOT_FILE_ID.to_string()),
                remote_parent_id: None,
                parent: None,
                attrs: InodeAttrs::empty(),
                expiry: AttrExpiry::Never,
                children: Some(synthetic_children(ROOT_INO, NO_PARENT)),
                ref_count: 1,
                open_handles: 0,
                local_dirty: false,
                removed: false,
            }),
        });
        let mut inodes = HashMap::new();
        inodes.insert(ROOT_INO, root);
        InodeTree {
            table: RwLock::new(Table {
                inodes,
                index: HashMap::new(),
                next_id: ROOT_INO,
            }),
        }
    }

    /// Next unused inode id.
    pub fn allocate_id(&self) -> u64 {
        let mut table = self.table.write();
        table.next_id += 1;
        table.next_id
    }

    pub fn lookup(&self, id: u64) -> DriveResult<Arc<Inode>> {
        self.table
            .read()
            .inodes
            .get(&id)
            .cloned()
            .ok_or_else(|| DriveError::invariant(format!("unknown inode {}", id)))
    }

    pub fn snapshot(&self, id: u64) -> DriveResult<InodeSnapshot> {
        Ok(self.lookup(id)?.snapshot())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.table.read().inodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.table.read().inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a new child under `parent_id` and return it.
    pub fn insert(&self, parent_id: u64, new: NewInode) -> DriveResult<Arc<Inode>> {
        let parent = self.lookup(parent_id)?;
        let mut parent_state = parent.lock();
        if parent_state.children.is_none() {
            return Err(not_a_dir(&parent_state));
        }
        if parent_state
            .real_children()
            .any(|c| c.name == new.name && c.kind == new.kind)
        {
            return Err(DriveError::AlreadyExists(new.name));
        }

        let parent_remote = parent_state.remote_id.clone();
        let id = self.allocate_id();
        let inode = Arc::new(Inode {
            id,
            kind: new.kind,
            state: Mutex::new(InodeState {
                name: new.name.clone(),
                remote_id: new.remote_id,
                remote_parent_id: parent_remote.clone(),
                parent: Some(parent_id),
                attrs: new.attrs,
                expiry: new.expiry,
                children: new
                    .kind
                    .is_folder()
                    .then(|| synthetic_children(id, parent_id)),
                ref_count: 0,
                open_handles: 0,
                local_dirty: false,
                removed: false,
            }),
        });

        {
            let mut table = self.table.write();
            if let Some(remote) = parent_remote {
                let key = (remote, new.name.clone(), new.kind);
                if let Some(&existing) = table.index.get(&key) {
                    if existing != id {
                        return Err(DriveError::invariant(format!(
                            "index already maps {:?} to inode {}",
                            key, existing
                        )));
                    }
                }
                table.index.insert(key, id);
            }
            table.inodes.insert(id, inode.clone());
        }

        if let Some(children) = parent_state.children.as_mut() {
            children.push(ChildEntry {
                name: new.name,
                kind: new.kind,
                ino: id,
            });
        }
        trace!(parent = parent_id, ino = id, "inode inserted");
        Ok(inode)
    }

    /// Drop an inode from the id table and the index.
    pub fn remove(&self, id: u64) -> DriveResult<Arc<Inode>> {
        if id == ROOT_INO {
            return Err(DriveError::invariant("attempt to remove the root inode"));
        }
        let inode = self.lookup(id)?;
        let key = {
            let mut state = inode.lock();
            state.removed = true;
            state.index_key(inode.kind)
        };
        let mut table = self.table.write();
        if let Some(key) = key {
            if table.index.get(&key) == Some(&id) {
                table.index.remove(&key);
            }
        }
        table
            .inodes
            .remove(&id)
            .ok_or_else(|| DriveError::invariant(format!("unknown inode {}", id)))
    }

    /// Record one kernel lookup reference.
    pub fn ref_inode(&self, id: u64) -> DriveResult<()> {
        self.lookup(id)?.lock().ref_count += 1;
        Ok(())
    }

    /// Drop `n` references. Returns true if the inode is now unreferenced.
    pub fn deref(&self, id: u64, n: u64) -> DriveResult<bool> {
        let inode = self.lookup(id)?;
        let mut state = inode.lock();
        if n > state.ref_count {
            return Err(DriveError::invariant(format!(
                "ref count underflow on inode {}: {} - {}",
                id, state.ref_count, n
            )));
        }
        state.ref_count -= n;
        Ok(state.ref_count == 0)
    }

    pub fn open_handle(&self, id: u64) -> DriveResult<()> {
        self.lookup(id)?.lock().open_handles += 1;
        Ok(())
    }

    pub fn close_handle(&self, id: u64) -> DriveResult<()> {
        let inode = self.lookup(id)?;
        let mut state = inode.lock();
        if state.open_handles == 0 {
            return Err(DriveError::invariant(format!(
                "open handle underflow on inode {}",
                id
            )));
        }
        state.open_handles -= 1;
        Ok(())
    }

    /// Real child named `name`. With no kind given, folders win over files.
    pub fn find_child(
        &self,
        parent_id: u64,
        name: &str,
        kind: Option<FileKind>,
    ) -> DriveResult<Option<u64>> {
        let parent = self.lookup(parent_id)?;
        let state = parent.lock();
        if state.children.is_none() {
            return Err(not_a_dir(&state));
        }
        let find = |k: FileKind| {
            state
                .real_children()
                .find(|c| c.name == name && c.kind == k)
                .map(|c| c.ino)
        };
        Ok(match kind {
            Some(k) => find(k),
            None => find(FileKind::Folder).or_else(|| find(FileKind::File)),
        })
    }

    /// All child entries, `.` and `..` first.
    pub fn children(&self, parent_id: u64) -> DriveResult<Vec<ChildEntry>> {
        let parent = self.lookup(parent_id)?;
        let state = parent.lock();
        state.children.clone().ok_or_else(|| not_a_dir(&state))
    }

    /// Lock several inodes in ascending id order.
    fn lock_all(inodes: &mut Vec<Arc<Inode>>) -> Vec<(u64, MutexGuard<'_, InodeState>)> {
        inodes.sort_by_key(|i| i.id);
        inodes.dedup_by_key(|i| i.id);
        inodes.iter().map(|i| (i.id, i.lock())).collect()
    }

    /// Unlink `name` from `parent_id`. The child stays in the table, reachable
    /// by id, until it is collected. Returns the detached id.
    pub fn detach(&self, parent_id: u64, name: &str, kind: FileKind) -> DriveResult<Option<u64>> {
        let Some(child_id) = self.find_child(parent_id, name, Some(kind))? else {
            return Ok(None);
        };
        let mut inodes = vec![self.lookup(parent_id)?, self.lookup(child_id)?];
        let mut guards = Self::lock_all(&mut inodes);

        let parent_state = state_of(&mut guards, parent_id)?;
        let Some(children) = parent_state.children.as_mut() else {
            return Err(DriveError::invariant("parent lost its children list"));
        };
        let before = children.len();
        children.retain(|c| !(c.ino == child_id && c.name == name && c.kind == kind));
        if children.len() == before {
            // Raced with another unlink or rename.
            return Ok(None);
        }

        let child_state = state_of(&mut guards, child_id)?;
        let key = child_state.index_key(kind);
        child_state.parent = None;

        let mut table = self.table.write();
        if let Some(key) = key {
            if table.index.get(&key) == Some(&child_id) {
                table.index.remove(&key);
            }
        }
        debug!(parent = parent_id, ino = child_id, name, "inode detached");
        Ok(Some(child_id))
    }

    /// Drop the inode if it is detached, unreferenced, and not open.
    /// Returns true if it was removed.
    pub fn collect(&self, id: u64) -> DriveResult<bool> {
        if id == ROOT_INO {
            return Ok(false);
        }
        let Some(inode) = self.table.read().inodes.get(&id).cloned() else {
            return Ok(false);
        };
        {
            let state = inode.lock();
            if state.removed
                || state.parent.is_some()
                || state.ref_count > 0
                || state.open_handles > 0
            {
                return Ok(false);
            }
        }
        match self.remove(id) {
            Ok(_) => {
                trace!(ino = id, "inode collected");
                Ok(true)
            }
            Err(DriveError::Invariant(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Kernel forget: drop `n` references, then collect if possible.
    pub fn forget(&self, id: u64, n: u64) -> DriveResult<bool> {
        if id == ROOT_INO {
            return Ok(false);
        }
        if self.deref(id, n)? {
            self.collect(id)
        } else {
            Ok(false)
        }
    }

    /// Move a child between directories (or rename in place) in the local
    /// graph. The destination must not hold a child of the same name and kind.
    pub fn rename_local(
        &self,
        old_parent: u64,
        old_name: &str,
        kind: FileKind,
        new_parent: u64,
        new_name: &str,
    ) -> DriveResult<u64> {
        let child_id = self
            .find_child(old_parent, old_name, Some(kind))?
            .ok_or_else(|| DriveError::NotFound(old_name.to_string()))?;
        let mut inodes = vec![
            self.lookup(old_parent)?,
            self.lookup(new_parent)?,
            self.lookup(child_id)?,
        ];
        let mut guards = Self::lock_all(&mut inodes);

        // Validate everything before mutating anything.
        {
            let old_state = state_of(&mut guards, old_parent)?;
            let present = old_state
                .real_children()
                .any(|c| c.ino == child_id && c.name == old_name && c.kind == kind);
            if !present {
                return Err(DriveError::NotFound(old_name.to_string()));
            }
        }
        let new_remote = {
            let new_state = state_of(&mut guards, new_parent)?;
            if new_state.children.is_none() {
                return Err(not_a_dir(new_state));
            }
            let clash = new_state
                .real_children()
                .any(|c| c.name == new_name && c.kind == kind && c.ino != child_id);
            if clash {
                return Err(DriveError::AlreadyExists(new_name.to_string()));
            }
            new_state.remote_id.clone()
        };

        if let Some(children) = state_of(&mut guards, old_parent)?.children.as_mut() {
            children.retain(|c| !(c.ino == child_id && c.kind == kind && c.name == old_name));
        }
        if let Some(children) = state_of(&mut guards, new_parent)?.children.as_mut() {
            children.push(ChildEntry {
                name: new_name.to_string(),
                kind,
                ino: child_id,
            });
        }

        let (old_key, new_key) = {
            let child = state_of(&mut guards, child_id)?;
            let old_key = child.index_key(kind);
            child.name = new_name.to_string();
            child.parent = Some(new_parent);
            child.remote_parent_id = new_remote;
            if let Some(children) = child.children.as_mut() {
                if let Some(dotdot) = children.iter_mut().find(|c| c.name == "..") {
                    dotdot.ino = new_parent;
                }
            }
            (old_key, child.index_key(kind))
        };

        let mut table = self.table.write();
        if let Some(key) = old_key {
            if table.index.get(&key) == Some(&child_id) {
                table.index.remove(&key);
            }
        }
        if let Some(key) = new_key {
            if let Some(&existing) = table.index.get(&key) {
                if existing != child_id {
                    return Err(DriveError::invariant(format!(
                        "index already maps {:?} to inode {}",
                        key, existing
                    )));
                }
            }
            table.index.insert(key, child_id);
        }
        debug!(
            ino = child_id,
            from = old_parent,
            to = new_parent,
            name = new_name,
            "inode renamed"
        );
        Ok(child_id)
    }

    /// Reuse the child matching `file` or insert a new one. Refreshes the
    /// attribute expiry of a reused child.
    pub fn upsert_child(&self, parent_id: u64, file: &RemoteFile, ttl: Duration) -> DriveResult<u64> {
        for _ in 0..2 {
            if let Some(id) = self.find_child(parent_id, &file.name, Some(file.kind))? {
                self.lookup(id)?
                    .lock()
                    .apply_remote(file, AttrExpiry::after(ttl));
                return Ok(id);
            }
            match self.insert(parent_id, NewInode::from_remote(file, ttl)) {
                Ok(inode) => return Ok(inode.id),
                Err(DriveError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(DriveError::invariant(format!(
            "child {} of inode {} neither found nor insertable",
            file.name, parent_id
        )))
    }

    /// Detach the children whose remote id is missing from `listed`, then
    /// collect them. Open children and children with unflushed writes stay.
    /// Returns the detached ids.
    pub fn prune_missing(&self, dir_id: u64, listed: &HashSet<&str>) -> DriveResult<Vec<u64>> {
        let stale: Vec<ChildEntry> = self
            .children(dir_id)?
            .into_iter()
            .filter(|c| !c.is_synthetic())
            .filter(|c| {
                self.lookup(c.ino)
                    .map(|inode| {
                        let state = inode.lock();
                        state.open_handles == 0
                            && !state.local_dirty
                            && state
                                .remote_id
                                .as_deref()
                                .is_some_and(|id| !listed.contains(id))
                    })
                    .unwrap_or(false)
            })
            .collect();

        let mut pruned = Vec::with_capacity(stale.len());
        for child in stale {
            if let Some(id) = self.detach(dir_id, &child.name, child.kind)? {
                self.collect(id)?;
                pruned.push(id);
            }
        }
        Ok(pruned)
    }

    /// Verify that the directory's real children and the index agree.
    pub fn check_index_consistency(&self, dir_id: u64) -> DriveResult<()> {
        let dir = self.lookup(dir_id)?;
        let state = dir.lock();
        let Some(remote) = state.remote_id.clone() else {
            return Ok(());
        };
        let from_children: HashSet<(String, FileKind, u64)> = state
            .real_children()
            .map(|c| (c.name.clone(), c.kind, c.ino))
            .collect();

        let table = self.table.read();
        let from_index: HashSet<(String, FileKind, u64)> = table
            .index
            .iter()
            .filter(|((parent, _, _), _)| *parent == remote)
            .map(|((_, name, kind), id)| (name.clone(), *kind, *id))
            .collect();

        if from_children != from_index {
            return Err(DriveError::invariant(format!(
                "inode {} children {:?} disagree with index {:?}",
                dir_id, from_children, from_index
            )));
        }
        Ok(())
    }
}

fn state_of<'a, 'g>(
    guards: &'a mut [(u64, MutexGuard<'g, InodeState>)],
    id: u64,
) -> DriveResult<&'a mut InodeState> {
    guards
        .iter_mut()
        .find(|(gid, _)| *gid == id)
        .map(|(_, guard)| &mut **guard)
        .ok_or_else(|| DriveError::invariant(format!("inode {} not locked", id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const TTL: Duration = Duration::from_secs(1);

    fn remote(id: &str, parent: &str, name: &str, kind: FileKind) -> RemoteFile {
        RemoteFile {
            file_id: id.to_string(),
            parent_file_id: parent.to_string(),
            name: name.to_string(),
            kind,
            size: 10,
            created_at: None,
            updated_at: None,
            content_hash: None,
            download_url: None,
        }
    }

    fn dir(tree: &InodeTree, parent: u64, id: &str, name: &str) -> u64 {
        let parent_remote = tree.snapshot(parent).unwrap().remote_id.unwrap();
        tree.insert(
            parent,
            NewInode::from_remote(&remote(id, &parent_remote, name, FileKind::Folder), TTL),
        )
        .unwrap()
        .id
    }

    fn file(tree: &InodeTree, parent: u64, id: &str, name: &str) -> u64 {
        let parent_remote = tree.snapshot(parent).unwrap().remote_id.unwrap();
        tree.insert(
            parent,
            NewInode::from_remote(&remote(id, &parent_remote, name, FileKind::File), TTL),
        )
        .unwrap()
        .id
    }

    // ====== Root & Insert Tests ======

    #[test]
    fn test_root_initialized() {
        let tree = InodeTree::new();
        let root = tree.snapshot(ROOT_INO).unwrap();
        assert_eq!(root.remote_id.as_deref(), Some(ROOT_FILE_ID));
        assert_eq!(root.expiry, AttrExpiry::Never);
        let children = tree.children(ROOT_INO).unwrap();
        assert_eq!(children[0].name, ".");
        assert_eq!(children[0].ino, ROOT_INO);
        assert_eq!(children[1].name, "..");
        assert_eq!(children[1].ino, NO_PARENT);
    }

    #[test]
    fn test_insert_assigns_increasing_ids() {
        let tree = InodeTree::new();
        let a = dir(&tree, ROOT_INO, "d1", "a");
        let b = file(&tree, ROOT_INO, "f1", "b");
        assert!(b > a);
        assert!(a > ROOT_INO);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_directory_gets_synthetic_entries() {
        let tree = InodeTree::new();
        let a = dir(&tree, ROOT_INO, "d1", "a");
        let children = tree.children(a).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].ino, a);
        assert_eq!(children[1].ino, ROOT_INO);
        assert_eq!(tree.find_child(a, ".", None).unwrap(), None);
    }

    #[test]
    fn test_insert_duplicate_name_and_kind_rejected() {
        let tree = InodeTree::new();
        file(&tree, ROOT_INO, "f1", "x");
        let err = tree
            .insert(ROOT_INO, NewInode::local_file("x"))
            .unwrap_err();
        assert!(matches!(err, DriveError::AlreadyExists(_)));

        // Same name, other kind is a distinct child.
        dir(&tree, ROOT_INO, "d1", "x");
        tree.check_index_consistency(ROOT_INO).unwrap();
    }

    #[test]
    fn test_insert_under_file_is_wrong_kind() {
        let tree = InodeTree::new();
        let f = file(&tree, ROOT_INO, "f1", "x");
        let err = tree.insert(f, NewInode::local_file("y")).unwrap_err();
        assert!(matches!(err, DriveError::WrongKind { .. }));
    }

    #[test]
    fn test_find_child_prefers_folder() {
        let tree = InodeTree::new();
        let f = file(&tree, ROOT_INO, "f1", "x");
        let d = dir(&tree, ROOT_INO, "d1", "x");
        assert_eq!(tree.find_child(ROOT_INO, "x", None).unwrap(), Some(d));
        assert_eq!(
            tree.find_child(ROOT_INO, "x", Some(FileKind::File)).unwrap(),
            Some(f)
        );
        assert_eq!(tree.find_child(ROOT_INO, "nope", None).unwrap(), None);
    }

    #[test]
    fn test_lookup_unknown_is_invariant() {
        let tree = InodeTree::new();
        assert!(matches!(tree.lookup(999), Err(DriveError::Invariant(_))));
    }

    // ====== Reference Counting ======

    #[test]
    fn test_deref_underflow_is_invariant() {
        let tree = InodeTree::new();
        let f = file(&tree, ROOT_INO, "f1", "x");
        tree.ref_inode(f).unwrap();
        tree.ref_inode(f).unwrap();
        assert!(!tree.deref(f, 1).unwrap());
        let err = tree.deref(f, 2).unwrap_err();
        assert!(matches!(err, DriveError::Invariant(_)));
        // Not clamped: the remaining reference is still there.
        assert_eq!(tree.snapshot(f).unwrap().ref_count, 1);
        assert!(tree.deref(f, 1).unwrap());
    }

    #[test]
    fn test_forget_attached_inode_keeps_it() {
        let tree = InodeTree::new();
        let f = file(&tree, ROOT_INO, "f1", "x");
        tree.ref_inode(f).unwrap();
        assert!(!tree.forget(f, 1).unwrap());
        assert!(tree.contains(f));
    }

    #[test]
    fn test_forget_detached_inode_collects() {
        let tree = InodeTree::new();
        let f = file(&tree, ROOT_INO, "f1", "x");
        tree.ref_inode(f).unwrap();
        assert_eq!(tree.detach(ROOT_INO, "x", FileKind::File).unwrap(), Some(f));
        assert!(tree.contains(f));

        assert!(tree.forget(f, 1).unwrap());
        assert!(!tree.contains(f));
        // Idempotent.
        assert!(!tree.collect(f).unwrap());
    }

    #[test]
    fn test_open_handle_blocks_collection() {
        let tree = InodeTree::new();
        let f = file(&tree, ROOT_INO, "f1", "x");
        tree.open_handle(f).unwrap();
        tree.detach(ROOT_INO, "x", FileKind::File).unwrap();
        assert!(!tree.collect(f).unwrap());
        assert!(tree.snapshot(f).is_ok());

        tree.close_handle(f).unwrap();
        assert!(tree.collect(f).unwrap());
        assert!(tree.close_handle(f).is_err());
    }

    #[test]
    fn test_root_never_removed() {
        let tree = InodeTree::new();
        assert!(!tree.forget(ROOT_INO, 1).unwrap());
        assert!(matches!(tree.remove(ROOT_INO), Err(DriveError::Invariant(_))));
    }

    // ====== Detach & Rename ======

    #[test]
    fn test_detach_clears_index() {
        let tree = InodeTree::new();
        file(&tree, ROOT_INO, "f1", "x");
        tree.detach(ROOT_INO, "x", FileKind::File).unwrap();
        tree.check_index_consistency(ROOT_INO).unwrap();
        // The name is free again.
        file(&tree, ROOT_INO, "f2", "x");
        tree.check_index_consistency(ROOT_INO).unwrap();
    }

    #[test]
    fn test_rename_local_across_dirs() {
        let tree = InodeTree::new();
        let a = dir(&tree, ROOT_INO, "da", "a");
        let b = dir(&tree, ROOT_INO, "db", "b");
        let f = file(&tree, a, "f1", "x");

        tree.rename_local(a, "x", FileKind::File, b, "y").unwrap();
        assert_eq!(tree.find_child(a, "x", None).unwrap(), None);
        assert_eq!(tree.find_child(b, "y", None).unwrap(), Some(f));

        let snap = tree.snapshot(f).unwrap();
        assert_eq!(snap.name, "y");
        assert_eq!(snap.parent, Some(b));
        assert_eq!(snap.remote_parent_id.as_deref(), Some("db"));
        tree.check_index_consistency(a).unwrap();
        tree.check_index_consistency(b).unwrap();
    }

    #[test]
    fn test_rename_dir_updates_dotdot() {
        let tree = InodeTree::new();
        let a = dir(&tree, ROOT_INO, "da", "a");
        let sub = dir(&tree, ROOT_INO, "ds", "sub");
        tree.rename_local(ROOT_INO, "sub", FileKind::Folder, a, "sub")
            .unwrap();
        let children = tree.children(sub).unwrap();
        assert_eq!(children[1].name, "..");
        assert_eq!(children[1].ino, a);
    }

    #[test]
    fn test_rename_onto_existing_rejected() {
        let tree = InodeTree::new();
        file(&tree, ROOT_INO, "f1", "x");
        file(&tree, ROOT_INO, "f2", "y");
        let err = tree
            .rename_local(ROOT_INO, "x", FileKind::File, ROOT_INO, "y")
            .unwrap_err();
        assert!(matches!(err, DriveError::AlreadyExists(_)));
        tree.check_index_consistency(ROOT_INO).unwrap();
    }

    #[test]
    fn test_rename_missing_source() {
        let tree = InodeTree::new();
        let err = tree
            .rename_local(ROOT_INO, "x", FileKind::File, ROOT_INO, "y")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_prune_missing_detaches_unlisted() {
        let tree = InodeTree::new();
        let kept = file(&tree, ROOT_INO, "f1", "kept.txt");
        let gone = file(&tree, ROOT_INO, "f2", "gone.txt");
        let open = file(&tree, ROOT_INO, "f3", "open.txt");
        tree.open_handle(open).unwrap();
        let local = tree.insert(ROOT_INO, NewInode::local_file("draft.txt")).unwrap().id;

        let listed: HashSet<&str> = ["f1"].into_iter().collect();
        assert_eq!(tree.prune_missing(ROOT_INO, &listed).unwrap(), vec![gone]);

        assert!(!tree.contains(gone));
        assert_eq!(tree.find_child(ROOT_INO, "kept.txt", None).unwrap(), Some(kept));
        assert_eq!(tree.find_child(ROOT_INO, "open.txt", None).unwrap(), Some(open));
        assert_eq!(tree.find_child(ROOT_INO, "draft.txt", None).unwrap(), Some(local));
        tree.check_index_consistency(ROOT_INO).unwrap();
    }

    // ====== Upsert & Expiry ======

    #[test]
    fn test_upsert_reuses_and_refreshes() {
        let tree = InodeTree::new();
        let rf = remote("f1", ROOT_FILE_ID, "x", FileKind::File);
        let id = tree.upsert_child(ROOT_INO, &rf, TTL).unwrap();

        let mut newer = rf.clone();
        newer.size = 99;
        assert_eq!(tree.upsert_child(ROOT_INO, &newer, TTL).unwrap(), id);
        assert_eq!(tree.snapshot(id).unwrap().attrs.size, 99);
        tree.check_index_consistency(ROOT_INO).unwrap();
    }

    #[test]
    fn test_upsert_keeps_dirty_attrs() {
        let tree = InodeTree::new();
        let rf = remote("f1", ROOT_FILE_ID, "x", FileKind::File);
        let id = tree.upsert_child(ROOT_INO, &rf, TTL).unwrap();
        {
            let inode = tree.lookup(id).unwrap();
            let mut state = inode.lock();
            state.local_dirty = true;
            state.attrs.set_size(5000);
        }
        tree.upsert_child(ROOT_INO, &rf, TTL).unwrap();
        assert_eq!(tree.snapshot(id).unwrap().attrs.size, 5000);
    }

    #[test]
    fn test_expiry_never_shrinks_pinned() {
        let mut pinned = AttrExpiry::Never;
        pinned.extend(AttrExpiry::after(Duration::from_secs(1)));
        assert_eq!(pinned, AttrExpiry::Never);

        let later = AttrExpiry::after(Duration::from_secs(60));
        let mut e = later;
        e.extend(AttrExpiry::after(Duration::from_secs(1)));
        assert_eq!(e, later);

        let mut stale = AttrExpiry::At(Instant::now() - Duration::from_secs(1));
        assert!(!stale.is_fresh());
        stale.extend(AttrExpiry::after(Duration::from_secs(60)));
        assert!(stale.is_fresh());
    }

    // ====== Concurrency Tests ======

    #[test]
    fn test_crossing_renames_do_not_deadlock() {
        let tree = Arc::new(InodeTree::new());
        let a = dir(&tree, ROOT_INO, "da", "a");
        let b = dir(&tree, ROOT_INO, "db", "b");
        for i in 0..50 {
            file(&tree, a, &format!("fa{}", i), &format!("a{}", i));
            file(&tree, b, &format!("fb{}", i), &format!("b{}", i));
        }

        let t1 = {
            let tree = tree.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    tree.rename_local(a, &format!("a{}", i), FileKind::File, b, &format!("a{}", i))
                        .unwrap();
                }
            })
        };
        let t2 = {
            let tree = tree.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    tree.rename_local(b, &format!("b{}", i), FileKind::File, a, &format!("b{}", i))
                        .unwrap();
                }
            })
        };
        t1.join().unwrap();
        t2.join().unwrap();

        assert_eq!(tree.children(a).unwrap().len(), 52);
        assert_eq!(tree.children(b).unwrap().len(), 52);
        assert!(tree.find_child(a, "b0", None).unwrap().is_some());
        tree.check_index_consistency(a).unwrap();
        tree.check_index_consistency(b).unwrap();
    }

    #[test]
    fn test_concurrent_inserts_unique_ids() {
        let tree = Arc::new(InodeTree::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tree = tree.clone();
                thread::spawn(move || {
                    (0..100)
                        .map(|i| {
                            tree.insert(ROOT_INO, NewInode::local_file(&format!("{}-{}", t, i)))
                                .unwrap()
                                .id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 800);
        tree.check_index_consistency(ROOT_INO).unwrap();
    }
}
