//! End-to-end filesystem behavior against the in-memory drive.

mod common;

use std::time::Duration;

use drivefs_core::{CloudClient, DriveError, FileKind};
use drivefs_fuse::{DriveFsCore, ROOT_INO};
use drivefs_remote::{Faults, MemoryDrive};

use common::{list_names, mount, write_file};

const MIB: usize = 1024 * 1024;

async fn lookup(fs: &DriveFsCore, parent: u64, name: &str) -> u64 {
    fs.do_lookup(parent, name).await.unwrap().id
}

// ====== Directory Listing ======

#[tokio::test]
async fn test_paged_listing_is_complete_and_cached() {
    let drive = MemoryDrive::with_page_size(200);
    for i in 0..447 {
        drive.add_file("root", &format!("f{:03}", i), vec![b'x'; i % 7]);
    }
    let m = mount(drive);

    let fh = m.fs.do_opendir(ROOT_INO).unwrap();
    let entries = m.fs.do_readdir(fh, 0).await.unwrap();
    assert_eq!(entries.len(), 449);
    assert_eq!(entries[0].name, ".");
    assert_eq!(entries[1].name, "..");
    // Newest first, as the drive lists.
    assert_eq!(entries[2].name, "f446");
    assert_eq!(entries[448].name, "f000");
    let mut names: Vec<&str> = entries[2..].iter().map(|e| e.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), 447);

    let markers: Vec<Option<String>> = m
        .drive
        .stats()
        .list_requests
        .into_iter()
        .map(|(_, marker)| marker)
        .collect();
    assert_eq!(
        markers,
        vec![None, Some("200".to_string()), Some("400".to_string())]
    );

    // Continuation reads reuse the snapshot.
    let again = m.fs.do_readdir(fh, 300).await.unwrap();
    assert_eq!(again.len(), 449);
    m.fs.do_releasedir(fh).unwrap();

    // A fresh open is answered from the cached listing.
    let names = list_names(&m.fs, ROOT_INO).await;
    assert_eq!(names.len(), 447);
    assert_eq!(m.drive.stats().list_calls, 3);
    m.fs.context().tree.check_index_consistency(ROOT_INO).unwrap();
}

#[tokio::test]
async fn test_inode_numbers_are_stable_across_listings() {
    let drive = MemoryDrive::new();
    drive.add_folder("root", "docs");
    let m = mount(drive);

    let first = lookup(&m.fs, ROOT_INO, "docs").await;
    m.fs.context().cache().clear();
    list_names(&m.fs, ROOT_INO).await;
    let second = lookup(&m.fs, ROOT_INO, "docs").await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_file_trashed_remotely_leaves_listing() {
    let drive = MemoryDrive::new();
    let gone = drive.add_file("root", "gone.txt", b"g".to_vec());
    drive.add_file("root", "keep.txt", b"k".to_vec());
    let m = mount(drive);
    assert_eq!(list_names(&m.fs, ROOT_INO).await.len(), 2);

    m.drive.trash(&gone.file_id).await.unwrap();
    m.fs.context().cache().clear();
    assert_eq!(list_names(&m.fs, ROOT_INO).await, vec!["keep.txt".to_string()]);
    assert!(m.fs.do_lookup(ROOT_INO, "gone.txt").await.unwrap_err().is_not_found());
}

// ====== Upload ======

#[tokio::test]
async fn test_written_file_appears_in_listing() {
    let m = mount(MemoryDrive::new());
    let ino = write_file(&m.fs, ROOT_INO, "hello.txt", b"hello world").await;

    let remote = m.drive.find("root", "hello.txt").unwrap();
    assert_eq!(m.drive.content(&remote.file_id).unwrap(), b"hello world");

    let snap = m.fs.do_getattr(ino).await.unwrap();
    assert_eq!(snap.attrs.size, 11);
    assert_eq!(snap.remote_id.as_deref(), Some(remote.file_id.as_str()));

    let names = list_names(&m.fs, ROOT_INO).await;
    assert_eq!(names, vec!["hello.txt".to_string()]);
}

#[tokio::test]
async fn test_matching_content_is_deduplicated_without_parts() {
    let body = vec![7u8; 64 * 1024];
    let drive = MemoryDrive::new();
    drive.add_file("root", "original.bin", body.clone());
    let m = mount(drive);

    write_file(&m.fs, ROOT_INO, "copy.bin", &body).await;

    let stats = m.drive.stats();
    assert!(stats.part_puts.is_empty());
    assert_eq!(stats.create_calls, 2);
    let copy = m.drive.find("root", "copy.bin").unwrap();
    assert_eq!(copy.size, body.len() as u64);
}

#[tokio::test]
async fn test_large_file_is_split_into_parts() {
    let m = mount(MemoryDrive::new());
    let (_, fh) = m.fs.do_create(ROOT_INO, "big.bin").await.unwrap();
    let chunk = vec![3u8; MIB];
    for i in 0..25 {
        m.fs.do_write(fh, (i * MIB) as u64, &chunk).await.unwrap();
    }
    m.fs.do_release(fh).await.unwrap();

    let sizes: Vec<usize> = m
        .drive
        .stats()
        .part_puts
        .iter()
        .map(|(_, _, len)| *len)
        .collect();
    assert_eq!(sizes, vec![10 * MIB, 10 * MIB, 5 * MIB]);
    assert_eq!(m.drive.stats().completes, 1);
    assert_eq!(m.drive.find("root", "big.bin").unwrap().size, (25 * MIB) as u64);
}

#[tokio::test]
async fn test_expired_part_urls_are_renewed() {
    let drive = MemoryDrive::new();
    drive.set_faults(Faults {
        expire_from_part: Some(2),
        ..Faults::default()
    });
    let m = mount(drive);

    let body = vec![9u8; 21 * MIB];
    write_file(&m.fs, ROOT_INO, "renewed.bin", &body).await;

    let stats = m.drive.stats();
    assert_eq!(stats.renewals, vec![vec![2, 3]]);
    let parts: Vec<u32> = stats.part_puts.iter().map(|(_, n, _)| *n).collect();
    assert_eq!(parts, vec![1, 2, 3]);
    let remote = m.drive.find("root", "renewed.bin").unwrap();
    assert_eq!(m.drive.content(&remote.file_id).unwrap().len(), body.len());
}

#[tokio::test]
async fn test_empty_file_rewritten_keeps_single_child() {
    let m = mount(MemoryDrive::new());
    write_file(&m.fs, ROOT_INO, "empty.txt", b"").await;

    let ino = lookup(&m.fs, ROOT_INO, "empty.txt").await;
    let fh = m.fs.do_open(ino, true).await.unwrap();
    m.fs.do_release(fh).await.unwrap();

    let empties: Vec<_> = m
        .drive
        .children_of("root")
        .into_iter()
        .filter(|f| f.name == "empty.txt")
        .collect();
    assert_eq!(empties.len(), 1);
    assert_eq!(empties[0].size, 0);
    assert_eq!(list_names(&m.fs, ROOT_INO).await, vec!["empty.txt".to_string()]);
}

#[tokio::test]
async fn test_create_existing_name_fails() {
    let drive = MemoryDrive::new();
    drive.add_file("root", "taken.txt", b"x".to_vec());
    let m = mount(drive);

    let err = m.fs.do_create(ROOT_INO, "taken.txt").await.unwrap_err();
    assert!(matches!(err, DriveError::AlreadyExists(_)));
}

// ====== Read ======

#[tokio::test]
async fn test_read_remote_file_sequentially() {
    let body: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let drive = MemoryDrive::new();
    drive.add_file("root", "data.bin", body.clone());
    let m = mount(drive);

    let ino = lookup(&m.fs, ROOT_INO, "data.bin").await;
    let fh = m.fs.do_open(ino, false).await.unwrap();
    let mut read = Vec::new();
    while read.len() < body.len() {
        let chunk = m.fs.do_read(fh, read.len() as u64, 4096).await.unwrap();
        assert!(!chunk.is_empty());
        read.extend_from_slice(&chunk);
    }
    assert_eq!(read, body);
    assert!(m.fs.do_read(fh, body.len() as u64, 4096).await.unwrap().is_empty());
    assert_eq!(m.drive.stats().stream_opens, 1);
    m.fs.do_release(fh).await.unwrap();
}

// ====== Namespace ======

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crossing_renames_complete() {
    let drive = MemoryDrive::new();
    let a = drive.add_folder("root", "a");
    let b = drive.add_folder("root", "b");
    drive.add_file(&a.file_id, "x", b"x".to_vec());
    drive.add_file(&b.file_id, "y", b"y".to_vec());
    let m = mount(drive);

    let a_ino = lookup(&m.fs, ROOT_INO, "a").await;
    let b_ino = lookup(&m.fs, ROOT_INO, "b").await;
    lookup(&m.fs, a_ino, "x").await;
    lookup(&m.fs, b_ino, "y").await;

    let fs1 = m.fs.clone();
    let fs2 = m.fs.clone();
    let t1 = tokio::spawn(async move { fs1.do_rename(a_ino, "x", b_ino, "x").await });
    let t2 = tokio::spawn(async move { fs2.do_rename(b_ino, "y", a_ino, "y").await });
    let (r1, r2) = tokio::time::timeout(Duration::from_secs(10), async {
        (t1.await.unwrap(), t2.await.unwrap())
    })
    .await
    .expect("renames deadlocked");
    r1.unwrap();
    r2.unwrap();

    assert!(m.drive.find(&b.file_id, "x").is_some());
    assert!(m.drive.find(&a.file_id, "y").is_some());
    let tree = &m.fs.context().tree;
    assert!(tree.find_child(b_ino, "x", None).unwrap().is_some());
    assert!(tree.find_child(a_ino, "y", None).unwrap().is_some());
    assert!(tree.find_child(a_ino, "x", None).unwrap().is_none());
}

#[tokio::test]
async fn test_rename_replaces_existing_file() {
    let drive = MemoryDrive::new();
    drive.add_file("root", "new.txt", b"new".to_vec());
    let old = drive.add_file("root", "old.txt", b"old".to_vec());
    let m = mount(drive);

    m.fs.do_rename(ROOT_INO, "new.txt", ROOT_INO, "old.txt").await.unwrap();

    assert!(m.drive.is_trashed(&old.file_id));
    let current = m.drive.find("root", "old.txt").unwrap();
    assert_eq!(m.drive.content(&current.file_id).unwrap(), b"new");
    assert_eq!(list_names(&m.fs, ROOT_INO).await, vec!["old.txt".to_string()]);
}

#[tokio::test]
async fn test_rename_onto_non_empty_directory_fails() {
    let drive = MemoryDrive::new();
    drive.add_folder("root", "src");
    let dst = drive.add_folder("root", "dst");
    drive.add_file(&dst.file_id, "keep", b"k".to_vec());
    let m = mount(drive);

    let err = m.fs.do_rename(ROOT_INO, "src", ROOT_INO, "dst").await.unwrap_err();
    assert!(matches!(err, DriveError::NotEmpty(_)));
    assert!(m.drive.find("root", "src").is_some());
}

#[tokio::test]
async fn test_rename_across_kinds_fails() {
    let drive = MemoryDrive::new();
    drive.add_file("root", "file", b"f".to_vec());
    drive.add_folder("root", "dir");
    let m = mount(drive);

    let err = m.fs.do_rename(ROOT_INO, "file", ROOT_INO, "dir").await.unwrap_err();
    assert!(matches!(
        err,
        DriveError::WrongKind {
            expected: FileKind::File,
            ..
        }
    ));
}

#[tokio::test]
async fn test_rename_before_first_flush_uploads_under_new_name() {
    let m = mount(MemoryDrive::new());
    let (_, fh) = m.fs.do_create(ROOT_INO, "draft.txt").await.unwrap();
    m.fs.do_write(fh, 0, b"content").await.unwrap();

    m.fs.do_rename(ROOT_INO, "draft.txt", ROOT_INO, "final.txt").await.unwrap();
    m.fs.do_release(fh).await.unwrap();

    assert!(m.drive.find("root", "draft.txt").is_none());
    let remote = m.drive.find("root", "final.txt").unwrap();
    assert_eq!(m.drive.content(&remote.file_id).unwrap(), b"content");
}

#[tokio::test]
async fn test_failed_move_keeps_replaced_destination() {
    let drive = MemoryDrive::new();
    let a = drive.add_folder("root", "a");
    let b = drive.add_folder("root", "b");
    let src = drive.add_file(&a.file_id, "x", b"from a".to_vec());
    let dst = drive.add_file(&b.file_id, "x", b"from b".to_vec());
    drive.set_faults(Faults {
        move_status: Some(403),
        ..Faults::default()
    });
    let m = mount(drive);
    let a_ino = lookup(&m.fs, ROOT_INO, "a").await;
    let b_ino = lookup(&m.fs, ROOT_INO, "b").await;

    let err = m.fs.do_rename(a_ino, "x", b_ino, "x").await.unwrap_err();
    assert!(matches!(err, DriveError::Remote { status: 403, .. }));
    assert!(!m.drive.is_trashed(&dst.file_id));
    assert_eq!(m.drive.find(&b.file_id, "x").unwrap().file_id, dst.file_id);
    assert_eq!(list_names(&m.fs, a_ino).await, vec!["x".to_string()]);
    assert_eq!(list_names(&m.fs, b_ino).await, vec!["x".to_string()]);

    // Retrying once the remote recovers replaces the destination.
    m.drive.set_faults(Faults::default());
    m.fs.do_rename(a_ino, "x", b_ino, "x").await.unwrap();
    assert!(m.drive.is_trashed(&dst.file_id));
    let moved = m.drive.find(&b.file_id, "x").unwrap();
    assert_eq!(moved.file_id, src.file_id);
    assert_eq!(m.drive.content(&moved.file_id).unwrap(), b"from a");
    assert!(list_names(&m.fs, a_ino).await.is_empty());
    assert_eq!(list_names(&m.fs, b_ino).await, vec!["x".to_string()]);
}

#[tokio::test]
async fn test_rename_open_file_missing_remotely_completes_locally() {
    let drive = MemoryDrive::new();
    let file = drive.add_file("root", "a.txt", b"a".to_vec());
    let m = mount(drive);
    let ino = lookup(&m.fs, ROOT_INO, "a.txt").await;
    let fh = m.fs.do_open(ino, false).await.unwrap();

    m.drive.trash(&file.file_id).await.unwrap();
    m.fs.do_rename(ROOT_INO, "a.txt", ROOT_INO, "b.txt").await.unwrap();

    let tree = &m.fs.context().tree;
    assert_eq!(tree.find_child(ROOT_INO, "b.txt", None).unwrap(), Some(ino));
    assert_eq!(tree.find_child(ROOT_INO, "a.txt", None).unwrap(), None);
    assert_eq!(tree.snapshot(ino).unwrap().name, "b.txt");
    m.fs.do_release(fh).await.unwrap();
}

#[tokio::test]
async fn test_mkdir_then_create_inside() {
    let m = mount(MemoryDrive::new());
    let dir = m.fs.do_mkdir(ROOT_INO, "projects").await.unwrap();
    assert!(dir.is_dir());
    write_file(&m.fs, dir.id, "notes.md", b"# notes").await;

    let remote_dir = m.drive.find("root", "projects").unwrap();
    assert!(m.drive.find(&remote_dir.file_id, "notes.md").is_some());

    let err = m.fs.do_mkdir(ROOT_INO, "projects").await.unwrap_err();
    assert!(matches!(err, DriveError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_unlink_and_rmdir_errors() {
    let drive = MemoryDrive::new();
    let full = drive.add_folder("root", "full");
    drive.add_file(&full.file_id, "inner", b"i".to_vec());
    drive.add_file("root", "plain", b"p".to_vec());
    let m = mount(drive);

    let err = m.fs.do_unlink(ROOT_INO, "full").await.unwrap_err();
    assert!(matches!(err, DriveError::WrongKind { expected: FileKind::File, .. }));
    let err = m.fs.do_rmdir(ROOT_INO, "plain").await.unwrap_err();
    assert!(matches!(err, DriveError::WrongKind { expected: FileKind::Folder, .. }));
    let err = m.fs.do_rmdir(ROOT_INO, "full").await.unwrap_err();
    assert!(matches!(err, DriveError::NotEmpty(_)));
    let err = m.fs.do_unlink(ROOT_INO, "missing").await.unwrap_err();
    assert!(err.is_not_found());

    m.fs.do_unlink(ROOT_INO, "plain").await.unwrap();
    assert!(m.drive.find("root", "plain").is_none());
}

#[tokio::test]
async fn test_rmdir_with_unflushed_child_fails() {
    let m = mount(MemoryDrive::new());
    let dir = m.fs.do_mkdir(ROOT_INO, "work").await.unwrap();
    let (_, fh) = m.fs.do_create(dir.id, "pending.txt").await.unwrap();

    let err = m.fs.do_rmdir(ROOT_INO, "work").await.unwrap_err();
    assert!(matches!(err, DriveError::NotEmpty(_)));
    m.fs.do_release(fh).await.unwrap();
}

// ====== Inode Lifetime ======

#[tokio::test]
async fn test_unlinked_inode_is_reclaimed_after_forget() {
    let drive = MemoryDrive::new();
    drive.add_file("root", "gone.txt", b"bye".to_vec());
    let m = mount(drive);

    let ino = lookup(&m.fs, ROOT_INO, "gone.txt").await;
    m.fs.do_unlink(ROOT_INO, "gone.txt").await.unwrap();
    let tree = &m.fs.context().tree;
    assert!(tree.contains(ino));

    m.fs.do_forget(ino, 1).unwrap();
    assert!(!tree.contains(ino));
}

#[tokio::test]
async fn test_forget_keeps_linked_inode() {
    let drive = MemoryDrive::new();
    drive.add_file("root", "stay.txt", b"s".to_vec());
    let m = mount(drive);

    let ino = lookup(&m.fs, ROOT_INO, "stay.txt").await;
    m.fs.do_forget(ino, 1).unwrap();
    assert_eq!(lookup(&m.fs, ROOT_INO, "stay.txt").await, ino);
}

// ====== Statfs ======

#[tokio::test]
async fn test_statfs_reports_quota_and_caches_it() {
    let drive = MemoryDrive::new();
    drive.set_quota_total(1000 * 4096);
    let m = mount(drive);

    let stat = m.fs.do_statfs().await.unwrap();
    assert_eq!(stat.blocks, 1000);
    assert!(stat.bfree <= 1000);
    assert_eq!(stat.frsize, 4096);

    m.drive.set_quota_total(10 * 4096);
    assert_eq!(m.fs.do_statfs().await.unwrap().blocks, 1000);
}
