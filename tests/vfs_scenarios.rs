use std::sync::Arc;

use remotefs::cadapter::ObjectBackend;
use remotefs::cadapter::localfs::LocalFsBackend;
use remotefs::cadapter::memory::MemoryBackend;
use remotefs::vfs::error::FsError;
use remotefs::vfs::file::OpenMode;
use remotefs::vfs::fs::RemoteFs;
use remotefs::vfs::inode::Node;
use remotefs::vfs::{NodeKind, VfsOptions};

const ROOT: u64 = RemoteFs::ROOT;

fn mount(backend: &Arc<MemoryBackend>) -> RemoteFs {
    RemoteFs::new(backend.clone(), VfsOptions::default())
}

async fn read_all(fs: &RemoteFs, ino: u64) -> Vec<u8> {
    let fh = fs.open(ino, OpenMode::ReadOnly).await.unwrap();
    let mut out = Vec::new();
    loop {
        let chunk = fs.read(fh, 3).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    fs.release(fh).await.unwrap();
    out
}

#[tokio::test]
async fn implicit_directories() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("a/b.txt", "hello");
    let fs = mount(&backend);

    let root = fs.readdir(ROOT).await.unwrap();
    assert_eq!(root.len(), 1);
    assert_eq!(root[0].name, "a");
    assert_eq!(root[0].kind, NodeKind::Dir);

    let (a, _) = fs.lookup(ROOT, "a").await.unwrap();
    assert_eq!(a, root[0].ino);
    let rows = fs.readdir(a).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "b.txt");

    let (b, node) = fs.lookup(a, "b.txt").await.unwrap();
    assert_eq!(node.attr().size, 5);
    assert_eq!(read_all(&fs, b).await, b"hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lookups_list_once() {
    let backend = Arc::new(MemoryBackend::new());
    for i in 0..20 {
        backend.insert(&format!("d/f{i}"), "x");
    }
    let fs = Arc::new(mount(&backend));
    let (d, _) = fs.lookup(ROOT, "d").await.unwrap();
    let before = backend.list_calls();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let fs = fs.clone();
        tasks.push(tokio::spawn(async move {
            fs.lookup(d, &format!("f{i}")).await.map(|(ino, _)| ino)
        }));
    }
    for t in tasks {
        assert!(t.await.unwrap().is_ok());
    }
    let first = fs.readdir(d).await.unwrap();
    let second = fs.readdir(d).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(backend.list_calls(), before + 1);
}

#[tokio::test]
async fn absent_name_is_not_found() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("present", "x");
    let fs = mount(&backend);
    fs.readdir(ROOT).await.unwrap();
    assert!(matches!(
        fs.lookup(ROOT, "absent").await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn mkdir_then_lookup_needs_no_listing() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend);
    fs.readdir(ROOT).await.unwrap();
    let calls = backend.list_calls();

    let (ino, _) = fs.mkdir(ROOT, "x").await.unwrap();
    let (found, node) = fs.lookup(ROOT, "x").await.unwrap();
    assert_eq!(found, ino);
    assert!(matches!(node, Node::Dir(_)));
    assert!(fs.readdir(ino).await.unwrap().is_empty());
    assert_eq!(backend.list_calls(), calls);
}

#[tokio::test]
async fn rmdir_requires_empty_directory() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("full/child", "c");
    let fs = mount(&backend);
    fs.mkdir(ROOT, "empty").await.unwrap();

    assert!(matches!(
        fs.rmdir(ROOT, "full").await,
        Err(FsError::NotEmpty(_))
    ));
    fs.rmdir(ROOT, "empty").await.unwrap();
    assert!(matches!(
        fs.lookup(ROOT, "empty").await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn unlink_and_rmdir_check_kinds() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("d/f", "c");
    backend.insert("file", "c");
    let fs = mount(&backend);

    assert!(matches!(
        fs.unlink(ROOT, "d").await,
        Err(FsError::IsADirectory(_))
    ));
    assert!(matches!(
        fs.rmdir(ROOT, "file").await,
        Err(FsError::NotADirectory(_))
    ));
    fs.unlink(ROOT, "file").await.unwrap();
    assert!(backend.get("file").is_none());
}

#[tokio::test]
async fn write_commit_preserves_order() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend);
    let (ino, _, fh) = fs.create(ROOT, "out.txt").await.unwrap();

    assert_eq!(fs.write(fh, b"abc").await.unwrap(), 3);
    assert_eq!(fs.getattr(ino).unwrap().size, 3);
    assert_eq!(fs.write(fh, b"def").await.unwrap(), 3);
    assert!(backend.get("out.txt").is_none());

    fs.release(fh).await.unwrap();
    assert_eq!(backend.get("out.txt").unwrap(), "abcdef");
    assert_eq!(fs.getattr(ino).unwrap().size, 6);
    assert!(matches!(
        fs.release(fh).await,
        Err(FsError::BadHandle(_))
    ));

    let (found, _) = fs.lookup(ROOT, "out.txt").await.unwrap();
    assert_eq!(found, ino);
    assert_eq!(read_all(&fs, ino).await, b"abcdef");
}

#[tokio::test]
async fn large_write_streams_through_small_buffer() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = RemoteFs::new(
        backend.clone(),
        VfsOptions {
            no_modtime: false,
            write_buffer_size: 64,
        },
    );
    let (_, _, fh) = fs.create(ROOT, "big").await.unwrap();
    let chunk: Vec<u8> = (0..=255u8).collect();
    for _ in 0..64 {
        assert_eq!(fs.write(fh, &chunk).await.unwrap(), chunk.len());
    }
    fs.release(fh).await.unwrap();

    let stored = backend.get("big").unwrap();
    assert_eq!(stored.len(), 64 * 256);
    assert!(stored.chunks(256).all(|c| c == &chunk[..]));
}

#[tokio::test]
async fn short_read_at_end_of_object() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("h", "hello");
    let fs = mount(&backend);
    let (ino, _) = fs.lookup(ROOT, "h").await.unwrap();

    let fh = fs.open(ino, OpenMode::ReadOnly).await.unwrap();
    assert_eq!(&fs.read(fh, 100).await.unwrap()[..], b"hello");
    assert!(fs.read(fh, 100).await.unwrap().is_empty());
    fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn failed_put_leaves_name_absent() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_fail_puts(true);
    let fs = mount(&backend);
    let (ino, _, fh) = fs.create(ROOT, "doomed").await.unwrap();
    fs.write(fh, b"data").await.unwrap();

    assert!(matches!(fs.release(fh).await, Err(FsError::Backend(_))));
    assert!(matches!(
        fs.lookup(ROOT, "doomed").await,
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        fs.open(ino, OpenMode::ReadOnly).await,
        Err(FsError::Busy(_))
    ));
}

#[tokio::test]
async fn failed_overwrite_keeps_previous_object() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("keep", "old");
    let fs = mount(&backend);
    let (ino, _) = fs.lookup(ROOT, "keep").await.unwrap();

    backend.set_fail_puts(true);
    let fh = fs.open(ino, OpenMode::WriteOnly).await.unwrap();
    fs.write(fh, b"new contents").await.unwrap();
    assert!(fs.release(fh).await.is_err());

    assert_eq!(fs.getattr(ino).unwrap().size, 3);
    assert_eq!(backend.get("keep").unwrap(), "old");
    assert_eq!(read_all(&fs, ino).await, b"old");
}

#[tokio::test]
async fn handles_follow_open_mode() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("f", "x");
    let fs = mount(&backend);
    let (ino, _) = fs.lookup(ROOT, "f").await.unwrap();

    assert!(matches!(
        fs.open(ino, OpenMode::ReadWrite).await,
        Err(FsError::Unsupported(_))
    ));
    assert!(matches!(
        fs.open(ROOT, OpenMode::ReadOnly).await,
        Err(FsError::IsADirectory(_))
    ));
    let fh = fs.open(ino, OpenMode::ReadOnly).await.unwrap();
    assert!(matches!(
        fs.write(fh, b"no").await,
        Err(FsError::Unsupported(_))
    ));
    fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn forgotten_inodes_are_dropped() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("f", "x");
    let fs = mount(&backend);
    let (ino, _) = fs.lookup(ROOT, "f").await.unwrap();
    fs.lookup(ROOT, "f").await.unwrap();

    fs.forget(ino, 1);
    assert!(fs.getattr(ino).is_ok());
    let (same, _) = fs.lookup(ROOT, "f").await.unwrap();
    assert_eq!(same, ino);

    fs.forget(ino, 2);
    assert!(matches!(fs.getattr(ino), Err(FsError::NotFound(_))));
    assert_eq!(fs.inodes().live(), 1);
    assert_eq!(fs.inodes().mapped(), 1);
    // a later lookup builds a fresh node
    let (again, _) = fs.lookup(ROOT, "f").await.unwrap();
    assert_ne!(again, ino);
    assert_eq!(fs.getattr(again).unwrap().size, 1);
}

#[tokio::test]
async fn listing_a_large_tree_does_not_pin_inodes() {
    let backend = Arc::new(MemoryBackend::new());
    for i in 0..50 {
        backend.insert(&format!("d{i}/f"), "x");
    }
    let fs = mount(&backend);
    for row in fs.readdir(ROOT).await.unwrap() {
        let (ino, _) = fs.lookup(ROOT, &row.name).await.unwrap();
        assert_eq!(fs.readdir(ino).await.unwrap().len(), 1);
        fs.forget(ino, 1);
    }
    assert_eq!(fs.inodes().live(), 1);
    assert_eq!(fs.inodes().mapped(), 1);
}

#[tokio::test]
async fn modtime_can_be_suppressed() {
    let backend = Arc::new(MemoryBackend::new());
    let info = backend.insert("f", "x");

    let fs = mount(&backend);
    let (ino, _) = fs.lookup(ROOT, "f").await.unwrap();
    assert_eq!(fs.getattr(ino).unwrap().mtime, Some(info.mod_time));

    let quiet = RemoteFs::new(
        backend.clone(),
        VfsOptions {
            no_modtime: true,
            ..VfsOptions::default()
        },
    );
    let (ino, _) = quiet.lookup(ROOT, "f").await.unwrap();
    assert_eq!(quiet.getattr(ino).unwrap().mtime, None);
}

#[tokio::test]
async fn local_backend_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn ObjectBackend> = Arc::new(LocalFsBackend::new(dir.path()));
    let fs = RemoteFs::new(backend.clone(), VfsOptions::default());

    let (sub, _) = fs.mkdir(ROOT, "sub").await.unwrap();
    let (_, _, fh) = fs.create(sub, "note.txt").await.unwrap();
    fs.write(fh, b"on disk").await.unwrap();
    fs.release(fh).await.unwrap();

    assert_eq!(
        std::fs::read(dir.path().join("sub/note.txt")).unwrap(),
        b"on disk"
    );
    // a fresh mount sees the committed file through a real listing
    let fresh = RemoteFs::new(backend, VfsOptions::default());
    let (sub, _) = fresh.lookup(ROOT, "sub").await.unwrap();
    let (note, _) = fresh.lookup(sub, "note.txt").await.unwrap();
    assert_eq!(read_all(&fresh, note).await, b"on disk");
}
