//! The filesystem root.
//!
//! `RemoteFs` owns the backend, the mount options, the root directory and
//! the inode/handle tables. Its methods speak inode and handle numbers, the
//! shape the kernel adapter needs, and carry all of the filesystem logic.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::cadapter::{ObjectBackend, join_remote};
use crate::vfs::dir::DirNode;
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::file::{FileNode, OpenMode};
use crate::vfs::inode::{Handle, HandleTable, InodeTable, Node, ROOT_INO};
use crate::vfs::{Entry, NodeAttr, NodeKind, VfsOptions};

pub struct RemoteFs {
    backend: Arc<dyn ObjectBackend>,
    root: Arc<DirNode>,
    inodes: InodeTable,
    handles: HandleTable,
    attr_ttl: Duration,
    mounted_at: SystemTime,
}

/// One row of a directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirRow {
    pub ino: u64,
    pub name: String,
    pub kind: NodeKind,
}

impl RemoteFs {
    pub fn new(backend: Arc<dyn ObjectBackend>, options: VfsOptions) -> Self {
        let root = DirNode::new(backend.clone(), Arc::new(options), "");
        Self {
            backend,
            inodes: InodeTable::new(root.clone()),
            root,
            handles: HandleTable::default(),
            attr_ttl: Duration::from_secs(1),
            mounted_at: SystemTime::now(),
        }
    }

    pub fn with_attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    pub fn root(&self) -> Arc<DirNode> {
        self.root.clone()
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    pub fn attr_ttl(&self) -> Duration {
        self.attr_ttl
    }

    /// Time reported for nodes without a modification time.
    pub fn mounted_at(&self) -> SystemTime {
        self.mounted_at
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn node(&self, ino: u64) -> FsResult<Node> {
        self.inodes
            .get(ino)
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
    }

    pub fn dir(&self, ino: u64) -> FsResult<Arc<DirNode>> {
        match self.node(ino)? {
            Node::Dir(d) => Ok(d),
            Node::File(f) => Err(FsError::NotADirectory(f.remote())),
        }
    }

    fn file(&self, ino: u64) -> FsResult<Arc<FileNode>> {
        match self.node(ino)? {
            Node::File(f) => Ok(f),
            Node::Dir(d) => Err(FsError::IsADirectory(d.path().to_string())),
        }
    }

    pub fn getattr(&self, ino: u64) -> FsResult<NodeAttr> {
        Ok(self.node(ino)?.attr())
    }

    /// Resolve `name` in directory `parent`, taking one kernel lookup on
    /// the returned inode.
    pub async fn lookup(&self, parent: u64, name: &str) -> FsResult<(u64, Node)> {
        let dir = self.dir(parent)?;
        let entry = dir.lookup(name).await?;
        let path = join_remote(dir.path(), name);
        Ok(self
            .inodes
            .remember(&path, entry.kind(), || dir.child_node(name, &entry)))
    }

    pub async fn readdir(&self, ino: u64) -> FsResult<Vec<DirRow>> {
        let dir = self.dir(ino)?;
        let mut rows: Vec<DirRow> = dir
            .read_dir_all()
            .await?
            .into_iter()
            .map(|(name, kind)| DirRow {
                ino: self.inodes.listed(ino, &join_remote(dir.path(), &name)),
                name,
                kind,
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    pub async fn mkdir(&self, parent: u64, name: &str) -> FsResult<(u64, Node)> {
        let dir = self.dir(parent)?;
        let child = dir.mkdir(name).await?;
        let ino = self.inodes.insert(child.path(), Node::Dir(child.clone()));
        Ok((ino, Node::Dir(child)))
    }

    /// Create a file and open it for writing. Returns inode, node and handle.
    pub async fn create(&self, parent: u64, name: &str) -> FsResult<(u64, Node, u64)> {
        let dir = self.dir(parent)?;
        if let Ok(Entry::Dir(path)) = dir.lookup(name).await {
            return Err(FsError::IsADirectory(path));
        }
        let (file, handle) = dir.create(name)?;
        let ino = self.inodes.insert(&file.remote(), Node::File(file.clone()));
        let fh = self.handles.insert(Handle::Write(handle));
        Ok((ino, Node::File(file), fh))
    }

    pub async fn open(&self, ino: u64, mode: OpenMode) -> FsResult<u64> {
        let file = self.file(ino)?;
        let handle = file.open(mode).await?;
        Ok(self.handles.insert(handle))
    }

    pub async fn read(&self, fh: u64, size: usize) -> FsResult<Bytes> {
        self.handles.get(fh)?.read(size).await
    }

    pub async fn write(&self, fh: u64, data: &[u8]) -> FsResult<usize> {
        self.handles.get(fh)?.write(data).await
    }

    pub async fn release(&self, fh: u64) -> FsResult<()> {
        self.handles.remove(fh)?.release().await
    }

    /// Remove a file.
    pub async fn unlink(&self, parent: u64, name: &str) -> FsResult<()> {
        let dir = self.dir(parent)?;
        if let Entry::Dir(path) = dir.lookup(name).await? {
            return Err(FsError::IsADirectory(path));
        }
        dir.remove(name).await?;
        self.inodes.unlink(&join_remote(dir.path(), name));
        Ok(())
    }

    /// Remove an empty directory.
    pub async fn rmdir(&self, parent: u64, name: &str) -> FsResult<()> {
        let dir = self.dir(parent)?;
        if let Entry::File(object) = dir.lookup(name).await? {
            return Err(FsError::NotADirectory(object.remote().to_string()));
        }
        dir.remove(name).await?;
        self.inodes.unlink(&join_remote(dir.path(), name));
        Ok(())
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    /// Release every handle still open, e.g. at unmount. Pending writes are
    /// committed where the backend allows it.
    pub async fn release_all(&self) {
        for (fh, handle) in self.handles.drain() {
            if let Err(e) = handle.release().await {
                tracing::warn!(fh, "release at shutdown failed: {e}");
            }
        }
    }

    /// Inode of the root directory.
    pub const ROOT: u64 = ROOT_INO;
}
