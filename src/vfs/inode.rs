//! Inode and file handle tables.
//!
//! The kernel names nodes by inode number and open files by handle number.
//! A node stays alive, under one inode number, while the kernel holds lookups
//! on it. Numbers handed out by a listing are kept while the listed directory
//! is alive, so `readdir` and a following `lookup` agree. Forgetting a node
//! drops its mapping and those of its listed children that have no node.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::vfs::dir::DirNode;
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::file::FileNode;
use crate::vfs::read::ReadHandle;
use crate::vfs::write::WriteHandle;
use crate::vfs::{NodeAttr, NodeKind};

pub const ROOT_INO: u64 = 1;

#[derive(Clone)]
pub enum Node {
    Dir(Arc<DirNode>),
    File(Arc<FileNode>),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Dir(_) => NodeKind::Dir,
            Node::File(_) => NodeKind::File,
        }
    }

    pub fn attr(&self) -> NodeAttr {
        match self {
            Node::Dir(d) => d.attr(),
            Node::File(f) => f.attr(),
        }
    }

    pub fn remote(&self) -> String {
        match self {
            Node::Dir(d) => d.path().to_string(),
            Node::File(f) => f.remote(),
        }
    }
}

struct Slot {
    path: String,
    node: Node,
    lookups: u64,
    /// Child paths this directory handed numbers out for.
    listed: HashSet<String>,
}

struct Inodes {
    next_ino: u64,
    by_path: HashMap<String, u64>,
    slots: HashMap<u64, Slot>,
}

impl Inodes {
    fn next(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn alloc(&mut self, path: &str) -> u64 {
        let ino = self.next();
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    fn occupy(&mut self, ino: u64, path: &str, node: Node) {
        let slot = Slot {
            path: path.to_string(),
            node,
            lookups: 1,
            listed: HashSet::new(),
        };
        self.slots.insert(ino, slot);
    }
}

pub struct InodeTable {
    inner: Mutex<Inodes>,
}

impl InodeTable {
    pub fn new(root: Arc<DirNode>) -> Self {
        let mut by_path = HashMap::new();
        by_path.insert(root.path().to_string(), ROOT_INO);
        let mut slots = HashMap::new();
        slots.insert(
            ROOT_INO,
            Slot {
                path: root.path().to_string(),
                node: Node::Dir(root),
                lookups: 1,
                listed: HashSet::new(),
            },
        );
        Self {
            inner: Mutex::new(Inodes {
                next_ino: ROOT_INO + 1,
                by_path,
                slots,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inodes> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, ino: u64) -> Option<Node> {
        self.lock().slots.get(&ino).map(|s| s.node.clone())
    }

    /// Inode number currently mapped to `path`, or a fresh unremembered one.
    pub fn ino_of(&self, path: &str) -> u64 {
        let mut inner = self.lock();
        match inner.by_path.get(path) {
            Some(&ino) => ino,
            None => inner.next(),
        }
    }

    /// Inode number for `path` as reported in a listing of directory `dir`.
    /// The mapping lives until `dir` is forgotten, or `path`'s own node is.
    pub fn listed(&self, dir: u64, path: &str) -> u64 {
        let mut inner = self.lock();
        if !inner.slots.contains_key(&dir) {
            return inner.next();
        }
        let ino = match inner.by_path.get(path) {
            Some(&ino) => ino,
            None => inner.alloc(path),
        };
        if let Some(slot) = inner.slots.get_mut(&dir) {
            slot.listed.insert(path.to_string());
        }
        ino
    }

    /// Take one kernel lookup on the node at `path`, building it with
    /// `make` when no live node of the right kind exists.
    pub fn remember(&self, path: &str, kind: NodeKind, make: impl FnOnce() -> Node) -> (u64, Node) {
        let mut inner = self.lock();
        let ino = match inner.by_path.get(path) {
            Some(&ino) => ino,
            None => inner.alloc(path),
        };
        if let Some(slot) = inner.slots.get_mut(&ino) {
            if slot.node.kind() == kind {
                slot.lookups += 1;
                return (ino, slot.node.clone());
            }
        }
        // the path changed kind under a live inode: give it a new number
        let ino = if inner.slots.contains_key(&ino) {
            inner.alloc(path)
        } else {
            ino
        };
        let node = make();
        inner.occupy(ino, path, node.clone());
        (ino, node)
    }

    /// Install a freshly made node at `path`, replacing whatever was there.
    pub fn insert(&self, path: &str, node: Node) -> u64 {
        let mut inner = self.lock();
        let ino = match inner.by_path.get(path) {
            Some(&ino) if !inner.slots.contains_key(&ino) => ino,
            _ => inner.alloc(path),
        };
        inner.occupy(ino, path, node);
        ino
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut inner = self.lock();
        let Some(slot) = inner.slots.get_mut(&ino) else {
            return;
        };
        slot.lookups = slot.lookups.saturating_sub(nlookup);
        if slot.lookups > 0 {
            return;
        }
        let Some(slot) = inner.slots.remove(&ino) else {
            return;
        };
        // the path may already belong to a newer inode
        if inner.by_path.get(&slot.path) == Some(&ino) {
            inner.by_path.remove(&slot.path);
        }
        for child in &slot.listed {
            if let Some(&child_ino) = inner.by_path.get(child) {
                if !inner.slots.contains_key(&child_ino) {
                    inner.by_path.remove(child);
                }
            }
        }
        tracing::trace!(ino, path = %slot.path, "inode forgotten");
    }

    /// The name at `path` is gone; a new node there gets a new number.
    pub fn unlink(&self, path: &str) {
        self.lock().by_path.remove(path);
    }

    /// Number of live nodes, the root included.
    pub fn live(&self) -> usize {
        self.lock().slots.len()
    }

    /// Number of remembered path mappings, the root included.
    pub fn mapped(&self) -> usize {
        self.lock().by_path.len()
    }
}

/// An open file handle; reading or writing depending on how it was opened.
pub enum Handle {
    Read(ReadHandle),
    Write(WriteHandle),
}

impl Handle {
    pub async fn read(&self, size: usize) -> FsResult<Bytes> {
        match self {
            Handle::Read(h) => h.read(size).await,
            Handle::Write(_) => Err(FsError::Unsupported("read from a write handle")),
        }
    }

    pub async fn write(&self, data: &[u8]) -> FsResult<usize> {
        match self {
            Handle::Write(h) => h.write(data).await,
            Handle::Read(_) => Err(FsError::Unsupported("write to a read handle")),
        }
    }

    pub async fn release(&self) -> FsResult<()> {
        match self {
            Handle::Read(h) => h.release().await,
            Handle::Write(h) => h.release().await,
        }
    }
}

pub struct HandleTable {
    next_fh: AtomicU64,
    handles: Mutex<HashMap<u64, Arc<Handle>>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }
}

impl HandleTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<Handle>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, handle: Handle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(fh, Arc::new(handle));
        fh
    }

    pub fn get(&self, fh: u64) -> FsResult<Arc<Handle>> {
        self.lock().get(&fh).cloned().ok_or(FsError::BadHandle(fh))
    }

    pub fn remove(&self, fh: u64) -> FsResult<Arc<Handle>> {
        self.lock().remove(&fh).ok_or(FsError::BadHandle(fh))
    }

    /// Take every open handle out of the table.
    pub fn drain(&self) -> Vec<(u64, Arc<Handle>)> {
        self.lock().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
