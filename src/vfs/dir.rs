//! Directory nodes and their lazily populated entry cache.
//!
//! A directory lists its backend prefix exactly once, on first access, and
//! serves every later lookup and listing from the cache. Only local
//! mutations (mkdir, committed writes, removals) patch the cache afterwards;
//! changes made to the backend by other clients stay invisible until the
//! node is dropped and recreated.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};

use crate::cadapter::{BackendError, Listing, ObjectBackend, ObjectRef, join_remote, leaf_of};
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::file::FileNode;
use crate::vfs::inode::Node;
use crate::vfs::write::WriteHandle;
use crate::vfs::{DIR_PERMS, Entry, NodeAttr, NodeKind, VfsOptions};

/// Population state of a directory cache.
///
/// `Populating` is only ever stored while the write lock is held by the task
/// doing the listing; finding it afterwards means that listing was abandoned.
enum CacheState {
    Unpopulated,
    Populating,
    Populated(HashMap<String, Entry>),
}

pub struct DirNode {
    backend: Arc<dyn ObjectBackend>,
    options: Arc<VfsOptions>,
    path: String,
    cache: RwLock<CacheState>,
}

impl DirNode {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        options: Arc<VfsOptions>,
        path: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            options,
            path: path.into(),
            cache: RwLock::new(CacheState::Unpopulated),
        })
    }

    /// A directory known to have no children, e.g. one just made by mkdir.
    fn new_empty(
        backend: Arc<dyn ObjectBackend>,
        options: Arc<VfsOptions>,
        path: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            options,
            path,
            cache: RwLock::new(CacheState::Populated(HashMap::new())),
        })
    }

    /// Remote path of this directory, `""` for the root.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    pub fn options(&self) -> &Arc<VfsOptions> {
        &self.options
    }

    pub fn attr(&self) -> NodeAttr {
        tracing::trace!(path = %self.path, "Dir.Attr");
        NodeAttr {
            kind: NodeKind::Dir,
            size: 0,
            perm: DIR_PERMS,
            mtime: None,
        }
    }

    pub async fn lookup(&self, name: &str) -> FsResult<Entry> {
        let guard = self.populated().await?;
        let items = Self::items(&guard, &self.path)?;
        match items.get(name) {
            Some(entry) => {
                tracing::debug!(path = %join_remote(&self.path, name), kind = ?entry.kind(), "Dir.Lookup OK");
                Ok(entry.clone())
            }
            None => Err(FsError::NotFound(join_remote(&self.path, name))),
        }
    }

    /// Every cached child as `(leaf, kind)`, in no particular order.
    pub async fn read_dir_all(&self) -> FsResult<Vec<(String, NodeKind)>> {
        let guard = self.populated().await?;
        let items = Self::items(&guard, &self.path)?;
        let entries: Vec<_> = items
            .iter()
            .map(|(name, entry)| (name.clone(), entry.kind()))
            .collect();
        tracing::debug!(path = %self.path, count = entries.len(), "Dir.ReadDirAll OK");
        Ok(entries)
    }

    /// Start a new file; nothing reaches the backend until the returned
    /// handle is released.
    pub fn create(
        self: &Arc<Self>,
        name: &str,
    ) -> FsResult<(Arc<FileNode>, WriteHandle)> {
        let file = FileNode::unbound(self.clone(), name);
        let handle = WriteHandle::new(file.clone())?;
        tracing::debug!(path = %file.remote(), "Dir.Create OK");
        Ok((file, handle))
    }

    /// Make a directory locally. The backend learns about it only once a
    /// file is written beneath it.
    pub async fn mkdir(&self, name: &str) -> FsResult<Arc<DirNode>> {
        let path = join_remote(&self.path, name);
        self.insert_entry(name, Entry::Dir(path.clone())).await?;
        tracing::debug!(path = %path, "Dir.Mkdir OK");
        Ok(Self::new_empty(
            self.backend.clone(),
            self.options.clone(),
            path,
        ))
    }

    pub async fn remove(&self, name: &str) -> FsResult<()> {
        let path = join_remote(&self.path, name);
        match self.lookup(name).await? {
            Entry::File(object) => {
                if let Err(e) = object.remove().await {
                    tracing::error!(path = %path, "Dir.Remove file error: {e}");
                    return Err(e.into());
                }
            }
            Entry::Dir(dir) => {
                if !self.dir_empty(&dir).await? {
                    tracing::debug!(path = %path, "Dir.Remove not empty");
                    return Err(FsError::NotEmpty(path));
                }
            }
        }
        self.delete_entry(name).await;
        tracing::debug!(path = %path, "Dir.Remove OK");
        Ok(())
    }

    /// Build the node for a cached child.
    pub fn child_node(self: &Arc<Self>, name: &str, entry: &Entry) -> Node {
        match entry {
            Entry::File(object) => Node::File(FileNode::bound(self.clone(), name, object.clone())),
            Entry::Dir(path) => Node::Dir(DirNode::new(
                self.backend.clone(),
                self.options.clone(),
                path.clone(),
            )),
        }
    }

    /// Record a freshly committed object. An unpopulated cache is left alone:
    /// its first listing will pick the object up from the backend.
    pub(crate) async fn register_object(&self, leaf: &str, object: ObjectRef) {
        let mut guard = self.cache.write().await;
        if let CacheState::Populated(items) = &mut *guard {
            items.insert(leaf.to_string(), Entry::File(object));
        }
    }

    async fn insert_entry(&self, leaf: &str, entry: Entry) -> FsResult<()> {
        drop(self.populated().await?);
        let mut guard = self.cache.write().await;
        match &mut *guard {
            CacheState::Populated(items) => {
                items.insert(leaf.to_string(), entry);
                Ok(())
            }
            _ => Err(FsError::Invariant(format!(
                "directory {:?} lost its populated cache",
                self.path
            ))),
        }
    }

    async fn delete_entry(&self, leaf: &str) {
        let mut guard = self.cache.write().await;
        if let CacheState::Populated(items) = &mut *guard {
            items.remove(leaf);
        }
    }

    /// Fresh, uncached check that a sub-directory has no children.
    async fn dir_empty(&self, dir: &str) -> FsResult<bool> {
        match self.backend.list(dir).await {
            Ok(listing) => Ok(listing.is_empty()),
            Err(BackendError::DirNotFound(_)) => Ok(true),
            Err(e) => {
                tracing::error!(path = %dir, "Dir.Remove dir error: {e}");
                Err(e.into())
            }
        }
    }

    /// Read access to a populated cache, listing the backend first if needed.
    /// Concurrent callers wait on the write lock while one of them lists.
    async fn populated(&self) -> FsResult<RwLockReadGuard<'_, CacheState>> {
        {
            let guard = self.cache.read().await;
            if matches!(*guard, CacheState::Populated(_)) {
                return Ok(guard);
            }
        }
        let mut guard = self.cache.write().await;
        if !matches!(*guard, CacheState::Populated(_)) {
            *guard = CacheState::Populating;
            match self.list_entries().await {
                Ok(items) => *guard = CacheState::Populated(items),
                Err(e) => {
                    *guard = CacheState::Unpopulated;
                    tracing::error!(path = %self.path, "Dir.ReadDir error: {e}");
                    return Err(e);
                }
            }
        }
        Ok(guard.downgrade())
    }

    async fn list_entries(&self) -> FsResult<HashMap<String, Entry>> {
        let listing = match self.backend.list(&self.path).await {
            Ok(listing) => listing,
            // Directories are implicit, a missing one is simply empty.
            Err(BackendError::DirNotFound(_)) => Listing::default(),
            Err(e) => return Err(e.into()),
        };
        let mut items = HashMap::with_capacity(listing.objects.len() + listing.dirs.len());
        for info in listing.objects {
            let leaf = info.leaf().to_string();
            items.insert(leaf, Entry::File(ObjectRef::new(info, self.backend.clone())));
        }
        for dir in listing.dirs {
            items.insert(leaf_of(&dir).to_string(), Entry::Dir(dir));
        }
        tracing::debug!(path = %self.path, count = items.len(), "Dir.ReadDir populated");
        Ok(items)
    }

    fn items<'a>(state: &'a CacheState, path: &str) -> FsResult<&'a HashMap<String, Entry>> {
        match state {
            CacheState::Populated(items) => Ok(items),
            CacheState::Unpopulated | CacheState::Populating => Err(FsError::Invariant(format!(
                "directory {path:?} read before population"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::MemoryBackend;

    fn dir_over(backend: &Arc<MemoryBackend>, path: &str) -> Arc<DirNode> {
        DirNode::new(backend.clone(), Arc::new(VfsOptions::default()), path)
    }

    #[tokio::test]
    async fn test_dir_lists_backend_once() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("a/b.txt", "hello");
        backend.insert("c.txt", "c");
        let root = dir_over(&backend, "");

        let first = root.lookup("a").await.unwrap();
        assert!(matches!(first, Entry::Dir(ref p) if p == "a"));
        let mut listing = root.read_dir_all().await.unwrap();
        listing.sort();
        assert_eq!(
            listing,
            vec![("a".to_string(), NodeKind::Dir), ("c.txt".to_string(), NodeKind::File)]
        );
        let mut again = root.read_dir_all().await.unwrap();
        again.sort();
        assert_eq!(listing, again);
        assert_eq!(backend.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_dir_concurrent_population_lists_once() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("x/one", "1");
        let dir = dir_over(&backend, "x");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let dir = dir.clone();
            tasks.push(tokio::spawn(async move { dir.lookup("one").await.is_ok() }));
        }
        for t in tasks {
            assert!(t.await.unwrap());
        }
        assert_eq!(backend.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_dir_lookup_absent_is_not_found() {
        let backend = Arc::new(MemoryBackend::new());
        let root = dir_over(&backend, "");
        assert!(matches!(root.lookup("nope").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let backend = Arc::new(MemoryBackend::new());
        let dir = dir_over(&backend, "never/written");
        assert!(dir.read_dir_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mkdir_is_local_and_visible() {
        let backend = Arc::new(MemoryBackend::new());
        let root = dir_over(&backend, "");
        root.read_dir_all().await.unwrap();
        let calls = backend.list_calls();

        let child = root.mkdir("x").await.unwrap();
        assert_eq!(child.path(), "x");
        assert!(matches!(root.lookup("x").await.unwrap(), Entry::Dir(_)));
        // the new directory is known to be empty
        assert!(child.read_dir_all().await.unwrap().is_empty());
        assert_eq!(backend.list_calls(), calls);
        assert!(backend.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_directory_checks_backend() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("full/f", "data");
        let root = dir_over(&backend, "");
        root.mkdir("empty").await.unwrap();

        assert!(matches!(root.remove("full").await, Err(FsError::NotEmpty(_))));
        root.remove("empty").await.unwrap();
        assert!(matches!(root.lookup("empty").await, Err(FsError::NotFound(_))));
        assert!(root.lookup("full").await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_file_deletes_object() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("f.txt", "data");
        let root = dir_over(&backend, "");
        root.remove("f.txt").await.unwrap();
        assert!(backend.get("f.txt").is_none());
        assert!(matches!(root.lookup("f.txt").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_file_backend_failure_keeps_entry() {
        let backend = Arc::new(MemoryBackend::new());
        let info = backend.insert("f.txt", "data");
        let root = dir_over(&backend, "");
        root.lookup("f.txt").await.unwrap();
        // object vanished behind our back: the backend remove fails
        backend.remove(&info).await.unwrap();
        assert!(matches!(root.remove("f.txt").await, Err(FsError::Backend(_))));
        assert!(root.lookup("f.txt").await.is_ok());
    }
}
