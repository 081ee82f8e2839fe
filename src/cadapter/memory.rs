//! In-memory object store, the mock backend for tests and `memory:` remotes.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;

use super::{BackendError, Listing, ObjectBackend, ObjectInfo, ObjectStream, join_remote};

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    mod_time: SystemTime,
}

#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    list_calls: AtomicUsize,
    fail_puts: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing `put`.
    pub fn insert(&self, remote: &str, data: impl Into<Bytes>) -> ObjectInfo {
        let stored = StoredObject {
            data: data.into(),
            mod_time: SystemTime::now(),
        };
        let info = Self::info_of(remote, &stored);
        self.write_objects().insert(remote.to_string(), stored);
        info
    }

    pub fn get(&self, remote: &str) -> Option<Bytes> {
        self.read_objects().get(remote).map(|o| o.data.clone())
    }

    /// Number of `list` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Make every subsequent `put` fail after draining its input.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    fn info_of(remote: &str, stored: &StoredObject) -> ObjectInfo {
        ObjectInfo::new(remote, stored.data.len() as u64, stored.mod_time)
    }

    fn read_objects(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_objects(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn name(&self) -> String {
        "memory:".to_string()
    }

    async fn list(&self, dir: &str) -> Result<Listing, BackendError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let objects = self.read_objects();
        let mut listing = Listing::default();
        let mut dirs = BTreeSet::new();
        for (key, stored) in objects.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((sub, _)) => {
                    dirs.insert(join_remote(dir, sub));
                }
                None => listing.objects.push(Self::info_of(key, stored)),
            }
        }
        listing.dirs = dirs.into_iter().collect();
        if !dir.is_empty() && listing.is_empty() {
            return Err(BackendError::DirNotFound(dir.to_string()));
        }
        Ok(listing)
    }

    async fn stat(&self, remote: &str) -> Result<ObjectInfo, BackendError> {
        self.read_objects()
            .get(remote)
            .map(|stored| Self::info_of(remote, stored))
            .ok_or_else(|| BackendError::ObjectNotFound(remote.to_string()))
    }

    async fn open(&self, object: &ObjectInfo) -> Result<ObjectStream, BackendError> {
        let data = self
            .get(&object.remote)
            .ok_or_else(|| BackendError::ObjectNotFound(object.remote.clone()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn put(&self, remote: &str, mut body: ObjectStream) -> Result<ObjectInfo, BackendError> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await?;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BackendError::remote("put", "injected failure"));
        }
        Ok(self.insert(remote, buf))
    }

    async fn remove(&self, object: &ObjectInfo) -> Result<(), BackendError> {
        match self.write_objects().remove(&object.remote) {
            Some(_) => Ok(()),
            None => Err(BackendError::ObjectNotFound(object.remote.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_list_single_level() {
        let backend = MemoryBackend::new();
        backend.insert("a/b.txt", "hello");
        backend.insert("a/c/d.txt", "x");
        backend.insert("top.txt", "t");

        let root = backend.list("").await.unwrap();
        assert_eq!(root.dirs, vec!["a".to_string()]);
        assert_eq!(root.objects.len(), 1);
        assert_eq!(root.objects[0].remote, "top.txt");

        let a = backend.list("a").await.unwrap();
        assert_eq!(a.dirs, vec!["a/c".to_string()]);
        assert_eq!(a.objects.len(), 1);
        assert_eq!(a.objects[0].size, 5);

        assert!(matches!(
            backend.list("missing").await,
            Err(BackendError::DirNotFound(_))
        ));
        assert_eq!(backend.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_memory_prefix_is_not_a_sibling_match() {
        let backend = MemoryBackend::new();
        backend.insert("ab/x", "1");
        backend.insert("a/y", "2");
        let a = backend.list("a").await.unwrap();
        assert_eq!(a.objects.len(), 1);
        assert_eq!(a.objects[0].remote, "a/y");
    }

    #[tokio::test]
    async fn test_memory_put_and_open() {
        let backend = MemoryBackend::new();
        let info = backend
            .put("dir/f.bin", Box::new(Cursor::new(b"abcdef".to_vec())))
            .await
            .unwrap();
        assert_eq!(info.size, 6);

        let mut out = Vec::new();
        backend.open(&info).await.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");

        backend.set_fail_puts(true);
        let res = backend
            .put("dir/g.bin", Box::new(Cursor::new(b"zz".to_vec())))
            .await;
        assert!(res.is_err());
        assert!(backend.get("dir/g.bin").is_none());
    }
}
