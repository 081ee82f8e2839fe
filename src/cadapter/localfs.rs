//! Local directory backend: every object is a regular file under `root`.
//!
//! Puts stream into a hidden `.remotefs.partial.*` sibling and are renamed
//! into place only once the whole body has been written, so a failed upload
//! never shows up in a listing.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{BackendError, Listing, ObjectBackend, ObjectInfo, ObjectStream, join_remote};

const PARTIAL_PREFIX: &str = ".remotefs.partial.";

pub struct LocalFsBackend {
    root: PathBuf,
    partial_seq: AtomicU64,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            partial_seq: AtomicU64::new(0),
        }
    }

    /// Host path of `remote`. Anything that could resolve outside `root` is refused.
    fn path_for(&self, remote: &str) -> Result<PathBuf, BackendError> {
        if remote.is_empty() {
            return Ok(self.root.clone());
        }
        let rel = Path::new(remote);
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(BackendError::InvalidRemote(remote.to_string()));
        }
        Ok(self.root.join(rel))
    }

    async fn info_for(&self, remote: &str) -> Result<ObjectInfo, BackendError> {
        match fs::metadata(self.path_for(remote)?).await {
            Ok(meta) if meta.is_file() => Ok(ObjectInfo::new(
                remote,
                meta.len(),
                meta.modified().unwrap_or_else(|_| SystemTime::now()),
            )),
            Ok(_) => Err(BackendError::ObjectNotFound(remote.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BackendError::ObjectNotFound(remote.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Staging file of an in-flight put. Removed on drop unless `keep` was called,
/// so a failed or cancelled put leaves nothing behind.
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!("failed to remove partial upload {}: {e}", self.path.display())
            }
        }
    }
}

#[async_trait]
impl ObjectBackend for LocalFsBackend {
    fn name(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn list(&self, dir: &str) -> Result<Listing, BackendError> {
        let mut read_dir = match fs::read_dir(self.path_for(dir)?).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackendError::DirNotFound(dir.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut listing = Listing::default();
        while let Some(entry) = read_dir.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!(dir, "skip non-utf8 entry {:?}", entry.file_name());
                continue;
            };
            if name.starts_with(PARTIAL_PREFIX) {
                continue;
            }
            let remote = join_remote(dir, &name);
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                listing.dirs.push(remote);
            } else if meta.is_file() {
                let mod_time = meta.modified().unwrap_or_else(|_| SystemTime::now());
                listing
                    .objects
                    .push(ObjectInfo::new(remote, meta.len(), mod_time));
            }
        }
        if !dir.is_empty() && listing.is_empty() {
            return Err(BackendError::DirNotFound(dir.to_string()));
        }
        Ok(listing)
    }

    async fn stat(&self, remote: &str) -> Result<ObjectInfo, BackendError> {
        self.info_for(remote).await
    }

    async fn open(&self, object: &ObjectInfo) -> Result<ObjectStream, BackendError> {
        match fs::File::open(self.path_for(&object.remote)?).await {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BackendError::ObjectNotFound(object.remote.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, remote: &str, mut body: ObjectStream) -> Result<ObjectInfo, BackendError> {
        let path = self.path_for(remote)?;
        let Some(dir) = path.parent() else {
            return Err(BackendError::remote("put", format!("invalid remote {remote}")));
        };
        fs::create_dir_all(dir).await?;
        let seq = self.partial_seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("{PARTIAL_PREFIX}{}.{seq}", std::process::id());
        let partial = PartialFile::new(dir.join(name));

        let mut f = fs::File::create(partial.path()).await?;
        let n = tokio::io::copy(&mut body, &mut f).await?;
        f.flush().await?;
        f.sync_all().await?;
        drop(f);

        fs::rename(partial.path(), &path).await?;
        partial.keep();
        tracing::debug!(remote, size = n, "local put committed");
        self.info_for(remote).await
    }

    async fn remove(&self, object: &ObjectInfo) -> Result<(), BackendError> {
        let path = self.path_for(&object.remote)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackendError::ObjectNotFound(object.remote.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        // Directories are implicit: prune parents left empty by the removal.
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == self.root || fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
        Ok(())
    }
}
