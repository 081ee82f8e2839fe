use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::cadapter::{ObjectRef, join_remote};
use crate::vfs::dir::DirNode;
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::inode::Handle;
use crate::vfs::read::ReadHandle;
use crate::vfs::write::WriteHandle;
use crate::vfs::{FILE_PERMS, NodeAttr, NodeKind};

/// Access mode requested by an open call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenMode {
    pub fn from_flags(flags: u32) -> Self {
        match flags as i32 & libc::O_ACCMODE {
            libc::O_WRONLY => OpenMode::WriteOnly,
            libc::O_RDWR => OpenMode::ReadWrite,
            _ => OpenMode::ReadOnly,
        }
    }
}

/// A file in the tree: either bound to a committed object, or a name that
/// is still being written and has no object yet.
pub struct FileNode {
    dir: Arc<DirNode>,
    leaf: String,
    object: RwLock<Option<ObjectRef>>,
    /// Bytes accepted by the current write handle.
    written: AtomicU64,
    writing: AtomicBool,
}

impl FileNode {
    pub fn bound(dir: Arc<DirNode>, leaf: &str, object: ObjectRef) -> Arc<Self> {
        Arc::new(Self::with_object(dir, leaf, Some(object)))
    }

    pub fn unbound(dir: Arc<DirNode>, leaf: &str) -> Arc<Self> {
        Arc::new(Self::with_object(dir, leaf, None))
    }

    fn with_object(dir: Arc<DirNode>, leaf: &str, object: Option<ObjectRef>) -> Self {
        Self {
            dir,
            leaf: leaf.to_string(),
            object: RwLock::new(object),
            written: AtomicU64::new(0),
            writing: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Arc<DirNode> {
        &self.dir
    }

    pub fn remote(&self) -> String {
        join_remote(self.dir.path(), &self.leaf)
    }

    /// The committed object, if any.
    pub fn object(&self) -> Option<ObjectRef> {
        self.object.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn attr(&self) -> NodeAttr {
        let (size, mtime) = match self.object() {
            Some(object) => {
                let mtime = (!self.dir.options().no_modtime).then(|| object.mod_time());
                (object.size(), mtime)
            }
            None => (self.written.load(Ordering::Acquire), None),
        };
        NodeAttr {
            kind: NodeKind::File,
            size,
            perm: FILE_PERMS,
            mtime,
        }
    }

    pub async fn open(self: &Arc<Self>, mode: OpenMode) -> FsResult<Handle> {
        match mode {
            OpenMode::ReadOnly => {
                let Some(object) = self.object() else {
                    // nothing committed yet to read from
                    return Err(FsError::Busy(self.remote()));
                };
                let handle = ReadHandle::open(&object).await?;
                tracing::debug!(path = %self.remote(), "File.Open read OK");
                Ok(Handle::Read(handle))
            }
            OpenMode::WriteOnly => {
                let handle = WriteHandle::new(self.clone())?;
                tracing::debug!(path = %self.remote(), "File.Open write OK");
                Ok(Handle::Write(handle))
            }
            OpenMode::ReadWrite => Err(FsError::Unsupported("read-write open")),
        }
    }

    /// Claim the single writer slot and reset the live size.
    pub(crate) fn begin_write(&self) -> FsResult<()> {
        if self
            .writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FsError::Busy(self.remote()));
        }
        self.written.store(0, Ordering::Release);
        Ok(())
    }

    pub(crate) fn end_write(&self) {
        self.writing.store(false, Ordering::Release);
    }

    pub(crate) fn add_written(&self, n: u64) {
        self.written.fetch_add(n, Ordering::AcqRel);
    }

    /// Bind the node to its committed object and make it visible in the
    /// parent directory.
    pub(crate) async fn commit(&self, object: ObjectRef) {
        *self.object.write().unwrap_or_else(|e| e.into_inner()) = Some(object.clone());
        self.dir.register_object(&self.leaf, object).await;
    }
}
