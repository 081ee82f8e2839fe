//! Object store adapter (cAdapter)
//!
//! The backend collaborator behind the mount: a flat key space of objects
//! addressed by `/`-separated remote paths. Directories are never stored;
//! they exist only as common prefixes of object keys.
//!
//! Submodules:
//! - `memory`: in-process store, used by tests and `memory:` remotes
//! - `localfs`: objects kept as files under a host directory
//! - `s3`: S3-compatible adapter built on aws-sdk-s3
//!
//! Responsibilities summary:
//! - Provide an async API for list/stat/open/put/remove of objects.
//! - Report a missing directory as `DirNotFound` so callers can treat it as empty.
//! - Commit puts atomically: a failed put never leaves a visible object.
pub mod localfs;
pub mod memory;
pub mod s3;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::config::RemoteSpec;

/// Byte stream handed out by `open` and consumed by `put`.
pub type ObjectStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("directory not found: {0}")]
    DirNotFound(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("invalid remote path: {0:?}")]
    InvalidRemote(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{op} failed: {message}")]
    Remote { op: &'static str, message: String },
}

impl BackendError {
    pub fn remote(op: &'static str, err: impl fmt::Display) -> Self {
        BackendError::Remote {
            op,
            message: err.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BackendError::DirNotFound(_) | BackendError::ObjectNotFound(_)
        )
    }
}

/// Metadata of one committed object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Full remote path, `/`-separated, no leading slash.
    pub remote: String,
    pub size: u64,
    pub mod_time: SystemTime,
    /// Content type declared by the backend, if it stores one.
    pub content_type: Option<String>,
}

impl ObjectInfo {
    pub fn new(remote: impl Into<String>, size: u64, mod_time: SystemTime) -> Self {
        Self {
            remote: remote.into(),
            size,
            mod_time,
            content_type: None,
        }
    }

    /// Last path segment of the remote.
    pub fn leaf(&self) -> &str {
        leaf_of(&self.remote)
    }
}

/// Result of a single-level listing.
#[derive(Clone, Debug, Default)]
pub struct Listing {
    pub objects: Vec<ObjectInfo>,
    /// Remote paths of the immediate sub-directories.
    pub dirs: Vec<String>,
}

impl Listing {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.dirs.is_empty()
    }
}

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Human readable description of the remote, used in logs.
    fn name(&self) -> String;

    /// List the immediate children of `dir` (`""` is the root).
    async fn list(&self, dir: &str) -> Result<Listing, BackendError>;

    async fn stat(&self, remote: &str) -> Result<ObjectInfo, BackendError>;

    async fn open(&self, object: &ObjectInfo) -> Result<ObjectStream, BackendError>;

    /// Store everything read from `body` until EOF under `remote`.
    async fn put(&self, remote: &str, body: ObjectStream) -> Result<ObjectInfo, BackendError>;

    async fn remove(&self, object: &ObjectInfo) -> Result<(), BackendError>;
}

/// A committed object together with the backend able to read or remove it.
#[derive(Clone)]
pub struct ObjectRef {
    info: ObjectInfo,
    backend: Arc<dyn ObjectBackend>,
}

impl ObjectRef {
    pub fn new(info: ObjectInfo, backend: Arc<dyn ObjectBackend>) -> Self {
        Self { info, backend }
    }

    pub fn info(&self) -> &ObjectInfo {
        &self.info
    }

    pub fn remote(&self) -> &str {
        &self.info.remote
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn mod_time(&self) -> SystemTime {
        self.info.mod_time
    }

    pub async fn open(&self) -> Result<ObjectStream, BackendError> {
        self.backend.open(&self.info).await
    }

    pub async fn remove(&self) -> Result<(), BackendError> {
        self.backend.remove(&self.info).await
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("remote", &self.info.remote)
            .field("size", &self.info.size)
            .finish()
    }
}

/// Build the backend described by `spec`.
pub async fn open_backend(
    spec: &RemoteSpec,
    s3: &s3::S3Config,
) -> Result<Arc<dyn ObjectBackend>, BackendError> {
    let backend: Arc<dyn ObjectBackend> = match spec {
        RemoteSpec::Memory => Arc::new(memory::MemoryBackend::new()),
        RemoteSpec::Local(root) => Arc::new(localfs::LocalFsBackend::new(root)),
        RemoteSpec::S3 { bucket, prefix } => {
            Arc::new(s3::S3Backend::new(bucket.clone(), prefix.clone(), s3.clone()).await?)
        }
    };
    tracing::info!(remote = %backend.name(), "backend ready");
    Ok(backend)
}

/// Join a directory remote and a leaf name.
pub fn join_remote(dir: &str, leaf: &str) -> String {
    if dir.is_empty() {
        leaf.to_string()
    } else {
        format!("{dir}/{leaf}")
    }
}

pub fn leaf_of(remote: &str) -> &str {
    let trimmed = remote.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(n) => &trimmed[n + 1..],
        None => trimmed,
    }
}

/// True when every `/`-separated segment is a plain name: no empty, `.` or
/// `..` segments. The root is the empty string.
pub fn is_clean_remote(remote: &str) -> bool {
    remote.is_empty()
        || remote
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

pub fn parent_of(remote: &str) -> &str {
    match remote.rfind('/') {
        Some(n) => &remote[..n],
        None => "",
    }
}
