//! VFS layer (virtual filesystem)
//!
//! Responsibilities:
//! - Model the remote as a tree of directory and file nodes. Directories are
//!   implicit prefixes of object keys and are listed lazily, once per node.
//! - Bridge chunked kernel writes into a single streaming backend put.
//! - Track the nodes and open handles the kernel refers to by number.
//!
//! Submodules:
//! - `dir`: directory node and its lazily populated cache
//! - `file`: file node, bound to a committed object or still being written
//! - `read` / `write`: open file handles
//! - `inode`: inode and handle tables
//! - `fs`: the filesystem root tying backend, options and tables together
pub mod dir;
pub mod error;
pub mod file;
pub mod fs;
pub mod inode;
pub mod read;
pub mod write;

use std::time::SystemTime;

use crate::cadapter::ObjectRef;

/// Permission bits reported for every directory.
pub const DIR_PERMS: u16 = 0o755;
/// Permission bits reported for every file.
pub const FILE_PERMS: u16 = 0o644;

/// Default capacity of the in-memory conduit between writes and the put.
pub const DEFAULT_WRITE_BUFFER: usize = 128 * 1024;

/// Options threaded into every node of one mount.
#[derive(Clone, Debug)]
pub struct VfsOptions {
    /// Don't report modification times of committed objects.
    pub no_modtime: bool,
    pub write_buffer_size: usize,
}

impl Default for VfsOptions {
    fn default() -> Self {
        Self {
            no_modtime: false,
            write_buffer_size: DEFAULT_WRITE_BUFFER,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeKind {
    Dir,
    File,
}

/// Attributes of a node as seen by the kernel adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAttr {
    pub kind: NodeKind,
    pub size: u64,
    pub perm: u16,
    /// Modification time; `None` when unknown or suppressed.
    pub mtime: Option<SystemTime>,
}

/// One child of a directory, keyed by its leaf name in the parent's cache.
#[derive(Clone, Debug)]
pub enum Entry {
    File(ObjectRef),
    /// Remote path of an implicit directory.
    Dir(String),
}

impl Entry {
    pub fn kind(&self) -> NodeKind {
        match self {
            Entry::File(_) => NodeKind::File,
            Entry::Dir(_) => NodeKind::Dir,
        }
    }

    pub fn remote(&self) -> &str {
        match self {
            Entry::File(o) => o.remote(),
            Entry::Dir(path) => path,
        }
    }
}
