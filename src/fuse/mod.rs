//! FUSE adapter
//!
//! Implements the rfuse3 raw `Filesystem` trait for `RemoteFs`, translating
//! inode/handle based kernel requests into VFS operations and VFS errors
//! into errno values.
//!
//! - `mount`: session setup and mounting.
//! - `open_options`: flags returned in open replies.
pub mod mount;
pub mod open_options;

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;

use futures_util::stream::{self, Stream};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType as FuseFileType, Result as FuseResult, SetAttr, Timestamp};

use crate::cadapter::{BackendError, parent_of};
use crate::fuse::open_options::OpenOptions;
use crate::vfs::error::FsError;
use crate::vfs::file::OpenMode;
use crate::vfs::fs::RemoteFs;
use crate::vfs::inode::{Node, ROOT_INO};
use crate::vfs::{NodeAttr, NodeKind};

/// Largest single write the kernel may send.
const MAX_WRITE: u32 = 1024 * 1024;

impl From<FsError> for Errno {
    fn from(err: FsError) -> Self {
        let code = match &err {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::Unsupported(_) => libc::ENOTSUP,
            FsError::Busy(_) => libc::EBUSY,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::Backend(e) if e.is_not_found() => libc::ENOENT,
            FsError::Backend(BackendError::InvalidRemote(_)) => libc::EINVAL,
            FsError::Backend(_) | FsError::Invariant(_) => libc::EIO,
        };
        match &err {
            FsError::Backend(_) | FsError::Invariant(_) => tracing::error!("{err}"),
            _ => tracing::debug!("{err}"),
        }
        Errno::from(code)
    }
}

impl Filesystem for RemoteFs {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(MAX_WRITE).ok_or_else(|| Errno::from(libc::EINVAL))?;
        tracing::info!(remote = %self.backend().name(), "filesystem initialised");
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        self.release_all().await;
        tracing::info!("filesystem destroyed");
    }

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let name = name.to_string_lossy();
        let (ino, node) = RemoteFs::lookup(self, parent, &name).await?;
        Ok(ReplyEntry {
            ttl: self.attr_ttl(),
            attr: self.fuse_attr(ino, &node.attr(), &req),
            generation: 0,
        })
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        RemoteFs::forget(self, inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for &(inode, nlookup) in inodes {
            RemoteFs::forget(self, inode, nlookup);
        }
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let attr = RemoteFs::getattr(self, ino)?;
        Ok(ReplyAttr {
            ttl: self.attr_ttl(),
            attr: self.fuse_attr(ino, &attr, &req),
        })
    }

    // Only truncation to zero is meaningful: every write replaces the whole
    // object. Other attribute changes are accepted and ignored.
    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let attr = RemoteFs::getattr(self, ino)?;
        match set_attr.size {
            Some(size) if size != 0 && attr.kind == NodeKind::File => {
                return Err(FsError::Unsupported("truncate to non-zero size").into());
            }
            _ => {}
        }
        Ok(ReplyAttr {
            ttl: self.attr_ttl(),
            attr: self.fuse_attr(ino, &attr, &req),
        })
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let name = name.to_string_lossy();
        let (ino, node) = RemoteFs::mkdir(self, parent, &name).await?;
        Ok(ReplyEntry {
            ttl: self.attr_ttl(),
            attr: self.fuse_attr(ino, &node.attr(), &req),
            generation: 0,
        })
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let name = name.to_string_lossy();
        Ok(RemoteFs::unlink(self, parent, &name).await?)
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let name = name.to_string_lossy();
        Ok(RemoteFs::rmdir(self, parent, &name).await?)
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let fh = RemoteFs::open(self, ino, OpenMode::from_flags(flags)).await?;
        Ok(ReplyOpen {
            fh,
            flags: OpenOptions::NONSEEKABLE.bits(),
        })
    }

    // Handles are sequential streams; the offset is not consulted.
    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        tracing::trace!(fh, offset, size, "read");
        let data = RemoteFs::read(self, fh, size as usize).await?;
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        tracing::trace!(fh, offset, len = data.len(), "write");
        let written = RemoteFs::write(self, fh, data).await?;
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        // Object stores have no meaningful capacity to report.
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: self.inodes().live() as u64,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        Ok(RemoteFs::release(self, fh).await?)
    }

    async fn flush(&self, _req: Request, _inode: u64, _fh: u64, _lock_owner: u64) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        self.dir(ino)?;
        // No FOPEN_CACHE_DIR: a commit lands in the listing after close returns.
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let rows = RemoteFs::readdir(self, ino).await?;

        // offset is that of the last entry already returned
        let mut all = Vec::with_capacity(rows.len() + 2);
        all.push(DirectoryEntry {
            inode: ino,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        all.push(DirectoryEntry {
            inode: self.parent_ino(ino),
            kind: FuseFileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, row) in rows.into_iter().enumerate() {
            all.push(DirectoryEntry {
                inode: row.ino,
                kind: fuse_kind(row.kind),
                name: OsString::from(row.name),
                offset: i as i64 + 3,
            });
        }

        let start = offset.max(0) as usize;
        let slice: Vec<_> = all.into_iter().skip(start).collect();
        let entries: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let rows = RemoteFs::readdir(self, ino).await?;
        let ttl = self.attr_ttl();
        let dir_attr = RemoteFs::getattr(self, ino)?;
        let parent = self.parent_ino(ino);

        let mut all = Vec::with_capacity(rows.len() + 2);
        for (name, inode, off) in [(".", ino, 1), ("..", parent, 2)] {
            if off <= offset as i64 {
                continue;
            }
            all.push(DirectoryEntryPlus {
                inode,
                generation: 0,
                kind: FuseFileType::Directory,
                name: OsString::from(name),
                offset: off,
                attr: self.fuse_attr(inode, &dir_attr, &req),
                entry_ttl: ttl,
                attr_ttl: ttl,
            });
        }
        for (i, row) in rows.into_iter().enumerate() {
            let off = i as i64 + 3;
            if off <= offset as i64 {
                continue;
            }
            // every returned child counts as one kernel lookup
            let (child_ino, node) = match RemoteFs::lookup(self, ino, &row.name).await {
                Ok(found) => found,
                Err(FsError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            all.push(DirectoryEntryPlus {
                inode: child_ino,
                generation: 0,
                kind: fuse_kind(row.kind),
                name: OsString::from(row.name),
                offset: off,
                attr: self.fuse_attr(child_ino, &node.attr(), &req),
                entry_ttl: ttl,
                attr_ttl: ttl,
            });
        }

        let entries: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(all.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries })
    }

    async fn releasedir(&self, _req: Request, _inode: u64, _fh: u64, _flags: u32) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let name = name.to_string_lossy();
        let (ino, node, fh) = RemoteFs::create(self, parent, &name).await?;
        Ok(ReplyCreated {
            ttl: self.attr_ttl(),
            attr: self.fuse_attr(ino, &node.attr(), &req),
            generation: 0,
            fh,
            flags: OpenOptions::NONSEEKABLE.bits(),
        })
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

impl RemoteFs {
    fn fuse_attr(&self, ino: u64, attr: &NodeAttr, req: &Request) -> FileAttr {
        let time = Timestamp::from(attr.mtime.unwrap_or_else(|| self.mounted_at()));
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: time,
            mtime: time,
            ctime: time,
            #[cfg(target_os = "macos")]
            crtime: time,
            kind: fuse_kind(attr.kind),
            perm: attr.perm,
            nlink: 1,
            uid: req.uid,
            gid: req.gid,
            rdev: 0,
            #[cfg(target_os = "macos")]
            flags: 0,
            blksize: 4096,
        }
    }

    fn parent_ino(&self, ino: u64) -> u64 {
        match self.inodes().get(ino) {
            Some(Node::Dir(dir)) if !dir.path().is_empty() => {
                self.inodes().ino_of(parent_of(dir.path()))
            }
            _ => ROOT_INO,
        }
    }
}

fn fuse_kind(kind: NodeKind) -> FuseFileType {
    match kind {
        NodeKind::Dir => FuseFileType::Directory,
        NodeKind::File => FuseFileType::RegularFile,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let cases: Vec<(FsError, i32)> = vec![
            (FsError::NotFound("a".into()), libc::ENOENT),
            (FsError::NotEmpty("a".into()), libc::ENOTEMPTY),
            (FsError::Unsupported("rw"), libc::ENOTSUP),
            (FsError::Busy("a".into()), libc::EBUSY),
            (FsError::NotADirectory("a".into()), libc::ENOTDIR),
            (FsError::IsADirectory("a".into()), libc::EISDIR),
            (FsError::BadHandle(3), libc::EBADF),
            (
                FsError::Backend(BackendError::ObjectNotFound("a".into())),
                libc::ENOENT,
            ),
            (
                FsError::Backend(BackendError::InvalidRemote("../x".into())),
                libc::EINVAL,
            ),
            (
                FsError::Backend(BackendError::remote("put", "boom")),
                libc::EIO,
            ),
            (FsError::Invariant("x".into()), libc::EIO),
        ];
        for (err, code) in cases {
            assert_eq!(Errno::from(err), Errno::from(code));
        }
    }
}
