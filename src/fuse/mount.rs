//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Linux. Unprivileged mounts go through fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use rfuse3::MountOptions;
use rfuse3::raw::{MountHandle, Session};

use crate::config::MountConfig;
use crate::vfs::fs::RemoteFs;

fn mount_options(config: &MountConfig) -> MountOptions {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    let mut mo = MountOptions::default();
    mo.fs_name("remotefs")
        .uid(uid)
        .gid(gid)
        .allow_other(config.allow_other);
    mo
}

/// Mount `fs` at the configured mount point. The returned handle resolves
/// when the filesystem is unmounted.
#[cfg(target_os = "linux")]
pub async fn mount_remote(fs: RemoteFs, config: &MountConfig) -> std::io::Result<MountHandle> {
    let session = Session::new(mount_options(config));
    tracing::info!(
        mount_point = %config.mount_point.display(),
        privileged = config.privileged,
        "mounting"
    );
    if config.privileged {
        session.mount(fs, &config.mount_point).await
    } else {
        session.mount_with_unprivileged(fs, &config.mount_point).await
    }
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_remote(_fs: RemoteFs, _config: &MountConfig) -> std::io::Result<MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
