use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::cadapter::{BackendError, ObjectRef, ObjectStream};
use crate::vfs::error::{FsError, FsResult};

/// Sequential reader over one committed object.
///
/// Reads are served strictly in order from a single backend stream; the
/// handle is non-seekable, so the offset the kernel passes is not used.
pub struct ReadHandle {
    remote: String,
    stream: Mutex<Option<ObjectStream>>,
}

impl ReadHandle {
    pub async fn open(object: &ObjectRef) -> FsResult<Self> {
        let stream = object.open().await.map_err(|e| {
            tracing::error!(path = %object.remote(), "ReadHandle open error: {e}");
            e
        })?;
        Ok(Self {
            remote: object.remote().to_string(),
            stream: Mutex::new(Some(stream)),
        })
    }

    /// Fill up to `size` bytes, short only at end of object.
    pub async fn read(&self, size: usize) -> FsResult<Bytes> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(FsError::Invariant(format!(
                "read on released handle for {}",
                self.remote
            )));
        };
        let mut buf = BytesMut::zeroed(size);
        let mut filled = 0;
        while filled < size {
            let n = stream
                .read(&mut buf[filled..])
                .await
                .map_err(BackendError::from)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        tracing::trace!(path = %self.remote, size, filled, "ReadHandle.Read");
        Ok(buf.freeze())
    }

    /// Drop the backend stream. Closing a reader cannot fail.
    pub async fn release(&self) -> FsResult<()> {
        self.stream.lock().await.take();
        tracing::debug!(path = %self.remote, "ReadHandle.Release OK");
        Ok(())
    }
}
