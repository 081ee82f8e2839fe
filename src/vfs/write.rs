//! Streaming writer.
//!
//! Kernel writes arrive in chunks; the backend wants one put fed from a
//! stream. A write handle bridges the two with a bounded in-memory pipe:
//! writes push into one end while a background task runs the put reading
//! from the other. The object exists only once the put completes, which
//! happens after the handle is released.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::cadapter::{BackendError, ObjectRef};
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::file::FileNode;

type PutOutcome = Result<ObjectRef, BackendError>;

enum WriteState {
    Open {
        conduit: DuplexStream,
        outcome: oneshot::Receiver<PutOutcome>,
        upload: JoinHandle<()>,
    },
    Releasing,
    Committed,
    Failed,
}

impl WriteState {
    fn name(&self) -> &'static str {
        match self {
            WriteState::Open { .. } => "open",
            WriteState::Releasing => "releasing",
            WriteState::Committed => "committed",
            WriteState::Failed => "failed",
        }
    }
}

pub struct WriteHandle {
    remote: String,
    file: Arc<FileNode>,
    state: Mutex<WriteState>,
}

impl WriteHandle {
    /// Claim the file's writer slot and start the put in the background.
    pub(crate) fn new(file: Arc<FileNode>) -> FsResult<Self> {
        file.begin_write()?;
        let remote = file.remote();
        let backend = file.dir().backend().clone();
        let buffer = file.dir().options().write_buffer_size;

        let (conduit, body) = tokio::io::duplex(buffer);
        let (tx, outcome) = oneshot::channel();
        let put_remote = remote.clone();
        let upload = tokio::spawn(async move {
            let result = backend
                .put(&put_remote, Box::new(body))
                .await
                .map(|info| ObjectRef::new(info, backend.clone()));
            if let Err(e) = &result {
                tracing::error!(path = %put_remote, "WriteHandle put error: {e}");
            }
            let _ = tx.send(result);
        });

        Ok(Self {
            remote,
            file,
            state: Mutex::new(WriteState::Open {
                conduit,
                outcome,
                upload,
            }),
        })
    }

    /// Push `data` into the put. Blocks while the pipe is full.
    ///
    /// Returns the number of bytes accepted, which is short only when the
    /// put stops reading part way through.
    pub async fn write(&self, data: &[u8]) -> FsResult<usize> {
        let mut state = self.state.lock().await;
        let conduit = match &mut *state {
            WriteState::Open { conduit, .. } => conduit,
            other => {
                return Err(FsError::Invariant(format!(
                    "write to {} in state {}",
                    self.remote,
                    other.name()
                )));
            }
        };
        let mut accepted = 0;
        while accepted < data.len() {
            match conduit.write(&data[accepted..]).await {
                Ok(0) => break,
                Ok(n) => {
                    accepted += n;
                    self.file.add_written(n as u64);
                }
                Err(e) if accepted == 0 => {
                    tracing::error!(path = %self.remote, "WriteHandle.Write error: {e}");
                    return Err(BackendError::from(e).into());
                }
                Err(_) => break,
            }
        }
        tracing::trace!(path = %self.remote, len = data.len(), accepted, "WriteHandle.Write");
        Ok(accepted)
    }

    /// Close the pipe, wait for the put and commit its result.
    ///
    /// The put's error wins over an error closing the pipe.
    pub async fn release(&self) -> FsResult<()> {
        let mut state = self.state.lock().await;
        let (mut conduit, outcome) = match std::mem::replace(&mut *state, WriteState::Releasing) {
            WriteState::Open {
                conduit, outcome, ..
            } => (conduit, outcome),
            other => {
                let name = other.name();
                *state = other;
                return Err(FsError::Invariant(format!(
                    "release of {} in state {name}",
                    self.remote
                )));
            }
        };

        let closed = conduit.shutdown().await;
        drop(conduit);
        let result = outcome
            .await
            .unwrap_or_else(|_| Err(BackendError::remote("put", "upload task ended without a result")));
        self.file.end_write();

        match result {
            Ok(object) => {
                let size = object.size();
                self.file.commit(object).await;
                *state = WriteState::Committed;
                if let Err(e) = closed {
                    tracing::error!(path = %self.remote, "WriteHandle.Release close error: {e}");
                    return Err(BackendError::from(e).into());
                }
                tracing::debug!(path = %self.remote, size, "WriteHandle.Release OK");
                Ok(())
            }
            Err(e) => {
                *state = WriteState::Failed;
                Err(e.into())
            }
        }
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        // Never released: the put must not see a clean EOF and commit a
        // truncated object, so cancel it before the pipe closes.
        if let WriteState::Open { upload, .. } = self.state.get_mut() {
            upload.abort();
            self.file.end_write();
            tracing::warn!(path = %self.remote, "write handle dropped without release");
        }
    }
}
