//! Named-pipe handoff for exported data.
//!
//! Instead of capturing the tool's stdout, the tool is told to write its
//! output "file" to a FIFO owned by the orchestrator. A background listener
//! drains the FIFO and forwards the bytes to the run, which writes them into
//! the caller's stream and rewinds it.
//!
//! The orchestrator holds a write end of its own (the keeper) for as long as
//! the tool runs. Without it the reader would see end-of-file before the tool
//! had even opened the pipe. Dropping the keeper after the tool exits leaves
//! the tool's own write end as the only thing between the listener and EOF.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::pump::STDOUT_CHUNK_SIZE;
use crate::error::ExportError;

/// Chunks buffered between the listener and the drain.
const CHUNK_CHANNEL_CAPACITY: usize = 16;

/// A FIFO on disk, removed when dropped.
#[derive(Debug)]
pub struct PipeEndpoint {
    path: PathBuf,
}

impl PipeEndpoint {
    /// Create the FIFO for an orchestrator instance under the temp dir.
    ///
    /// The name is derived from `instance_id`, so concurrent orchestrators
    /// never share a pipe.
    pub fn create(instance_id: &Uuid) -> Result<Self, ExportError> {
        let path = std::env::temp_dir().join(format!("bcpw-{instance_id}.pipe"));
        Self::create_at(path)
    }

    /// Create a FIFO at `path`, replacing any stale file left there.
    pub fn create_at(path: PathBuf) -> Result<Self, ExportError> {
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed stale pipe endpoint"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ExportError::Pipe(e)),
        }
        mkfifo(&path).map_err(ExportError::Pipe)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Address handed to the tool as its destination.
    pub fn address(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Open the read end, start the listener task and return it together
    /// with the keeper that holds the pipe open.
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen(&self) -> Result<(PipeKeeper, PipeListener), ExportError> {
        let receiver = pipe::OpenOptions::new()
            .open_receiver(&self.path)
            .map_err(ExportError::Pipe)?;
        let keeper = pipe::OpenOptions::new()
            .open_sender(&self.path)
            .map_err(ExportError::Pipe)?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let task = tokio::spawn(forward_chunks(receiver, tx));

        tracing::debug!(path = %self.path.display(), "Pipe listener started");

        Ok((PipeKeeper { _sender: keeper }, PipeListener { rx, task }))
    }
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove pipe endpoint");
            }
        }
    }
}

/// Orchestrator-held write end. Drop it once the tool has exited.
pub struct PipeKeeper {
    _sender: pipe::Sender,
}

/// Receiving side of a running pipe listener.
pub struct PipeListener {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl PipeListener {
    /// Write everything the listener receives into `output`, then flush and
    /// rewind `output` to its start.
    ///
    /// Completes only after the listener has seen end-of-file. If writing
    /// to `output` fails, the remaining data is still drained from the pipe
    /// (and discarded) so the tool is never left blocked on a full pipe; the
    /// first error is returned at the end.
    pub async fn drain_into<W>(mut self, output: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + AsyncSeek + Unpin + ?Sized,
    {
        let mut total = 0u64;
        let mut failure: Option<io::Error> = None;

        while let Some(chunk) = self.rx.recv().await {
            if failure.is_some() {
                continue;
            }
            let written = match chunk {
                Ok(bytes) => output.write_all(&bytes).await.map(|()| bytes.len()),
                Err(e) => Err(e),
            };
            match written {
                Ok(n) => total += n as u64,
                Err(e) => failure = Some(e),
            }
        }

        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "Pipe listener task failed");
        }

        if let Some(e) = failure {
            return Err(e);
        }

        output.flush().await?;
        output.seek(io::SeekFrom::Start(0)).await?;
        tracing::debug!(bytes = total, "Pipe payload received");
        Ok(total)
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        // A drain abandoned mid-way must not leave the task parked on a FIFO
        // some stray writer still holds open.
        self.task.abort();
    }
}

/// Read the FIFO until every writer has closed it.
async fn forward_chunks(mut receiver: pipe::Receiver, tx: mpsc::Sender<io::Result<Vec<u8>>>) {
    let mut buf = vec![0u8; STDOUT_CHUNK_SIZE];
    loop {
        match receiver.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

fn mkfifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pipe path contains NUL"))?;
    // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
