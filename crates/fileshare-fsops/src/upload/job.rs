//! Chunk write job executed on the upload pool.

use std::fs::File;
use std::io;
use std::sync::Arc;

use fileshare_telemetry::Metrics;
use tokio::sync::oneshot;
use tracing::warn;

use super::session::{Refusal, UploadFailure, UploadSession};
use crate::buffer::PooledBuffer;
use crate::worker::Job;

/// Result reported back to the handler that submitted the chunk.
#[derive(Debug)]
pub(crate) enum ChunkWriteResult {
    Written(u64),
    Failed(io::Error),
    /// The session had already failed; nothing was written.
    Skipped,
}

/// In-flight accounting for one chunk. Dropping an unsettled ticket releases the in-flight
/// slot; if the write had started, the session is marked failed as well.
pub(crate) struct ChunkTicket {
    session: Arc<UploadSession>,
    offset: u64,
    started: bool,
    settled: bool,
}

impl ChunkTicket {
    /// Reserve an in-flight slot for the chunk covering `offset..end`.
    pub(crate) fn issue(session: Arc<UploadSession>, offset: u64, end: u64) -> Result<Self, Refusal> {
        session.begin_chunk(end)?;
        Ok(Self {
            session,
            offset,
            started: false,
            settled: false,
        })
    }

    const fn start(&mut self) {
        self.started = true;
    }

    fn written(mut self, len: u64) {
        self.settled = true;
        self.session.complete_chunk(len);
    }

    fn failed(mut self, failure: UploadFailure) {
        self.settled = true;
        self.session.fail_chunk(failure);
    }

    fn skipped(mut self) {
        self.settled = true;
        self.session.cancel_chunk();
    }
}

impl Drop for ChunkTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.started {
            self.session.fail_chunk(UploadFailure::WorkerPanicked {
                offset: self.offset,
            });
        } else {
            self.session.cancel_chunk();
        }
    }
}

/// Writes one leased buffer into the session's temp file at its offset.
pub(crate) struct ChunkWriteJob {
    ticket: ChunkTicket,
    buffer: PooledBuffer,
    reply: oneshot::Sender<ChunkWriteResult>,
    metrics: Metrics,
}

impl ChunkWriteJob {
    pub(crate) const fn new(
        ticket: ChunkTicket,
        buffer: PooledBuffer,
        reply: oneshot::Sender<ChunkWriteResult>,
        metrics: Metrics,
    ) -> Self {
        Self {
            ticket,
            buffer,
            reply,
            metrics,
        }
    }
}

impl Job for ChunkWriteJob {
    fn kind(&self) -> &'static str {
        "chunk_write"
    }

    fn execute(self: Box<Self>) {
        let Self {
            mut ticket,
            buffer,
            reply,
            metrics,
        } = *self;
        ticket.start();
        let offset = ticket.offset;
        let session = Arc::clone(&ticket.session);

        let result = if session.failure().is_some() {
            drop(buffer);
            ticket.skipped();
            metrics.inc_upload_chunk("skipped");
            ChunkWriteResult::Skipped
        } else {
            let len = buffer.len() as u64;
            let outcome = write_at(session.file(), &buffer, offset);
            drop(buffer);
            match outcome {
                Ok(()) => {
                    ticket.written(len);
                    metrics.inc_upload_chunk("written");
                    metrics.add_upload_bytes(len);
                    ChunkWriteResult::Written(len)
                }
                Err(err) => {
                    warn!(
                        session = %session.id(),
                        offset,
                        error = %err,
                        "chunk write failed"
                    );
                    ticket.failed(UploadFailure::WriteFailed {
                        offset,
                        error: err.to_string(),
                    });
                    metrics.inc_upload_chunk("failed");
                    ChunkWriteResult::Failed(err)
                }
            }
        };
        // The handler may have gone away; its drop guard owns cleanup in that case.
        let _ = reply.send(result);
    }
}

#[cfg(unix)]
fn write_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        match file.seek_write(data, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole chunk",
                ));
            }
            Ok(written) => {
                data = &data[written..];
                offset += written as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
