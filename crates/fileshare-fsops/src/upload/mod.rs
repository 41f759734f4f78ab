//! Chunked upload pipeline.
//!
//! # Design
//! - One session per destination path; chunks land in `.<name>.partial` beside the destination
//!   through positioned writes, so chunks may arrive in any order and concurrently.
//! - Each chunk is read into a pooled buffer, then written by a job on the upload pool. The
//!   handler awaits the job's reply before answering.
//! - The file length is the largest `offset + len` seen by the session, so the final chunk may
//!   carry data or be an empty marker sent after the last data chunk. Its handler waits
//!   (bounded) until every byte up to that length is accounted for with nothing in flight,
//!   then syncs and atomically renames.
//! - Any failure (write error, worker panic, disconnect, gap or overlap) fails the session
//!   permanently; the temp file is removed once in-flight writes drain and the next chunk for
//!   the same name starts over. Sessions idle past the idle limit are retired the same way.

mod job;
mod session;

use std::io;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fileshare_telemetry::Metrics;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{BufferPool, PooledBuffer};
use crate::error::{FsOpsError, FsOpsResult};
use crate::paths::{BaseDir, PARTIAL_SUFFIX, partial_path_for, relative_path};
use crate::worker::{RejectReason, WorkerPool};

use job::{ChunkTicket, ChunkWriteJob, ChunkWriteResult};
use session::{FinalizeGate, Refusal, SessionRegistry, UploadSession, UploadTarget};

pub use session::UploadFailure;

/// One chunk as described by the request metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    /// Destination directory relative to the serving root.
    pub dir: String,
    /// File name, possibly with `/`-separated subdirectories.
    pub file_name: String,
    /// Byte offset of this chunk within the file.
    pub offset: u64,
    /// Whether this chunk is the last one of the file.
    pub is_final: bool,
}

/// Session state reported to the client after a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    /// Chunk stored, more expected.
    Receiving,
    /// File renamed into place.
    Committed,
}

/// Response body for an accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkOutcome {
    /// File name as requested.
    pub file_name: String,
    /// Offset of the chunk.
    pub offset: u64,
    /// Bytes written for this chunk.
    pub bytes_written: u64,
    /// Session state after the chunk.
    pub state: UploadState,
    /// Final file length, present once committed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

/// Accepts chunk bodies and drives sessions to commit or abort.
pub struct UploadPipeline {
    base: BaseDir,
    pool: Arc<WorkerPool>,
    buffers: BufferPool,
    sessions: Arc<SessionRegistry>,
    metrics: Metrics,
    finalize_timeout: Duration,
}

/// Retires upload sessions that stopped receiving chunks. Cheap to clone.
#[derive(Clone)]
pub struct SessionReaper {
    sessions: Arc<SessionRegistry>,
}

impl SessionReaper {
    /// Abandon idle sessions and delete their temp files. Returns how many were retired.
    pub async fn expire_idle(&self) -> usize {
        self.sessions.expire_idle().await
    }
}

impl UploadPipeline {
    /// Wire the pipeline to its pool and buffers.
    #[must_use]
    pub fn new(
        base: BaseDir,
        pool: Arc<WorkerPool>,
        buffers: BufferPool,
        metrics: Metrics,
        finalize_timeout: Duration,
        session_idle_timeout: Duration,
    ) -> Self {
        Self {
            base,
            pool,
            buffers,
            sessions: Arc::new(SessionRegistry::new(metrics.clone(), session_idle_timeout)),
            metrics,
            finalize_timeout,
        }
    }

    /// Handle for sweeping idle sessions from a background task.
    #[must_use]
    pub fn session_reaper(&self) -> SessionReaper {
        SessionReaper {
            sessions: Arc::clone(&self.sessions),
        }
    }

    /// Pooled buffers backing chunk reads.
    #[must_use]
    pub const fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Number of sessions currently registered.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.len().await
    }

    /// Read one chunk body and write it into the file's session; commit on the final chunk.
    ///
    /// Cancelling `cancel` or dropping the returned future before it completes fails the
    /// session.
    ///
    /// # Errors
    ///
    /// - [`FsOpsError::PathTraversal`] / [`FsOpsError::InvalidInput`] for bad names, before
    ///   anything touches the disk.
    /// - [`FsOpsError::ChunkTooLarge`] when the body exceeds the buffer size.
    /// - [`FsOpsError::ClientDisconnected`] when the body stream fails or `cancel` fires.
    /// - [`FsOpsError::PoolRejected`] when the upload pool stays saturated.
    /// - [`FsOpsError::PartialWrite`], [`FsOpsError::UploadAborted`],
    ///   [`FsOpsError::IncompleteUpload`], [`FsOpsError::Finalize`] when the session fails.
    /// - [`FsOpsError::SessionBusy`] when the session is already finalizing.
    pub async fn ingest_chunk<S, E>(
        &self,
        request: ChunkRequest,
        body: S,
        cancel: &CancellationToken,
    ) -> FsOpsResult<ChunkOutcome>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: std::fmt::Display,
    {
        let target = resolve_target(&self.base, &request.dir, &request.file_name)?;
        let mut guard = DisconnectGuard::new(Arc::clone(&self.sessions), self.metrics.clone());
        if let Some(existing) = self.sessions.get(&target.destination).await {
            guard.watch(existing);
        }

        let result = self.ingest(&target, &request, body, cancel, &mut guard).await;
        if !matches!(result, Err(FsOpsError::ClientDisconnected { .. })) {
            guard.disarm();
        }
        result
    }

    async fn ingest<S, E>(
        &self,
        target: &UploadTarget,
        request: &ChunkRequest,
        body: S,
        cancel: &CancellationToken,
        guard: &mut DisconnectGuard,
    ) -> FsOpsResult<ChunkOutcome>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: std::fmt::Display,
    {
        let buffer = self.read_chunk(body, cancel).await?;
        let len = buffer.len() as u64;
        let chunk_end = request
            .offset
            .checked_add(len)
            .ok_or_else(|| FsOpsError::invalid("offset", "overflow", request.offset.to_string()))?;

        let session = self.sessions.get_or_open(target).await?;
        guard.watch(Arc::clone(&session));

        let ticket = match ChunkTicket::issue(Arc::clone(&session), request.offset, chunk_end) {
            Ok(ticket) => ticket,
            Err(Refusal::Failed(cause)) => {
                drop(buffer);
                abort_session(&self.sessions, &self.metrics, &session).await;
                return Err(FsOpsError::UploadAborted {
                    path: target.destination.clone(),
                    cause,
                });
            }
            Err(Refusal::Finalizing) => {
                return Err(FsOpsError::SessionBusy {
                    path: target.destination.clone(),
                });
            }
        };

        let (reply, outcome) = oneshot::channel();
        let job = ChunkWriteJob::new(ticket, buffer, reply, self.metrics.clone());
        if let Err(rejected) = self.pool.try_submit(job, cancel).await {
            let reason = rejected.reason();
            drop(rejected.into_job());
            self.metrics
                .inc_pool_rejection(self.pool.name(), reason.as_str());
            return Err(match reason {
                RejectReason::Cancelled => FsOpsError::ClientDisconnected {
                    operation: "upload.submit",
                },
                RejectReason::TimedOut | RejectReason::Closed => FsOpsError::PoolRejected {
                    pool: self.pool.name(),
                    reason,
                },
            });
        }

        let written = match outcome.await {
            Ok(ChunkWriteResult::Written(written)) => written,
            Ok(ChunkWriteResult::Failed(source)) => {
                abort_session(&self.sessions, &self.metrics, &session).await;
                return Err(FsOpsError::PartialWrite {
                    path: target.temp_path.clone(),
                    offset: request.offset,
                    source,
                });
            }
            Ok(ChunkWriteResult::Skipped) | Err(_) => {
                return Err(self.abort_with_cause(&session, request.offset).await);
            }
        };
        debug!(
            session = %session.id(),
            offset = request.offset,
            bytes = written,
            is_final = request.is_final,
            "chunk written"
        );

        if !request.is_final {
            if session.failure().is_some() {
                return Err(self.abort_with_cause(&session, request.offset).await);
            }
            return Ok(ChunkOutcome {
                file_name: request.file_name.clone(),
                offset: request.offset,
                bytes_written: written,
                state: UploadState::Receiving,
                total_bytes: None,
            });
        }

        let total = self.finalize(&session, chunk_end, cancel).await?;
        Ok(ChunkOutcome {
            file_name: request.file_name.clone(),
            offset: request.offset,
            bytes_written: written,
            state: UploadState::Committed,
            total_bytes: Some(total),
        })
    }

    async fn read_chunk<S, E>(&self, body: S, cancel: &CancellationToken) -> FsOpsResult<PooledBuffer>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: std::fmt::Display,
    {
        let mut buffer = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(FsOpsError::ClientDisconnected { operation: "upload.lease_buffer" });
            }
            leased = self.buffers.lease() => leased?,
        };

        let mut body = pin!(body);
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(FsOpsError::ClientDisconnected { operation: "upload.read_body" });
                }
                next = body.next() => next,
            };
            match next {
                None => return Ok(buffer),
                Some(Ok(bytes)) => buffer.extend_from(&bytes)?,
                Some(Err(err)) => {
                    debug!(error = %err, "upload body stream failed");
                    return Err(FsOpsError::ClientDisconnected {
                        operation: "upload.read_body",
                    });
                }
            }
        }
    }

    /// Wait for the session to become whole, then commit it. The file length is the larger of
    /// `floor` and the session extent. Returns the committed length.
    async fn finalize(
        &self,
        session: &Arc<UploadSession>,
        floor: u64,
        cancel: &CancellationToken,
    ) -> FsOpsResult<u64> {
        let deadline = Instant::now() + self.finalize_timeout;
        let (written, expected) = loop {
            let timed_out = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(FsOpsError::ClientDisconnected { operation: "upload.finalize" });
                }
                () = session.wait_ready(floor) => false,
                () = tokio::time::sleep_until(deadline) => true,
            };
            match session.try_begin_finalize(floor) {
                FinalizeGate::Ready { written, expected } => break (written, expected),
                FinalizeGate::Failed(cause) => {
                    abort_session(&self.sessions, &self.metrics, session).await;
                    return Err(FsOpsError::UploadAborted {
                        path: session.destination().to_path_buf(),
                        cause,
                    });
                }
                FinalizeGate::AlreadyFinalizing => {
                    return Err(FsOpsError::SessionBusy {
                        path: session.destination().to_path_buf(),
                    });
                }
                FinalizeGate::NotReady if timed_out => {
                    let progress = session.snapshot();
                    let expected = progress.expected(floor);
                    return Err(self.abort_incomplete(session, expected, progress.written).await);
                }
                FinalizeGate::NotReady => {}
            }
        };

        if written != expected {
            return Err(self.abort_incomplete(session, expected, written).await);
        }

        let committing = Arc::clone(session);
        let committed = tokio::task::spawn_blocking(move || commit(&committing, expected))
            .await
            .unwrap_or_else(|join| {
                Err(CommitError::Io {
                    operation: "upload.commit_task",
                    source: io::Error::other(join.to_string()),
                })
            });
        match committed {
            Ok(()) => {
                self.sessions.remove(session).await;
                self.metrics.inc_upload_session("committed");
                let progress = session.snapshot();
                info!(
                    session = %session.id(),
                    destination = %session.destination().display(),
                    bytes = expected,
                    chunks = progress.chunks,
                    "upload committed"
                );
                Ok(expected)
            }
            Err(CommitError::Length { actual }) => {
                Err(self.abort_incomplete(session, expected, actual).await)
            }
            Err(CommitError::Io { operation, source }) => {
                session.fail(UploadFailure::FinalizeFailed {
                    error: source.to_string(),
                });
                abort_session(&self.sessions, &self.metrics, session).await;
                Err(FsOpsError::Finalize {
                    operation,
                    path: session.destination().to_path_buf(),
                    source,
                })
            }
        }
    }

    async fn abort_incomplete(
        &self,
        session: &Arc<UploadSession>,
        expected: u64,
        written: u64,
    ) -> FsOpsError {
        session.fail(UploadFailure::Incomplete { expected, written });
        abort_session(&self.sessions, &self.metrics, session).await;
        FsOpsError::IncompleteUpload {
            path: session.destination().to_path_buf(),
            expected,
            written,
        }
    }

    async fn abort_with_cause(&self, session: &Arc<UploadSession>, offset: u64) -> FsOpsError {
        let cause = session
            .failure()
            .unwrap_or(UploadFailure::WorkerPanicked { offset });
        session.fail(cause.clone());
        abort_session(&self.sessions, &self.metrics, session).await;
        FsOpsError::UploadAborted {
            path: session.destination().to_path_buf(),
            cause,
        }
    }
}

enum CommitError {
    Length { actual: u64 },
    Io { operation: &'static str, source: io::Error },
}

fn commit(session: &UploadSession, expected: u64) -> Result<(), CommitError> {
    let file = session.file();
    file.sync_all().map_err(|source| CommitError::Io {
        operation: "upload.sync",
        source,
    })?;
    let actual = file
        .metadata()
        .map_err(|source| CommitError::Io {
            operation: "upload.stat",
            source,
        })?
        .len();
    if actual != expected {
        return Err(CommitError::Length { actual });
    }
    std::fs::rename(session.temp_path(), session.destination()).map_err(|source| {
        CommitError::Io {
            operation: "upload.rename",
            source,
        }
    })
}

/// Remove a failed session's temp file once its in-flight writes drain. Only the first
/// caller per session does the work.
async fn abort_session(sessions: &SessionRegistry, metrics: &Metrics, session: &Arc<UploadSession>) {
    if !session.claim_abort() {
        return;
    }
    session.wait_idle().await;
    match tokio::fs::remove_file(session.temp_path()).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            session = %session.id(),
            path = %session.temp_path().display(),
            error = %err,
            "failed to remove partial upload; janitor will reclaim it"
        ),
    }
    sessions.remove(session).await;
    metrics.inc_upload_session("failed");
    warn!(
        session = %session.id(),
        destination = %session.destination().display(),
        failure = ?session.failure(),
        "upload session aborted"
    );
}

/// Fails the watched session if the ingest future is dropped or ends in a disconnect.
struct DisconnectGuard {
    sessions: Arc<SessionRegistry>,
    metrics: Metrics,
    session: Option<Arc<UploadSession>>,
}

impl DisconnectGuard {
    const fn new(sessions: Arc<SessionRegistry>, metrics: Metrics) -> Self {
        Self {
            sessions,
            metrics,
            session: None,
        }
    }

    fn watch(&mut self, session: Arc<UploadSession>) {
        self.session = Some(session);
    }

    fn disarm(&mut self) {
        self.session = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if session.fail(UploadFailure::ClientDisconnected) {
            warn!(session = %session.id(), "client disconnected mid-upload");
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sessions = Arc::clone(&self.sessions);
        let metrics = self.metrics.clone();
        runtime.spawn(async move {
            abort_session(&sessions, &metrics, &session).await;
        });
    }
}

/// Validate the request names and derive destination and temp paths.
fn resolve_target(base: &BaseDir, dir: &str, file_name: &str) -> FsOpsResult<UploadTarget> {
    let directory = base.resolve(dir)?;
    let name = relative_path(file_name)?;
    let Some(last) = name.file_name().and_then(|last| last.to_str()) else {
        return Err(FsOpsError::invalid("file_name", "empty", file_name));
    };
    if last.ends_with(PARTIAL_SUFFIX) {
        return Err(FsOpsError::invalid("file_name", "reserved_suffix", file_name));
    }
    let destination: PathBuf = directory.join(name);
    let temp_path = partial_path_for(&destination)?;
    Ok(UploadTarget {
        destination,
        temp_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{Job, PoolConfig};
    use futures_util::stream;
    use std::error::Error;
    use std::fs::File;
    use std::sync::mpsc as std_mpsc;
    use std::sync::{Mutex, PoisonError};
    use tempfile::TempDir;

    const CHUNK: usize = 64 * 1024;
    const IDLE: Duration = Duration::from_secs(60);

    struct Harness {
        dir: TempDir,
        pool: Arc<WorkerPool>,
        pipeline: UploadPipeline,
    }

    impl Harness {
        fn new(
            workers: usize,
            queue: usize,
            buffers: usize,
            submit_timeout: Option<Duration>,
            finalize_timeout: Duration,
            session_idle: Duration,
        ) -> Result<Self, Box<dyn Error>> {
            let dir = TempDir::new()?;
            let metrics = Metrics::new()?;
            let pool = Arc::new(WorkerPool::new(&PoolConfig {
                name: "upload",
                workers,
                queue_capacity: queue,
                submit_timeout,
            })?);
            let pipeline = UploadPipeline::new(
                BaseDir::new(dir.path()),
                Arc::clone(&pool),
                BufferPool::new(buffers, CHUNK)?,
                metrics,
                finalize_timeout,
                session_idle,
            );
            Ok(Self {
                dir,
                pool,
                pipeline,
            })
        }

        fn standard() -> Result<Self, Box<dyn Error>> {
            Self::new(4, 16, 4, None, Duration::from_secs(5), IDLE)
        }

        async fn send(
            &self,
            name: &str,
            offset: usize,
            data: &[u8],
            is_final: bool,
        ) -> FsOpsResult<ChunkOutcome> {
            let request = ChunkRequest {
                dir: String::new(),
                file_name: name.to_string(),
                offset: offset as u64,
                is_final,
            };
            self.pipeline
                .ingest_chunk(request, body(data), &CancellationToken::new())
                .await
        }

        fn partial_files(&self) -> Result<Vec<String>, Box<dyn Error>> {
            let mut names = Vec::new();
            for entry in walkdir::WalkDir::new(self.dir.path()) {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(PARTIAL_SUFFIX) {
                    names.push(name);
                }
            }
            Ok(names)
        }

        async fn settle(&self) {
            for _ in 0..100 {
                if self.pipeline.active_sessions().await == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.pool.stop();
        }
    }

    fn body(data: &[u8]) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        let pieces: Vec<Result<Bytes, io::Error>> = data
            .chunks(4096)
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();
        stream::iter(pieces)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len)
            .map(|index| u8::try_from((index * 31 + index / 251) % 256).unwrap_or(0))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn out_of_order_chunks_commit_an_identical_file() -> Result<(), Box<dyn Error>> {
        let harness = Harness::standard()?;
        let data = pattern(CHUNK * 2 + 1000);
        let (first, rest) = data.split_at(CHUNK);
        let (second, last) = rest.split_at(CHUNK);

        let (final_outcome, second_outcome, first_outcome) = tokio::join!(
            harness.send("movie.bin", CHUNK * 2, last, true),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                harness.send("movie.bin", CHUNK, second, false).await
            },
            async {
                tokio::time::sleep(Duration::from_millis(40)).await;
                harness.send("movie.bin", 0, first, false).await
            },
        );
        assert_eq!(first_outcome?.state, UploadState::Receiving);
        assert_eq!(second_outcome?.state, UploadState::Receiving);
        let final_outcome = final_outcome?;
        assert_eq!(final_outcome.state, UploadState::Committed);
        assert_eq!(final_outcome.total_bytes, Some(data.len() as u64));

        assert_eq!(std::fs::read(harness.dir.path().join("movie.bin"))?, data);
        assert!(harness.partial_files()?.is_empty());
        assert_eq!(harness.pipeline.active_sessions().await, 0);
        let buffers = harness.pipeline.buffers();
        assert_eq!(buffers.available(), buffers.capacity());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_final_marker_commits_after_data_chunks() -> Result<(), Box<dyn Error>> {
        let harness = Harness::standard()?;
        let data = pattern(CHUNK + 500);
        let (first, second) = data.split_at(CHUNK);

        harness.send("clip.mp4", 0, first, false).await?;
        harness.send("clip.mp4", CHUNK, second, false).await?;
        let outcome = harness.send("clip.mp4", 0, &[], true).await?;

        assert_eq!(outcome.state, UploadState::Committed);
        assert_eq!(outcome.bytes_written, 0);
        assert_eq!(outcome.total_bytes, Some(data.len() as u64));
        assert_eq!(std::fs::read(harness.dir.path().join("clip.mp4"))?, data);
        assert!(harness.partial_files()?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_file_commits_from_a_lone_final_marker() -> Result<(), Box<dyn Error>> {
        let harness = Harness::standard()?;
        let outcome = harness.send("empty.txt", 0, &[], true).await?;
        assert_eq!(outcome.total_bytes, Some(0));
        assert_eq!(std::fs::read(harness.dir.path().join("empty.txt"))?, b"");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_session_does_not_poison_a_reupload() -> Result<(), Box<dyn Error>> {
        let harness = Harness::new(2, 8, 4, None, Duration::from_secs(1), Duration::from_millis(250))?;
        let data = pattern(CHUNK * 2);
        let (first, second) = data.split_at(CHUNK);

        harness.send("movie.bin", 0, first, false).await?;
        harness.send("movie.bin", CHUNK, &second[..100], false).await?;
        assert_eq!(harness.pipeline.active_sessions().await, 1);
        tokio::time::sleep(Duration::from_millis(400)).await;

        harness.send("movie.bin", 0, first, false).await?;
        let outcome = harness.send("movie.bin", CHUNK, second, true).await?;
        assert_eq!(outcome.total_bytes, Some(data.len() as u64));
        assert_eq!(std::fs::read(harness.dir.path().join("movie.bin"))?, data);
        assert_eq!(harness.pipeline.active_sessions().await, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reaper_retires_idle_sessions_and_their_temp_files() -> Result<(), Box<dyn Error>> {
        let harness = Harness::new(2, 8, 2, None, Duration::from_secs(1), Duration::from_millis(20))?;
        harness.send("left.bin", 0, b"half", false).await?;
        assert_eq!(harness.partial_files()?, [".left.bin.partial"]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(harness.pipeline.session_reaper().expire_idle().await, 1);
        assert_eq!(harness.pipeline.active_sessions().await, 0);
        assert!(harness.partial_files()?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn swept_temp_file_restarts_the_session() -> Result<(), Box<dyn Error>> {
        let harness = Harness::standard()?;
        harness.send("clip.bin", 0, b"abc", false).await?;
        std::fs::remove_file(harness.dir.path().join(".clip.bin.partial"))?;

        harness.send("clip.bin", 0, b"abc", false).await?;
        let outcome = harness.send("clip.bin", 3, b"def", true).await?;
        assert_eq!(outcome.total_bytes, Some(6));
        assert_eq!(std::fs::read(harness.dir.path().join("clip.bin"))?, b"abcdef");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rename_failure_aborts_and_removes_the_temp_file() -> Result<(), Box<dyn Error>> {
        let harness = Harness::standard()?;
        let blocked = harness.dir.path().join("blocked");
        std::fs::create_dir(&blocked)?;
        std::fs::write(blocked.join("keep.txt"), b"keep")?;

        let result = harness.send("blocked", 0, b"abc", true).await;
        assert!(matches!(
            result,
            Err(FsOpsError::Finalize {
                operation: "upload.rename",
                ..
            })
        ));
        assert!(harness.partial_files()?.is_empty());
        assert_eq!(harness.pipeline.active_sessions().await, 0);
        assert_eq!(std::fs::read(blocked.join("keep.txt"))?, b"keep");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nested_names_create_directories() -> Result<(), Box<dyn Error>> {
        let harness = Harness::standard()?;
        let outcome = harness.send("album/2024/pic.jpg", 0, b"jpeg", true).await?;
        assert_eq!(outcome.total_bytes, Some(4));
        assert_eq!(
            std::fs::read(harness.dir.path().join("album/2024/pic.jpg"))?,
            b"jpeg"
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_names_are_rejected_before_touching_disk() -> Result<(), Box<dyn Error>> {
        let harness = Harness::standard()?;
        assert!(matches!(
            harness.send("../escape.txt", 0, b"x", true).await,
            Err(FsOpsError::PathTraversal { .. })
        ));
        assert!(matches!(
            harness.send("a/../../b.txt", 0, b"x", true).await,
            Err(FsOpsError::PathTraversal { .. })
        ));
        assert!(matches!(
            harness.send("sneaky.partial", 0, b"x", true).await,
            Err(FsOpsError::InvalidInput {
                reason: "reserved_suffix",
                ..
            })
        ));
        assert!(matches!(
            harness.send("", 0, b"x", true).await,
            Err(FsOpsError::InvalidInput { reason: "empty", .. })
        ));
        assert_eq!(std::fs::read_dir(harness.dir.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_chunks_return_their_buffer() -> Result<(), Box<dyn Error>> {
        let harness = Harness::standard()?;
        let result = harness.send("big.bin", 0, &pattern(CHUNK + 1), false).await;
        assert!(matches!(result, Err(FsOpsError::ChunkTooLarge { limit: CHUNK })));
        let buffers = harness.pipeline.buffers();
        assert_eq!(buffers.available(), buffers.capacity());
        assert_eq!(harness.pipeline.active_sessions().await, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gaps_are_reported_as_incomplete() -> Result<(), Box<dyn Error>> {
        let harness = Harness::new(2, 8, 2, None, Duration::from_millis(100), IDLE)?;
        harness.send("gap.bin", 0, &[1; 100], false).await?;
        let result = harness.send("gap.bin", 200, &[2; 100], true).await;
        assert!(matches!(
            result,
            Err(FsOpsError::IncompleteUpload {
                expected: 300,
                written: 200,
                ..
            })
        ));
        assert!(!harness.dir.path().join("gap.bin").exists());
        assert!(harness.partial_files()?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_chunks_are_reported_as_incomplete() -> Result<(), Box<dyn Error>> {
        let harness = Harness::standard()?;
        harness.send("dup.bin", 0, &[1; 100], false).await?;
        harness.send("dup.bin", 0, &[1; 100], false).await?;
        let result = harness.send("dup.bin", 100, &[2; 100], true).await;
        assert!(matches!(
            result,
            Err(FsOpsError::IncompleteUpload {
                expected: 200,
                written: 300,
                ..
            })
        ));
        assert!(!harness.dir.path().join("dup.bin").exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_failure_aborts_and_the_next_session_recovers() -> Result<(), Box<dyn Error>> {
        let harness = Harness::standard()?;
        let target = resolve_target(&BaseDir::new(harness.dir.path()), "", "broken.bin")?;
        File::create(&target.temp_path)?;
        let read_only = File::open(&target.temp_path)?;
        harness
            .pipeline
            .sessions
            .adopt(UploadSession::new(&target, read_only))
            .await;

        let result = harness.send("broken.bin", 0, b"abc", false).await;
        assert!(matches!(result, Err(FsOpsError::PartialWrite { offset: 0, .. })));
        assert!(!target.temp_path.exists());
        assert_eq!(harness.pipeline.active_sessions().await, 0);
        let buffers = harness.pipeline.buffers();
        assert_eq!(buffers.available(), buffers.capacity());

        let outcome = harness.send("broken.bin", 0, b"abc", true).await?;
        assert_eq!(outcome.state, UploadState::Committed);
        assert_eq!(std::fs::read(&target.destination)?, b"abc");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_fails_the_session_and_never_commits() -> Result<(), Box<dyn Error>> {
        let harness = Harness::new(2, 8, 2, None, Duration::from_millis(100), IDLE)?;
        harness.send("clip.bin", 0, &[7; 100], false).await?;

        let broken = stream::iter(vec![
            Ok(Bytes::from_static(&[8; 10])),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let request = ChunkRequest {
            dir: String::new(),
            file_name: "clip.bin".to_string(),
            offset: 100,
            is_final: false,
        };
        let result = harness
            .pipeline
            .ingest_chunk(request, broken, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(FsOpsError::ClientDisconnected { .. })));
        harness.settle().await;
        assert!(harness.partial_files()?.is_empty());

        assert!(harness.send("clip.bin", 200, &[9; 100], true).await.is_err());
        assert!(!harness.dir.path().join("clip.bin").exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_while_reading_is_a_disconnect() -> Result<(), Box<dyn Error>> {
        let harness = Harness::standard()?;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let request = ChunkRequest {
            dir: String::new(),
            file_name: "stalled.bin".to_string(),
            offset: 0,
            is_final: true,
        };
        let result = harness
            .pipeline
            .ingest_chunk(request, stream::pending::<Result<Bytes, io::Error>>(), &cancel)
            .await;
        assert!(matches!(result, Err(FsOpsError::ClientDisconnected { .. })));
        let buffers = harness.pipeline.buffers();
        assert_eq!(buffers.available(), buffers.capacity());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn saturated_pool_rejects_and_releases_resources() -> Result<(), Box<dyn Error>> {
        struct Gate(Arc<Mutex<std_mpsc::Receiver<()>>>);

        impl Job for Gate {
            fn kind(&self) -> &'static str {
                "gate"
            }

            fn execute(self: Box<Self>) {
                let _ = self.0.lock().unwrap_or_else(PoisonError::into_inner).recv();
            }
        }

        let harness = Harness::new(
            1,
            1,
            2,
            Some(Duration::from_millis(30)),
            Duration::from_secs(1),
            IDLE,
        )?;
        let (release, gate) = std_mpsc::channel();
        let gate = Arc::new(Mutex::new(gate));
        harness.pool.submit(Gate(Arc::clone(&gate))).await?;
        harness.pool.submit(Gate(Arc::clone(&gate))).await?;

        let result = harness.send("busy.bin", 0, b"abc", false).await;
        assert!(matches!(
            result,
            Err(FsOpsError::PoolRejected {
                reason: RejectReason::TimedOut,
                ..
            })
        ));
        let buffers = harness.pipeline.buffers();
        assert_eq!(buffers.available(), buffers.capacity());

        release.send(())?;
        release.send(())?;
        let outcome = harness.send("busy.bin", 0, b"abc", true).await?;
        assert_eq!(outcome.state, UploadState::Committed);
        Ok(())
    }
}
