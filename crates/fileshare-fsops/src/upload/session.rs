//! Per-file upload session shared by request handlers and chunk jobs.
//!
//! A session owns the open temporary file and a watch channel carrying its progress. Handlers
//! wait on the channel (finalize readiness, in-flight drain); chunk jobs update it.
//!
//! Sessions that see no chunk activity for the idle limit, or whose temp file has disappeared,
//! are abandoned: the registry retires them and the next chunk for that name starts over.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fileshare_telemetry::Metrics;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FsOpsError, FsOpsResult};

/// First failure recorded for an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadFailure {
    /// A positioned write failed.
    WriteFailed {
        /// Offset of the failed chunk.
        offset: u64,
        /// Rendered IO error.
        error: String,
    },
    /// A chunk job panicked after it started.
    WorkerPanicked {
        /// Offset of the chunk being written.
        offset: u64,
    },
    /// A client went away mid-chunk.
    ClientDisconnected,
    /// The chunks did not add up to the final length.
    Incomplete {
        /// Length implied by the final chunk.
        expected: u64,
        /// Bytes accounted for.
        written: u64,
    },
    /// Syncing or renaming failed.
    FinalizeFailed {
        /// Rendered IO error.
        error: String,
    },
    /// No chunk arrived within the idle limit, or the temp file vanished.
    Abandoned {
        /// Bytes written before the session was given up.
        written: u64,
    },
}

/// Mutable progress of a session, published through a watch channel.
#[derive(Debug, Clone)]
pub(crate) struct Progress {
    pub(crate) in_flight: usize,
    pub(crate) written: u64,
    /// Largest `offset + len` of any accepted chunk.
    pub(crate) extent: u64,
    pub(crate) chunks: u64,
    pub(crate) failure: Option<UploadFailure>,
    pub(crate) finalizing: bool,
    pub(crate) last_activity: Instant,
}

impl Progress {
    fn new() -> Self {
        Self {
            in_flight: 0,
            written: 0,
            extent: 0,
            chunks: 0,
            failure: None,
            finalizing: false,
            last_activity: Instant::now(),
        }
    }

    /// Length the file must reach before it can commit.
    pub(crate) fn expected(&self, floor: u64) -> u64 {
        self.extent.max(floor)
    }
}

/// Why a session refused a new chunk.
#[derive(Debug)]
pub(crate) enum Refusal {
    Failed(UploadFailure),
    Finalizing,
}

/// Outcome of an attempt to enter the finalizing state.
#[derive(Debug)]
pub(crate) enum FinalizeGate {
    Ready { written: u64, expected: u64 },
    NotReady,
    Failed(UploadFailure),
    AlreadyFinalizing,
}

/// Paths derived from a validated upload request.
#[derive(Debug, Clone)]
pub(crate) struct UploadTarget {
    pub(crate) destination: PathBuf,
    pub(crate) temp_path: PathBuf,
}

pub(crate) struct UploadSession {
    id: Uuid,
    destination: PathBuf,
    temp_path: PathBuf,
    file: File,
    progress: watch::Sender<Progress>,
    abort_claimed: AtomicBool,
}

impl UploadSession {
    pub(crate) fn new(target: &UploadTarget, file: File) -> Self {
        let (progress, _) = watch::channel(Progress::new());
        Self {
            id: Uuid::new_v4(),
            destination: target.destination.clone(),
            temp_path: target.temp_path.clone(),
            file,
            progress,
            abort_claimed: AtomicBool::new(false),
        }
    }

    pub(crate) const fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn destination(&self) -> &Path {
        &self.destination
    }

    pub(crate) fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub(crate) const fn file(&self) -> &File {
        &self.file
    }

    pub(crate) fn snapshot(&self) -> Progress {
        self.progress.borrow().clone()
    }

    pub(crate) fn failure(&self) -> Option<UploadFailure> {
        self.progress.borrow().failure.clone()
    }

    /// Count a chunk ending at `end` as in flight unless the session already failed or is
    /// finalizing.
    pub(crate) fn begin_chunk(&self, end: u64) -> Result<(), Refusal> {
        let mut refusal = None;
        self.progress.send_if_modified(|progress| {
            if let Some(failure) = &progress.failure {
                refusal = Some(Refusal::Failed(failure.clone()));
                false
            } else if progress.finalizing {
                refusal = Some(Refusal::Finalizing);
                false
            } else {
                progress.in_flight += 1;
                progress.extent = progress.extent.max(end);
                progress.last_activity = Instant::now();
                true
            }
        });
        refusal.map_or(Ok(()), Err)
    }

    pub(crate) fn complete_chunk(&self, len: u64) {
        self.progress.send_modify(|progress| {
            progress.in_flight = progress.in_flight.saturating_sub(1);
            progress.written += len;
            progress.chunks += 1;
            progress.last_activity = Instant::now();
        });
    }

    pub(crate) fn cancel_chunk(&self) {
        self.progress.send_modify(|progress| {
            progress.in_flight = progress.in_flight.saturating_sub(1);
        });
    }

    pub(crate) fn fail_chunk(&self, failure: UploadFailure) {
        self.progress.send_modify(|progress| {
            progress.in_flight = progress.in_flight.saturating_sub(1);
            progress.failure.get_or_insert(failure);
        });
    }

    /// Record a failure; the first one wins. Returns whether this call recorded it.
    pub(crate) fn fail(&self, failure: UploadFailure) -> bool {
        self.progress.send_if_modified(|progress| {
            if progress.failure.is_some() {
                false
            } else {
                progress.failure = Some(failure);
                true
            }
        })
    }

    /// Wait until the session failed or every byte up to the larger of `floor` and the
    /// session extent has been accounted for with no chunk still in flight.
    pub(crate) async fn wait_ready(&self, floor: u64) {
        let mut receiver = self.progress.subscribe();
        let _ = receiver
            .wait_for(|progress| {
                progress.failure.is_some()
                    || (progress.in_flight == 0 && progress.written >= progress.expected(floor))
            })
            .await;
    }

    pub(crate) async fn wait_idle(&self) {
        let mut receiver = self.progress.subscribe();
        let _ = receiver.wait_for(|progress| progress.in_flight == 0).await;
    }

    /// Atomically enter the finalizing state when the session is drained and whole.
    pub(crate) fn try_begin_finalize(&self, floor: u64) -> FinalizeGate {
        let mut gate = FinalizeGate::NotReady;
        self.progress.send_if_modified(|progress| {
            if let Some(failure) = &progress.failure {
                gate = FinalizeGate::Failed(failure.clone());
                false
            } else if progress.finalizing {
                gate = FinalizeGate::AlreadyFinalizing;
                false
            } else if progress.in_flight == 0 && progress.written >= progress.expected(floor) {
                progress.finalizing = true;
                gate = FinalizeGate::Ready {
                    written: progress.written,
                    expected: progress.expected(floor),
                };
                true
            } else {
                false
            }
        });
        gate
    }

    /// Claim the right to clean up; only the first caller gets `true`.
    pub(crate) fn claim_abort(&self) -> bool {
        !self.abort_claimed.swap(true, Ordering::SeqCst)
    }

    /// Fail a quiet session that has been idle for at least `idle_limit`. Sessions with
    /// chunks in flight, a recorded failure or a running finalize are left alone.
    pub(crate) fn try_abandon(&self, idle_limit: Duration) -> bool {
        self.progress.send_if_modified(|progress| {
            let quiet = progress.failure.is_none() && !progress.finalizing && progress.in_flight == 0;
            if quiet && progress.last_activity.elapsed() >= idle_limit {
                progress.failure = Some(UploadFailure::Abandoned {
                    written: progress.written,
                });
                true
            } else {
                false
            }
        })
    }
}

/// Sessions keyed by destination path.
pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<PathBuf, Arc<UploadSession>>>,
    metrics: Metrics,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub(crate) fn new(metrics: Metrics, idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            metrics,
            idle_timeout,
        }
    }

    pub(crate) async fn get(&self, destination: &Path) -> Option<Arc<UploadSession>> {
        self.sessions.lock().await.get(destination).cloned()
    }

    /// Return the live session for the target or open a fresh temp file for it. An idle
    /// session, or one whose temp file is gone, is retired and replaced.
    pub(crate) async fn get_or_open(&self, target: &UploadTarget) -> FsOpsResult<Arc<UploadSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&target.destination).cloned() {
            let temp_present = tokio::fs::try_exists(existing.temp_path())
                .await
                .unwrap_or(true);
            let idle_limit = if temp_present {
                self.idle_timeout
            } else {
                Duration::ZERO
            };
            if !existing.try_abandon(idle_limit) {
                return Ok(existing);
            }
            sessions.remove(&target.destination);
            self.retire(&existing).await;
        }
        self.retire_idle(&mut sessions).await;

        if let Some(parent) = target.temp_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FsOpsError::io("upload.create_dirs", parent, source))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target.temp_path)
            .await
            .map_err(|source| FsOpsError::io("upload.open_temp", &target.temp_path, source))?
            .into_std()
            .await;

        let session = Arc::new(UploadSession::new(target, file));
        info!(
            session = %session.id(),
            destination = %target.destination.display(),
            "upload session opened"
        );
        sessions.insert(target.destination.clone(), Arc::clone(&session));
        self.metrics.set_upload_sessions_active(sessions.len());
        drop(sessions);
        Ok(session)
    }

    /// Remove the session if it is still the registered one for its destination.
    pub(crate) async fn remove(&self, session: &Arc<UploadSession>) {
        let mut sessions = self.sessions.lock().await;
        let registered = sessions
            .get(session.destination())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if registered {
            sessions.remove(session.destination());
            debug!(session = %session.id(), "upload session unregistered");
        }
        self.metrics.set_upload_sessions_active(sessions.len());
    }

    pub(crate) async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Retire every session idle for longer than the idle limit. Returns how many went.
    pub(crate) async fn expire_idle(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let expired = self.retire_idle(&mut sessions).await;
        self.metrics.set_upload_sessions_active(sessions.len());
        drop(sessions);
        expired
    }

    async fn retire_idle(&self, sessions: &mut HashMap<PathBuf, Arc<UploadSession>>) -> usize {
        let idle: Vec<_> = sessions
            .values()
            .filter(|session| session.try_abandon(self.idle_timeout))
            .cloned()
            .collect();
        for session in &idle {
            sessions.remove(session.destination());
            self.retire(session).await;
        }
        idle.len()
    }

    /// Remove an abandoned session's temp file. Runs with the registry locked so a
    /// replacement session cannot have created its own temp file yet.
    async fn retire(&self, session: &UploadSession) {
        if !session.claim_abort() {
            return;
        }
        match tokio::fs::remove_file(session.temp_path()).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                session = %session.id(),
                path = %session.temp_path().display(),
                error = %err,
                "failed to remove abandoned partial upload"
            ),
        }
        self.metrics.inc_upload_session("abandoned");
        info!(
            session = %session.id(),
            destination = %session.destination().display(),
            written = session.snapshot().written,
            "abandoned upload session retired"
        );
    }

    #[cfg(test)]
    pub(crate) async fn adopt(&self, session: UploadSession) -> Arc<UploadSession> {
        let session = Arc::new(session);
        self.sessions
            .lock()
            .await
            .insert(session.destination().to_path_buf(), Arc::clone(&session));
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use tempfile::TempDir;

    fn target_in(dir: &TempDir, name: &str) -> UploadTarget {
        UploadTarget {
            destination: dir.path().join(name),
            temp_path: dir.path().join(format!(".{name}.partial")),
        }
    }

    fn session_in(dir: &TempDir) -> Result<UploadSession, Box<dyn Error>> {
        let target = target_in(dir, "file.bin");
        let file = File::create(&target.temp_path)?;
        Ok(UploadSession::new(&target, file))
    }

    #[test]
    fn first_failure_wins_and_blocks_new_chunks() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let session = session_in(&dir)?;
        assert!(session.begin_chunk(10).is_ok());
        session.fail_chunk(UploadFailure::WorkerPanicked { offset: 0 });
        assert!(!session.fail(UploadFailure::ClientDisconnected));
        assert_eq!(
            session.failure(),
            Some(UploadFailure::WorkerPanicked { offset: 0 })
        );
        assert!(matches!(session.begin_chunk(20), Err(Refusal::Failed(_))));
        assert_eq!(session.snapshot().in_flight, 0);
        Ok(())
    }

    #[test]
    fn finalize_gate_requires_drained_and_whole_session() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let session = session_in(&dir)?;
        assert!(session.begin_chunk(10).is_ok());
        assert!(matches!(session.try_begin_finalize(10), FinalizeGate::NotReady));
        session.complete_chunk(10);
        assert!(matches!(
            session.try_begin_finalize(10),
            FinalizeGate::Ready {
                written: 10,
                expected: 10
            }
        ));
        assert!(matches!(
            session.try_begin_finalize(10),
            FinalizeGate::AlreadyFinalizing
        ));
        assert!(matches!(session.begin_chunk(20), Err(Refusal::Finalizing)));
        assert!(session.claim_abort());
        assert!(!session.claim_abort());
        Ok(())
    }

    #[test]
    fn empty_final_chunk_uses_the_session_extent() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let session = session_in(&dir)?;
        for (end, len) in [(100, 100), (150, 50)] {
            assert!(session.begin_chunk(end).is_ok());
            session.complete_chunk(len);
        }
        assert!(session.begin_chunk(0).is_ok());
        session.complete_chunk(0);
        assert_eq!(session.snapshot().extent, 150);
        assert!(matches!(
            session.try_begin_finalize(0),
            FinalizeGate::Ready {
                written: 150,
                expected: 150
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn only_quiet_idle_sessions_are_abandoned() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let session = session_in(&dir)?;
        assert!(!session.try_abandon(Duration::from_secs(60)));

        assert!(session.begin_chunk(5).is_ok());
        assert!(!session.try_abandon(Duration::ZERO));
        session.complete_chunk(5);

        assert!(session.try_abandon(Duration::ZERO));
        assert_eq!(session.failure(), Some(UploadFailure::Abandoned { written: 5 }));
        assert!(!session.try_abandon(Duration::ZERO));
        assert!(matches!(session.begin_chunk(10), Err(Refusal::Failed(_))));
        Ok(())
    }

    #[tokio::test]
    async fn registry_reuses_and_removes_sessions() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let metrics = Metrics::new()?;
        let registry = SessionRegistry::new(metrics.clone(), Duration::from_secs(60));
        let target = UploadTarget {
            destination: dir.path().join("nested/file.bin"),
            temp_path: dir.path().join("nested/.file.bin.partial"),
        };

        let first = registry.get_or_open(&target).await?;
        let second = registry.get_or_open(&target).await?;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(target.temp_path.exists());
        assert_eq!(metrics.snapshot().upload_sessions_active, 1);

        registry.remove(&first).await;
        assert_eq!(registry.len().await, 0);
        assert!(registry.get(&target.destination).await.is_none());
        assert_eq!(metrics.snapshot().upload_sessions_active, 0);
        Ok(())
    }

    #[tokio::test]
    async fn vanished_temp_file_replaces_the_session() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let registry = SessionRegistry::new(Metrics::new()?, Duration::from_secs(60));
        let target = target_in(&dir, "clip.bin");

        let first = registry.get_or_open(&target).await?;
        std::fs::remove_file(&target.temp_path)?;
        let second = registry.get_or_open(&target).await?;

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(matches!(first.failure(), Some(UploadFailure::Abandoned { .. })));
        assert!(target.temp_path.exists());
        assert_eq!(registry.len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn idle_sessions_expire_and_lose_their_temp_files() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let metrics = Metrics::new()?;
        let registry = SessionRegistry::new(metrics.clone(), Duration::from_millis(20));
        let stale = target_in(&dir, "stale.bin");
        let busy = target_in(&dir, "busy.bin");

        registry.get_or_open(&stale).await?;
        let live = registry.get_or_open(&busy).await?;
        assert!(live.begin_chunk(1).is_ok());
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(registry.expire_idle().await, 1);
        assert!(!stale.temp_path.exists());
        assert!(busy.temp_path.exists());
        assert!(registry.get(&stale.destination).await.is_none());
        assert_eq!(registry.len().await, 1);
        assert_eq!(metrics.snapshot().upload_sessions_active, 1);
        Ok(())
    }
}
