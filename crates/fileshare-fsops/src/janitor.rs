//! Periodic removal of abandoned upload temp files.
//!
//! # Design
//! - Sweeps the whole serving tree for `.<name>.partial` files whose modification time is older
//!   than the configured age; younger temp files belong to live sessions and are left alone.
//! - The first sweep runs immediately at start, then on a fixed interval until cancelled.
//! - When given a [`SessionReaper`], each tick first retires idle upload sessions so their temp
//!   files are released before the file sweep looks at them.
//! - Filesystem work runs on the blocking pool; a file that vanishes mid-sweep is not an error.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fileshare_telemetry::Metrics;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::paths::is_partial_name;
use crate::upload::SessionReaper;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Temp files inspected.
    pub scanned: u64,
    /// Stale temp files removed.
    pub removed: u64,
    /// Stale temp files already gone by the time they were removed.
    pub vanished: u64,
    /// Stale temp files that could not be removed.
    pub failed: u64,
}

/// Background sweeper for stale partial uploads.
#[derive(Clone)]
pub struct PartialFileJanitor {
    root: PathBuf,
    max_age: Duration,
    interval: Duration,
    metrics: Metrics,
    sessions: Option<SessionReaper>,
}

impl PartialFileJanitor {
    /// Configure a janitor for `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, max_age: Duration, interval: Duration, metrics: Metrics) -> Self {
        Self {
            root: root.into(),
            max_age,
            interval,
            metrics,
            sessions: None,
        }
    }

    /// Also retire idle upload sessions on every tick.
    #[must_use]
    pub fn with_session_reaper(mut self, reaper: SessionReaper) -> Self {
        self.sessions = Some(reaper);
        self
    }

    /// Run one sweep treating `now` as the current time.
    #[must_use]
    pub fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        for item in WalkDir::new(&self.root).follow_links(false) {
            let item = match item {
                Ok(item) => item,
                Err(err) => {
                    debug!(path = ?err.path(), error = %err, "janitor skipped unreadable path");
                    continue;
                }
            };
            if !item.file_type().is_file() || !is_partial_name(item.file_name()) {
                continue;
            }
            report.scanned += 1;
            if !self.is_stale(item.path(), now) {
                continue;
            }
            match std::fs::remove_file(item.path()) {
                Ok(()) => {
                    report.removed += 1;
                    info!(path = %item.path().display(), "removed stale partial upload");
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => report.vanished += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(path = %item.path().display(), error = %err, "failed to remove stale partial upload");
                }
            }
        }
        self.metrics
            .record_janitor_sweep(report.removed, report.failed);
        report
    }

    /// Run one sweep against the wall clock.
    #[must_use]
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now())
    }

    /// Sweep now and then every interval until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            info!(
                root = %self.root.display(),
                max_age_secs = self.max_age.as_secs(),
                interval_secs = self.interval.as_secs(),
                "partial-file janitor started"
            );
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(reaper) = &self.sessions {
                            let expired = reaper.expire_idle().await;
                            if expired > 0 {
                                info!(expired, "idle upload sessions retired");
                            }
                        }
                        let janitor = self.clone();
                        match tokio::task::spawn_blocking(move || janitor.sweep()).await {
                            Ok(report) => debug!(
                                scanned = report.scanned,
                                removed = report.removed,
                                failed = report.failed,
                                "janitor sweep finished"
                            ),
                            Err(err) => warn!(error = %err, "janitor sweep task failed"),
                        }
                    }
                }
            }
            info!("partial-file janitor stopped");
        })
    }

    fn is_stale(&self, path: &Path, now: SystemTime) -> bool {
        let modified = match std::fs::metadata(path).and_then(|metadata| metadata.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "janitor could not stat partial file");
                return false;
            }
        };
        now.duration_since(modified)
            .is_ok_and(|age| age > self.max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TransferContext;
    use crate::upload::ChunkRequest;
    use bytes::Bytes;
    use fileshare_config::TransferConfig;
    use futures_util::stream;
    use std::error::Error;
    use std::fs::File;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn touch(path: &Path, modified: SystemTime) -> Result<(), Box<dyn Error>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        file.set_modified(modified)?;
        Ok(())
    }

    #[test]
    fn only_stale_partials_are_removed() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let now = SystemTime::now();
        let stale = temp.path().join("a/.old.bin.partial");
        let fresh = temp.path().join(".new.bin.partial");
        let regular = temp.path().join("old.bin");
        let not_ours = temp.path().join("old.bin.partial");
        touch(&stale, now - DAY - Duration::from_secs(60))?;
        touch(&fresh, now - Duration::from_secs(60))?;
        touch(&regular, now - DAY * 2)?;
        touch(&not_ours, now - DAY * 2)?;

        let metrics = Metrics::new()?;
        let janitor = PartialFileJanitor::new(temp.path(), DAY, Duration::from_secs(3600), metrics.clone());
        let report = janitor.sweep_at(now);

        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(report.failed, 0);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(regular.exists());
        assert!(not_ours.exists());
        assert_eq!(metrics.snapshot().janitor_removed_total, 1);
        Ok(())
    }

    #[test]
    fn empty_tree_is_a_clean_sweep() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let janitor = PartialFileJanitor::new(temp.path(), DAY, DAY, Metrics::new()?);
        assert_eq!(janitor.sweep(), SweepReport::default());
        Ok(())
    }

    #[tokio::test]
    async fn spawned_janitor_sweeps_immediately_and_stops() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let stale = temp.path().join(".stale.partial");
        touch(&stale, SystemTime::now() - DAY * 2)?;

        let janitor = PartialFileJanitor::new(temp.path(), DAY, DAY, Metrics::new()?);
        let cancel = CancellationToken::new();
        let handle = janitor.spawn(cancel.clone());

        for _ in 0..100 {
            if !stale.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!stale.exists());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ticks_retire_idle_upload_sessions() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let metrics = Metrics::new()?;
        let config = TransferConfig {
            chunk_size_bytes: 64 * 1024,
            buffer_count: 1,
            upload_workers: 1,
            upload_queue: 1,
            archive_workers: 1,
            archive_queue: 1,
            session_idle_timeout_secs: 0,
            ..TransferConfig::default()
        };
        let context = TransferContext::start(temp.path(), &config, metrics.clone())?;
        context
            .uploads()
            .ingest_chunk(
                ChunkRequest {
                    dir: String::new(),
                    file_name: "left.bin".to_string(),
                    offset: 0,
                    is_final: false,
                },
                stream::iter([Ok::<_, io::Error>(Bytes::from_static(b"half"))]),
                &CancellationToken::new(),
            )
            .await?;
        let partial = temp.path().join(".left.bin.partial");
        assert!(partial.exists());

        let cancel = CancellationToken::new();
        let handle = PartialFileJanitor::new(temp.path(), DAY, DAY, metrics)
            .with_session_reaper(context.uploads().session_reaper())
            .spawn(cancel.clone());
        for _ in 0..100 {
            if context.uploads().active_sessions().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(context.uploads().active_sessions().await, 0);
        assert!(!partial.exists());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await??;
        context.shutdown();
        Ok(())
    }
}
