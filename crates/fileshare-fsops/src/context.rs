//! Lifecycle owner for the transfer core.
//!
//! # Design
//! - Built once at server start from the transfer config and handed to the HTTP layer by
//!   reference; nothing in this crate lives in a global.
//! - Owns both worker pools and the chunk buffers; `shutdown` stops the pools after in-flight
//!   work drains.

use std::path::PathBuf;
use std::sync::Arc;

use fileshare_config::TransferConfig;
use fileshare_telemetry::Metrics;
use serde::Serialize;

use crate::archive::Archiver;
use crate::buffer::BufferPool;
use crate::error::FsOpsResult;
use crate::paths::BaseDir;
use crate::upload::UploadPipeline;
use crate::worker::{PoolConfig, PoolStats, WorkerPool};

/// Pool name for chunk writes.
pub const UPLOAD_POOL: &str = "upload";
/// Pool name for archive jobs.
pub const ARCHIVE_POOL: &str = "archive";

/// Point-in-time view of the transfer core.
#[derive(Debug, Clone, Serialize)]
pub struct TransferStats {
    /// Upload pool counters.
    pub upload_pool: PoolStats,
    /// Archive pool counters.
    pub archive_pool: PoolStats,
    /// Idle chunk buffers.
    pub buffers_available: usize,
    /// Total chunk buffers.
    pub buffers_capacity: usize,
    /// Registered upload sessions.
    pub upload_sessions: usize,
}

/// Pools, buffers, upload pipeline and archiver for one serving root.
pub struct TransferContext {
    base: BaseDir,
    upload_pool: Arc<WorkerPool>,
    archive_pool: Arc<WorkerPool>,
    uploads: UploadPipeline,
    archiver: Archiver,
    metrics: Metrics,
}

impl TransferContext {
    /// Start both pools and allocate the buffer pool.
    ///
    /// # Errors
    ///
    /// Returns an error when a pool or the buffer pool rejects its sizing or a worker thread
    /// cannot be spawned.
    pub fn start(root: impl Into<PathBuf>, config: &TransferConfig, metrics: Metrics) -> FsOpsResult<Self> {
        let base = BaseDir::new(root);
        let upload_pool = Arc::new(WorkerPool::new(&PoolConfig {
            name: UPLOAD_POOL,
            workers: config.upload_workers,
            queue_capacity: config.upload_queue,
            submit_timeout: Some(config.submit_timeout()),
        })?);
        let archive_pool = Arc::new(WorkerPool::new(&PoolConfig {
            name: ARCHIVE_POOL,
            workers: config.archive_workers,
            queue_capacity: config.archive_queue,
            submit_timeout: Some(config.submit_timeout()),
        })?);
        let buffers = BufferPool::new(config.buffer_count, config.chunk_size_bytes)?;
        metrics.set_buffers_available(buffers.available());

        let uploads = UploadPipeline::new(
            base.clone(),
            Arc::clone(&upload_pool),
            buffers,
            metrics.clone(),
            config.finalize_timeout(),
            config.session_idle_timeout(),
        );
        let archiver = Archiver::new(base.clone(), Arc::clone(&archive_pool), metrics.clone());
        Ok(Self {
            base,
            upload_pool,
            archive_pool,
            uploads,
            archiver,
            metrics,
        })
    }

    /// Serving root.
    #[must_use]
    pub const fn base(&self) -> &BaseDir {
        &self.base
    }

    /// Chunked upload pipeline.
    #[must_use]
    pub const fn uploads(&self) -> &UploadPipeline {
        &self.uploads
    }

    /// Directory archiver.
    #[must_use]
    pub const fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    /// Push the point-in-time buffer and session counts into the gauges.
    pub async fn refresh_gauges(&self) -> (usize, usize) {
        let available = self.uploads.buffers().available();
        let upload_sessions = self.uploads.active_sessions().await;
        self.metrics.set_buffers_available(available);
        self.metrics.set_upload_sessions_active(upload_sessions);
        (available, upload_sessions)
    }

    /// Current counters; also refreshes the buffer and session gauges.
    pub async fn stats(&self) -> TransferStats {
        let (buffers_available, upload_sessions) = self.refresh_gauges().await;
        let buffers = self.uploads.buffers();
        TransferStats {
            upload_pool: self.upload_pool.stats(),
            archive_pool: self.archive_pool.stats(),
            buffers_available,
            buffers_capacity: buffers.capacity(),
            upload_sessions,
        }
    }

    /// Stop both pools, letting queued jobs finish. Blocks the calling thread.
    pub fn shutdown(&self) {
        self.upload_pool.stop();
        self.archive_pool.stop();
    }
}
