//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes counters/gauges for the upload pipeline, the archiver, the pools and the janitor.

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{MetricStage, Result, TelemetryError};

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    http_requests_total: IntCounterVec,
    upload_chunks_total: IntCounterVec,
    upload_sessions_total: IntCounterVec,
    upload_bytes_total: IntCounter,
    upload_sessions_active: IntGauge,
    archive_jobs_total: IntCounterVec,
    archive_entries_total: IntCounterVec,
    pool_rejections_total: IntCounterVec,
    janitor_removed_total: IntCounter,
    janitor_failures_total: IntCounter,
    buffers_available: IntGauge,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Upload sessions currently registered.
    pub upload_sessions_active: i64,
    /// Pooled chunk buffers currently idle.
    pub buffers_available: i64,
    /// Bytes written by chunk jobs since start.
    pub upload_bytes_total: u64,
    /// Partial files reclaimed by the janitor since start.
    pub janitor_removed_total: u64,
    /// Partial files the janitor failed to remove since start.
    pub janitor_failures_total: u64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be built or
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_requests_total = counter_vec(
            &registry,
            "http_requests_total",
            "Total HTTP requests received",
            &["route", "code"],
        )?;
        let upload_chunks_total = counter_vec(
            &registry,
            "upload_chunks_total",
            "Upload chunks processed by outcome",
            &["outcome"],
        )?;
        let upload_sessions_total = counter_vec(
            &registry,
            "upload_sessions_total",
            "Upload sessions closed by outcome",
            &["outcome"],
        )?;
        let upload_bytes_total = counter(
            &registry,
            "upload_bytes_total",
            "Bytes written to temporary upload files",
        )?;
        let upload_sessions_active = gauge(
            &registry,
            "upload_sessions_active",
            "Upload sessions currently receiving or finalizing",
        )?;
        let archive_jobs_total = counter_vec(
            &registry,
            "archive_jobs_total",
            "Archive jobs by outcome",
            &["outcome"],
        )?;
        let archive_entries_total = counter_vec(
            &registry,
            "archive_entries_total",
            "Archive entries by outcome",
            &["outcome"],
        )?;
        let pool_rejections_total = counter_vec(
            &registry,
            "pool_rejections_total",
            "Job submissions rejected by pool and reason",
            &["pool", "reason"],
        )?;
        let janitor_removed_total = counter(
            &registry,
            "janitor_removed_total",
            "Stale partial files removed by the janitor",
        )?;
        let janitor_failures_total = counter(
            &registry,
            "janitor_failures_total",
            "Stale partial files the janitor could not remove",
        )?;
        let buffers_available = gauge(
            &registry,
            "buffers_available",
            "Idle pooled chunk buffers",
        )?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                http_requests_total,
                upload_chunks_total,
                upload_sessions_total,
                upload_bytes_total,
                upload_sessions_active,
                archive_jobs_total,
                archive_entries_total,
                pool_rejections_total,
                janitor_removed_total,
                janitor_failures_total,
                buffers_available,
            }),
        })
    }

    /// Increment the HTTP request counter for the given route and status code.
    pub fn inc_http_request(&self, route: &str, status: u16) {
        self.inner
            .http_requests_total
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    /// Count one processed upload chunk (`written`, `failed`, `skipped`).
    pub fn inc_upload_chunk(&self, outcome: &str) {
        self.inner
            .upload_chunks_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Count one closed upload session (`committed`, `failed`).
    pub fn inc_upload_session(&self, outcome: &str) {
        self.inner
            .upload_sessions_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Add bytes written by a chunk job.
    pub fn add_upload_bytes(&self, bytes: u64) {
        self.inner.upload_bytes_total.inc_by(bytes);
    }

    /// Set the number of registered upload sessions.
    pub fn set_upload_sessions_active(&self, count: usize) {
        self.inner
            .upload_sessions_active
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Count one finished archive job (`completed`, `cancelled`, `failed`, `rejected`).
    pub fn inc_archive_job(&self, outcome: &str) {
        self.inner
            .archive_jobs_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Count one archive entry (`written`, `skipped`, `truncated`).
    pub fn inc_archive_entry(&self, outcome: &str) {
        self.inner
            .archive_entries_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Count a rejected pool submission.
    pub fn inc_pool_rejection(&self, pool: &str, reason: &str) {
        self.inner
            .pool_rejections_total
            .with_label_values(&[pool, reason])
            .inc();
    }

    /// Record the outcome of a janitor sweep.
    pub fn record_janitor_sweep(&self, removed: u64, failed: u64) {
        self.inner.janitor_removed_total.inc_by(removed);
        self.inner.janitor_failures_total.inc_by(failed);
    }

    /// Set the number of idle pooled buffers.
    pub fn set_buffers_available(&self, count: usize) {
        self.inner
            .buffers_available
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::ScrapeEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::ScrapeUtf8 { source })
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            upload_sessions_active: self.inner.upload_sessions_active.get(),
            buffers_available: self.inner.buffers_available.get(),
            upload_bytes_total: self.inner.upload_bytes_total.get(),
            janitor_removed_total: self.inner.janitor_removed_total.get(),
            janitor_failures_total: self.inner.janitor_failures_total.get(),
        }
    }
}

fn counter_vec(
    registry: &Registry,
    name: &'static str,
    help: &'static str,
    labels: &[&str],
) -> Result<IntCounterVec> {
    let collector = IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|source| TelemetryError::metric(name, MetricStage::Build, source))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::metric(name, MetricStage::Register, source))?;
    Ok(collector)
}

fn counter(registry: &Registry, name: &'static str, help: &'static str) -> Result<IntCounter> {
    let collector = IntCounter::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::metric(name, MetricStage::Build, source))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::metric(name, MetricStage::Register, source))?;
    Ok(collector)
}

fn gauge(registry: &Registry, name: &'static str, help: &'static str) -> Result<IntGauge> {
    let collector = IntGauge::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::metric(name, MetricStage::Build, source))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::metric(name, MetricStage::Register, source))?;
    Ok(collector)
}
