#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Telemetry primitives shared across the fileshare workspace.
//!
//! This crate centralises logging, metrics and request-id scoping so the
//! transfer core and the HTTP surface report through one consistent channel.

pub mod context;
pub mod error;
pub mod init;
pub mod metrics;

pub use context::{ServiceSpan, current_request_id, with_request_id};
pub use error::{MetricStage, Result, TelemetryError};
pub use init::{DEFAULT_LOG_LEVEL, LogFormat, LoggingConfig, build_sha, init_logging};
pub use metrics::{Metrics, MetricsSnapshot};
