//! Default tuning values for the server.
//!
//! # Design
//! - Centralize defaults so the CLI, the config file, and tests agree.
//! - Keep time-based defaults explicit (seconds) for auditability.

use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;

/// Default bind address (all interfaces, local network sharing).
pub const DEFAULT_BIND_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8080;
/// Default upload chunk size (4 MiB).
pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 4 * 1024 * 1024;
/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE_BYTES: usize = 64 * 1024;
/// Largest accepted chunk size.
pub const MAX_CHUNK_SIZE_BYTES: usize = 256 * 1024 * 1024;
/// Default upload queue depth.
pub const DEFAULT_UPLOAD_QUEUE: usize = 500;
/// Default archive worker count.
pub const DEFAULT_ARCHIVE_WORKERS: usize = 4;
/// Default archive queue depth.
pub const DEFAULT_ARCHIVE_QUEUE: usize = 20;
/// Default deadline for enqueueing a job while the queue is full.
pub const DEFAULT_SUBMIT_TIMEOUT_SECS: u64 = 30;
/// Default wait for earlier chunks once the final chunk has landed.
pub const DEFAULT_FINALIZE_TIMEOUT_SECS: u64 = 120;
/// Default idle time after which an unfinished upload session is abandoned (5m).
pub const DEFAULT_SESSION_IDLE_TIMEOUT_SECS: u64 = 5 * 60;
/// Default age after which abandoned partial files are reclaimed (24h).
pub const DEFAULT_JANITOR_MAX_AGE_SECS: u64 = 24 * 60 * 60;
/// Default janitor sweep interval (1h).
pub const DEFAULT_JANITOR_INTERVAL_SECS: u64 = 60 * 60;
/// Default log level when `RUST_LOG` is not provided.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Upload workers default to the available hardware parallelism.
#[must_use]
pub fn default_upload_workers() -> usize {
    std::thread::available_parallelism().map_or(4, NonZeroUsize::get)
}

/// Default buffer count: two per upload worker.
#[must_use]
pub fn default_buffer_count() -> usize {
    default_upload_workers().saturating_mul(2)
}
