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
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! Transfer core for the fileshare server: worker pools, pooled chunk buffers, the chunked
//! upload pipeline, the streaming archiver and the partial-file janitor.
//!
//! Layout: `paths.rs` (base directory resolution), `worker.rs` (bounded job executor),
//! `buffer.rs` (chunk buffers), `upload/` (sessions, chunk jobs, finalize), `archive/`
//! (walk, archive job streaming through `zip::ZipWriter`), `janitor.rs` (stale partial sweep),
//! `context.rs` (lifecycle owner).

pub mod archive;
pub mod buffer;
pub mod context;
pub mod error;
pub mod janitor;
pub mod paths;
pub mod upload;
pub mod worker;

pub use archive::{
    ArchiveEntry, ArchiveOutcome, ArchiveReport, ArchiveStream, Archiver, CompressionMethod,
    scan_entries,
};
pub use buffer::{BufferPool, PooledBuffer};
pub use context::{TransferContext, TransferStats};
pub use error::{FsOpsError, FsOpsResult};
pub use janitor::{PartialFileJanitor, SweepReport};
pub use paths::{BaseDir, PARTIAL_SUFFIX, is_hidden_name, is_partial_name};
pub use upload::{
    ChunkOutcome, ChunkRequest, SessionReaper, UploadFailure, UploadPipeline, UploadState,
};
pub use worker::{Job, PoolConfig, PoolStats, RejectReason, Rejected, WorkerPool};
