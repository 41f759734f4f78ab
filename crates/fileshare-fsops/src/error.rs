//! # Design
//!
//! - Provide structured, constant-message errors for the transfer pipeline.
//! - Capture operation context (paths, offsets, inputs) to make failures reproducible in tests.
//! - Preserve source errors without interpolating context into error messages.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::upload::UploadFailure;
use crate::worker::RejectReason;

/// Result type for transfer operations.
pub type FsOpsResult<T> = Result<T, FsOpsError>;

/// Errors produced by the transfer pipeline.
#[derive(Debug, Error)]
pub enum FsOpsError {
    /// A requested path contained a parent-directory component.
    #[error("path traversal rejected")]
    PathTraversal {
        /// Path exactly as requested.
        requested: String,
    },
    /// Input validation failures.
    #[error("fsops invalid input")]
    InvalidInput {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// A chunk body exceeded the pooled buffer size.
    #[error("chunk exceeds buffer size")]
    ChunkTooLarge {
        /// Maximum accepted chunk length in bytes.
        limit: usize,
    },
    /// The client went away before the operation finished.
    #[error("client disconnected")]
    ClientDisconnected {
        /// Stage that observed the disconnect.
        operation: &'static str,
    },
    /// A worker pool refused the job (queue saturated or pool stopped).
    #[error("worker pool rejected job")]
    PoolRejected {
        /// Pool that refused the job.
        pool: &'static str,
        /// Why the submission was refused.
        reason: RejectReason,
    },
    /// Spawning a worker thread failed.
    #[error("worker spawn failed")]
    WorkerSpawn {
        /// Pool that was being constructed.
        pool: &'static str,
        /// Underlying IO error.
        source: io::Error,
    },
    /// IO failures while interacting with the filesystem.
    #[error("fsops io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Walkdir traversal failures.
    #[error("fsops walkdir failure")]
    Walkdir {
        /// Operation that triggered the walkdir failure.
        operation: &'static str,
        /// Path involved in the walkdir failure.
        path: PathBuf,
        /// Underlying walkdir error.
        source: walkdir::Error,
    },
    /// A positioned chunk write failed; the upload session was aborted.
    #[error("chunk write failed")]
    PartialWrite {
        /// Temporary file being written.
        path: PathBuf,
        /// Offset of the failed chunk.
        offset: u64,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Syncing or renaming the completed temporary file failed.
    #[error("upload finalize failed")]
    Finalize {
        /// Finalize step that failed.
        operation: &'static str,
        /// Destination path of the upload.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The received chunks do not add up to the announced file length.
    #[error("upload incomplete")]
    IncompleteUpload {
        /// Destination path of the upload.
        path: PathBuf,
        /// Length implied by the final chunk.
        expected: u64,
        /// Bytes actually accounted for.
        written: u64,
    },
    /// The upload session failed because of an earlier chunk or a disconnect.
    #[error("upload session aborted")]
    UploadAborted {
        /// Destination path of the upload.
        path: PathBuf,
        /// First failure recorded for the session.
        cause: UploadFailure,
    },
    /// The upload session is already finalizing.
    #[error("upload session busy")]
    SessionBusy {
        /// Destination path of the upload.
        path: PathBuf,
    },
    /// The requested path does not exist.
    #[error("path not found")]
    MissingPath {
        /// Resolved path.
        path: PathBuf,
    },
    /// The requested path is not a directory.
    #[error("path is not a directory")]
    NotADirectory {
        /// Resolved path.
        path: PathBuf,
    },
}

impl FsOpsError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn walkdir(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: walkdir::Error,
    ) -> Self {
        Self::Walkdir {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            reason,
            value: Some(value.into()),
        }
    }

    pub(crate) fn traversal(requested: &str) -> Self {
        Self::PathTraversal {
            requested: requested.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    #[test]
    fn fsops_error_helpers_build_variants() -> Result<(), Box<dyn Error>> {
        let io_err = FsOpsError::io("read", "path", io::Error::other("io"));
        assert!(matches!(io_err, FsOpsError::Io { .. }));
        assert!(io_err.source().is_some());
        assert_eq!(io_err.to_string(), "fsops io failure");

        let temp = TempDir::new()?;
        let missing = temp.path().join("missing");
        let walkdir_error = WalkDir::new(&missing)
            .into_iter()
            .next()
            .and_then(Result::err)
            .ok_or_else(|| io::Error::other("expected walkdir error"))?;
        let walk_err = FsOpsError::walkdir("walk", &missing, walkdir_error);
        assert!(matches!(walk_err, FsOpsError::Walkdir { .. }));
        assert!(walk_err.source().is_some());

        let invalid = FsOpsError::invalid("offset", "not_a_number", "abc");
        assert!(matches!(
            invalid,
            FsOpsError::InvalidInput {
                field: "offset",
                reason: "not_a_number",
                value: Some(ref value),
            } if value == "abc"
        ));

        let traversal = FsOpsError::traversal("../etc");
        assert_eq!(traversal.to_string(), "path traversal rejected");
        assert!(traversal.source().is_none());
        Ok(())
    }
}
