//! RFC9457-style API error wrapper.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use fileshare_fsops::{FsOpsError, UploadFailure};
use tracing::{error, warn};

use crate::http::constants::{
    PROBLEM_BAD_REQUEST, PROBLEM_CONFLICT, PROBLEM_FORBIDDEN, PROBLEM_INTERNAL, PROBLEM_NOT_FOUND,
    PROBLEM_PAYLOAD_TOO_LARGE, PROBLEM_SERVICE_UNAVAILABLE,
};
use crate::models::ProblemDetails;

/// Detail sent when a worker pool refuses a job.
pub(crate) const SERVER_BUSY: &str = "Server busy";

/// Structured API error with optional RFC9457 fields.
#[derive(Debug)]
pub(crate) struct ApiError {
    pub(crate) status: StatusCode,
    pub(crate) kind: &'static str,
    title: &'static str,
    detail: Option<String>,
}

impl ApiError {
    const fn new(status: StatusCode, kind: &'static str, title: &'static str) -> Self {
        Self {
            status,
            kind,
            title,
            detail: None,
        }
    }

    pub(crate) fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            PROBLEM_INTERNAL,
            "internal server error",
        )
        .with_detail(message)
    }

    pub(crate) fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, PROBLEM_BAD_REQUEST, "bad request").with_detail(detail)
    }

    pub(crate) fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, PROBLEM_FORBIDDEN, "forbidden").with_detail(detail)
    }

    pub(crate) fn not_found(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            PROBLEM_NOT_FOUND,
            "resource not found",
        )
        .with_detail(detail)
    }

    pub(crate) fn conflict(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, PROBLEM_CONFLICT, "conflict").with_detail(detail)
    }

    pub(crate) fn payload_too_large(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            PROBLEM_PAYLOAD_TOO_LARGE,
            "payload too large",
        )
        .with_detail(detail)
    }

    pub(crate) fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            PROBLEM_SERVICE_UNAVAILABLE,
            "service unavailable",
        )
        .with_detail(detail)
    }

    #[cfg(test)]
    pub(crate) const fn status(&self) -> StatusCode {
        self.status
    }

    #[cfg(test)]
    pub(crate) fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

fn incomplete(expected: u64, written: u64) -> ApiError {
    ApiError::conflict(format!(
        "upload incomplete: expected {expected} bytes, received {written}"
    ))
}

impl From<FsOpsError> for ApiError {
    fn from(err: FsOpsError) -> Self {
        match &err {
            FsOpsError::PathTraversal { requested } => {
                warn!(requested = %requested, "path traversal rejected");
                Self::forbidden("path traversal rejected")
            }
            FsOpsError::InvalidInput { field, reason, .. } => {
                Self::bad_request(format!("invalid {field}: {reason}"))
            }
            FsOpsError::ChunkTooLarge { limit } => {
                Self::payload_too_large(format!("chunk exceeds {limit} bytes"))
            }
            FsOpsError::PoolRejected { pool, reason } => {
                warn!(pool = *pool, reason = reason.as_str(), "worker pool rejected request");
                Self::service_unavailable(SERVER_BUSY)
            }
            FsOpsError::MissingPath { .. } => Self::not_found("path not found"),
            FsOpsError::NotADirectory { .. } => Self::bad_request("path is not a directory"),
            FsOpsError::IncompleteUpload {
                expected, written, ..
            }
            | FsOpsError::UploadAborted {
                cause: UploadFailure::Incomplete { expected, written },
                ..
            } => incomplete(*expected, *written),
            FsOpsError::UploadAborted {
                cause: UploadFailure::Abandoned { .. },
                ..
            } => Self::conflict("upload session expired; restart the upload"),
            FsOpsError::SessionBusy { .. } => Self::conflict("upload is already finalizing"),
            FsOpsError::ClientDisconnected { .. } => Self::bad_request("client disconnected"),
            FsOpsError::UploadAborted { .. }
            | FsOpsError::PartialWrite { .. }
            | FsOpsError::Finalize { .. }
            | FsOpsError::Io { .. }
            | FsOpsError::Walkdir { .. }
            | FsOpsError::WorkerSpawn { .. } => {
                error!(error = ?err, "transfer operation failed");
                Self::internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ProblemDetails {
            kind: self.kind.to_string(),
            title: self.title.to_string(),
            status: self.status.as_u16(),
            detail: self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileshare_fsops::RejectReason;
    use std::io;
    use std::path::PathBuf;

    #[test]
    fn fsops_errors_map_to_statuses() {
        let cases = [
            (
                FsOpsError::PathTraversal {
                    requested: "../etc".to_string(),
                },
                StatusCode::FORBIDDEN,
            ),
            (
                FsOpsError::ChunkTooLarge { limit: 10 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                FsOpsError::PoolRejected {
                    pool: "archive",
                    reason: RejectReason::TimedOut,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                FsOpsError::MissingPath {
                    path: PathBuf::from("gone"),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                FsOpsError::UploadAborted {
                    path: PathBuf::from("a.bin"),
                    cause: UploadFailure::Incomplete {
                        expected: 10,
                        written: 5,
                    },
                },
                StatusCode::CONFLICT,
            ),
            (
                FsOpsError::UploadAborted {
                    path: PathBuf::from("a.bin"),
                    cause: UploadFailure::WorkerPanicked { offset: 0 },
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                FsOpsError::UploadAborted {
                    path: PathBuf::from("a.bin"),
                    cause: UploadFailure::Abandoned { written: 5 },
                },
                StatusCode::CONFLICT,
            ),
            (
                FsOpsError::Finalize {
                    operation: "upload.rename",
                    path: PathBuf::from("a.bin"),
                    source: io::Error::other("is a directory"),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                FsOpsError::PartialWrite {
                    path: PathBuf::from(".a.bin.partial"),
                    offset: 0,
                    source: io::Error::other("disk full"),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn busy_pool_reports_server_busy() {
        let err = ApiError::from(FsOpsError::PoolRejected {
            pool: "upload",
            reason: RejectReason::Closed,
        });
        assert_eq!(err.detail(), Some(SERVER_BUSY));
        assert_eq!(err.kind, PROBLEM_SERVICE_UNAVAILABLE);
    }
}
