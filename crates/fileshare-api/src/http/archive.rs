//! Streamed directory archives.
//!
//! # Design
//! - The archive job runs on the archive pool and pushes encoded bytes through a bounded
//!   channel; the response body drains that channel, so nothing is buffered beyond it.
//! - A client that goes away drops the body; the guard then cancels the job and keeps waiting
//!   for its completion report in the background.

use std::sync::Arc;

use async_stream::stream;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use fileshare_fsops::{ArchiveReport, ArchiveStream};
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::constants::ARCHIVE_CONTENT_TYPE;
use crate::http::errors::ApiError;
use crate::state::ApiState;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ArchiveQuery {
    pub(crate) path: Option<String>,
}

pub(crate) async fn download_archive(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ArchiveQuery>,
) -> Result<Response, ApiError> {
    let requested = query.path.unwrap_or_default();
    let archive = state
        .transfer
        .archiver()
        .open(&requested, state.request_token())
        .await?;
    let disposition = content_disposition(&archive.file_name)?;
    info!(path = %requested, file = %archive.file_name, "archive download started");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, ARCHIVE_CONTENT_TYPE)
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(archive_body(archive))
        .map_err(|err| {
            warn!(error = %err, "failed to build archive response");
            ApiError::internal("failed to build archive response")
        })
}

fn archive_body(archive: ArchiveStream) -> Body {
    let ArchiveStream {
        file_name,
        mut chunks,
        done,
        cancel,
    } = archive;
    let mut completion = Completion {
        file_name,
        cancel,
        done: Some(done),
    };
    Body::from_stream(stream! {
        while let Some(chunk) = chunks.recv().await {
            let failed = chunk.is_err();
            yield chunk;
            if failed {
                break;
            }
        }
        completion.finish().await;
    })
}

/// Waits for the job's report; if the body is dropped first, cancels the job and waits in a
/// detached task instead.
struct Completion {
    file_name: String,
    cancel: CancellationToken,
    done: Option<oneshot::Receiver<ArchiveReport>>,
}

impl Completion {
    async fn finish(&mut self) {
        if let Some(done) = self.done.take() {
            log_report(&self.file_name, done.await.ok());
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };
        self.cancel.cancel();
        let file_name = std::mem::take(&mut self.file_name);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { log_report(&file_name, done.await.ok()) });
        }
    }
}

fn log_report(file_name: &str, report: Option<ArchiveReport>) {
    match report {
        Some(report) => info!(
            file = %file_name,
            outcome = report.outcome.as_str(),
            entries = report.entries,
            skipped = report.skipped,
            truncated = report.truncated,
            bytes = report.bytes_out,
            "archive download finished"
        ),
        None => debug!(file = %file_name, "archive job ended without a report"),
    }
}

fn content_disposition(file_name: &str) -> Result<HeaderValue, ApiError> {
    let safe: String = file_name
        .chars()
        .map(|ch| if ch == '"' || ch == '\\' || ch.is_control() { '_' } else { ch })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{safe}\""))
        .map_err(|_| ApiError::internal("archive name is not a valid header value"))
}
