//! Chunked upload endpoint.
//!
//! # Design
//! - One request per chunk: `X-File-Name`, `X-Chunk-Offset` and `X-Final-Chunk` describe it,
//!   the raw body carries the bytes, `?dir=` picks the destination directory.
//! - Header validation happens before the body is touched; the body is streamed straight into
//!   a pooled buffer by the pipeline.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Query, State},
    http::HeaderMap,
};
use fileshare_fsops::{ChunkOutcome, ChunkRequest};
use fileshare_telemetry::current_request_id;
use serde::Deserialize;
use tracing::debug;

use crate::http::constants::{HEADER_CHUNK_OFFSET, HEADER_FILE_NAME, HEADER_FINAL_CHUNK};
use crate::http::errors::ApiError;
use crate::state::ApiState;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct UploadQuery {
    pub(crate) dir: Option<String>,
}

pub(crate) async fn upload_chunk(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ChunkOutcome>, ApiError> {
    let request = chunk_request(query.dir.unwrap_or_default(), &headers)?;
    debug!(
        request_id = current_request_id().as_deref().unwrap_or_default(),
        file = %request.file_name,
        offset = request.offset,
        is_final = request.is_final,
        "upload chunk received"
    );
    let cancel = state.request_token();
    let outcome = state
        .transfer
        .uploads()
        .ingest_chunk(request, body.into_data_stream(), &cancel)
        .await?;
    Ok(Json(outcome))
}

fn chunk_request(dir: String, headers: &HeaderMap) -> Result<ChunkRequest, ApiError> {
    let file_name = header_str(headers, HEADER_FILE_NAME)?
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing X-File-Name header"))?
        .to_string();
    let offset = header_str(headers, HEADER_CHUNK_OFFSET)?
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .ok_or_else(|| ApiError::bad_request("Invalid X-Chunk-Offset"))?;
    let is_final = match header_str(headers, HEADER_FINAL_CHUNK)?.map(str::trim) {
        None | Some("false") => false,
        Some("true") => true,
        Some(_) => return Err(ApiError::bad_request("Invalid X-Final-Chunk")),
    };
    Ok(ChunkRequest {
        dir,
        file_name,
        offset,
        is_final,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, ApiError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| ApiError::bad_request(format!("{name} header is not valid text")))
        })
        .transpose()
}
