//! HTTP surface modules (router, handlers, middleware).

/// Streamed directory archives.
pub mod archive;
/// Directory listing.
pub mod browse;
/// Shared constants and header names.
pub mod constants;
/// Problem response helpers and error types.
pub mod errors;
/// Health and metrics endpoints.
pub mod health;
/// Router construction and server host.
pub mod router;
/// Metrics middleware for HTTP requests.
pub mod telemetry;
/// Chunked upload endpoint.
pub mod upload;
