//! Request and response payloads exchanged over the HTTP API.

use fileshare_fsops::TransferStats;
use fileshare_telemetry::MetricsSnapshot;
use serde::{Deserialize, Serialize};

/// RFC9457-compatible problem document returned on errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    /// URI reference identifying the problem type.
    pub kind: String,
    /// Short, human-readable summary of the issue.
    pub title: String,
    /// HTTP status code associated with the error.
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Detailed diagnostic message when available.
    pub detail: Option<String>,
}

/// Kind of a listed directory entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Subdirectory; downloads as an archive.
    Directory,
    /// Regular file.
    File,
}

/// One navigation step from the root to the listed directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Breadcrumb {
    /// Segment label (`Home` for the root).
    pub name: String,
    /// Browse link for the segment.
    pub link: String,
}

/// One visible entry of a listed directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrowseEntry {
    /// Entry name.
    pub name: String,
    /// Path relative to the serving root, `/`-separated.
    pub path: String,
    /// Entry kind.
    pub kind: EntryKind,
    /// Size in bytes; absent for directories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Human-readable size; absent for directories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_display: Option<String>,
    /// Where to download the entry.
    pub download_url: String,
}

/// Directory listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrowseResponse {
    /// Listed directory relative to the serving root.
    pub path: String,
    /// Navigation trail from the root.
    pub breadcrumbs: Vec<Breadcrumb>,
    /// Directories first, then files, each sorted by name.
    pub entries: Vec<BrowseEntry>,
}

/// Health payload with transfer core counters.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `ok` while the server answers.
    pub status: &'static str,
    /// Build identifier.
    pub build: String,
    /// Pool, buffer and session counters.
    pub transfer: TransferStats,
    /// Selected metric values.
    pub metrics: MetricsSnapshot,
}
