//! Shared HTTP constants (headers, problem URIs).

pub(crate) const HEADER_REQUEST_ID: &str = "x-request-id";
pub(crate) const HEADER_FILE_NAME: &str = "x-file-name";
pub(crate) const HEADER_CHUNK_OFFSET: &str = "x-chunk-offset";
pub(crate) const HEADER_FINAL_CHUNK: &str = "x-final-chunk";

pub(crate) const PROBLEM_INTERNAL: &str = "https://fileshare.dev/problems/internal";
pub(crate) const PROBLEM_BAD_REQUEST: &str = "https://fileshare.dev/problems/bad-request";
pub(crate) const PROBLEM_FORBIDDEN: &str = "https://fileshare.dev/problems/forbidden";
pub(crate) const PROBLEM_NOT_FOUND: &str = "https://fileshare.dev/problems/not-found";
pub(crate) const PROBLEM_CONFLICT: &str = "https://fileshare.dev/problems/conflict";
pub(crate) const PROBLEM_PAYLOAD_TOO_LARGE: &str =
    "https://fileshare.dev/problems/payload-too-large";
pub(crate) const PROBLEM_SERVICE_UNAVAILABLE: &str =
    "https://fileshare.dev/problems/service-unavailable";

pub(crate) const ARCHIVE_CONTENT_TYPE: &str = "application/octet-stream";
pub(crate) const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";
