//! Span and request-id scoping for the share service.
//!
//! The service span wraps everything the process logs with the command, shared root and
//! build. Each HTTP request runs inside a task-local request id so upload and archive
//! handlers can stamp their log lines without threading the id through every call.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tracing::span::EnteredSpan;

use crate::init::build_sha;

/// Keeps the `fileshare` span entered until dropped.
pub struct ServiceSpan {
    _entered: EnteredSpan,
}

impl ServiceSpan {
    /// Enter the process-wide span for `command` serving `root`.
    #[must_use]
    pub fn enter(command: &str, root: &Path) -> Self {
        let span = tracing::info_span!(
            "fileshare",
            command,
            root = %root.display(),
            build = %build_sha(),
        );
        Self {
            _entered: span.entered(),
        }
    }
}

tokio::task_local! {
    static REQUEST_ID: Arc<str>;
}

/// Id of the request whose future is currently being polled.
#[must_use]
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.to_string()).ok()
}

/// Poll `fut` with `request_id` visible to [`current_request_id`].
///
/// An empty id leaves the scope unset.
pub async fn with_request_id<Fut, T>(request_id: impl Into<String>, fut: Fut) -> T
where
    Fut: Future<Output = T>,
{
    let request_id = request_id.into();
    if request_id.is_empty() {
        return fut.await;
    }
    REQUEST_ID.scope(Arc::from(request_id), fut).await
}
