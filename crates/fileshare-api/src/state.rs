//! Shared state handed to every handler.

use std::sync::Arc;

use fileshare_fsops::TransferContext;
use fileshare_telemetry::Metrics;
use tokio_util::sync::CancellationToken;

/// Transfer core, metrics and the server-wide shutdown signal.
pub struct ApiState {
    pub(crate) transfer: Arc<TransferContext>,
    pub(crate) telemetry: Metrics,
    pub(crate) shutdown: CancellationToken,
}

impl ApiState {
    /// Bundle the handler dependencies.
    #[must_use]
    pub const fn new(
        transfer: Arc<TransferContext>,
        telemetry: Metrics,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transfer,
            telemetry,
            shutdown,
        }
    }

    /// Token for one request's long-running work; fires when the server shuts down.
    pub(crate) fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}
