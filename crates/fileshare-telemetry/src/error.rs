//! Errors raised while installing logging or maintaining the metrics registry.

use std::fmt::{self, Display, Formatter};
use std::string::FromUtf8Error;

use prometheus::Error as PrometheusError;
use thiserror::Error;
use tracing_subscriber::util::TryInitError;

/// Result alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Which half of registering a metric failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricStage {
    /// Building the collector from its name, help text and labels.
    Build,
    /// Adding the collector to the registry.
    Register,
}

impl Display for MetricStage {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Build => "built",
            Self::Register => "registered",
        })
    }
}

/// Errors raised by telemetry helpers.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global tracing subscriber was already installed.
    #[error("log subscriber could not be installed")]
    SubscriberInstall {
        /// Underlying tracing subscriber error.
        #[source]
        source: TryInitError,
    },
    /// A transfer metric could not be set up.
    #[error("metric `{name}` could not be {stage}")]
    Metric {
        /// Metric name.
        name: &'static str,
        /// Step that failed.
        stage: MetricStage,
        /// Underlying Prometheus error.
        #[source]
        source: PrometheusError,
    },
    /// The registry could not be written out for a scrape.
    #[error("metrics scrape could not be encoded")]
    ScrapeEncode {
        /// Underlying Prometheus error.
        #[source]
        source: PrometheusError,
    },
    /// The encoded scrape was not UTF-8.
    #[error("metrics scrape was not valid utf-8")]
    ScrapeUtf8 {
        /// Underlying conversion error.
        #[source]
        source: FromUtf8Error,
    },
}

impl TelemetryError {
    pub(crate) const fn metric(
        name: &'static str,
        stage: MetricStage,
        source: PrometheusError,
    ) -> Self {
        Self::Metric {
            name,
            stage,
            source,
        }
    }
}
