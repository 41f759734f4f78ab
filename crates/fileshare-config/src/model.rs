//! Typed configuration models.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults::{
    DEFAULT_ARCHIVE_QUEUE, DEFAULT_ARCHIVE_WORKERS, DEFAULT_BIND_ADDR, DEFAULT_CHUNK_SIZE_BYTES,
    DEFAULT_FINALIZE_TIMEOUT_SECS, DEFAULT_JANITOR_INTERVAL_SECS, DEFAULT_JANITOR_MAX_AGE_SECS,
    DEFAULT_LOG_LEVEL, DEFAULT_PORT, DEFAULT_SESSION_IDLE_TIMEOUT_SECS,
    DEFAULT_SUBMIT_TIMEOUT_SECS, DEFAULT_UPLOAD_QUEUE,
    default_buffer_count, default_upload_workers,
};

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    pub bind_addr: IpAddr,
    /// Port the HTTP listener binds to.
    pub port: u16,
    /// Directory whose contents are shared.
    pub root: PathBuf,
    /// Upload/archive pipeline tuning.
    pub transfer: TransferConfig,
    /// Partial-file janitor tuning.
    pub janitor: JanitorConfig,
    /// Logging preferences.
    pub logging: LogSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR,
            port: DEFAULT_PORT,
            root: PathBuf::from("."),
            transfer: TransferConfig::default(),
            janitor: JanitorConfig::default(),
            logging: LogSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Socket address assembled from the bind address and port.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

/// Worker pool, buffer pool and upload timing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum body size of one upload chunk, also the pooled buffer size.
    pub chunk_size_bytes: usize,
    /// Number of pooled chunk buffers.
    pub buffer_count: usize,
    /// Threads in the upload pool.
    pub upload_workers: usize,
    /// Queue capacity of the upload pool.
    pub upload_queue: usize,
    /// Threads in the archive pool.
    pub archive_workers: usize,
    /// Queue capacity of the archive pool.
    pub archive_queue: usize,
    /// Deadline for enqueueing while a queue is full.
    pub submit_timeout_secs: u64,
    /// How long a final chunk waits for earlier chunks to land.
    pub finalize_timeout_secs: u64,
    /// Upload sessions without chunk activity for this long are abandoned.
    pub session_idle_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            buffer_count: default_buffer_count(),
            upload_workers: default_upload_workers(),
            upload_queue: DEFAULT_UPLOAD_QUEUE,
            archive_workers: DEFAULT_ARCHIVE_WORKERS,
            archive_queue: DEFAULT_ARCHIVE_QUEUE,
            submit_timeout_secs: DEFAULT_SUBMIT_TIMEOUT_SECS,
            finalize_timeout_secs: DEFAULT_FINALIZE_TIMEOUT_SECS,
            session_idle_timeout_secs: DEFAULT_SESSION_IDLE_TIMEOUT_SECS,
        }
    }
}

impl TransferConfig {
    /// Submission deadline as a [`Duration`].
    #[must_use]
    pub const fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    /// Finalize wait as a [`Duration`].
    #[must_use]
    pub const fn finalize_timeout(&self) -> Duration {
        Duration::from_secs(self.finalize_timeout_secs)
    }

    /// Session idle limit as a [`Duration`].
    #[must_use]
    pub const fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}

/// Background sweep of abandoned `.partial` files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JanitorConfig {
    /// Whether the sweep runs at all.
    pub enabled: bool,
    /// Partial files older than this are removed.
    pub max_age_secs: u64,
    /// Time between sweeps.
    pub interval_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_secs: DEFAULT_JANITOR_MAX_AGE_SECS,
            interval_secs: DEFAULT_JANITOR_INTERVAL_SECS,
        }
    }
}

impl JanitorConfig {
    /// Maximum partial-file age as a [`Duration`].
    #[must_use]
    pub const fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Log output format requested by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormatSetting {
    /// Structured JSON lines.
    Json,
    /// Human-readable output.
    Pretty,
}

/// Logging preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Level directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format; inferred from the build profile when absent.
    pub format: Option<LogFormatSetting>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            format: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::error::Error;

    #[test]
    fn partial_documents_fill_in_defaults() -> Result<(), Box<dyn Error>> {
        let config: ServerConfig = serde_json::from_value(json!({
            "port": 9090,
            "transfer": { "upload_workers": 3 },
            "janitor": { "enabled": false },
            "logging": { "format": "json" }
        }))?;

        assert_eq!(config.port, 9090);
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.transfer.upload_workers, 3);
        assert_eq!(config.transfer.chunk_size_bytes, DEFAULT_CHUNK_SIZE_BYTES);
        assert_eq!(config.transfer.archive_queue, DEFAULT_ARCHIVE_QUEUE);
        assert!(!config.janitor.enabled);
        assert_eq!(config.janitor.max_age(), Duration::from_secs(86_400));
        assert_eq!(config.logging.format, Some(LogFormatSetting::Json));
        assert_eq!(config.logging.level, "info");
        Ok(())
    }

    #[test]
    fn durations_and_socket_addr_derive_from_fields() {
        let config = ServerConfig {
            port: 7000,
            ..ServerConfig::default()
        };
        assert_eq!(config.socket_addr().port(), 7000);
        assert_eq!(config.transfer.submit_timeout(), Duration::from_secs(30));
        assert_eq!(config.transfer.finalize_timeout(), Duration::from_secs(120));
        assert_eq!(config.transfer.session_idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.janitor.interval(), Duration::from_secs(3_600));
        assert!(config.transfer.buffer_count >= config.transfer.upload_workers);
    }
}
