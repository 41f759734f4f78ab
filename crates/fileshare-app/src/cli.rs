//! Command-line arguments and their overrides on top of the configuration file.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use fileshare_config::{LogFormatSetting, ServerConfig};

/// Share a directory on the local network.
#[derive(Debug, Clone, Parser)]
#[command(name = "fileshare", version, about = "Share a directory over HTTP on the local network")]
pub struct Cli {
    /// JSON configuration file; command-line values take precedence over it.
    #[arg(long, env = "FILESHARE_CONFIG")]
    pub config: Option<PathBuf>,
    /// Directory to share (defaults to the working directory).
    #[arg(long, env = "FILESHARE_ROOT")]
    pub root: Option<PathBuf>,
    /// Address to bind.
    #[arg(long, env = "FILESHARE_BIND")]
    pub bind: Option<IpAddr>,
    /// Port to bind.
    #[arg(long, short, env = "FILESHARE_PORT")]
    pub port: Option<u16>,
    /// Threads writing upload chunks.
    #[arg(long, env = "FILESHARE_UPLOAD_WORKERS")]
    pub upload_workers: Option<usize>,
    /// Threads building archives.
    #[arg(long, env = "FILESHARE_ARCHIVE_WORKERS")]
    pub archive_workers: Option<usize>,
    /// Largest accepted chunk body in bytes.
    #[arg(long, env = "FILESHARE_CHUNK_SIZE")]
    pub chunk_size: Option<usize>,
    /// Seconds without a chunk after which an unfinished upload is abandoned.
    #[arg(long, env = "FILESHARE_SESSION_IDLE_TIMEOUT")]
    pub session_idle_timeout: Option<u64>,
    /// Disable the stale partial-file sweep.
    #[arg(long, env = "FILESHARE_NO_JANITOR")]
    pub no_janitor: bool,
    /// Partial files older than this many seconds are swept.
    #[arg(long, env = "FILESHARE_PARTIAL_MAX_AGE")]
    pub partial_max_age: Option<u64>,
    /// Log level directive used when `RUST_LOG` is unset.
    #[arg(long, env = "FILESHARE_LOG_LEVEL")]
    pub log_level: Option<String>,
    /// Log output format.
    #[arg(long, value_enum, env = "FILESHARE_LOG_FORMAT")]
    pub log_format: Option<LogFormatArg>,
}

/// Log format accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// Structured JSON lines.
    Json,
    /// Human-readable output.
    Pretty,
}

impl From<LogFormatArg> for LogFormatSetting {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Json => Self::Json,
            LogFormatArg::Pretty => Self::Pretty,
        }
    }
}

impl Cli {
    /// Overlay every flag that was given onto `config`.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(root) = &self.root {
            config.root.clone_from(root);
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(workers) = self.upload_workers {
            config.transfer.upload_workers = workers;
            config.transfer.buffer_count = config.transfer.buffer_count.max(workers.saturating_mul(2));
        }
        if let Some(workers) = self.archive_workers {
            config.transfer.archive_workers = workers;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.transfer.chunk_size_bytes = chunk_size;
        }
        if let Some(idle) = self.session_idle_timeout {
            config.transfer.session_idle_timeout_secs = idle;
        }
        if self.no_janitor {
            config.janitor.enabled = false;
        }
        if let Some(max_age) = self.partial_max_age {
            config.janitor.max_age_secs = max_age;
        }
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
        if let Some(format) = self.log_format {
            config.logging.format = Some(format.into());
        }
    }
}
