//! JSON configuration file loading.
//!
//! # Design
//! - Missing fields fall back to defaults (`#[serde(default)]` on every section).
//! - Validation is a separate step so callers can layer CLI overrides first.

use std::path::Path;

use tokio::fs;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::model::ServerConfig;

/// Read a [`ServerConfig`] from a JSON document on disk.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when the file cannot be read and [`ConfigError::Parse`] when it is
/// not a valid configuration document.
pub async fn load_from_file(path: &Path) -> ConfigResult<ServerConfig> {
    let raw = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            operation: "config.read",
            path: path.to_path_buf(),
            source,
        })?;
    let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "loaded configuration file");
    Ok(config)
}
