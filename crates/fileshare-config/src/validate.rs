//! Validation helpers for configuration documents.

use std::path::Path;

use crate::defaults::{MAX_CHUNK_SIZE_BYTES, MIN_CHUNK_SIZE_BYTES};
use crate::error::{ConfigError, ConfigResult};
use crate::model::{JanitorConfig, ServerConfig, TransferConfig};

impl ServerConfig {
    /// Check every field against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for the first field that fails validation.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_port(self.port)?;
        ensure_directory("server", "root", &self.root)?;
        self.transfer.validate()?;
        if self.janitor.enabled {
            self.janitor.validate()?;
            if self.transfer.session_idle_timeout_secs >= self.janitor.max_age_secs {
                return Err(ConfigError::invalid(
                    "transfer",
                    "session_idle_timeout_secs",
                    "not_below_janitor_max_age",
                    self.transfer.session_idle_timeout_secs,
                ));
            }
        }
        Ok(())
    }
}

impl TransferConfig {
    /// Check pool sizes, chunk size and timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] when a value is out of range.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(MIN_CHUNK_SIZE_BYTES..=MAX_CHUNK_SIZE_BYTES).contains(&self.chunk_size_bytes) {
            return Err(ConfigError::invalid(
                "transfer",
                "chunk_size_bytes",
                "out_of_range",
                self.chunk_size_bytes,
            ));
        }
        ensure_positive("transfer", "buffer_count", self.buffer_count)?;
        ensure_positive("transfer", "upload_workers", self.upload_workers)?;
        ensure_positive("transfer", "upload_queue", self.upload_queue)?;
        ensure_positive("transfer", "archive_workers", self.archive_workers)?;
        ensure_positive("transfer", "archive_queue", self.archive_queue)?;
        ensure_positive_secs("transfer", "submit_timeout_secs", self.submit_timeout_secs)?;
        ensure_positive_secs(
            "transfer",
            "finalize_timeout_secs",
            self.finalize_timeout_secs,
        )?;
        if self.session_idle_timeout_secs <= self.finalize_timeout_secs {
            return Err(ConfigError::invalid(
                "transfer",
                "session_idle_timeout_secs",
                "not_above_finalize_timeout",
                self.session_idle_timeout_secs,
            ));
        }
        Ok(())
    }
}

impl JanitorConfig {
    /// Check sweep timing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] when a duration is zero.
    pub fn validate(&self) -> ConfigResult<()> {
        ensure_positive_secs("janitor", "max_age_secs", self.max_age_secs)?;
        ensure_positive_secs("janitor", "interval_secs", self.interval_secs)
    }
}

/// Reject port zero.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] when the port is zero.
pub const fn validate_port(port: u16) -> ConfigResult<()> {
    if port == 0 {
        return Err(ConfigError::InvalidField {
            section: "server",
            field: "port",
            reason: "zero",
            value: None,
        });
    }
    Ok(())
}

/// Require an existing directory.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] when the path is missing or not a directory.
pub fn ensure_directory(section: &'static str, field: &'static str, path: &Path) -> ConfigResult<()> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(ConfigError::invalid(
            section,
            field,
            "not_a_directory",
            path.display(),
        )),
        Err(_) => Err(ConfigError::invalid(section, field, "missing", path.display())),
    }
}

fn ensure_positive(section: &'static str, field: &'static str, value: usize) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::invalid(section, field, "zero", value));
    }
    Ok(())
}

fn ensure_positive_secs(section: &'static str, field: &'static str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::invalid(section, field, "zero", value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> ServerConfig {
        ServerConfig {
            root: dir.path().to_path_buf(),
            ..ServerConfig::default()
        }
    }

    fn rejected_field(result: ConfigResult<()>) -> Option<(&'static str, &'static str)> {
        match result {
            Err(ConfigError::InvalidField { field, reason, .. }) => Some((field, reason)),
            _ => None,
        }
    }

    #[test]
    fn defaults_validate_against_an_existing_root() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        config_in(&dir).validate()?;
        Ok(())
    }

    #[test]
    fn zero_values_are_rejected() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;

        let mut config = config_in(&dir);
        config.port = 0;
        assert_eq!(rejected_field(config.validate()), Some(("port", "zero")));

        let mut config = config_in(&dir);
        config.transfer.upload_workers = 0;
        assert_eq!(
            rejected_field(config.validate()),
            Some(("upload_workers", "zero"))
        );

        let mut config = config_in(&dir);
        config.transfer.finalize_timeout_secs = 0;
        assert_eq!(
            rejected_field(config.validate()),
            Some(("finalize_timeout_secs", "zero"))
        );

        let mut config = config_in(&dir);
        config.janitor.interval_secs = 0;
        assert_eq!(
            rejected_field(config.validate()),
            Some(("interval_secs", "zero"))
        );
        config.janitor.enabled = false;
        config.validate()?;
        Ok(())
    }

    #[test]
    fn session_idle_timeout_sits_between_finalize_and_janitor_age() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let mut config = config_in(&dir);
        config.transfer.session_idle_timeout_secs = config.transfer.finalize_timeout_secs;
        assert_eq!(
            rejected_field(config.validate()),
            Some(("session_idle_timeout_secs", "not_above_finalize_timeout"))
        );

        config.transfer.session_idle_timeout_secs = config.janitor.max_age_secs;
        assert_eq!(
            rejected_field(config.validate()),
            Some(("session_idle_timeout_secs", "not_below_janitor_max_age"))
        );
        config.janitor.enabled = false;
        config.validate()?;
        Ok(())
    }

    #[test]
    fn chunk_size_bounds_are_enforced() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let mut config = config_in(&dir);
        config.transfer.chunk_size_bytes = MIN_CHUNK_SIZE_BYTES - 1;
        assert_eq!(
            rejected_field(config.validate()),
            Some(("chunk_size_bytes", "out_of_range"))
        );
        config.transfer.chunk_size_bytes = MAX_CHUNK_SIZE_BYTES;
        config.validate()?;
        Ok(())
    }

    #[test]
    fn root_must_be_an_existing_directory() -> Result<(), Box<dyn Error>> {
        let dir = TempDir::new()?;
        let file = dir.path().join("file.txt");
        std::fs::write(&file, b"x")?;

        let mut config = config_in(&dir);
        config.root = file;
        assert_eq!(
            rejected_field(config.validate()),
            Some(("root", "not_a_directory"))
        );
        config.root = dir.path().join("missing");
        assert_eq!(rejected_field(config.validate()), Some(("root", "missing")));
        Ok(())
    }
}
