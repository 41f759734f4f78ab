#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Typed server configuration for the fileshare workspace.
//!
//! Layout: `model.rs` (typed config models), `defaults.rs` (default tuning values),
//! `validate.rs` (validation helpers), `loader.rs` (JSON file loading).

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::load_from_file;
pub use model::{JanitorConfig, LogFormatSetting, LogSettings, ServerConfig, TransferConfig};
