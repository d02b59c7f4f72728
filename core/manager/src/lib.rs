//! Disk configuration and management for Stowage.
//!
//! This crate provides:
//! - Config resolution from YAML or JSON, with `${VAR}` expansion and
//!   extraction from a larger application config
//! - A [`Manager`] that constructs each configured disk once, on first use
//! - A replaceable process-wide default manager with a fluent [`Disk`]
//!   handle and default-disk shortcuts

pub mod config;
pub mod global;
pub mod manager;

pub use config::{expand_env_vars, ConfigFormat, DiskConfig, ResolvedConfig, DEFAULT_EMBED_KEY};
pub use global::{
    default_disk, delete, disk, exists, get, get_bytes, get_string, init, init_embedded, put,
    put_bytes, put_file, put_string, setup, setup_config, teardown, url, DefaultManager, Disk,
};
pub use manager::Manager;
