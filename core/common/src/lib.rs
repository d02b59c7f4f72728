//! Common utilities and types shared across Stowage crates.
//!
//! This crate provides the error taxonomy every backend and the runtime core
//! report through, plus the validated key type used by built-in backends.

pub mod error;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use types::ObjectKey;
