//! Storage backend abstraction for Stowage.
//!
//! This crate provides the capability contracts every backend implements
//! ([`Storage`] and the optional [`AdvancedStorage`]), a driver registry for
//! resolving backends by name, and the built-in `local` and `memory`
//! backends.
//!
//! # Design Principles
//! - Backend isolation: vendor adapters live in their own crates and only
//!   register a factory
//! - Async operations: all I/O operations are async
//! - Streaming support: payloads travel as [`ByteStream`]s
//! - Unified error semantics: every backend reports through
//!   [`stowage_common::Error`]

pub mod helpers;
pub mod instrument;
pub mod local;
pub mod memory;
pub mod progress;
pub mod provider;
pub mod registry;

pub use helpers::{
    bytes_stream, collect_bytes, detect_content_type, download_to_file, generate_key,
    generate_key_flat, upload_file,
};
pub use instrument::Instrumented;
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use progress::{track_upload, ProgressStream};
pub use provider::{
    require_advanced, AdvancedStorage, ByteStream, FileInfo, ListOptions, ListResult,
    ProgressFn, Storage, UploadOptions, UploadResult, DEFAULT_MAX_KEYS,
};
pub use registry::{DriverFactory, DriverRegistry, Options};
