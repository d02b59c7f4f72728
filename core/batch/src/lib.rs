//! Batch operations and retries for Stowage.
//!
//! This crate provides:
//! - A concurrency-capped, cancellable batch executor for uploads and
//!   deletes against one backend
//! - Prefix deletion that pages through a listing before deleting
//! - Exponential-backoff retries that respect cancellation

pub mod batch;
pub mod retry;

pub use batch::{
    delete_all_by_prefix, delete_batch, run_batch, upload_batch, BatchFailure, BatchItem,
    BatchOutcome, BatchSuccess, UploadPayload,
};
pub use retry::{retry, RetryConfig, RetryExecutor};

pub use tokio_util::sync::CancellationToken;
