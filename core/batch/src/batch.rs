//! Concurrent batch uploads and deletes against one backend.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stowage_common::{Error, Result};
use stowage_storage::{
    require_advanced, ByteStream, ListOptions, Storage, UploadOptions, UploadResult,
    DEFAULT_MAX_KEYS,
};

/// One unit of work: a key plus whatever the operation needs for it.
#[derive(Debug, Clone)]
pub struct BatchItem<P> {
    pub key: String,
    pub payload: P,
}

impl<P> BatchItem<P> {
    pub fn new(key: impl Into<String>, payload: P) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// Payload of one batch upload.
pub struct UploadPayload {
    pub stream: ByteStream,
    pub options: UploadOptions,
}

impl UploadPayload {
    pub fn new(stream: ByteStream, options: UploadOptions) -> Self {
        Self { stream, options }
    }
}

#[derive(Debug)]
pub struct BatchSuccess<R> {
    pub key: String,
    pub value: R,
}

#[derive(Debug)]
pub struct BatchFailure {
    pub key: String,
    pub error: Error,
}

/// Per-item results of a batch, grouped by outcome.
///
/// Every input item lands in exactly one of the two lists. There is no
/// ordering guarantee within either list.
#[derive(Debug)]
pub struct BatchOutcome<R> {
    pub succeeded: Vec<BatchSuccess<R>>,
    pub failed: Vec<BatchFailure>,
}

impl<R> BatchOutcome<R> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            succeeded: Vec::with_capacity(capacity),
            failed: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_keys(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(|f| f.key.as_str())
    }
}

/// Run `operation` over `items` with at most `concurrency` in flight.
///
/// `concurrency == 0` runs every item at once. Items are admitted in input
/// order; once `cancel` fires, items not yet admitted fail with `Cancelled`
/// without the operation being called, while admitted items run to
/// completion. Returns after every admitted item finished.
pub async fn run_batch<P, R, F, Fut>(
    items: Vec<BatchItem<P>>,
    concurrency: usize,
    cancel: &CancellationToken,
    operation: F,
) -> BatchOutcome<R>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(String, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let total = items.len();
    // Never more permits than items; this also keeps huge limits under
    // the semaphore's maximum.
    let limit = if concurrency == 0 {
        total
    } else {
        concurrency.min(total)
    }
    .max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    let operation = Arc::new(operation);

    let mut outcome = BatchOutcome::with_capacity(total);
    let mut handles = Vec::with_capacity(total);

    for BatchItem { key, payload } in items {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = semaphore.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            debug!(key = %key, "batch item cancelled before start");
            outcome.failed.push(BatchFailure {
                key,
                error: Error::Cancelled,
            });
            continue;
        };

        let operation = operation.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            operation(task_key, payload).await
        });
        handles.push((key, handle));
    }

    for (key, handle) in handles {
        match handle.await {
            Ok(Ok(value)) => {
                debug!(key = %key, "batch item done");
                outcome.succeeded.push(BatchSuccess { key, value });
            }
            Ok(Err(error)) => {
                warn!(key = %key, error = %error, "batch item failed");
                outcome.failed.push(BatchFailure { key, error });
            }
            Err(join_err) => {
                warn!(key = %key, error = %join_err, "batch task aborted");
                outcome.failed.push(BatchFailure {
                    key,
                    error: Error::Storage(format!("batch task aborted: {}", join_err)),
                });
            }
        }
    }

    info!(
        total,
        succeeded = outcome.succeeded.len(),
        failed = outcome.failed.len(),
        "batch finished"
    );
    outcome
}

/// Upload every item to `backend`.
pub async fn upload_batch(
    backend: Arc<dyn Storage>,
    items: Vec<BatchItem<UploadPayload>>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> BatchOutcome<UploadResult> {
    run_batch(items, concurrency, cancel, move |key, payload: UploadPayload| {
        let backend = backend.clone();
        async move { backend.upload(&key, payload.stream, payload.options).await }
    })
    .await
}

/// Delete every key from `backend`.
pub async fn delete_batch(
    backend: Arc<dyn Storage>,
    keys: Vec<String>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> BatchOutcome<()> {
    let items = keys.into_iter().map(|key| BatchItem::new(key, ())).collect();
    run_batch(items, concurrency, cancel, move |key, ()| {
        let backend = backend.clone();
        async move { backend.delete(&key).await }
    })
    .await
}

/// Delete every object under `prefix`.
///
/// The whole key set is listed first, page by page, then deleted as one
/// batch.
///
/// # Errors
/// - `NotImplemented` if the backend cannot list
/// - `Cancelled` if `cancel` fires while listing
/// - `Storage` if a truncated page does not advance the marker
/// - any listing error; nothing has been deleted in that case
pub async fn delete_all_by_prefix(
    backend: Arc<dyn Storage>,
    prefix: &str,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<BatchOutcome<()>> {
    let advanced = require_advanced(backend.as_ref())?;

    let mut keys: Vec<String> = Vec::new();
    let mut marker: Option<String> = None;
    let mut previous: Option<String> = None;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut options = ListOptions::default().with_max_keys(DEFAULT_MAX_KEYS);
        if let Some(marker) = marker.take() {
            options = options.with_marker(marker);
        }
        let page = advanced.list(prefix, options).await?;
        if page.files.is_empty() {
            break;
        }

        let last_key = page.files.last().map(|f| f.key.clone());
        keys.extend(page.files.into_iter().map(|f| f.key));
        if !page.is_truncated {
            break;
        }

        let Some(next) = page.next_marker.or(last_key) else {
            break;
        };
        if previous.as_deref() == Some(next.as_str()) {
            return Err(Error::Storage(format!(
                "listing '{}' did not advance past marker '{}'",
                prefix, next
            )));
        }
        previous = Some(next.clone());
        marker = Some(next);
    }

    info!(prefix, count = keys.len(), "deleting by prefix");
    Ok(delete_batch(backend, keys, concurrency, cancel).await)
}
