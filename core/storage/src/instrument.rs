//! Logging decorator applied to every disk the manager constructs.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::provider::{
    require_advanced, AdvancedStorage, ByteStream, FileInfo, ListOptions, ListResult, Storage,
    UploadOptions, UploadResult,
};
use stowage_common::{Error, Result};

/// Storage decorator that times and logs every call.
///
/// Failures are wrapped in [`Error::Backend`] with the driver, operation and
/// key, so a log line or error message always says where it came from.
/// [`Error::kind`] still reports the backend's own category.
pub struct Instrumented {
    disk: String,
    inner: Arc<dyn Storage>,
}

impl Instrumented {
    pub fn new(disk: impl Into<String>, inner: Arc<dyn Storage>) -> Self {
        Self {
            disk: disk.into(),
            inner,
        }
    }

    /// Name of the disk this backend serves.
    pub fn disk(&self) -> &str {
        &self.disk
    }

    pub fn inner(&self) -> &Arc<dyn Storage> {
        &self.inner
    }

    fn finish<T>(
        &self,
        op: &'static str,
        key: &str,
        started: Instant,
        result: Result<T>,
    ) -> Result<T> {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let driver = self.inner.driver();
        match result {
            Ok(value) => {
                debug!(disk = %self.disk, driver, op, key, elapsed_ms, "storage call ok");
                Ok(value)
            }
            Err(err) => {
                warn!(disk = %self.disk, driver, op, key, elapsed_ms, error = %err, "storage call failed");
                Err(Error::backend(driver, op, key, err))
            }
        }
    }

    fn advanced_inner(&self) -> Result<&dyn AdvancedStorage> {
        require_advanced(self.inner.as_ref())
    }
}

#[async_trait]
impl Storage for Instrumented {
    fn driver(&self) -> &str {
        self.inner.driver()
    }

    async fn upload(
        &self,
        key: &str,
        data: ByteStream,
        options: UploadOptions,
    ) -> Result<UploadResult> {
        let started = Instant::now();
        let result = self.inner.upload(key, data, options).await;
        if let Ok(uploaded) = &result {
            debug!(disk = %self.disk, key, size = uploaded.size, "uploaded");
        }
        self.finish("upload", key, started, result)
    }

    async fn download(&self, key: &str) -> Result<ByteStream> {
        let started = Instant::now();
        let result = self.inner.download(key).await;
        self.finish("download", key, started, result)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.delete(key).await;
        self.finish("delete", key, started, result)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let started = Instant::now();
        let result = self.inner.exists(key).await;
        self.finish("exists", key, started, result)
    }

    async fn public_url(&self, key: &str) -> Result<String> {
        let started = Instant::now();
        let result = self.inner.public_url(key).await;
        self.finish("public_url", key, started, result)
    }

    async fn close(&self) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.close().await;
        self.finish("close", "", started, result)
    }

    fn advanced(&self) -> Option<&dyn AdvancedStorage> {
        // Only advertise what the wrapped backend can actually do.
        self.inner.advanced().map(|_| self as &dyn AdvancedStorage)
    }
}

#[async_trait]
impl AdvancedStorage for Instrumented {
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let started = Instant::now();
        let result = match self.advanced_inner() {
            Ok(inner) => inner.signed_url(key, ttl).await,
            Err(err) => Err(err),
        };
        self.finish("signed_url", key, started, result)
    }

    async fn list(&self, prefix: &str, options: ListOptions) -> Result<ListResult> {
        let started = Instant::now();
        let result = match self.advanced_inner() {
            Ok(inner) => inner.list(prefix, options).await,
            Err(err) => Err(err),
        };
        if let Ok(page) = &result {
            debug!(disk = %self.disk, prefix, count = page.files.len(), truncated = page.is_truncated, "listed");
        }
        self.finish("list", prefix, started, result)
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let started = Instant::now();
        let result = match self.advanced_inner() {
            Ok(inner) => inner.copy(src, dst).await,
            Err(err) => Err(err),
        };
        self.finish("copy", src, started, result)
    }

    async fn move_to(&self, src: &str, dst: &str) -> Result<()> {
        let started = Instant::now();
        let result = match self.advanced_inner() {
            Ok(inner) => inner.move_to(src, dst).await,
            Err(err) => Err(err),
        };
        self.finish("move", src, started, result)
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let started = Instant::now();
        let result = match self.advanced_inner() {
            Ok(inner) => inner.size(key).await,
            Err(err) => Err(err),
        };
        self.finish("size", key, started, result)
    }

    async fn metadata(&self, key: &str) -> Result<FileInfo> {
        let started = Instant::now();
        let result = match self.advanced_inner() {
            Ok(inner) => inner.metadata(key).await,
            Err(err) => Err(err),
        };
        self.finish("metadata", key, started, result)
    }
}
