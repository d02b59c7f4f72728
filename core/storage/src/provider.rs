//! Storage capability contracts.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use stowage_common::{Error, Result};

/// Byte stream type for upload/download operations.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Progress callback: `(bytes_so_far, declared_total)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Default page size for [`AdvancedStorage::list`].
pub const DEFAULT_MAX_KEYS: usize = 1000;

/// Options accepted by [`Storage::upload`].
#[derive(Clone, Default)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    /// Access control hint, e.g. "public-read" or "private".
    pub acl: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Declared payload size, reported as the total to `progress`.
    pub content_length: Option<u64>,
    pub progress: Option<ProgressFn>,
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_disposition(mut self, disposition: impl Into<String>) -> Self {
        self.content_disposition = Some(disposition.into());
        self
    }

    pub fn with_acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = Some(acl.into());
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("content_type", &self.content_type)
            .field("content_disposition", &self.content_disposition)
            .field("acl", &self.acl)
            .field("metadata", &self.metadata)
            .field("content_length", &self.content_length)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub key: String,
    /// Public URL, when the backend has one.
    pub url: Option<String>,
    pub size: u64,
    pub etag: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Metadata for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
    /// ETag or checksum, backend specific.
    pub etag: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Listing options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
    /// Page size; 0 means [`DEFAULT_MAX_KEYS`].
    pub max_keys: usize,
    /// Return keys strictly after this one.
    pub marker: Option<String>,
    /// Skip keys that contain the delimiter after the prefix.
    pub delimiter: Option<String>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            max_keys: DEFAULT_MAX_KEYS,
            marker: None,
            delimiter: None,
        }
    }
}

impl ListOptions {
    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListResult {
    pub files: Vec<FileInfo>,
    /// Cursor for the next page.
    pub next_marker: Option<String>,
    pub is_truncated: bool,
}

/// Storage capability contract every backend implements.
///
/// Backends must be safe for concurrent use; batch workers share one
/// instance.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Driver name (e.g., "local", "memory", "s3").
    fn driver(&self) -> &str;

    /// Upload a stream under `key`, replacing any existing object.
    async fn upload(&self, key: &str, data: ByteStream, options: UploadOptions)
        -> Result<UploadResult>;

    /// Download an object.
    ///
    /// # Errors
    /// - `NotFound` if the key is absent
    async fn download(&self, key: &str) -> Result<ByteStream>;

    /// Delete an object. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if an object exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Public URL of an object; fails if the backend has no such concept.
    async fn public_url(&self, key: &str) -> Result<String>;

    /// Release backend resources. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Capability query for the extended contract.
    fn advanced(&self) -> Option<&dyn AdvancedStorage> {
        None
    }
}

/// Optional extended contract, discovered through [`Storage::advanced`].
#[async_trait]
pub trait AdvancedStorage: Storage {
    /// Pre-signed URL valid for `ttl`.
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String>;

    /// List objects under `prefix`, one page at a time.
    async fn list(&self, prefix: &str, options: ListOptions) -> Result<ListResult>;

    async fn copy(&self, src: &str, dst: &str) -> Result<()>;

    /// Move an object. Copy-then-delete unless the backend has an atomic
    /// primitive.
    async fn move_to(&self, src: &str, dst: &str) -> Result<()> {
        self.copy(src, dst).await?;
        self.delete(src).await
    }

    async fn size(&self, key: &str) -> Result<u64>;

    async fn metadata(&self, key: &str) -> Result<FileInfo>;
}

/// Extended contract of `storage`, or `NotImplemented`.
pub fn require_advanced(storage: &dyn Storage) -> Result<&dyn AdvancedStorage> {
    storage.advanced().ok_or_else(|| {
        Error::NotImplemented(format!(
            "driver '{}' does not support advanced operations",
            storage.driver()
        ))
    })
}

/// Cut one listing page out of `entries`, which must be sorted by key.
///
/// Shared by the built-in backends so marker, delimiter and truncation
/// behave the same everywhere.
pub fn paginate<I>(entries: I, prefix: &str, options: &ListOptions) -> ListResult
where
    I: IntoIterator<Item = FileInfo>,
{
    let max_keys = if options.max_keys == 0 {
        DEFAULT_MAX_KEYS
    } else {
        options.max_keys
    };
    let delimiter = options.delimiter.as_deref().filter(|d| !d.is_empty());

    let mut files = Vec::new();
    let mut is_truncated = false;
    for info in entries {
        if !info.key.starts_with(prefix) {
            continue;
        }
        if let Some(marker) = options.marker.as_deref() {
            if info.key.as_str() <= marker {
                continue;
            }
        }
        if let Some(delimiter) = delimiter {
            if info.key[prefix.len()..].contains(delimiter) {
                continue;
            }
        }
        if files.len() == max_keys {
            is_truncated = true;
            break;
        }
        files.push(info);
    }

    let next_marker = if is_truncated {
        files.last().map(|f| f.key.clone())
    } else {
        None
    };

    ListResult {
        files,
        next_marker,
        is_truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(key: &str) -> FileInfo {
        FileInfo {
            key: key.to_string(),
            size: 1,
            last_modified: None,
            content_type: None,
            etag: None,
            metadata: HashMap::new(),
        }
    }

    fn keys(result: &ListResult) -> Vec<&str> {
        result.files.iter().map(|f| f.key.as_str()).collect()
    }

    #[test]
    fn test_paginate_truncates_and_sets_marker() {
        let entries = vec![info("a/1"), info("a/2"), info("a/3"), info("b/1")];
        let page = paginate(entries, "a/", &ListOptions::default().with_max_keys(2));

        assert_eq!(keys(&page), vec!["a/1", "a/2"]);
        assert!(page.is_truncated);
        assert_eq!(page.next_marker.as_deref(), Some("a/2"));
    }

    #[test]
    fn test_paginate_resumes_after_marker() {
        let entries = vec![info("a/1"), info("a/2"), info("a/3")];
        let page = paginate(
            entries,
            "a/",
            &ListOptions::default().with_max_keys(2).with_marker("a/2"),
        );

        assert_eq!(keys(&page), vec!["a/3"]);
        assert!(!page.is_truncated);
        assert_eq!(page.next_marker, None);
    }

    #[test]
    fn test_paginate_exact_page_is_not_truncated() {
        let entries = vec![info("x"), info("y")];
        let page = paginate(entries, "", &ListOptions::default().with_max_keys(2));
        assert_eq!(page.files.len(), 2);
        assert!(!page.is_truncated);
    }

    #[test]
    fn test_paginate_delimiter_skips_nested() {
        let entries = vec![info("d/a.txt"), info("d/sub/b.txt"), info("d/z.txt")];
        let page = paginate(entries, "d/", &ListOptions::default().with_delimiter("/"));
        assert_eq!(keys(&page), vec!["d/a.txt", "d/z.txt"]);
    }

    #[test]
    fn test_upload_options_debug_hides_callback() {
        let opts = UploadOptions::new()
            .with_content_type("text/plain")
            .with_progress(|_, _| {});
        let debug = format!("{:?}", opts);
        assert!(debug.contains("text/plain"));
        assert!(debug.contains("progress: true"));
    }

    #[test]
    fn test_file_info_serialization() {
        let metadata = FileInfo {
            key: "docs/a.txt".to_string(),
            size: 1024,
            last_modified: Some(Utc::now()),
            content_type: Some("text/plain".to_string()),
            etag: Some("abc123".to_string()),
            metadata: HashMap::new(),
        };

        let json = serde_json::to_string(&metadata).unwrap();
        let deserialized: FileInfo = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized, metadata);
    }
}
