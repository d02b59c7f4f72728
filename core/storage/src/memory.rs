//! In-memory storage backend.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::helpers::{bytes_stream, collect_bytes, detect_content_type};
use crate::progress::track_upload;
use crate::provider::{
    paginate, AdvancedStorage, ByteStream, FileInfo, ListOptions, ListResult, Storage,
    UploadOptions, UploadResult,
};
use crate::registry::Options;
use stowage_common::{Error, ObjectKey, Result};

/// In-memory storage entry.
#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    info: FileInfo,
}

/// In-memory storage backend.
///
/// Useful for tests and scratch disks. Objects are kept in key order, so
/// listings paginate the same way an object store would. All data is lost
/// on drop.
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, Entry>>,
    base_url: Option<String>,
    closed: AtomicBool,
}

/// Driver factory for `memory`.
///
/// Options: `base_url` (optional) enables public and signed URLs.
pub fn open(options: &Options) -> Result<Arc<dyn Storage>> {
    let mut storage = MemoryStorage::new();
    if let Some(base) = options.get("base_url").and_then(|v| v.as_str()) {
        storage = storage.with_base_url(base);
    }
    Ok(Arc::new(storage))
}

impl MemoryStorage {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            base_url: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Serve public URLs under `base_url`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn entry(&self, key: &ObjectKey) -> Result<Entry> {
        self.objects
            .read()
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn driver(&self) -> &str {
        "memory"
    }

    async fn upload(
        &self,
        key: &str,
        data: ByteStream,
        options: UploadOptions,
    ) -> Result<UploadResult> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;

        let data = collect_bytes(track_upload(data, &options)).await?;
        let etag = Uuid::new_v4().simple().to_string();
        let info = FileInfo {
            key: key.to_string(),
            size: data.len() as u64,
            last_modified: Some(Utc::now()),
            content_type: Some(
                options
                    .content_type
                    .clone()
                    .unwrap_or_else(|| detect_content_type(key.file_name())),
            ),
            etag: Some(etag.clone()),
            metadata: options.metadata.clone(),
        };

        self.objects
            .write()
            .insert(key.to_string(), Entry { data, info: info.clone() });

        Ok(UploadResult {
            url: self.base_url.as_ref().map(|base| format!("{}/{}", base, key)),
            key: info.key,
            size: info.size,
            etag: Some(etag),
            metadata: info.metadata,
        })
    }

    async fn download(&self, key: &str) -> Result<ByteStream> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;
        Ok(bytes_stream(self.entry(&key)?.data))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;
        self.objects.write().remove(key.as_str());
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;
        Ok(self.objects.read().contains_key(key.as_str()))
    }

    async fn public_url(&self, key: &str) -> Result<String> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;
        match &self.base_url {
            Some(base) => Ok(format!("{}/{}", base, key)),
            None => Err(Error::NotImplemented(
                "memory: base_url not configured".to_string(),
            )),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn advanced(&self) -> Option<&dyn AdvancedStorage> {
        Some(self)
    }
}

#[async_trait]
impl AdvancedStorage for MemoryStorage {
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let url = self.public_url(key).await?;
        let expires = i64::try_from(ttl.as_secs())
            .ok()
            .and_then(|secs| Utc::now().timestamp().checked_add(secs))
            .ok_or_else(|| {
                Error::InvalidArgument(format!("signed URL ttl out of range: {:?}", ttl))
            })?;
        Ok(format!("{}?expires={}", url, expires))
    }

    async fn list(&self, prefix: &str, options: ListOptions) -> Result<ListResult> {
        self.ensure_open()?;
        let objects = self.objects.read();
        let entries = objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, entry)| entry.info.clone());
        Ok(paginate(entries, prefix, &options))
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        self.ensure_open()?;
        let src = ObjectKey::parse(src)?;
        let dst = ObjectKey::parse(dst)?;

        let mut entry = self.entry(&src)?;
        entry.info.key = dst.to_string();
        entry.info.last_modified = Some(Utc::now());
        entry.info.etag = Some(Uuid::new_v4().simple().to_string());
        self.objects.write().insert(dst.to_string(), entry);
        Ok(())
    }

    async fn move_to(&self, src: &str, dst: &str) -> Result<()> {
        self.ensure_open()?;
        let src = ObjectKey::parse(src)?;
        let dst = ObjectKey::parse(dst)?;

        let mut objects = self.objects.write();
        let mut entry = objects
            .remove(src.as_str())
            .ok_or_else(|| Error::NotFound(src.to_string()))?;
        entry.info.key = dst.to_string();
        objects.insert(dst.to_string(), entry);
        Ok(())
    }

    async fn size(&self, key: &str) -> Result<u64> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;
        Ok(self.entry(&key)?.info.size)
    }

    async fn metadata(&self, key: &str) -> Result<FileInfo> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;
        Ok(self.entry(&key)?.info)
    }
}
