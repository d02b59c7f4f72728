//! Process-wide default manager and the fluent [`Disk`] handle.

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::ResolvedConfig;
use crate::manager::Manager;
use stowage_common::{Error, Result};
use stowage_storage::{
    bytes_stream, collect_bytes, require_advanced, ByteStream, FileInfo, ListOptions, ListResult,
    Storage, UploadOptions, UploadResult,
};

static DEFAULT: Lazy<DefaultManager> = Lazy::new(DefaultManager::new);

/// Holder for a replaceable [`Manager`].
///
/// Readers get a snapshot `Arc`, so replacing the manager never disturbs
/// calls already in flight.
pub struct DefaultManager {
    current: RwLock<Option<Arc<Manager>>>,
}

impl DefaultManager {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    /// The process-wide holder used by the free functions of this module.
    pub fn global() -> &'static DefaultManager {
        &DEFAULT
    }

    /// Install `manager`, returning the one it replaces.
    ///
    /// The replaced manager is not closed; its backends stay usable by
    /// whoever still holds them.
    pub fn install(&self, manager: Manager) -> Option<Arc<Manager>> {
        let previous = self.current.write().replace(Arc::new(manager));
        info!(replaced = previous.is_some(), "default storage manager installed");
        previous
    }

    /// Current manager.
    ///
    /// # Errors
    /// - `NotInitialized` before the first [`DefaultManager::install`]
    pub fn current(&self) -> Result<Arc<Manager>> {
        self.current.read().clone().ok_or(Error::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.current.read().is_some()
    }

    /// Remove the current manager and close its disks.
    pub async fn teardown(&self) -> Result<()> {
        let previous = self.current.write().take();
        match previous {
            Some(manager) => manager.close().await,
            None => Ok(()),
        }
    }

    /// Handle on a disk of whichever manager is current when it is used.
    pub fn disk(&self, name: impl Into<String>) -> Disk<'_> {
        Disk {
            holder: self,
            name: name.into(),
        }
    }
}

impl Default for DefaultManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy handle on a named disk.
///
/// Nothing is resolved until an operation runs; every call goes through
/// the holder's current manager, so a handle survives re-setup.
pub struct Disk<'a> {
    holder: &'a DefaultManager,
    name: String,
}

impl Disk<'_> {
    /// Disk name; empty means the default disk.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve the backend, e.g. to query [`Storage::advanced`] directly.
    pub fn storage(&self) -> Result<Arc<dyn Storage>> {
        self.holder.current()?.disk(&self.name)
    }

    pub async fn put(
        &self,
        key: &str,
        data: ByteStream,
        options: UploadOptions,
    ) -> Result<UploadResult> {
        self.storage()?.upload(key, data, options).await
    }

    pub async fn put_bytes(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        mut options: UploadOptions,
    ) -> Result<UploadResult> {
        let data = data.into();
        if options.content_length.is_none() {
            options.content_length = Some(data.len() as u64);
        }
        self.put(key, bytes_stream(data), options).await
    }

    pub async fn put_string(
        &self,
        key: &str,
        content: impl Into<String>,
        options: UploadOptions,
    ) -> Result<UploadResult> {
        self.put_bytes(key, content.into(), options).await
    }

    /// Upload a local file; the content type is detected from the file
    /// name unless `options` sets one.
    pub async fn put_file(
        &self,
        key: &str,
        path: impl AsRef<Path>,
        options: UploadOptions,
    ) -> Result<UploadResult> {
        let storage = self.storage()?;
        stowage_storage::upload_file(storage.as_ref(), key, path, options).await
    }

    pub async fn get(&self, key: &str) -> Result<ByteStream> {
        self.storage()?.download(key).await
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Bytes> {
        collect_bytes(self.get(key).await?).await
    }

    pub async fn get_string(&self, key: &str) -> Result<String> {
        let data = self.get_bytes(key).await?;
        String::from_utf8(data.to_vec())
            .map_err(|_| Error::Storage(format!("object '{}' is not valid UTF-8", key)))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.storage()?.delete(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.storage()?.exists(key).await
    }

    pub async fn url(&self, key: &str) -> Result<String> {
        self.storage()?.public_url(key).await
    }

    /// Download into a local file. Returns the number of bytes written.
    pub async fn download_to_file(&self, key: &str, path: impl AsRef<Path>) -> Result<u64> {
        let storage = self.storage()?;
        stowage_storage::download_to_file(storage.as_ref(), key, path).await
    }

    // Extended operations; `NotImplemented` on basic backends.

    pub async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let storage = self.storage()?;
        require_advanced(storage.as_ref())?.signed_url(key, ttl).await
    }

    pub async fn list(&self, prefix: &str, options: ListOptions) -> Result<ListResult> {
        let storage = self.storage()?;
        require_advanced(storage.as_ref())?.list(prefix, options).await
    }

    pub async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let storage = self.storage()?;
        require_advanced(storage.as_ref())?.copy(src, dst).await
    }

    pub async fn move_to(&self, src: &str, dst: &str) -> Result<()> {
        let storage = self.storage()?;
        require_advanced(storage.as_ref())?.move_to(src, dst).await
    }

    pub async fn size(&self, key: &str) -> Result<u64> {
        let storage = self.storage()?;
        require_advanced(storage.as_ref())?.size(key).await
    }

    pub async fn metadata(&self, key: &str) -> Result<FileInfo> {
        let storage = self.storage()?;
        require_advanced(storage.as_ref())?.metadata(key).await
    }
}

/// Install a manager for `config` as the process-wide default.
///
/// Returns the manager it replaces, which the caller may close.
pub fn setup_config(config: ResolvedConfig) -> Option<Arc<Manager>> {
    DefaultManager::global().install(Manager::new(config))
}

/// Set up the default manager from an already-parsed tree, e.g. a section
/// taken from another configuration library.
pub fn setup(value: &Value) -> Result<Option<Arc<Manager>>> {
    Ok(setup_config(ResolvedConfig::from_value(value)?))
}

/// Set up the default manager from a storage config file.
pub fn init(path: impl AsRef<Path>) -> Result<Option<Arc<Manager>>> {
    Ok(setup_config(ResolvedConfig::load(path)?))
}

/// Set up the default manager from the section at `key_path` of an
/// application config file.
pub fn init_embedded(path: impl AsRef<Path>, key_path: &str) -> Result<Option<Arc<Manager>>> {
    Ok(setup_config(ResolvedConfig::load_embedded_with_key(
        path, key_path,
    )?))
}

/// Close and remove the process-wide default manager.
pub async fn teardown() -> Result<()> {
    DefaultManager::global().teardown().await
}

/// The process-wide default manager.
pub fn manager() -> Result<Arc<Manager>> {
    DefaultManager::global().current()
}

/// Handle on a disk of the default manager; `""` selects the default disk.
pub fn disk(name: impl Into<String>) -> Disk<'static> {
    DefaultManager::global().disk(name)
}

pub fn default_disk() -> Disk<'static> {
    disk("")
}

pub async fn put(key: &str, data: ByteStream, options: UploadOptions) -> Result<UploadResult> {
    default_disk().put(key, data, options).await
}

pub async fn get(key: &str) -> Result<ByteStream> {
    default_disk().get(key).await
}

pub async fn delete(key: &str) -> Result<()> {
    default_disk().delete(key).await
}

pub async fn exists(key: &str) -> Result<bool> {
    default_disk().exists(key).await
}

pub async fn url(key: &str) -> Result<String> {
    default_disk().url(key).await
}

pub async fn put_bytes(
    key: &str,
    data: impl Into<Bytes>,
    options: UploadOptions,
) -> Result<UploadResult> {
    default_disk().put_bytes(key, data, options).await
}

pub async fn put_string(
    key: &str,
    content: impl Into<String>,
    options: UploadOptions,
) -> Result<UploadResult> {
    default_disk().put_string(key, content, options).await
}

pub async fn put_file(
    key: &str,
    path: impl AsRef<Path>,
    options: UploadOptions,
) -> Result<UploadResult> {
    default_disk().put_file(key, path, options).await
}

pub async fn get_bytes(key: &str) -> Result<Bytes> {
    default_disk().get_bytes(key).await
}

pub async fn get_string(key: &str) -> Result<String> {
    default_disk().get_string(key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskConfig;
    use serde_json::json;
    use stowage_common::ErrorKind;
    use stowage_storage::DriverRegistry;
    use tempfile::TempDir;

    fn memory_manager() -> Manager {
        let config = ResolvedConfig::new("mem")
            .with_disk("mem", DiskConfig::new("memory"))
            .with_disk(
                "public",
                DiskConfig::new("memory").with_option("base_url", "https://cdn.example.com"),
            );
        Manager::with_registry(config, Arc::new(DriverRegistry::with_builtin_drivers()))
    }

    #[tokio::test]
    async fn test_uninitialized_holder() {
        let holder = DefaultManager::new();
        assert!(!holder.is_initialized());

        let err = holder.current().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);

        let err = holder.disk("").exists("a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);

        holder.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disk_handle_round_trip() {
        let holder = DefaultManager::new();
        assert!(holder.install(memory_manager()).is_none());

        let disk = holder.disk("");
        disk.put_string("notes/a.txt", "hello", UploadOptions::new())
            .await
            .unwrap();
        assert!(disk.exists("notes/a.txt").await.unwrap());
        assert_eq!(disk.get_string("notes/a.txt").await.unwrap(), "hello");
        assert_eq!(disk.size("notes/a.txt").await.unwrap(), 5);

        disk.copy("notes/a.txt", "notes/b.txt").await.unwrap();
        disk.move_to("notes/b.txt", "archive/b.txt").await.unwrap();
        let page = disk.list("", ListOptions::default()).await.unwrap();
        let keys: Vec<_> = page.files.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["archive/b.txt", "notes/a.txt"]);

        disk.delete("notes/a.txt").await.unwrap();
        let err = disk.get_bytes("notes/a.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_named_disk_urls() {
        let holder = DefaultManager::new();
        holder.install(memory_manager());

        let public = holder.disk("public");
        assert_eq!(public.name(), "public");
        public
            .put_bytes("img/logo.png", vec![1u8, 2, 3], UploadOptions::new())
            .await
            .unwrap();
        assert_eq!(
            public.url("img/logo.png").await.unwrap(),
            "https://cdn.example.com/img/logo.png"
        );

        let err = holder.disk("mem").url("img/logo.png").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);

        let err = holder.disk("nope").exists("x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiskNotConfigured);
    }

    #[tokio::test]
    async fn test_put_file_and_download_to_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("report.json");
        std::fs::write(&src, br#"{"ok":true}"#).unwrap();

        let holder = DefaultManager::new();
        holder.install(memory_manager());
        let disk = holder.disk("mem");

        disk.put_file("reports/r.json", &src, UploadOptions::new())
            .await
            .unwrap();
        let info = disk.metadata("reports/r.json").await.unwrap();
        assert_eq!(info.content_type.as_deref(), Some("application/json"));

        let dest = temp.path().join("out/r.json");
        assert_eq!(disk.download_to_file("reports/r.json", &dest).await.unwrap(), 11);
        assert_eq!(std::fs::read(&dest).unwrap(), br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_install_replaces_and_teardown_closes() {
        let holder = DefaultManager::new();
        holder.install(memory_manager());
        let handle = holder.disk("");
        handle
            .put_string("k", "v1", UploadOptions::new())
            .await
            .unwrap();
        let old_backend = handle.storage().unwrap();

        let previous = holder.install(memory_manager());
        assert!(previous.is_some());
        // Same handle, new manager, fresh backend.
        assert!(!handle.exists("k").await.unwrap());

        holder.teardown().await.unwrap();
        assert!(!holder.is_initialized());
        assert!(old_backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_process_wide_setup() {
        let temp = TempDir::new().unwrap();
        let value = json!({
            "default": "files",
            "disks": {
                "files": { "driver": "local", "root": temp.path() }
            }
        });
        setup(&value).unwrap();

        put_string("hello.txt", "world", UploadOptions::new())
            .await
            .unwrap();
        assert!(exists("hello.txt").await.unwrap());
        assert_eq!(get_string("hello.txt").await.unwrap(), "world");
        assert_eq!(get_bytes("hello.txt").await.unwrap().len(), 5);
        assert!(temp.path().join("hello.txt").is_file());
        assert_eq!(manager().unwrap().config().default, "files");

        delete("hello.txt").await.unwrap();
        assert!(!disk("files").exists("hello.txt").await.unwrap());

        teardown().await.unwrap();
        let err = exists("hello.txt").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }
}
