//! Local filesystem storage backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

use crate::helpers::detect_content_type;
use crate::progress::track_upload;
use crate::provider::{
    paginate, AdvancedStorage, ByteStream, FileInfo, ListOptions, ListResult, Storage,
    UploadOptions, UploadResult,
};
use crate::registry::Options;
use stowage_common::{Error, ObjectKey, Result};

/// Characters escaped inside one URL path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Local filesystem storage backend.
///
/// Objects are plain files under `root`; `/` in keys maps to directories.
pub struct LocalStorage {
    root: PathBuf,
    base_url: Option<String>,
    perm: Option<u32>,
    closed: AtomicBool,
}

/// Driver factory for `local`.
///
/// Options:
/// - `root` (required): directory holding the objects; `~` expands to the
///   home directory; created if missing
/// - `base_url` (optional): prefix for public URLs
/// - `perm` (optional): unix mode for new files, as an integer or an octal
///   string such as `"0640"`
pub fn open(options: &Options) -> Result<Arc<dyn Storage>> {
    let root = options
        .get("root")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidArgument("local: 'root' is required".to_string()))?;

    let mut storage = LocalStorage::new(expand_home(root)?)?;

    if let Some(base_url) = options.get("base_url").and_then(|v| v.as_str()) {
        storage = storage.with_base_url(base_url)?;
    }

    match options.get("perm") {
        None | Some(serde_json::Value::Null) => {}
        Some(serde_json::Value::Number(n)) => {
            let mode = n
                .as_u64()
                .and_then(|m| u32::try_from(m).ok())
                .ok_or_else(|| Error::InvalidArgument(format!("local: invalid perm {}", n)))?;
            storage = storage.with_perm(mode);
        }
        Some(serde_json::Value::String(s)) => {
            let mode = u32::from_str_radix(s.trim_start_matches("0o"), 8)
                .map_err(|_| Error::InvalidArgument(format!("local: invalid perm '{}'", s)))?;
            storage = storage.with_perm(mode);
        }
        Some(other) => {
            return Err(Error::InvalidArgument(format!(
                "local: invalid perm {}",
                other
            )))
        }
    }

    Ok(Arc::new(storage))
}

fn expand_home(root: &str) -> Result<PathBuf> {
    let rest = match root.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return Ok(PathBuf::from(root)),
    };
    let home = dirs::home_dir().ok_or_else(|| {
        Error::InvalidArgument("local: cannot resolve home directory".to_string())
    })?;
    Ok(home.join(rest))
}

/// Map an I/O error onto the key-level taxonomy.
fn map_io(err: std::io::Error, key: &ObjectKey) -> Error {
    match err.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(key.to_string()),
        std::io::ErrorKind::PermissionDenied => Error::PermissionDenied(key.to_string()),
        _ => Error::Io(err),
    }
}

impl LocalStorage {
    /// Create a new local backend rooted at `root`.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied or other I/O failure creating the root
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Sync on purpose: factories are synchronous.
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self {
            root,
            base_url: None,
            perm: None,
            closed: AtomicBool::new(false),
        })
    }

    /// Serve public URLs under `base_url`.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        Url::parse(base_url).map_err(|e| {
            Error::InvalidArgument(format!("local: invalid base_url '{}': {}", base_url, e))
        })?;
        self.base_url = Some(base_url.trim_end_matches('/').to_string());
        Ok(self)
    }

    /// Unix permission bits applied to uploaded files.
    pub fn with_perm(mut self, mode: u32) -> Self {
        self.perm = Some(mode);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Convert a key to a filesystem path under the root.
    fn to_fs_path(&self, key: &ObjectKey) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.segments() {
            path.push(segment);
        }
        path
    }

    fn url_for(&self, key: &ObjectKey) -> Option<String> {
        self.base_url.as_ref().map(|base| {
            let encoded: Vec<String> = key
                .segments()
                .map(|s| utf8_percent_encode(s, SEGMENT).to_string())
                .collect();
            format!("{}/{}", base, encoded.join("/"))
        })
    }

    /// Metadata of a regular file, `NotFound` for anything else.
    async fn file_metadata(&self, key: &ObjectKey) -> Result<std::fs::Metadata> {
        let meta = fs::metadata(self.to_fs_path(key))
            .await
            .map_err(|e| map_io(e, key))?;
        if !meta.is_file() {
            return Err(Error::NotFound(key.to_string()));
        }
        Ok(meta)
    }

    /// Create a FileInfo from filesystem metadata.
    fn create_file_info(&self, key: &str, meta: &std::fs::Metadata) -> FileInfo {
        let modified: Option<DateTime<Utc>> = meta.modified().ok().map(|t| t.into());
        let etag = modified.map(|m| format!("{:x}-{:x}", m.timestamp(), meta.len()));

        FileInfo {
            key: key.to_string(),
            size: meta.len(),
            last_modified: modified,
            content_type: Some(detect_content_type(key)),
            etag,
            metadata: Default::default(),
        }
    }

    async fn write_stream(&self, path: &Path, mut data: ByteStream) -> Result<u64> {
        let mut file = fs::File::create(path).await?;
        let mut size = 0u64;
        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;

        #[cfg(unix)]
        if let Some(mode) = self.perm {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        }

        Ok(size)
    }

    /// Every regular file whose key starts with `prefix`, sorted by key.
    async fn walk(&self, prefix: &str) -> Result<Vec<FileInfo>> {
        let start_dir = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let mut start = self.root.clone();
        let mut segments = Vec::new();
        for segment in start_dir.split('/').filter(|s| !s.is_empty()) {
            if segment == ".." || segment == "." {
                return Err(Error::InvalidKey(prefix.to_string()));
            }
            start.push(segment);
            segments.push(segment);
        }

        let mut files = Vec::new();
        let mut pending = vec![(start, segments.join("/"))];

        while let Some((dir, dir_key)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = match entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(_) => continue,
                };
                let key = if dir_key.is_empty() {
                    name
                } else {
                    format!("{}/{}", dir_key, name)
                };

                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    let dir_prefix = format!("{}/", key);
                    if dir_prefix.starts_with(prefix) || prefix.starts_with(&dir_prefix) {
                        pending.push((entry.path(), key));
                    }
                } else if meta.is_file() && key.starts_with(prefix) {
                    files.push(self.create_file_info(&key, &meta));
                }
            }
        }

        files.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(files)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn driver(&self) -> &str {
        "local"
    }

    async fn upload(
        &self,
        key: &str,
        data: ByteStream,
        options: UploadOptions,
    ) -> Result<UploadResult> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;
        let path = self.to_fs_path(&key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(e, &key))?;
        }

        let size = match self.write_stream(&path, track_upload(data, &options)).await {
            Ok(size) => size,
            Err(err) => {
                // Do not leave a truncated object behind.
                let _ = fs::remove_file(&path).await;
                return Err(err);
            }
        };

        let meta = fs::metadata(&path).await.map_err(|e| map_io(e, &key))?;
        let info = self.create_file_info(key.as_str(), &meta);
        debug!(key = %key, size, "local upload complete");

        Ok(UploadResult {
            key: key.to_string(),
            url: self.url_for(&key),
            size,
            etag: info.etag,
            metadata: options.metadata,
        })
    }

    async fn download(&self, key: &str) -> Result<ByteStream> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;
        self.file_metadata(&key).await?;

        let file = fs::File::open(self.to_fs_path(&key))
            .await
            .map_err(|e| map_io(e, &key))?;
        let stream = ReaderStream::new(file).map(|chunk| chunk.map_err(Error::from));
        Ok(Box::pin(stream))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;
        let path = self.to_fs_path(&key);

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            // Directories are not objects; nothing to delete.
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(map_io(e, &key)),
        }

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(e, &key)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;
        match self.file_metadata(&key).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn public_url(&self, key: &str) -> Result<String> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;
        self.url_for(&key).ok_or_else(|| {
            Error::NotImplemented("local: base_url not configured".to_string())
        })
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
impl AdvancedStorage for LocalStorage {
    /// Files on local disk have no signing; the public URL is returned.
    async fn signed_url(&self, key: &str, _ttl: Duration) -> Result<String> {
        self.public_url(key).await
    }

    async fn list(&self, prefix: &str, options: ListOptions) -> Result<ListResult> {
        self.ensure_open()?;
        let prefix = prefix.trim_start_matches('/');
        let files = self.walk(prefix).await?;
        Ok(paginate(files, prefix, &options))
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        self.ensure_open()?;
        let src = ObjectKey::parse(src)?;
        let dst = ObjectKey::parse(dst)?;
        self.file_metadata(&src).await?;

        let dst_path = self.to_fs_path(&dst);
        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(e, &dst))?;
        }
        fs::copy(self.to_fs_path(&src), &dst_path)
            .await
            .map_err(|e| map_io(e, &src))?;
        Ok(())
    }

    async fn move_to(&self, src: &str, dst: &str) -> Result<()> {
        self.ensure_open()?;
        let src = ObjectKey::parse(src)?;
        let dst = ObjectKey::parse(dst)?;
        self.file_metadata(&src).await?;

        let dst_path = self.to_fs_path(&dst);
        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(e, &dst))?;
        }
        fs::rename(self.to_fs_path(&src), &dst_path)
            .await
            .map_err(|e| map_io(e, &src))?;
        Ok(())
    }

    async fn size(&self, key: &str) -> Result<u64> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;
        Ok(self.file_metadata(&key).await?.len())
    }

    async fn metadata(&self, key: &str) -> Result<FileInfo> {
        self.ensure_open()?;
        let key = ObjectKey::parse(key)?;
        let meta = self.file_metadata(&key).await?;
        Ok(self.create_file_info(key.as_str(), &meta))
    }
}
