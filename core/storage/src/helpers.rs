//! Convenience helpers shared by callers of any backend.

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{stream, StreamExt, TryStreamExt};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::provider::{ByteStream, Storage, UploadOptions, UploadResult};
use stowage_common::{Error, Result};

const OCTET_STREAM: &str = "application/octet-stream";

/// Detect a content type from a file name's extension.
///
/// Falls back to `application/octet-stream`.
pub fn detect_content_type(filename: impl AsRef<Path>) -> String {
    let ext = match filename.as_ref().extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => return OCTET_STREAM.to_string(),
    };

    // Types mime_guess reports differently or not at all.
    let common = match ext.as_str() {
        "md" => Some("text/markdown"),
        "yaml" | "yml" => Some("text/yaml"),
        "ts" | "tsx" => Some("text/typescript"),
        "vue" => Some("text/x-vue"),
        "go" => Some("text/x-go"),
        "rs" => Some("text/x-rust"),
        "webp" => Some("image/webp"),
        "avif" => Some("image/avif"),
        "heic" => Some("image/heic"),
        "heif" => Some("image/heif"),
        "woff" => Some("font/woff"),
        "woff2" => Some("font/woff2"),
        _ => None,
    };
    if let Some(ct) = common {
        return ct.to_string();
    }

    mime_guess::from_ext(&ext)
        .first_raw()
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default()
}

/// Unique key of the form `prefix/YYYY/MM/DD/<uuid>.<ext>`.
pub fn generate_key(prefix: &str, filename: &str) -> String {
    let mut parts = Vec::with_capacity(3);
    let prefix = prefix.trim_matches('/');
    if !prefix.is_empty() {
        parts.push(prefix.to_string());
    }
    parts.push(Utc::now().format("%Y/%m/%d").to_string());
    parts.push(format!("{}{}", Uuid::new_v4().simple(), extension_of(filename)));
    parts.join("/")
}

/// Unique key of the form `prefix/<uuid>.<ext>`, without date directories.
pub fn generate_key_flat(prefix: &str, filename: &str) -> String {
    let name = format!("{}{}", Uuid::new_v4().simple(), extension_of(filename));
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Single-chunk stream over in-memory data.
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(stream::once(async move { Ok(data) }))
}

/// Drain a stream into one buffer.
pub async fn collect_bytes(mut stream: ByteStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Stream a local file, reporting I/O errors through [`Error::Io`].
pub async fn file_stream(path: impl AsRef<Path>) -> Result<(ByteStream, u64)> {
    let file = fs::File::open(path.as_ref()).await?;
    let len = file.metadata().await?.len();
    let stream = ReaderStream::new(file).map_err(Error::from);
    Ok((Box::pin(stream), len))
}

/// Upload a local file, detecting the content type when none is given.
pub async fn upload_file(
    storage: &dyn Storage,
    key: &str,
    path: impl AsRef<Path>,
    mut options: UploadOptions,
) -> Result<UploadResult> {
    let path = path.as_ref();
    let (stream, len) = file_stream(path).await?;
    if options.content_type.is_none() {
        options.content_type = Some(detect_content_type(path));
    }
    if options.content_length.is_none() {
        options.content_length = Some(len);
    }
    storage.upload(key, stream, options).await
}

/// Download an object into a local file, creating parent directories.
///
/// Returns the number of bytes written.
pub async fn download_to_file(
    storage: &dyn Storage,
    key: &str,
    path: impl AsRef<Path>,
) -> Result<u64> {
    let path = path.as_ref();
    let mut stream = storage.download(key).await?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut file = fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use tempfile::TempDir;

    #[test]
    fn test_detect_content_type() {
        assert_eq!(detect_content_type("notes.md"), "text/markdown");
        assert_eq!(detect_content_type("config.YML"), "text/yaml");
        assert_eq!(detect_content_type("photo.png"), "image/png");
        assert_eq!(detect_content_type("index.html"), "text/html");
        assert_eq!(detect_content_type("archive"), OCTET_STREAM);
        assert_eq!(detect_content_type("blob.unknownext"), OCTET_STREAM);
    }

    #[test]
    fn test_generate_key_layout() {
        let key = generate_key("/avatars/", "me.JPG");
        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], "avatars");
        assert_eq!(parts[1].len(), 4);
        assert!(parts[4].ends_with(".JPG"));
        assert_ne!(generate_key("avatars", "me.jpg"), generate_key("avatars", "me.jpg"));
    }

    #[test]
    fn test_generate_key_flat() {
        let key = generate_key_flat("", "report.pdf");
        assert!(!key.contains('/'));
        assert!(key.ends_with(".pdf"));

        let key = generate_key_flat("docs", "noext");
        assert!(key.starts_with("docs/"));
        assert!(!key.contains('.'));
    }

    #[tokio::test]
    async fn test_upload_file_detects_content_type() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("page.html");
        std::fs::write(&src, b"<html></html>").unwrap();

        let storage = MemoryStorage::new();
        let result = upload_file(&storage, "site/page.html", &src, UploadOptions::new())
            .await
            .unwrap();
        assert_eq!(result.size, 13);

        let info = crate::AdvancedStorage::metadata(&storage, "site/page.html")
            .await
            .unwrap();
        assert_eq!(info.content_type.as_deref(), Some("text/html"));
    }

    #[tokio::test]
    async fn test_download_to_file_creates_parents() {
        let temp = TempDir::new().unwrap();
        let storage = MemoryStorage::new();
        storage
            .upload("a.txt", bytes_stream("hello"), UploadOptions::new())
            .await
            .unwrap();

        let dest = temp.path().join("nested/dir/a.txt");
        let written = download_to_file(&storage, "a.txt", &dest).await.unwrap();

        assert_eq!(written, 5);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_collect_bytes() {
        let data = collect_bytes(bytes_stream(vec![1u8, 2, 3])).await.unwrap();
        assert_eq!(&data[..], &[1, 2, 3]);
    }
}
