//! Per-provider object reads for the tagging pipeline.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

use super::{LOCAL_PROVIDER, ObjectReader, repair_textual_bytes};
use crate::database::models::FileDbModel;
use crate::{Error, Result};

/// Which of a file's two keys is being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Thumbnail,
    Original,
}

impl KeyKind {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Thumbnail => "thumbnails/",
            Self::Original => "files/",
        }
    }
}

const LEGACY_PREFIXES: &[(&str, &str)] = &[
    ("uploads/thumbnails/", "thumbnails/"),
    ("uploads/files/", "files/"),
    ("uploads/images1/", "files/"),
];

/// Map a stored key onto the local layout (`files/…`, `thumbnails/…`).
///
/// Leading slashes are stripped, legacy `uploads/…` prefixes remapped, and the
/// kind's prefix added only when no layout prefix is present.
pub fn normalize_local_key(key: &str, kind: KeyKind) -> String {
    let key = key.trim().trim_start_matches('/');

    for (legacy, current) in LEGACY_PREFIXES {
        if let Some(rest) = key.strip_prefix(legacy) {
            return format!("{current}{}", rest.trim_start_matches('/'));
        }
    }

    if key.starts_with("files/") || key.starts_with("thumbnails/") {
        return key.to_string();
    }

    format!("{}{}", kind.prefix(), key)
}

/// Resolves a file's bytes across registered providers.
pub struct ObjectStoreGateway {
    readers: HashMap<String, Arc<dyn ObjectReader>>,
    fallback: Arc<dyn ObjectReader>,
}

impl ObjectStoreGateway {
    /// Gateway whose unknown providers fall back to `fallback`, also registered as `local`.
    pub fn new(fallback: Arc<dyn ObjectReader>) -> Self {
        let mut readers: HashMap<String, Arc<dyn ObjectReader>> = HashMap::new();
        readers.insert(LOCAL_PROVIDER.to_string(), fallback.clone());
        Self { readers, fallback }
    }

    pub fn register(&mut self, provider_id: impl Into<String>, reader: Arc<dyn ObjectReader>) {
        self.readers.insert(provider_id.into(), reader);
    }

    pub fn with_reader(
        mut self,
        provider_id: impl Into<String>,
        reader: Arc<dyn ObjectReader>,
    ) -> Self {
        self.register(provider_id, reader);
        self
    }

    fn reader_for(&self, provider_id: &str) -> &Arc<dyn ObjectReader> {
        if let Some(reader) = self.readers.get(provider_id) {
            return reader;
        }
        tracing::debug!(provider_id, "Unknown storage provider, using fallback reader");
        &self.fallback
    }

    /// Read one key. Empty payloads are reported as not found.
    pub async fn read(&self, provider_id: &str, key: &str, kind: KeyKind) -> Result<Bytes> {
        let reader = self.reader_for(provider_id);
        let key = if reader.uses_local_layout() {
            normalize_local_key(key, kind)
        } else {
            key.trim_start_matches('/').to_string()
        };

        let data = repair_textual_bytes(reader.read(&key).await?);
        if data.is_empty() {
            return Err(Error::object_not_found(provider_id, key));
        }
        Ok(data)
    }

    pub async fn read_base64(&self, provider_id: &str, key: &str, kind: KeyKind) -> Result<String> {
        let data = self.read(provider_id, key, kind).await?;
        Ok(BASE64.encode(&data))
    }

    /// Bytes for a file: thumbnail first, then the original.
    ///
    /// When both fail, a storage error other than not-found takes precedence so
    /// the caller retries instead of applying the missing-file policy.
    pub async fn read_file(&self, file: &FileDbModel) -> Result<Bytes> {
        let candidates = [
            (file.local_thumb_path.as_deref(), KeyKind::Thumbnail),
            (file.local_file_path.as_deref(), KeyKind::Original),
        ];

        let mut not_found: Option<Error> = None;
        let mut other: Option<Error> = None;

        for (key, kind) in candidates {
            let Some(key) = key.filter(|k| !k.trim().is_empty()) else {
                continue;
            };
            match self.read(&file.storage_provider_id, key, kind).await {
                Ok(data) => return Ok(data),
                Err(e) if e.is_object_not_found() => {
                    tracing::debug!(file_id = %file.id, key, ?kind, "Object missing, trying next key");
                    not_found.get_or_insert(e);
                }
                Err(e) => {
                    tracing::warn!(file_id = %file.id, key, error = %e, "Object read failed");
                    other.get_or_insert(e);
                }
            }
        }

        Err(other
            .or(not_found)
            .unwrap_or_else(|| Error::object_not_found(&file.storage_provider_id, "")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalObjectStore;
    use rstest::rstest;

    #[rstest]
    #[case("/files/a.png", KeyKind::Original, "files/a.png")]
    #[case("uploads/thumbnails/a.webp", KeyKind::Thumbnail, "thumbnails/a.webp")]
    #[case("uploads/files/2024/a.png", KeyKind::Original, "files/2024/a.png")]
    #[case("uploads/images1/a.png", KeyKind::Thumbnail, "files/a.png")]
    #[case("a.png", KeyKind::Thumbnail, "thumbnails/a.png")]
    #[case("a.png", KeyKind::Original, "files/a.png")]
    #[case("//thumbnails/a.png", KeyKind::Original, "thumbnails/a.png")]
    #[case("/uploads/files//a.png", KeyKind::Original, "files/a.png")]
    fn test_normalize_local_key(#[case] key: &str, #[case] kind: KeyKind, #[case] expected: &str) {
        assert_eq!(normalize_local_key(key, kind), expected);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for key in ["files/x.png", "thumbnails/x.png", "uploads/files/x.png", "x.png"] {
            let once = normalize_local_key(key, KeyKind::Original);
            assert_eq!(normalize_local_key(&once, KeyKind::Original), once);
        }
    }

    fn gateway_with(files: &[(&str, &[u8])]) -> (tempfile::TempDir, ObjectStoreGateway) {
        let dir = tempfile::tempdir().unwrap();
        for (key, data) in files {
            let path = dir.path().join(key);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        (dir, ObjectStoreGateway::new(store))
    }

    fn file_with(thumb: Option<&str>, original: Option<&str>) -> FileDbModel {
        let mut file = FileDbModel::new("f1", "u1");
        file.local_thumb_path = thumb.map(str::to_string);
        file.local_file_path = original.map(str::to_string);
        file
    }

    #[tokio::test]
    async fn test_thumbnail_preferred() {
        let (_dir, gateway) =
            gateway_with(&[("thumbnails/a.png", b"thumb"), ("files/a.png", b"orig")]);
        let data = gateway
            .read_file(&file_with(Some("a.png"), Some("a.png")))
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"thumb");
    }

    #[tokio::test]
    async fn test_empty_thumbnail_falls_back_to_original() {
        let (_dir, gateway) = gateway_with(&[("thumbnails/a.png", b""), ("files/a.png", b"orig")]);
        let data = gateway
            .read_file(&file_with(Some("a.png"), Some("uploads/files/a.png")))
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"orig");
    }

    #[tokio::test]
    async fn test_missing_everywhere_is_not_found() {
        let (_dir, gateway) = gateway_with(&[]);
        let err = gateway
            .read_file(&file_with(Some("a.png"), None))
            .await
            .unwrap_err();
        assert!(err.is_object_not_found());

        let err = gateway.read_file(&file_with(None, None)).await.unwrap_err();
        assert!(err.is_object_not_found());
    }

    #[tokio::test]
    async fn test_unknown_provider_uses_fallback_and_base64() {
        let (_dir, gateway) = gateway_with(&[("files/a.png", b"[104,105]")]);
        let encoded = gateway
            .read_base64("s3-eu", "a.png", KeyKind::Original)
            .await
            .unwrap();
        assert_eq!(encoded, BASE64.encode(b"hi"));
    }
}
