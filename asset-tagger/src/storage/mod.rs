//! Object storage access for the tagging pipeline.
//!
//! Providers plug in through [`ObjectReader`]; [`ObjectStoreGateway`] picks
//! the reader for a file, normalizes local keys, falls back from thumbnail to
//! original and repairs byte payloads that an adapter serialized as text.

mod gateway;
mod local;
mod repair;

pub use gateway::{KeyKind, ObjectStoreGateway, normalize_local_key};
pub use local::LocalObjectStore;
pub use repair::repair_textual_bytes;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// Provider id of the local filesystem store.
pub const LOCAL_PROVIDER: &str = "local";

/// Read access to one storage provider.
#[async_trait]
pub trait ObjectReader: Send + Sync {
    /// Bytes stored under `key`, or [`crate::Error::ObjectNotFound`].
    async fn read(&self, key: &str) -> Result<Bytes>;

    /// Whether keys for this provider follow the local `files/` / `thumbnails/` layout.
    fn uses_local_layout(&self) -> bool {
        false
    }
}

/// Image format guessed from magic bytes.
pub fn detect_format(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpeg")
    } else if bytes.starts_with(b"GIF8") {
        Some("gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("webp")
    } else if bytes.starts_with(b"BM") {
        Some("bmp")
    } else {
        None
    }
}
