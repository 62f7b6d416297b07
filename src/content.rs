//! Image content helpers

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{Error, Result};
use crate::protocol::Content;

/// Guess an image MIME type from its leading bytes
pub fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some("image/png"),
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some("image/gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        _ => None,
    }
}

impl Content {
    /// Base64-encode raw image bytes into an image block
    pub fn image_from_bytes(bytes: &[u8]) -> Result<Content> {
        let mime_type = sniff_image_mime(bytes).ok_or_else(|| {
            Error::InvalidDefinition("Unrecognized image format".to_string())
        })?;
        Ok(Content::Image {
            data: STANDARD.encode(bytes),
            mime_type: mime_type.to_string(),
        })
    }

    /// Read an image file into an image block
    pub async fn image_from_path(path: impl AsRef<std::path::Path>) -> Result<Content> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            Error::Internal(format!("Failed to read image {}: {}", path.display(), e))
        })?;
        Content::image_from_bytes(&bytes)
    }
}
