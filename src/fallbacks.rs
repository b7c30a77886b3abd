use bytes::Bytes;
use std::path::Path;
use tracing::{debug, info};

/// 1x1 transparent GIF served when no fallback JPEG is configured or the
/// configured one cannot be read.
pub const PLACEHOLDER_GIF: [u8; 42] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x01, 0x44, 0x00, 0x3b,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackImage {
    Configured(Bytes),
    Placeholder,
}

impl FallbackImage {
    pub fn content_type(&self) -> &'static str {
        match self {
            FallbackImage::Configured(_) => "image/jpeg",
            FallbackImage::Placeholder => "image/gif",
        }
    }

    pub fn bytes(&self) -> Bytes {
        match self {
            FallbackImage::Configured(bytes) => bytes.clone(),
            FallbackImage::Placeholder => Bytes::from_static(&PLACEHOLDER_GIF),
        }
    }
}

/// Reads the configured fallback at serve time so it can be replaced on disk
/// without a restart. Any problem reading it silently selects the GIF.
pub async fn load_fallback(path: Option<&Path>) -> FallbackImage {
    let Some(path) = path else {
        debug!("no fallback image configured");
        return FallbackImage::Placeholder;
    };
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => {}
        _ => {
            info!(path = %path.display(), "fallback image missing, serving placeholder");
            return FallbackImage::Placeholder;
        }
    }
    match tokio::fs::read(path).await {
        Ok(bytes) => FallbackImage::Configured(Bytes::from(bytes)),
        Err(err) => {
            info!(error = ?err, path = %path.display(), "fallback image unreadable, serving placeholder");
            FallbackImage::Placeholder
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use tempfile::tempdir;

    #[test]
    fn placeholder_matches_published_payload() {
        let decoded = STANDARD
            .decode("R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7")
            .unwrap();
        assert_eq!(decoded, PLACEHOLDER_GIF);
        assert_eq!(FallbackImage::Placeholder.content_type(), "image/gif");
    }

    #[tokio::test]
    async fn configured_file_is_served() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fallback.jpg");
        std::fs::write(&path, b"\xff\xd8\xff fallback").unwrap();
        let fallback = load_fallback(Some(&path)).await;
        assert_eq!(fallback.content_type(), "image/jpeg");
        assert_eq!(&fallback.bytes()[..], b"\xff\xd8\xff fallback");
    }

    #[tokio::test]
    async fn missing_or_directory_falls_through_to_placeholder() {
        let dir = tempdir().unwrap();
        assert_eq!(load_fallback(None).await, FallbackImage::Placeholder);
        assert_eq!(
            load_fallback(Some(&dir.path().join("nope.jpg"))).await,
            FallbackImage::Placeholder
        );
        assert_eq!(
            load_fallback(Some(dir.path())).await,
            FallbackImage::Placeholder
        );
    }
}
