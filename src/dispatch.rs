use crate::cache::StorageError;
use crate::fallbacks::FallbackImage;
use crate::pipeline::Materialized;
use bytes::Bytes;
use tracing::{info, warn};

/// Final state of a request. Exactly one of these is produced per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Cache mode: the artifact now sits where the static layer serves it,
    /// so the client is sent back to the same URL.
    Redirect { location: String },
    Artifact {
        bytes: Bytes,
        content_type: &'static str,
    },
    Fallback(FallbackImage),
}

/// Cache mode redirects. Otherwise the artifact is read into memory and
/// removed before anything is sent, so the file never outlives the request.
pub async fn serve_artifact(
    materialized: Materialized,
    use_cache: bool,
) -> Result<Dispatch, StorageError> {
    if use_cache {
        info!(location = %materialized.request_url, "redirect to cached artifact");
        return Ok(Dispatch::Redirect {
            location: materialized.request_url,
        });
    }
    let path = materialized.artifact;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|source| StorageError::Read {
            path: path.clone(),
            source,
        })?;
    match tokio::fs::remove_file(&path).await {
        Ok(()) => info!(path = %path.display(), "artifact deleted"),
        Err(source) => {
            let err = StorageError::Remove {
                path: path.clone(),
                source,
            };
            warn!(error = %err, "artifact served but not deleted");
        }
    }
    Ok(Dispatch::Artifact {
        bytes: Bytes::from(bytes),
        content_type: materialized.content_type,
    })
}

pub fn content_type_from_path(path: &str) -> Option<&'static str> {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        Some("image/jpeg")
    } else if lower.ends_with(".png") {
        Some("image/png")
    } else if lower.ends_with(".gif") {
        Some("image/gif")
    } else if lower.ends_with(".webp") {
        Some("image/webp")
    } else if lower.ends_with(".avif") {
        Some("image/avif")
    } else if lower.ends_with(".svg") {
        Some("image/svg+xml")
    } else if lower.ends_with(".bmp") {
        Some("image/bmp")
    } else if lower.ends_with(".tif") || lower.ends_with(".tiff") {
        Some("image/tiff")
    } else {
        None
    }
}
