use crate::dispatch::Dispatch;
use crate::failure_log::FailureLogEntry;
use crate::fallbacks::FallbackImage;
use crate::state::AppState;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::sync::Arc;
use tracing::{info, warn};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .fallback(image)
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn image(State(state): State<Arc<AppState>>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "GET, HEAD")],
        )
            .into_response();
    }
    let request_url = uri
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let handled = state
        .handler
        .handle(&request_url, &state.config.additional_transformations)
        .await;
    if let Some(error) = handled.error.as_ref() {
        state.record_failure(FailureLogEntry::new(
            request_url.clone(),
            error.kind(),
            error.to_string(),
        ));
    }
    if let Dispatch::Fallback(fallback) = &handled.dispatch {
        info!(request = %request_url, content_type = fallback.content_type(), "serving fallback");
    }
    handled.dispatch.into_response()
}

impl IntoResponse for Dispatch {
    fn into_response(self) -> Response {
        match self {
            Dispatch::Redirect { location } => match HeaderValue::from_str(&location) {
                Ok(location) => (
                    StatusCode::FOUND,
                    [
                        (header::LOCATION, location),
                        (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
                    ],
                )
                    .into_response(),
                Err(err) => {
                    warn!(error = %err, "redirect location is not a valid header value");
                    Dispatch::Fallback(FallbackImage::Placeholder).into_response()
                }
            },
            Dispatch::Artifact {
                bytes,
                content_type,
            } => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
                bytes,
            )
                .into_response(),
            Dispatch::Fallback(fallback) => (
                StatusCode::OK,
                [
                    (
                        header::CONTENT_TYPE,
                        HeaderValue::from_static(fallback.content_type()),
                    ),
                    (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
                    (
                        header::HeaderName::from_static("x-image-fallback"),
                        HeaderValue::from_static("true"),
                    ),
                ],
                fallback.bytes(),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallbacks::PLACEHOLDER_GIF;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use bytes::Bytes;
    use tower::ServiceExt;

    #[tokio::test]
    async fn redirect_is_not_cacheable() {
        let response = Dispatch::Redirect {
            location: "/thumb-100/a/b/XYZ123.jpg?v=1".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/thumb-100/a/b/XYZ123.jpg?v=1"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    }

    #[tokio::test]
    async fn unencodable_redirect_serves_placeholder() {
        let response = Dispatch::Redirect {
            location: "/large/a/b/XYZ\n123.jpg".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/gif");
        assert_eq!(response.headers()["x-image-fallback"], "true");
        assert!(response.headers().get(header::LOCATION).is_none());
    }

    #[tokio::test]
    async fn fallback_is_flagged() {
        let response = Dispatch::Fallback(FallbackImage::Placeholder).into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/gif");
        assert_eq!(response.headers()["x-image-fallback"], "true");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], &PLACEHOLDER_GIF[..]);
    }

    #[tokio::test]
    async fn artifact_carries_content_type() {
        let response = Dispatch::Artifact {
            bytes: Bytes::from_static(b"webp"),
            content_type: "image/webp",
        }
        .into_response();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/webp");
        assert!(response.headers().get("x-image-fallback").is_none());
    }

    #[tokio::test]
    async fn post_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = crate::tests::test_state(dir.path(), true, None);
        let response = router(Arc::new(state))
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/large/a/b/XYZ123.jpg")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
