//! Request ID middleware for correlation across the gateway and backends.
//!
//! An inbound `X-Request-Id` is reused when it is short printable ASCII;
//! anything else is replaced by a fresh UUIDv4 so a client cannot smuggle
//! arbitrary bytes into backend logs. The chosen id is:
//!
//! 1. written back into the request headers (the proxy forwards it upstream)
//! 2. stored as a [`RequestId`] extension
//! 3. recorded on the current tracing span
//! 4. echoed on the response

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::Span;
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied id accepted verbatim.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation id of the request being processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(Arc<str>);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let (id, header) = accept_or_generate(req.headers().get(REQUEST_ID_HEADER));

        req.headers_mut().insert(REQUEST_ID_HEADER, header.clone());
        req.extensions_mut().insert(id.clone());
        Span::current().record("request_id", id.as_str());

        // Swap in the ready service, leaving a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response.headers_mut().insert(REQUEST_ID_HEADER, header);
            Ok(response)
        })
    }
}

fn is_acceptable(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value.bytes().all(|b| b.is_ascii_graphic())
}

/// Reuse an acceptable inbound id or mint a new one.
fn accept_or_generate(inbound: Option<&HeaderValue>) -> (RequestId, HeaderValue) {
    if let Some(value) = inbound
        && let Ok(text) = value.to_str()
        && is_acceptable(text)
    {
        return (RequestId(Arc::from(text)), value.clone());
    }

    let fresh = Uuid::new_v4().to_string();
    // A hyphenated UUID is always a valid header value.
    let header = HeaderValue::from_str(&fresh).unwrap_or(HeaderValue::from_static("unknown"));
    (RequestId(Arc::from(fresh)), header)
}

/// Read the request id set by [`RequestIdLayer`].
pub trait RequestIdExt {
    fn request_id(&self) -> Option<&str>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.extensions()
            .get::<RequestId>()
            .map(RequestId::as_str)
            .or_else(|| {
                self.headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::Router;
    use axum::routing::get;
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn test_keeps_well_formed_inbound_id() {
        let value = HeaderValue::from_static("corr-123");
        let (id, header) = accept_or_generate(Some(&value));
        assert_eq!(id.as_str(), "corr-123");
        assert_eq!(header, "corr-123");
    }

    #[test]
    fn test_replaces_malformed_inbound_id() {
        let long = "a".repeat(MAX_REQUEST_ID_LEN + 1);
        for bad in ["", "has space", long.as_str()] {
            let value = HeaderValue::from_str(bad).unwrap();
            let (id, _) = accept_or_generate(Some(&value));
            assert!(Uuid::parse_str(id.as_str()).is_ok(), "{bad:?}");
        }
    }

    #[test]
    fn test_generates_when_absent() {
        let (id, header) = accept_or_generate(None);
        assert!(Uuid::parse_str(id.as_str()).is_ok());
        assert_eq!(header.to_str().unwrap(), id.as_str());
    }

    #[tokio::test]
    async fn test_layer_sets_extension_and_echoes_header() {
        let app = Router::new()
            .route(
                "/",
                get(|req: Request<Body>| async move {
                    req.request_id().unwrap_or_default().to_string()
                }),
            )
            .layer(RequestIdLayer::new());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "abc-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "abc-1");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"abc-1");
    }
}
