//! HTTP middleware

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, warn};

use crate::metrics;

/// Request logging and counting middleware
pub async fn track_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status();
    metrics::record_http_request(method.as_str(), status.as_u16());

    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    if status.is_server_error() {
        warn!(%method, %path, status = status.as_u16(), elapsed_ms, "Request failed");
    } else {
        debug!(%method, %path, status = status.as_u16(), elapsed_ms, "Request completed");
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, routing::get, Router};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_slow_request_is_counted() {
        let app = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    StatusCode::SERVICE_UNAVAILABLE
                }),
            )
            .layer(axum::middleware::from_fn(track_requests));

        let counter = metrics::HTTP_REQUESTS_TOTAL.with_label_values(&["PUT", "503"]);
        let before = counter.get();

        let request = Request::builder()
            .method("PUT")
            .uri("/slow")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(counter.get(), before + 1);
    }
}
