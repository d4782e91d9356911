//! Shared-secret check
//!
//! Callers present the key in the `x-api-key` header. Health and metrics
//! stay public so health checks and scrapers need no secret.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Error;

/// Header carrying the shared secret
pub const API_KEY_HEADER: &str = "x-api-key";

/// Key check state shared across requests
#[derive(Clone)]
pub struct AuthState {
    api_key: Option<Arc<str>>,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl AuthState {
    pub fn with_api_key(key: impl AsRef<str>) -> Self {
        Self {
            api_key: Some(Arc::from(key.as_ref())),
        }
    }

    /// Accept every request (dev mode)
    pub fn disabled() -> Self {
        Self { api_key: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Whether the presented key grants access
    pub fn authorize(&self, presented: Option<&str>) -> bool {
        match (&self.api_key, presented) {
            (None, _) => true,
            (Some(expected), Some(presented)) => {
                constant_time_eq(expected.as_bytes(), presented.as_bytes())
            }
            (Some(_), None) => false,
        }
    }
}

/// Reject requests without a valid key before they reach a handler
pub async fn require_api_key(
    State(auth): State<AuthState>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if is_public_endpoint(path) {
        return next.run(req).await;
    }

    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    if auth.authorize(presented) {
        debug!(path = %path, "Request authorized");
        return next.run(req).await;
    }

    warn!(
        path = %path,
        key_present = presented.is_some(),
        "Rejected request with missing or invalid API key"
    );
    Error::Unauthorized.into_response()
}

/// Check if endpoint is public (no key required)
fn is_public_endpoint(path: &str) -> bool {
    matches!(path, "/_health" | "/health" | "/_metrics")
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
