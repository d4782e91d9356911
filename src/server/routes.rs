//! HTTP routes definition

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers;

/// Record routes
///
/// - GET    /api/records          - Search records (`name`, `username`, `status`)
/// - POST   /api/records          - Create a record
/// - POST   /api/records/claim    - Claim a batch as `accounts.txt`
/// - GET    /api/records/stats    - Counts per status
/// - GET    /api/records/:id      - Get a record
/// - PUT    /api/records/:id      - Update a record
/// - DELETE /api/records/:id      - Delete a record
pub fn record_routes() -> Router {
    Router::new()
        .route(
            "/api/records",
            get(handlers::list_records).post(handlers::create_record),
        )
        .route("/api/records/claim", post(handlers::claim_records))
        .route("/api/records/stats", get(handlers::record_stats))
        .route(
            "/api/records/:id",
            get(handlers::get_record)
                .put(handlers::update_record)
                .delete(handlers::delete_record),
        )
}

/// Operator routes
pub fn ops_routes() -> Router {
    Router::new().route("/logs", get(handlers::read_logs))
}

/// Health check and metrics routes
pub fn health_routes() -> Router {
    Router::new()
        .route("/_health", get(handlers::health_check))
        .route("/health", get(handlers::health_check))
        .route("/_metrics", get(handlers::metrics_endpoint))
}
