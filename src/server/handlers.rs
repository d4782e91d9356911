//! HTTP route handlers

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Extension, Json, Path, Query},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::error::{Error, Result};
use crate::export;
use crate::metrics;
use crate::record::{NewRecord, Record, RecordFilter, RecordId, RecordPatch, RecordStatus};
use crate::server::AppState;
use crate::storage::StatusCounts;

/// Number of records asked for in a claim
pub const CLAIM_REQUESTED_HEADER: &str = "x-claim-requested";
/// Number of records actually handed out
pub const CLAIM_RETURNED_HEADER: &str = "x-claim-returned";

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidRequest(_) | Error::ValidationError(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self, kind = self.kind(), "Request failed");
        }

        (
            status,
            Json(serde_json::json!({
                "success": false,
                "error": self.to_string(),
                "kind": self.kind(),
            })),
        )
            .into_response()
    }
}

/// Search query. Empty parameters are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl SearchParams {
    fn into_filter(self) -> RecordFilter {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        RecordFilter {
            name: non_empty(self.name).or_else(|| non_empty(self.username)),
            status: non_empty(self.status).map(RecordStatus::from),
        }
    }
}

/// List or search records
#[instrument(skip(state))]
pub async fn list_records(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<Record>>> {
    let filter = params.into_filter();
    let records = state.storage.find(&filter).await?;
    info!(matched = records.len(), "Listed records");
    Ok(Json(records))
}

/// Create a record
#[instrument(skip(state, payload))]
pub async fn create_record(
    Extension(state): Extension<Arc<AppState>>,
    payload: std::result::Result<Json<NewRecord>, JsonRejection>,
) -> Result<(StatusCode, Json<Record>)> {
    let Json(new) = payload.map_err(bad_json)?;
    let record = state.storage.insert(new).await?;
    info!(id = %record.id, name = %record.name, "Record created");
    Ok((StatusCode::CREATED, Json(record)))
}

/// Fetch one record
#[instrument(skip(state))]
pub async fn get_record(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Record>> {
    let id: RecordId = id.parse()?;
    Ok(Json(state.storage.get(id).await?))
}

/// Partially update a record
#[instrument(skip(state, payload))]
pub async fn update_record(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<RecordPatch>, JsonRejection>,
) -> Result<Json<Record>> {
    let id: RecordId = id.parse()?;
    let Json(patch) = payload.map_err(bad_json)?;
    let record = state.storage.update(id, patch).await?;
    info!(id = %record.id, status = %record.status, "Record updated");
    Ok(Json(record))
}

/// Delete a record
#[instrument(skip(state))]
pub async fn delete_record(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let id: RecordId = id.parse()?;
    state.storage.delete(id).await?;
    info!(id = %id, "Record deleted");
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Claim a batch of unused records and return it as a text download
#[instrument(skip(state, body))]
pub async fn claim_records(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Response> {
    let count = parse_claim_count(&body)?;
    let batch = state.allocator.claim_accounts(count).await?;

    let headers = [
        (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", export::EXPORT_FILE_NAME),
        ),
        (
            HeaderName::from_static(CLAIM_REQUESTED_HEADER),
            batch.requested.to_string(),
        ),
        (
            HeaderName::from_static(CLAIM_RETURNED_HEADER),
            batch.len().to_string(),
        ),
    ];

    Ok((StatusCode::OK, headers, export::format_batch(&batch.records)).into_response())
}

/// Counts per status
#[instrument(skip(state))]
pub async fn record_stats(Extension(state): Extension<Arc<AppState>>) -> Result<Json<StatusCounts>> {
    let counts = state.storage.status_counts().await?;
    metrics::update_pool_gauges(&counts);
    Ok(Json(counts))
}

/// Tail of the current log file
pub async fn read_logs(Extension(state): Extension<Arc<AppState>>) -> Result<Response> {
    let text = state.logs.tail().await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        text,
    )
        .into_response())
}

/// Health check
pub async fn health_check() -> Response {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics_endpoint(Extension(state): Extension<Arc<AppState>>) -> String {
    match state.storage.status_counts().await {
        Ok(counts) => metrics::update_pool_gauges(&counts),
        Err(e) => error!(error = %e, "Failed to refresh pool gauges"),
    }
    metrics::export_metrics()
}

/// Read `count` from a claim body. Accepts a JSON integer or a string
/// holding one.
pub fn parse_claim_count(body: &[u8]) -> Result<i64> {
    #[derive(Deserialize)]
    struct ClaimRequest {
        #[serde(default)]
        count: Option<Value>,
    }

    let request: ClaimRequest = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidRequest(format!("invalid claim body: {}", e)))?;

    match request.count {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| Error::InvalidRequest(format!("count must be an integer, got {}", n))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| Error::InvalidRequest(format!("count must be an integer, got {:?}", s))),
        Some(other) => Err(Error::InvalidRequest(format!(
            "count must be an integer, got {}",
            other
        ))),
        None => Err(Error::InvalidRequest("count is required".to_string())),
    }
}

fn bad_json(rejection: JsonRejection) -> Error {
    Error::InvalidRequest(rejection.body_text())
}
