//! recordpool HTTP server
//!
//! axum router over the shared record store. Every route except health and
//! metrics sits behind the `x-api-key` check.

pub mod auth;
pub mod handlers;
pub mod logs;
pub mod middleware;
pub mod routes;

use axum::{extract::DefaultBodyLimit, extract::Extension, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::allocator::ClaimAllocator;
use crate::storage::Storage;

pub use auth::AuthState;
pub use logs::LogSource;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP server bind address
    pub http_addr: String,
    /// HTTP port
    pub http_port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Request timeout (seconds)
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0".to_string(),
            http_port: 8080,
            enable_cors: false,
            max_body_size: 1024 * 1024, // 1MB
            timeout_secs: 30,
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub allocator: ClaimAllocator,
    pub config: ServerConfig,
    pub logs: LogSource,
}

impl AppState {
    pub fn new(storage: Arc<Storage>, config: ServerConfig, logs: LogSource) -> Self {
        Self {
            allocator: ClaimAllocator::new(storage.clone()),
            storage,
            config,
            logs,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .finish()
    }
}

/// Build the full application router
pub fn build_router(state: AppState, auth: AuthState) -> Router {
    let config = state.config.clone();

    let app = Router::new()
        .merge(routes::record_routes())
        .merge(routes::ops_routes())
        .merge(routes::health_routes())
        .layer(axum::middleware::from_fn_with_state(auth, auth::require_api_key))
        .layer(axum::middleware::from_fn(middleware::track_requests))
        .layer(Extension(Arc::new(state)))
        .layer(DefaultBodyLimit::max(config.max_body_size))
        .layer(TimeoutLayer::new(Duration::from_secs(config.timeout_secs)))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new());

    if config.enable_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the recordpool server and run until Ctrl-C
pub async fn start_server(
    config: ServerConfig,
    storage: Arc<Storage>,
    auth: AuthState,
    logs: LogSource,
) -> anyhow::Result<()> {
    info!(
        addr = %config.http_addr,
        port = config.http_port,
        "Starting recordpool HTTP server"
    );

    if auth.is_enabled() {
        info!("API key check enabled");
    } else {
        warn!("API key check disabled (dev mode)");
    }

    let counts = storage.status_counts().await?;
    crate::metrics::update_pool_gauges(&counts);
    info!(total = counts.total, unused = counts.unused(), "Record pool loaded");

    let state = AppState::new(storage.clone(), config.clone(), logs);
    let app = build_router(state, auth);

    let addr = format!("{}:{}", config.http_addr, config.http_port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Server listening on http://{}", addr);
    info!("Metrics: http://{}/_metrics", addr);
    info!("Health: http://{}/_health", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Flush the store even when serving failed
    let closed = storage.close().await;

    served.map_err(|e| {
        error!(error = %e, "Server error");
        anyhow::anyhow!("Server failed: {}", e)
    })?;
    closed?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
