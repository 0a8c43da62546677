//! Health endpoint and the shared status it reports.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;

/// Health status shared between the lifecycle manager and the health endpoint.
///
/// Holds an HTTP status code. Starts out as `503 Service Unavailable` until
/// the server finishes starting.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    code: Arc<AtomicU16>,
}

impl HealthStatus {
    /// Create a status in the not-yet-started state.
    pub fn new() -> Self {
        Self {
            code: Arc::new(AtomicU16::new(StatusCode::SERVICE_UNAVAILABLE.as_u16())),
        }
    }

    /// Current status.
    pub fn get(&self) -> StatusCode {
        StatusCode::from_u16(self.code.load(Ordering::SeqCst))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Replace the status.
    pub fn set(&self, status: StatusCode) {
        self.code.store(status.as_u16(), Ordering::SeqCst);
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Health check handler - replies with the current status and no body.
pub async fn health(State(status): State<HealthStatus>) -> impl IntoResponse {
    status.get()
}

/// Create the health router.
pub fn router(status: HealthStatus) -> Router {
    Router::new()
        .route("/health", any(health))
        .with_state(status)
}
