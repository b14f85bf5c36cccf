//! Health check endpoint for liveness probes.
//!
//! Returns 200 OK while the subscription store can be read.

use axum::extract::State;
use axum::http::StatusCode;
use tracing::warn;

use super::AppState;

/// Health check handler.
///
/// Pings the subscription store; a poisoned or unreachable store reports
/// 503 so orchestration restarts the process.
///
/// # Example
///
/// ```ignore
/// GET /health HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: text/plain
///
/// OK
/// ```
pub async fn health_handler(State(app_state): State<AppState>) -> (StatusCode, &'static str) {
    match app_state.store().ping() {
        Ok(_) => (StatusCode::OK, "OK"),
        Err(e) => {
            warn!(error = %e, "store unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}
