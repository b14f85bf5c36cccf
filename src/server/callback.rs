//! Callback endpoint handler.
//!
//! Decodes the raw query string and hands the request to the
//! [`CallbackHandler`](crate::callback::CallbackHandler). The handler's
//! outcome becomes the response: JSON `{status, message}` with 200 on success.

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::HeaderMap;
use tracing::debug;

use super::AppState;
use crate::callback::CallbackOutcome;

/// Callback handler.
///
/// # Request
///
/// - Method: POST
/// - Query: `subscription=<token>&format=msg` followed by `selector__op=value` filters
/// - Headers: `x-notify-subscriber` and `x-notify-signature`
/// - Body: JSON `{pe_id, notify_on, method, resource, last_check_time}`
///
/// # Response
///
/// - 200 OK: at least one method delivered, or nothing to deliver
/// - 400 Bad Request: unsupported format or invalid body
/// - 401 Unauthorized: unknown token or wrong identity
/// - 403 Forbidden: every delivery method failed
/// - 500 Internal Server Error: store or resource failure
///
/// # Example
///
/// ```ignore
/// POST /callback/project/task?subscription=...&format=msg&~.created_on__ge=2024-06-01T12:00:00Z HTTP/1.1
/// X-Notify-Subscriber: 7
/// X-Notify-Signature: sha256=...
/// Content-Type: application/json
///
/// {"pe_id": 7, "notify_on": ["new"], "method": ["EMAIL"], "resource": "project_task", ...}
///
/// HTTP/1.1 200 OK
/// {"status": "success", "message": "Success"}
/// ```
pub async fn callback_handler(
    State(app_state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> CallbackOutcome {
    let params: Vec<(String, String)> = query
        .as_deref()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    debug!(path = %path, params = params.len(), "Received callback");

    app_state.handler().handle(&params, &headers, &body).await
}
