//! Binding inspection endpoint for observability.
//!
//! Provides a read-only view of a binding's schedule and lease for debugging
//! and monitoring. The callback token is never exposed.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::AppState;
use crate::store::StoreError;
use crate::types::{Binding, BindingId, Lease, ResourceName, SubscriptionId};

/// Errors that can occur when fetching a binding.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("binding not found: {0}")]
    NotFound(BindingId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for StateError {
    fn into_response(self) -> Response {
        let status = match &self {
            StateError::NotFound(_) => StatusCode::NOT_FOUND,
            StateError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

/// Public view of a [`Binding`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingView {
    pub id: BindingId,
    pub subscription_id: SubscriptionId,
    pub resource: ResourceName,
    pub callback_path: String,
    pub last_check_time: Option<DateTime<Utc>>,
    pub next_check_time: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    /// True while a callback token is outstanding.
    pub in_flight: bool,
    pub deleted: bool,
}

impl From<Binding> for BindingView {
    fn from(b: Binding) -> Self {
        BindingView {
            id: b.id,
            subscription_id: b.subscription_id,
            resource: b.resource,
            callback_path: b.callback_path,
            last_check_time: b.last_check_time,
            next_check_time: b.next_check_time,
            lease: b.lease,
            in_flight: b.auth_token.is_some(),
            deleted: b.deleted,
        }
    }
}

/// Binding inspection handler.
///
/// # Response
///
/// - 200 OK with JSON body containing a [`BindingView`]
/// - 404 Not Found if the binding does not exist
/// - 500 Internal Server Error if the store cannot be read
pub async fn binding_handler(
    State(app_state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<BindingView>, StateError> {
    let id = BindingId(id);
    let binding = app_state
        .store()
        .binding(id)?
        .ok_or(StateError::NotFound(id))?;
    Ok(Json(binding.into()))
}
