//! Wire types of the callback exchange.
//!
//! ```text
//! POST <base>/<path>?subscription=<token>&format=msg&~.modified_on__ge=<iso>&...
//! Content-Type: application/json
//!
//! {"pe_id": 7, "notify_on": ["new"], "method": ["EMAIL"],
//!  "resource": "project_task", "last_check_time": "2024-06-01T12:00:00Z"}
//!
//! HTTP/1.1 200 OK
//! {"status": "success", "message": "Success"}
//! ```

use std::collections::BTreeSet;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::types::{DeliveryMethod, ResourceName, SubscriberId, Trigger};

/// Query parameter carrying the callback token.
pub const TOKEN_PARAM: &str = "subscription";

/// Query parameter selecting the response format.
pub const FORMAT_PARAM: &str = "format";

/// The only response format the handler serves.
pub const MESSAGE_FORMAT: &str = "msg";

/// Request body sent by the Dispatch Worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackBody {
    pub pe_id: SubscriberId,
    pub notify_on: BTreeSet<Trigger>,
    pub method: BTreeSet<DeliveryMethod>,
    pub resource: ResourceName,
    /// ISO-8601 UTC checkpoint; absent if the binding was never checked.
    #[serde(default)]
    pub last_check_time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Response body returned to the Dispatch Worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub status: ResponseStatus,
    pub message: String,
}

impl CallbackResponse {
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Result of handling one callback.
///
/// `errors` holds per-method failures; they are reported even when another
/// method succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub success: bool,
    pub status_code: StatusCode,
    pub message: String,
    pub errors: Vec<String>,
}

impl CallbackOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        CallbackOutcome {
            success: true,
            status_code: StatusCode::OK,
            message: message.into(),
            errors: Vec::new(),
        }
    }

    pub fn failure(status_code: StatusCode, message: impl Into<String>) -> Self {
        CallbackOutcome {
            success: false,
            status_code,
            message: message.into(),
            errors: Vec::new(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::failure(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    /// Aggregates per-method results: 200 if anything was delivered, 403
    /// otherwise. The message lists every error, or "Success".
    pub fn from_deliveries(delivered: bool, errors: Vec<String>) -> Self {
        let message = if errors.is_empty() {
            "Success".to_string()
        } else {
            errors.join(", ")
        };
        CallbackOutcome {
            success: delivered,
            status_code: if delivered {
                StatusCode::OK
            } else {
                StatusCode::FORBIDDEN
            },
            message,
            errors,
        }
    }

    pub fn response(&self) -> CallbackResponse {
        CallbackResponse {
            status: if self.success {
                ResponseStatus::Success
            } else {
                ResponseStatus::Error
            },
            message: self.message.clone(),
        }
    }
}

impl IntoResponse for CallbackOutcome {
    fn into_response(self) -> Response {
        (self.status_code, Json(self.response())).into_response()
    }
}
