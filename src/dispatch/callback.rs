//! The client side of the callback exchange.
//!
//! [`CallbackClient`] is the seam between the Dispatch Worker and the
//! transport. [`ReqwestCallbackClient`] posts over HTTP with a timeout; tests
//! substitute a client that drives the axum router in-process.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use url::Url;

use crate::callback::{CallbackBody, CallbackResponse};

/// Default bound on one callback exchange (2 minutes).
pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 120;

/// How a failed callback should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackErrorKind {
    /// The service may succeed on the next attempt (transport, timeout, 5xx, 429).
    Retryable,
    /// Retrying the same request cannot succeed (authorization, malformed reply).
    Terminal,
}

/// Errors from one callback exchange.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// The request could not be sent or the reply not received.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("callback timed out")]
    Timeout,

    /// The handler answered with a non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The reply could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The handler answered 2xx but reported an error.
    #[error("{0}")]
    Rejected(String),
}

impl CallbackError {
    pub fn kind(&self) -> CallbackErrorKind {
        match self {
            CallbackError::Transport(_) | CallbackError::Timeout => CallbackErrorKind::Retryable,
            CallbackError::Status { status, .. } if *status >= 500 || *status == 429 => {
                CallbackErrorKind::Retryable
            }
            CallbackError::Status { .. }
            | CallbackError::Malformed(_)
            | CallbackError::Rejected(_) => CallbackErrorKind::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == CallbackErrorKind::Retryable
    }
}

/// A fully built callback request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackRequest {
    /// Target including the query string.
    pub url: Url,
    pub headers: Vec<(&'static str, String)>,
    pub body: CallbackBody,
}

/// Performs callback exchanges.
pub trait CallbackClient: Send + Sync {
    fn post(
        &self,
        request: CallbackRequest,
    ) -> impl Future<Output = Result<CallbackResponse, CallbackError>> + Send;
}

/// Interprets a reply: non-2xx is a [`CallbackError::Status`], a body that is
/// not a [`CallbackResponse`] is malformed.
pub fn interpret_response(status: u16, body: &[u8]) -> Result<CallbackResponse, CallbackError> {
    if !(200..300).contains(&status) {
        return Err(CallbackError::Status {
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        });
    }
    serde_json::from_slice(body).map_err(|e| CallbackError::Malformed(e.to_string()))
}

/// [`CallbackClient`] over HTTP.
#[derive(Debug, Clone)]
pub struct ReqwestCallbackClient {
    client: reqwest::Client,
}

impl ReqwestCallbackClient {
    pub fn new(timeout: Duration) -> Result<Self, CallbackError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallbackError::Transport(e.to_string()))?;
        Ok(ReqwestCallbackClient { client })
    }
}

impl CallbackClient for ReqwestCallbackClient {
    async fn post(&self, request: CallbackRequest) -> Result<CallbackResponse, CallbackError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &request.headers {
            let value = HeaderValue::from_str(value)
                .map_err(|e| CallbackError::Transport(format!("invalid header {name}: {e}")))?;
            headers.insert(HeaderName::from_static(name), value);
        }

        let response = self
            .client
            .post(request.url)
            .headers(headers)
            .json(&request.body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(transport_error)?;
        interpret_response(status, &body)
    }
}

fn transport_error(e: reqwest::Error) -> CallbackError {
    if e.is_timeout() {
        CallbackError::Timeout
    } else {
        CallbackError::Transport(e.to_string())
    }
}
