//! The Callback Handler: the second half of the dispatch exchange.
//!
//! The Dispatch Worker calls back into the service with a one-time token.
//! Before touching any data the handler checks that the token is the one
//! currently stored for a live binding, and that the authenticated caller is
//! that binding's subscriber. It then queries the changed rows, renders one
//! message per requested delivery method, sends them, and reports the
//! aggregate outcome.
//!
//! Per-method failures are isolated: a missing template or a refused send is
//! recorded and the next method is still attempted.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::auth::Authenticator;
use crate::delivery::{ChannelRegistry, OutgoingMessage};
use crate::resource::{FieldFilter, RecordQuery, ResourceCatalog, memory::capitalize_words};
use crate::store::{SubscriptionStore, TokenGrant};
use crate::template::{DEFAULT_THEME, TemplateSet};
use crate::types::{AuthToken, DeliveryMethod, SubscriberId, decode_iso};

pub mod digest;
pub mod protocol;

pub use digest::{DigestTable, DigestView, build_digest, classify};
pub use protocol::{
    CallbackBody, CallbackOutcome, CallbackResponse, FORMAT_PARAM, MESSAGE_FORMAT,
    ResponseStatus, TOKEN_PARAM,
};

/// Presentation settings for rendered digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSettings {
    /// Template theme; `default` means no override directory.
    pub theme: String,
    /// Short system name used in subjects and templates.
    pub system_name: String,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        HandlerSettings {
            theme: DEFAULT_THEME.to_string(),
            system_name: "Notify".to_string(),
        }
    }
}

/// Serves authorized callbacks.
pub struct CallbackHandler {
    store: Arc<dyn SubscriptionStore>,
    catalog: Arc<dyn ResourceCatalog>,
    templates: Arc<dyn TemplateSet>,
    channels: ChannelRegistry,
    authenticator: Arc<dyn Authenticator>,
    settings: HandlerSettings,
}

impl CallbackHandler {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn ResourceCatalog>,
        templates: Arc<dyn TemplateSet>,
        channels: ChannelRegistry,
        authenticator: Arc<dyn Authenticator>,
        settings: HandlerSettings,
    ) -> Self {
        CallbackHandler {
            store,
            catalog,
            templates,
            channels,
            authenticator,
            settings,
        }
    }

    /// Handles one callback request.
    ///
    /// `params` are the decoded query parameters in request order.
    #[instrument(skip_all)]
    pub async fn handle(
        &self,
        params: &[(String, String)],
        headers: &HeaderMap,
        body: &[u8],
    ) -> CallbackOutcome {
        let grant = match self.authorize(params, headers) {
            Ok(grant) => grant,
            Err(outcome) => return outcome,
        };

        if param(params, FORMAT_PARAM) != Some(MESSAGE_FORMAT) {
            return CallbackOutcome::failure(StatusCode::BAD_REQUEST, "Unsupported format");
        }

        let body: CallbackBody = match serde_json::from_slice(body) {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "malformed callback body");
                return CallbackOutcome::failure(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid request body: {e}"),
                );
            }
        };
        if body.pe_id != grant.subscriber {
            warn!(binding = %grant.binding, "callback body names a different subscriber");
            return CallbackOutcome::unauthorized();
        }
        if body.resource != grant.resource {
            return CallbackOutcome::failure(StatusCode::BAD_REQUEST, "Resource mismatch");
        }

        if body.notify_on.is_empty() || body.method.is_empty() {
            return CallbackOutcome::success("No notification configured for this subscription");
        }

        let checkpoint = match body.last_check_time.as_deref().map(decode_iso).transpose() {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                return CallbackOutcome::failure(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid last_check_time: {e}"),
                );
            }
        };

        self.notify(&grant, &body, checkpoint, params).await
    }

    /// Checks the token and the caller's identity.
    fn authorize(
        &self,
        params: &[(String, String)],
        headers: &HeaderMap,
    ) -> Result<TokenGrant, CallbackOutcome> {
        let Some(token) = param(params, TOKEN_PARAM) else {
            debug!("callback without token");
            return Err(CallbackOutcome::unauthorized());
        };

        let grant = match self.store.find_token(&AuthToken::new(token)) {
            Ok(Some(grant)) => grant,
            Ok(None) => {
                warn!("callback with unknown or superseded token");
                return Err(CallbackOutcome::unauthorized());
            }
            Err(e) => {
                warn!(error = %e, "token lookup failed");
                return Err(CallbackOutcome::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    e.to_string(),
                ));
            }
        };

        match self.authenticator.authenticate(headers) {
            Some(identity) if identity == grant.subscriber => Ok(grant),
            identity => {
                warn!(
                    binding = %grant.binding,
                    identity = ?identity,
                    "callback caller is not the subscriber"
                );
                Err(CallbackOutcome::unauthorized())
            }
        }
    }

    async fn notify(
        &self,
        grant: &TokenGrant,
        body: &CallbackBody,
        checkpoint: Option<DateTime<Utc>>,
        params: &[(String, String)],
    ) -> CallbackOutcome {
        let resource = &grant.resource;
        let fields = match self.catalog.report_fields(resource) {
            Ok(fields) => fields.resolve(),
            Err(e) => {
                return CallbackOutcome::failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
        };
        let query = RecordQuery {
            resource: resource.clone(),
            fields,
            filters: params
                .iter()
                .filter(|(k, _)| k != TOKEN_PARAM && k != FORMAT_PARAM)
                .map(|(k, v)| FieldFilter::from_param(k, v))
                .collect(),
        };
        let records = match self.catalog.select(&query) {
            Ok(records) => records,
            Err(e) => {
                warn!(resource = %resource, error = %e, "record query failed");
                return CallbackOutcome::failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
        };
        if records.is_empty() {
            debug!(resource = %resource, "no records to notify about");
            return CallbackOutcome::success("No records found");
        }

        let resource_name = self
            .catalog
            .display_name(resource)
            .unwrap_or_else(|| capitalize_words(resource.as_str()));
        let view = build_digest(
            &records,
            checkpoint,
            &body.notify_on,
            &self.settings.system_name,
            &resource_name,
        );
        let subject = view.subject();

        let mut delivered = false;
        let mut errors = Vec::new();
        for &method in &body.method {
            match self.deliver(grant.subscriber, method, &subject, &view).await {
                Ok(()) => delivered = true,
                Err(e) => {
                    warn!(
                        binding = %grant.binding,
                        method = %method,
                        error = %e,
                        "delivery failed"
                    );
                    errors.push(e);
                }
            }
        }

        let outcome = CallbackOutcome::from_deliveries(delivered, errors);
        info!(
            binding = %grant.binding,
            delivered,
            new = view.new.unwrap_or(0),
            updated = view.upd.unwrap_or(0),
            message = %outcome.message,
            "callback handled"
        );
        outcome
    }

    /// Renders and sends one method's message. Errors are returned as text.
    async fn deliver(
        &self,
        recipient: SubscriberId,
        method: DeliveryMethod,
        subject: &str,
        view: &DigestView,
    ) -> Result<(), String> {
        let handle = self
            .templates
            .resolve(method, &self.settings.theme)
            .map_err(|e| e.to_string())?;
        let rendered = self
            .templates
            .render(&handle, view)
            .map_err(|e| e.to_string())?;
        let message = OutgoingMessage {
            subject: subject.to_string(),
            body: rendered,
            method,
            system_generated: true,
        };
        self.channels
            .send(recipient, &message)
            .await
            .map_err(|e| e.to_string())
    }
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}
