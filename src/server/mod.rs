//! HTTP server for the notification service.
//!
//! This module implements the HTTP server that:
//! - Accepts callbacks from the Dispatch Worker and delivers digests
//! - Provides binding inspection endpoints for observability
//! - Provides health checks for liveness probes
//!
//! # Endpoints
//!
//! - `POST /callback/{*path}` - Serves one authorized callback (200 or 403, see [`CallbackOutcome`])
//! - `GET /api/v1/bindings/{id}` - Returns a binding's schedule and lease as JSON
//! - `GET /health` - Returns 200 if the store is readable
//!
//! [`CallbackOutcome`]: crate::callback::CallbackOutcome

use std::sync::Arc;

use crate::callback::CallbackHandler;
use crate::store::SubscriptionStore;

pub mod callback;
pub mod health;
pub mod state;

pub use callback::callback_handler;
pub use health::health_handler;
pub use state::binding_handler;

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    handler: Arc<CallbackHandler>,
    store: Arc<dyn SubscriptionStore>,
}

impl AppState {
    pub fn new(handler: Arc<CallbackHandler>, store: Arc<dyn SubscriptionStore>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner { handler, store }),
        }
    }

    pub fn handler(&self) -> &CallbackHandler {
        &self.inner.handler
    }

    pub fn store(&self) -> &dyn SubscriptionStore {
        self.inner.store.as_ref()
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/callback/{*path}", post(callback_handler))
        .route("/api/v1/bindings/{id}", get(binding_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::auth::{IdentitySigner, SignedIdentity};
    use crate::callback::{CallbackBody, CallbackResponse, HandlerSettings, ResponseStatus};
    use crate::delivery::ChannelRegistry;
    use crate::store::SubscriptionDb;
    use crate::test_utils::{
        RecordingChannel, SUBSCRIBER, default_templates, subscription, t0, task_catalog,
        task_record,
    };
    use crate::types::{
        AuthToken, BindingId, DeliveryMethod, Frequency, Lease, ResourceName, Trigger, encode_iso,
    };
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Duration;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct TestApp {
        state: AppState,
        identity: SignedIdentity,
        channel: Arc<RecordingChannel>,
        binding: BindingId,
        token: AuthToken,
    }

    /// An app with one leased `project_task` binding, a token already issued,
    /// and one task created after the checkpoint.
    fn test_app() -> TestApp {
        let store = Arc::new(SubscriptionDb::in_memory());
        store
            .subscribe(
                subscription(Frequency::Daily, &[Trigger::New], &["project_task"]),
                t0(),
            )
            .unwrap();
        let binding = store.due_candidates(t0()).unwrap()[0].binding;
        let lease = Lease::grant(t0(), Duration::minutes(30));
        store.acquire_lease(binding, lease, t0()).unwrap();
        let token = AuthToken::generate();
        assert!(store.issue_token(binding, lease.holder, token.clone()).unwrap());

        let catalog = Arc::new(task_catalog());
        let created = t0() + Duration::hours(1);
        catalog
            .push_record(
                &ResourceName::new("project_task"),
                task_record(2, "Paint fence", created, created),
            )
            .unwrap();

        let identity = SignedIdentity::new(IdentitySigner::new("secret"));
        let channel = Arc::new(RecordingChannel::default());
        let handler = CallbackHandler::new(
            store.clone(),
            catalog,
            Arc::new(default_templates()),
            ChannelRegistry::uniform(channel.clone()),
            Arc::new(identity.clone()),
            HandlerSettings::default(),
        );

        TestApp {
            state: AppState::new(Arc::new(handler), store),
            identity,
            channel,
            binding,
            token,
        }
    }

    fn callback_request(app: &TestApp, token: &str) -> Request<Body> {
        let body = CallbackBody {
            pe_id: SUBSCRIBER,
            notify_on: [Trigger::New].into(),
            method: [DeliveryMethod::Email].into(),
            resource: ResourceName::new("project_task"),
            last_check_time: Some(encode_iso(t0())),
        };
        let uri = format!(
            "/callback/project/task?subscription={token}&format=msg&~.created_on__ge={}",
            encode_iso(t0())
        );
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in app.identity.headers_for(SUBSCRIBER) {
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    // ─── Health endpoint tests ───

    #[tokio::test]
    async fn health_returns_200() {
        let app = test_app();
        let router = build_router(app.state.clone());

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    // ─── Callback endpoint tests ───

    #[tokio::test]
    async fn callback_with_valid_token_delivers() {
        let app = test_app();
        let router = build_router(app.state.clone());

        let response = router
            .oneshot(callback_request(&app, app.token.as_str()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let parsed: CallbackResponse = read_json(response).await;
        assert_eq!(parsed.status, ResponseStatus::Success);
        assert_eq!(parsed.message, "Success");

        let sent = app.channel.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.body.contains("Paint fence"));
    }

    #[tokio::test]
    async fn callback_with_wrong_token_is_unauthorized() {
        let app = test_app();
        let router = build_router(app.state.clone());

        let response = router
            .oneshot(callback_request(&app, "not-the-token"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let parsed: CallbackResponse = read_json(response).await;
        assert_eq!(parsed.status, ResponseStatus::Error);
        assert!(app.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn callback_without_query_is_unauthorized() {
        let app = test_app();
        let router = build_router(app.state.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/callback/project/task")
            .body(Body::from("{}"))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // ─── Binding endpoint tests ───

    #[tokio::test]
    async fn binding_returns_json_without_token() {
        let app = test_app();
        let router = build_router(app.state.clone());

        let request = Request::builder()
            .uri(format!("/api/v1/bindings/{}", app.binding.0))
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["id"], app.binding.0);
        assert_eq!(value["resource"], "project_task");
        assert_eq!(value["last_check_time"], encode_iso(t0()));
        assert!(value["lease"].is_object());
        assert!(value.get("auth_token").is_none());
        assert!(!String::from_utf8_lossy(&body).contains(app.token.as_str()));
    }

    #[tokio::test]
    async fn binding_returns_404_for_unknown_id() {
        let app = test_app();
        let router = build_router(app.state.clone());

        let request = Request::builder()
            .uri("/api/v1/bindings/999")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
