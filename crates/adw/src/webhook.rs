//! Webhook Gateway (C8).
//!
//! An axum HTTP server with two inbound routes:
//!
//! - `POST /intake` — an external issue tracker notifying us of a new or
//!   updated issue; on success this enqueues a new run.
//! - `POST /workflow-complete` — one of our own worker processes
//!   reporting a phase outcome back to the Orchestrator.
//!
//! Both verify `X-Hub-Signature-256` via [`adw_webhook_crypto::verify`]
//! before touching the body, and both dedupe via
//! [`crate::webhook_store::WebhookEventStore`]'s `webhook_id` `UNIQUE`
//! constraint so a retried delivery from a flaky sender never
//! double-applies, even across a gateway restart.

use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use adw_types::{WebhookEvent, WebhookSource};

use crate::error::WebhookError;
use crate::webhook_store::WebhookEventStore;

#[derive(Debug, Clone, Deserialize)]
pub struct IntakePayload {
    pub issue_id: u64,
    pub title: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowCompletePayload {
    pub run_id: String,
    pub queue_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AckResponse {
    accepted: bool,
    deduped: bool,
}

fn sha256_hex(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// What the gateway calls back into once a delivery is verified and not a
/// duplicate. Kept as a trait so this module doesn't have to depend
/// directly on the Orchestrator's concrete type.
pub trait WebhookSink: Send + Sync {
    fn on_intake(&self, payload: IntakePayload) -> anyhow::Result<()>;
    fn on_workflow_complete(&self, payload: WorkflowCompletePayload) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct WebhookGateway<S: WebhookSink + 'static> {
    secret: Arc<String>,
    signature_header: Arc<String>,
    store: Arc<Mutex<WebhookEventStore>>,
    sink: Arc<S>,
}

impl<S: WebhookSink + 'static> WebhookGateway<S> {
    pub fn new(secret: String, signature_header: String, sink: S, store: WebhookEventStore) -> Self {
        Self {
            secret: Arc::new(secret),
            signature_header: Arc::new(signature_header),
            store: Arc::new(Mutex::new(store)),
            sink: Arc::new(sink),
        }
    }

    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookError> {
        let sig = headers
            .get(self.signature_header.as_str())
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| WebhookError::MalformedPayload("missing signature header".to_string()))?;
        adw_webhook_crypto::verify(&self.secret, body, sig)?;
        Ok(())
    }

    /// Records `event` in the durable store and reports whether it is a
    /// duplicate of a previously-seen delivery (by `webhook_id`).
    fn dedupe_and_record(&self, event: WebhookEvent) -> Result<bool, WebhookError> {
        let store = self.store.lock().expect("webhook event store mutex poisoned");
        let is_new = store
            .record_if_new(&event)
            .map_err(|e| WebhookError::Storage(e.to_string()))?;
        Ok(!is_new)
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/intake", post(intake_handler::<S>))
            .route("/workflow-complete", post(workflow_complete_handler::<S>))
            .with_state(self)
    }
}

async fn intake_handler<S: WebhookSink + 'static>(
    State(gw): State<WebhookGateway<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Err(e) = gw.verify(&headers, &body) {
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }

    let payload: IntakePayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let fingerprint = adw_types::webhook_fingerprint(
        "external_issue",
        "",
        "intake",
        &payload.issue_id.to_string(),
    );
    let event = WebhookEvent {
        webhook_id: fingerprint,
        source: WebhookSource::ExternalIssue,
        received_at: Utc::now(),
        payload_digest: sha256_hex(&body),
        run_id: Some(format!("adw-{}", payload.issue_id)),
        issue_id: Some(payload.issue_id),
    };
    match gw.dedupe_and_record(event) {
        Ok(true) => {
            return axum::Json(AckResponse {
                accepted: true,
                deduped: true,
            })
            .into_response();
        }
        Ok(false) => {}
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }

    match gw.sink.on_intake(payload) {
        Ok(()) => axum::Json(AckResponse {
            accepted: true,
            deduped: false,
        })
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn workflow_complete_handler<S: WebhookSink + 'static>(
    State(gw): State<WebhookGateway<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Err(e) = gw.verify(&headers, &body) {
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }

    let payload: WorkflowCompletePayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let fingerprint = adw_types::webhook_fingerprint(
        "workflow_complete",
        &payload.run_id,
        &payload.status,
        &payload.queue_id,
    );
    let event = WebhookEvent {
        webhook_id: fingerprint,
        source: WebhookSource::WorkflowComplete,
        received_at: Utc::now(),
        payload_digest: sha256_hex(&body),
        run_id: Some(payload.run_id.clone()),
        issue_id: None,
    };
    match gw.dedupe_and_record(event) {
        Ok(true) => {
            return axum::Json(AckResponse {
                accepted: true,
                deduped: true,
            })
            .into_response();
        }
        Ok(false) => {}
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }

    match gw.sink.on_workflow_complete(payload) {
        Ok(()) => axum::Json(AckResponse {
            accepted: true,
            deduped: false,
        })
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Mutex as StdMutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingSink {
        intakes: StdMutex<Vec<IntakePayload>>,
    }

    impl WebhookSink for RecordingSink {
        fn on_intake(&self, payload: IntakePayload) -> anyhow::Result<()> {
            self.intakes.lock().unwrap().push(payload);
            Ok(())
        }
        fn on_workflow_complete(&self, _payload: WorkflowCompletePayload) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn signed_request(secret: &str, path: &str, body: &str) -> Request<Body> {
        let sig = adw_webhook_crypto::sign(secret, body.as_bytes()).unwrap();
        Request::builder()
            .method("POST")
            .uri(path)
            .header(adw_webhook_crypto::SIGNATURE_HEADER, sig)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn gateway(sink: RecordingSink) -> WebhookGateway<RecordingSink> {
        WebhookGateway::new(
            "topsecret".to_string(),
            adw_webhook_crypto::SIGNATURE_HEADER.to_string(),
            sink,
            WebhookEventStore::open_in_memory().unwrap(),
        )
    }

    #[tokio::test]
    async fn intake_accepts_correctly_signed_payload() {
        let gw = gateway(RecordingSink::default());
        let app = gw.router();

        let body = r#"{"issue_id": 1, "title": "fix the thing"}"#;
        let req = signed_request("topsecret", "/intake", body);
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn intake_rejects_bad_signature() {
        let gw = gateway(RecordingSink::default());
        let app = gw.router();

        let req = signed_request("wrong-secret", "/intake", r#"{"issue_id": 1, "title": "x"}"#);
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_deduped() {
        let gw = gateway(RecordingSink::default());
        let store = Arc::clone(&gw.store);
        let app = gw.router();

        let body = r#"{"issue_id": 42, "title": "dup"}"#;
        let req1 = signed_request("topsecret", "/intake", body);
        let resp1 = app.clone().oneshot(req1).await.unwrap();
        assert_eq!(resp1.status(), StatusCode::OK);

        let req2 = signed_request("topsecret", "/intake", body);
        let resp2 = app.oneshot(req2).await.unwrap();
        assert_eq!(resp2.status(), StatusCode::OK);

        // Exactly one row persisted despite two deliveries: the second
        // was recognized as a duplicate rather than re-inserted.
        let fingerprint = adw_types::webhook_fingerprint("external_issue", "", "intake", "42");
        assert!(
            store
                .lock()
                .unwrap()
                .get(&fingerprint)
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn duplicate_delivery_survives_a_fresh_gateway_over_the_same_store() {
        let store_path = tempfile::NamedTempFile::new().unwrap().into_temp_path();

        let sink1 = RecordingSink::default();
        let gw1 = WebhookGateway::new(
            "topsecret".to_string(),
            adw_webhook_crypto::SIGNATURE_HEADER.to_string(),
            sink1,
            WebhookEventStore::open(&store_path).unwrap(),
        );
        let body = r#"{"issue_id": 7, "title": "restart test"}"#;
        let req1 = signed_request("topsecret", "/intake", body);
        gw1.router().oneshot(req1).await.unwrap();

        // A brand new gateway (as if the process restarted) opened over
        // the same durable store must still recognize the repeat.
        let sink2 = RecordingSink::default();
        let gw2 = WebhookGateway::new(
            "topsecret".to_string(),
            adw_webhook_crypto::SIGNATURE_HEADER.to_string(),
            sink2,
            WebhookEventStore::open(&store_path).unwrap(),
        );
        let req2 = signed_request("topsecret", "/intake", body);
        let resp = gw2.router().oneshot(req2).await.unwrap();
        let body_bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let ack: AckResponse = serde_json::from_slice(&body_bytes).unwrap();
        assert!(ack.deduped);
    }
}
