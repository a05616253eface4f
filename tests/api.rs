use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::mpsc;
use tower::util::ServiceExt;

use chat_relay::analytics::Aggregator;
use chat_relay::build_app;
use chat_relay::dedup::DedupGuard;
use chat_relay::directory::TenantDirectory;
use chat_relay::gateway::{ChannelDispatcher, CompletionGateway, APOLOGY_REPLY};
use chat_relay::store::Store;
use chat_relay::types::{AppState, ChatTurn, ChatbotConfig, RelayConfig, Tenant};

const APP_SECRET: &str = "webhook-secret";
const VERIFY_TOKEN: &str = "verify-me";

struct MockGateway {
    calls: AtomicUsize,
    reply: String,
    fail: bool,
}

impl MockGateway {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reply: reply.to_string(),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reply: String::new(),
            fail: true,
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionGateway for MockGateway {
    async fn complete(&self, _system: &str, _history: &[ChatTurn]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err("mock completion failure".to_string());
        }
        Ok(self.reply.clone())
    }

    async fn complete_stream(
        &self,
        _system: &str,
        _history: &[ChatTurn],
    ) -> Result<mpsc::Receiver<String>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err("mock completion failure".to_string());
        }
        let (tx, rx) = mpsc::channel(4);
        let reply = self.reply.clone();
        tokio::spawn(async move {
            let midpoint = reply.len() / 2;
            let _ = tx.send(reply[..midpoint].to_string()).await;
            let _ = tx.send(reply[midpoint..].to_string()).await;
        });
        Ok(rx)
    }
}

struct MockDispatcher {
    sent: Mutex<Vec<(String, String)>>,
}

impl MockDispatcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelDispatcher for MockDispatcher {
    async fn send_text(&self, recipient_id: &str, text: &str) -> Result<(), String> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient_id.to_string(), text.to_string()));
        Ok(())
    }
}

fn tenants() -> Vec<Tenant> {
    vec![
        Tenant {
            id: "acme".to_string(),
            status: "active".to_string(),
            domain: "acme.example".to_string(),
            platform_recipient_ids: vec!["page-acme".to_string()],
            config: ChatbotConfig {
                identity: "You are the Acme assistant.".to_string(),
                allowed_origins: vec!["https://acme.example".to_string()],
                ..ChatbotConfig::default()
            },
        },
        Tenant {
            id: "globex".to_string(),
            status: "active".to_string(),
            domain: "globex.example".to_string(),
            platform_recipient_ids: vec!["page-globex".to_string()],
            config: ChatbotConfig {
                identity: "You are the Globex assistant.".to_string(),
                ..ChatbotConfig::default()
            },
        },
    ]
}

fn test_state(gateway: Arc<MockGateway>, dispatcher: Arc<MockDispatcher>) -> Arc<AppState> {
    Arc::new(AppState {
        store: Store::memory_with_tenants(tenants()),
        dedup: DedupGuard::default(),
        directory: TenantDirectory::new(true),
        analytics: Aggregator::new(),
        gateway,
        dispatcher,
        config: RelayConfig {
            verify_token: VERIFY_TOKEN.to_string(),
            app_secret: APP_SECRET.to_string(),
            fallback_to_first_active: true,
        },
    })
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn webhook_body(mid: &str, text: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "entry": [{
            "id": "page-acme",
            "messaging": [{
                "sender": { "id": "user-9" },
                "recipient": { "id": "page-acme" },
                "message": { "mid": mid, "text": text }
            }]
        }]
    }))
    .unwrap()
}

fn signed_webhook_request(body: Vec<u8>) -> Request<Body> {
    let signature = sign(APP_SECRET, &body);
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .header("x-hub-signature-256", signature)
        .body(Body::from(body))
        .unwrap()
}

fn local_date_today() -> String {
    (Utc::now() + ChronoDuration::hours(10))
        .format("%Y-%m-%d")
        .to_string()
}

async fn settle() {
    // lets the detached analytics tasks run on the test runtime
    tokio::time::sleep(Duration::from_millis(25)).await;
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn webhook_challenge_accepted_with_matching_token() {
    let state = test_state(MockGateway::new("hi"), MockDispatcher::new());
    let app = build_app(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/webhook?hub.mode=subscribe&hub.verify_token={VERIFY_TOKEN}&hub.challenge=424242"
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"424242");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=424242")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn webhook_message_drives_one_completion_one_dispatch_one_analytics_row() {
    let gateway = MockGateway::new("Thanks for reaching out!");
    let dispatcher = MockDispatcher::new();
    let state = test_state(gateway.clone(), dispatcher.clone());
    let app = build_app(state.clone());

    let response = app
        .oneshot(signed_webhook_request(webhook_body("mid.1", "hello there")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["processed"], 1);

    settle().await;
    assert_eq!(gateway.call_count(), 1);
    let sent = dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "user-9");
    assert_eq!(sent[0].1, "Thanks for reaching out!");
    assert!(state.dedup.seen(Some("mid.1")));

    let daily = state
        .store
        .get_daily("acme", &local_date_today())
        .await
        .unwrap()
        .expect("daily analytics row");
    assert_eq!(daily.total_conversations, 1);
    assert_eq!(daily.channel_instagram, 1);
    assert_eq!(daily.channel_webchat, 0);
}

#[tokio::test]
async fn redelivered_mid_is_inert() {
    let gateway = MockGateway::new("hi");
    let dispatcher = MockDispatcher::new();
    let state = test_state(gateway.clone(), dispatcher.clone());
    let app = build_app(state.clone());

    let first = app
        .clone()
        .oneshot(signed_webhook_request(webhook_body("mid.dup", "hello")))
        .await
        .unwrap();
    assert_eq!(body_json(first).await["processed"], 1);

    let second = app
        .oneshot(signed_webhook_request(webhook_body("mid.dup", "hello")))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_json(second).await["processed"], 0);

    settle().await;
    assert_eq!(gateway.call_count(), 1);
    assert_eq!(dispatcher.sent().len(), 1);
    let daily = state
        .store
        .get_daily("acme", &local_date_today())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(daily.total_conversations, 1);
}

#[tokio::test]
async fn echo_and_textless_events_are_ignored() {
    let gateway = MockGateway::new("hi");
    let dispatcher = MockDispatcher::new();
    let state = test_state(gateway.clone(), dispatcher.clone());
    let app = build_app(state);

    let body = serde_json::to_vec(&json!({
        "entry": [{
            "id": "page-acme",
            "messaging": [
                {
                    "sender": { "id": "page-acme" },
                    "recipient": { "id": "user-9" },
                    "message": { "mid": "mid.echo", "text": "our own reply", "is_echo": true }
                },
                {
                    "sender": { "id": "user-9" },
                    "recipient": { "id": "page-acme" },
                    "message": { "mid": "mid.attachment" }
                }
            ]
        }]
    }))
    .unwrap();

    let response = app.oneshot(signed_webhook_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["processed"], 0);

    settle().await;
    assert_eq!(gateway.call_count(), 0);
    assert!(dispatcher.sent().is_empty());
}

#[tokio::test]
async fn invalid_signature_is_rejected_before_processing() {
    let gateway = MockGateway::new("hi");
    let state = test_state(gateway.clone(), MockDispatcher::new());
    let app = build_app(state);

    let body = webhook_body("mid.bad", "hello");
    let bad_signature = sign("some-other-secret", &body);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("content-type", "application/json")
                .header("x-hub-signature-256", bad_signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    settle().await;
    assert_eq!(gateway.call_count(), 0);
}

#[tokio::test]
async fn missing_signature_header_skips_verification() {
    let gateway = MockGateway::new("hi");
    let state = test_state(gateway.clone(), MockDispatcher::new());
    let app = build_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("content-type", "application/json")
                .body(Body::from(webhook_body("mid.unsigned", "hello")))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    settle().await;
    assert_eq!(gateway.call_count(), 1);
}

#[tokio::test]
async fn unparseable_webhook_body_is_a_server_error() {
    let state = test_state(MockGateway::new("hi"), MockDispatcher::new());
    let app = build_app(state);

    let body = b"this is not json".to_vec();
    let signature = sign(APP_SECRET, &body);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("x-hub-signature-256", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn chat_with_empty_messages_is_rejected_without_completion() {
    let gateway = MockGateway::new("hi");
    let state = test_state(gateway.clone(), MockDispatcher::new());
    let app = build_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"messages":[]}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    settle().await;
    assert_eq!(gateway.call_count(), 0);
}

#[tokio::test]
async fn chat_replies_and_echoes_allowed_origin() {
    let gateway = MockGateway::new("Happy to help.");
    let state = test_state(gateway.clone(), MockDispatcher::new());
    let app = build_app(state.clone());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("content-type", "application/json")
                .header("origin", "https://acme.example")
                .body(Body::from(
                    r#"{"messages":[{"role":"user","content":"hi, email me at a@b.com"}]}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("https://acme.example")
    );
    assert_eq!(body_json(response).await["reply"], "Happy to help.");

    settle().await;
    let daily = state
        .store
        .get_daily("acme", &local_date_today())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(daily.total_conversations, 1);
    assert_eq!(daily.channel_webchat, 1);
    assert_eq!(daily.leads_captured, 1);
    let leads = state.store.leads_for_tenant("acme").await.unwrap();
    assert_eq!(leads.len(), 1);
    assert_eq!(leads[0].email.as_deref(), Some("a@b.com"));

    // an origin outside the allow-list falls back to the wildcard
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("content-type", "application/json")
                .header("origin", "https://evil.example")
                .body(Body::from(r#"{"messages":[{"role":"user","content":"hi"}]}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}

#[tokio::test]
async fn chat_client_id_overrides_origin_inference() {
    let gateway = MockGateway::new("hello from globex");
    let state = test_state(gateway, MockDispatcher::new());
    let app = build_app(state.clone());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("content-type", "application/json")
                .header("origin", "https://acme.example")
                .body(Body::from(
                    r#"{"messages":[{"role":"user","content":"hi"}],"clientId":"globex"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    settle().await;
    let daily = state
        .store
        .get_daily("globex", &local_date_today())
        .await
        .unwrap()
        .expect("analytics recorded against the overridden tenant");
    assert_eq!(daily.total_conversations, 1);
    assert!(state
        .store
        .get_daily("acme", &local_date_today())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn completion_failure_degrades_to_apology() {
    let gateway = MockGateway::failing();
    let dispatcher = MockDispatcher::new();
    let state = test_state(gateway.clone(), dispatcher.clone());
    let app = build_app(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"messages":[{"role":"user","content":"hi"}]}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["reply"], APOLOGY_REPLY);

    // the webhook path delivers the same apology through the dispatcher
    let response = app
        .oneshot(signed_webhook_request(webhook_body("mid.fail", "hello")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    settle().await;
    let sent = dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, APOLOGY_REPLY);
}

#[tokio::test]
async fn streaming_chat_emits_sse_frames_and_done() {
    let gateway = MockGateway::new("streamed reply");
    let state = test_state(gateway, MockDispatcher::new());
    let app = build_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"messages":[{"role":"user","content":"hi"}],"stream":true}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    let fragments: Vec<&str> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert!(fragments.len() >= 2);
    assert_eq!(*fragments.last().unwrap(), "[DONE]");
    let reassembled: String = fragments[..fragments.len() - 1]
        .iter()
        .map(|frame| {
            serde_json::from_str::<Value>(frame).unwrap()["content"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(reassembled, "streamed reply");
}

#[tokio::test]
async fn engagement_always_acknowledges() {
    let state = test_state(MockGateway::new("hi"), MockDispatcher::new());
    let app = build_app(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/engagement")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"eventType":"chat_opened","sessionId":"s-1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["ok"], true);

    // malformed telemetry still acknowledges
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/engagement")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["ok"], true);
}
