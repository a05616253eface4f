use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Instant};

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::gateway::APOLOGY_REPLY;
use crate::leads;
use crate::prompting::render_system_prompt;
use crate::signature::{signing_applies, verify_signature};
use crate::types::*;

pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(webhook_verify).post(webhook_ingest))
        .route("/api/chat", post(chat).options(preflight))
        .route("/api/engagement", post(engagement).options(preflight))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let verify_token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    let expected = &state.config.verify_token;

    if mode == "subscribe"
        && !challenge.is_empty()
        && !expected.is_empty()
        && verify_token == *expected
    {
        return (StatusCode::OK, challenge).into_response();
    }

    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "invalid webhook verification token" })),
    )
        .into_response()
}

async fn webhook_ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if signing_applies(&state.config.app_secret, signature_header)
        && !verify_signature(&state.config.app_secret, signature_header, &body)
    {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook signature" })),
        )
            .into_response();
    }

    let Ok(payload) = serde_json::from_slice::<WebhookPayload>(&body) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "unparseable webhook payload" })),
        )
            .into_response();
    };

    // Events within one payload are handled strictly in array order so
    // conversational ordering per sender is preserved.
    let mut processed = 0usize;
    for entry in payload.entry {
        for event in &entry.messaging {
            if handle_messaging_event(&state, &entry.id, event).await {
                processed += 1;
            }
        }
    }

    (
        StatusCode::OK,
        Json(json!({ "received": true, "processed": processed })),
    )
        .into_response()
}

/// One messaging event through the pipeline. Echoes, duplicates and non-text
/// events short-circuit to ignored with no side effects beyond the dedup
/// mark.
async fn handle_messaging_event(
    state: &Arc<AppState>,
    entry_id: &str,
    event: &MessagingEvent,
) -> bool {
    let Some(message) = &event.message else {
        return false;
    };
    if message.is_echo {
        return false;
    }
    if !state.dedup.check_and_mark(message.mid.as_deref()) {
        eprintln!(
            "[webhook] duplicate message skipped: {}",
            message.mid.as_deref().unwrap_or("")
        );
        return false;
    }
    let text = message.text.as_deref().unwrap_or("").trim();
    if text.is_empty() {
        return false;
    }

    let recipient_id = if event.recipient.id.is_empty() {
        entry_id
    } else {
        event.recipient.id.as_str()
    };
    let inbound = InboundMessage {
        external_id: message.mid.clone(),
        sender_id: event.sender.id.clone(),
        recipient_id: recipient_id.to_string(),
        text: text.to_string(),
        is_echo: false,
        channel: Channel::Instagram,
    };
    process_platform_message(state, inbound).await;
    true
}

async fn process_platform_message(state: &Arc<AppState>, inbound: InboundMessage) {
    let started = Instant::now();
    let tenant = state
        .directory
        .resolve_by_platform_recipient(&state.store, &inbound.recipient_id)
        .await;
    let prompt = render_system_prompt(tenant.as_ref().map(|t| &t.config));

    let history = vec![ChatTurn {
        role: "user".to_string(),
        content: inbound.text.clone(),
    }];
    let reply = match state.gateway.complete(&prompt, &history).await {
        Ok(reply) => reply,
        Err(err) => {
            eprintln!("[webhook] completion failed: {err}");
            APOLOGY_REPLY.to_string()
        }
    };

    if let Err(err) = state.dispatcher.send_text(&inbound.sender_id, &reply).await {
        eprintln!("[webhook] reply dispatch failed: {err}");
    }

    if let Some(tenant) = tenant {
        spawn_exchange_effects(
            state.clone(),
            tenant.id,
            inbound.channel,
            started.elapsed().as_millis() as f64,
            1.0,
            inbound.text,
            reply,
        );
    }
}

/// Analytics, conversation logging and lead capture run detached from the
/// reply path with their own error boundary. A failure here is logged and
/// discarded, never surfaced to the user.
fn spawn_exchange_effects(
    state: Arc<AppState>,
    tenant_id: String,
    channel: Channel,
    response_time_ms: f64,
    message_count: f64,
    user_text: String,
    reply_text: String,
) {
    tokio::spawn(async move {
        let now = Utc::now();
        let conversation = ConversationLog {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.clone(),
            channel: channel.as_str().to_string(),
            user_text: user_text.clone(),
            reply_text,
            created_at: now_iso(),
        };
        if let Err(err) = state.store.insert_conversation(&conversation).await {
            eprintln!("[analytics] conversation log failed: {err}");
        }
        if let Err(err) = state
            .analytics
            .record_exchange(
                &state.store,
                &tenant_id,
                channel,
                Some(response_time_ms),
                Some(message_count),
                now,
            )
            .await
        {
            eprintln!("[analytics] exchange record failed: {err}");
        }
        if let Some(hit) = leads::extract(&user_text) {
            if let Err(err) = state
                .analytics
                .record_lead(&state.store, &tenant_id, channel, &hit, now)
                .await
            {
                eprintln!("[analytics] lead record failed: {err}");
            }
        }
    });
}

fn request_origin(headers: &HeaderMap) -> String {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Echo the request origin only when the resolved tenant allows it.
fn allow_origin_for(tenant: Option<&Tenant>, origin: &str) -> String {
    let allowed = tenant
        .map(|t| t.config.allowed_origins.iter().any(|o| o == origin))
        .unwrap_or(false);
    if allowed && !origin.is_empty() {
        origin.to_string()
    } else {
        "*".to_string()
    }
}

async fn preflight() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "content-type"),
        ],
    )
}

async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatRequestBody>,
) -> Response {
    if body.messages.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "messages must be a non-empty array" })),
        )
            .into_response();
    }

    let started = Instant::now();
    let origin = request_origin(&headers);
    let tenant = match body.client_id.as_deref() {
        Some(client_id) if !client_id.is_empty() => {
            state
                .directory
                .resolve_by_client_id(&state.store, client_id)
                .await
        }
        _ => state.directory.resolve_by_origin(&state.store, &origin).await,
    };
    let allow_origin = allow_origin_for(tenant.as_ref(), &origin);
    let prompt = render_system_prompt(tenant.as_ref().map(|t| &t.config));

    let user_text = body
        .messages
        .iter()
        .rev()
        .find(|turn| turn.role == "user")
        .or_else(|| body.messages.last())
        .map(|turn| turn.content.clone())
        .unwrap_or_default();
    let message_count = body.messages.len() as f64;

    if body.stream {
        return stream_chat_response(
            state,
            tenant,
            prompt,
            body.messages,
            allow_origin,
            user_text,
            message_count,
            started,
        )
        .await;
    }

    let reply = match state.gateway.complete(&prompt, &body.messages).await {
        Ok(reply) => reply,
        Err(err) => {
            eprintln!("[chat] completion failed: {err}");
            APOLOGY_REPLY.to_string()
        }
    };

    if let Some(tenant) = tenant {
        spawn_exchange_effects(
            state.clone(),
            tenant.id,
            Channel::Webchat,
            started.elapsed().as_millis() as f64,
            message_count,
            user_text,
            reply.clone(),
        );
    }

    (
        StatusCode::OK,
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin)],
        Json(json!({ "reply": reply })),
    )
        .into_response()
}

fn sse_frame(content: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", json!({ "content": content })))
}

fn sse_response(allow_origin: String, body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin)
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[allow(clippy::too_many_arguments)]
async fn stream_chat_response(
    state: Arc<AppState>,
    tenant: Option<Tenant>,
    prompt: String,
    messages: Vec<ChatTurn>,
    allow_origin: String,
    user_text: String,
    message_count: f64,
    started: Instant,
) -> Response {
    let upstream = match state.gateway.complete_stream(&prompt, &messages).await {
        Ok(rx) => rx,
        Err(err) => {
            eprintln!("[chat] streaming completion failed: {err}");
            let frames = stream::iter(vec![
                Ok::<_, Infallible>(sse_frame(APOLOGY_REPLY)),
                Ok(Bytes::from("data: [DONE]\n\n")),
            ]);
            return sse_response(allow_origin, Body::from_stream(frames));
        }
    };

    // Tee the upstream fragments: forward to the client while accumulating
    // the full reply, then run the detached effects once the stream ends.
    let (tx, rx) = mpsc::channel::<String>(32);
    tokio::spawn(async move {
        let mut upstream = upstream;
        let mut full_reply = String::new();
        while let Some(fragment) = upstream.recv().await {
            full_reply.push_str(&fragment);
            if tx.send(fragment).await.is_err() {
                break;
            }
        }
        drop(tx);
        if let Some(tenant) = tenant {
            spawn_exchange_effects(
                state,
                tenant.id,
                Channel::Webchat,
                started.elapsed().as_millis() as f64,
                message_count,
                user_text,
                full_reply,
            );
        }
    });

    let frames = stream::unfold(Some(rx), |slot| async move {
        let mut rx = slot?;
        match rx.recv().await {
            Some(fragment) => Some((Ok::<_, Infallible>(sse_frame(&fragment)), Some(rx))),
            None => Some((Ok(Bytes::from("data: [DONE]\n\n")), None)),
        }
    });
    sse_response(allow_origin, Body::from_stream(frames))
}

/// Engagement telemetry must never surface as a user-facing failure, so this
/// accepts anything and always acknowledges.
async fn engagement(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    let event_type = payload
        .get("eventType")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    if !event_type.is_empty() {
        let origin = request_origin(&headers);
        let session_id = payload
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let state = state.clone();
        tokio::spawn(async move {
            let tenant = state.directory.resolve_by_origin(&state.store, &origin).await;
            let event = EngagementEvent {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant.map(|t| t.id),
                event_type,
                session_id,
                payload,
                created_at: now_iso(),
            };
            if let Err(err) = state.store.insert_engagement(&event).await {
                eprintln!("[engagement] event insert failed: {err}");
            }
        });
    }

    (StatusCode::OK, Json(json!({ "ok": true })))
}
