use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::types::ChatTurn;

/// Shown to the end user when the completion call fails for any reason.
pub const APOLOGY_REPLY: &str =
    "Sorry, I'm having trouble answering right now. Please try again in a moment.";

/// LLM completion endpoint, specified only at its boundary. Object-safe so
/// tests can count calls with a mock.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    async fn complete(&self, system: &str, history: &[ChatTurn]) -> Result<String, String>;

    /// Incremental variant: fragments arrive on the channel as the model
    /// produces them; the channel closing marks the end of the reply.
    async fn complete_stream(
        &self,
        system: &str,
        history: &[ChatTurn],
    ) -> Result<mpsc::Receiver<String>, String>;
}

/// Delivers a reply back through the originating messaging platform.
#[async_trait]
pub trait ChannelDispatcher: Send + Sync {
    async fn send_text(&self, recipient_id: &str, text: &str) -> Result<(), String>;
}

pub struct OpenAiGateway {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiGateway {
    pub fn new(client: reqwest::Client, api_key: String, model: String) -> Self {
        Self {
            client,
            api_key,
            model,
        }
    }

    pub fn from_env(client: reqwest::Client) -> Self {
        Self::new(
            client,
            std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        )
    }

    fn request_messages(system: &str, history: &[ChatTurn]) -> Vec<Value> {
        let mut messages = vec![json!({ "role": "system", "content": system })];
        messages.extend(
            history
                .iter()
                .map(|turn| json!({ "role": turn.role, "content": turn.content })),
        );
        messages
    }
}

#[async_trait]
impl CompletionGateway for OpenAiGateway {
    async fn complete(&self, system: &str, history: &[ChatTurn]) -> Result<String, String> {
        if self.api_key.trim().is_empty() {
            return Err("OPENAI_API_KEY not configured".to_string());
        }
        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": Self::request_messages(system, history),
                "temperature": 0.4
            }))
            .send()
            .await
            .map_err(|err| format!("openai request failed: {err}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("openai returned {status}: {body}"));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| format!("openai parse failed: {err}"))?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err("openai response had empty content".to_string());
        }
        Ok(text)
    }

    async fn complete_stream(
        &self,
        system: &str,
        history: &[ChatTurn],
    ) -> Result<mpsc::Receiver<String>, String> {
        if self.api_key.trim().is_empty() {
            return Err("OPENAI_API_KEY not configured".to_string());
        }
        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": Self::request_messages(system, history),
                "temperature": 0.4,
                "stream": true
            }))
            .send()
            .await
            .map_err(|err| format!("openai request failed: {err}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("openai returned {status}: {body}"));
        }

        let (tx, rx) = mpsc::channel::<String>(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            'outer: while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else {
                    break;
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    let fragment = serde_json::from_str::<Value>(data)
                        .ok()
                        .and_then(|event| {
                            event
                                .get("choices")?
                                .get(0)?
                                .get("delta")?
                                .get("content")?
                                .as_str()
                                .map(str::to_string)
                        });
                    if let Some(fragment) = fragment {
                        if tx.send(fragment).await.is_err() {
                            break 'outer;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Graph-style platform send API. Without an access token every send fails
/// with an error the caller logs; the rest of the pipeline is unaffected.
pub struct PlatformDispatcher {
    client: reqwest::Client,
    access_token: String,
    api_base: String,
}

impl PlatformDispatcher {
    pub fn new(client: reqwest::Client, access_token: String) -> Self {
        Self {
            client,
            access_token,
            api_base: "https://graph.facebook.com/v19.0".to_string(),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Self {
        Self::new(client, std::env::var("PAGE_ACCESS_TOKEN").unwrap_or_default())
    }
}

#[async_trait]
impl ChannelDispatcher for PlatformDispatcher {
    async fn send_text(&self, recipient_id: &str, text: &str) -> Result<(), String> {
        if self.access_token.trim().is_empty() {
            return Err("PAGE_ACCESS_TOKEN not configured".to_string());
        }
        let response = self
            .client
            .post(format!("{}/me/messages", self.api_base))
            .query(&[("access_token", self.access_token.as_str())])
            .json(&json!({
                "recipient": { "id": recipient_id },
                "messaging_type": "RESPONSE",
                "message": { "text": text }
            }))
            .send()
            .await
            .map_err(|err| format!("platform send failed: {err}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("platform send returned {status}: {body}"));
        }
        Ok(())
    }
}
