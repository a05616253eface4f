use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analytics::Aggregator;
use crate::dedup::DedupGuard;
use crate::directory::TenantDirectory;
use crate::gateway::{ChannelDispatcher, CompletionGateway};
use crate::store::Store;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Instagram,
    Webchat,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Instagram => "instagram",
            Channel::Webchat => "webchat",
        }
    }

    pub fn parse(value: &str) -> Option<Channel> {
        match value {
            "instagram" => Some(Channel::Instagram),
            "webchat" => Some(Channel::Webchat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub status: String,
    pub domain: String,
    #[serde(default)]
    pub platform_recipient_ids: Vec<String>,
    #[serde(default)]
    pub config: ChatbotConfig,
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatbotConfig {
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub role: Vec<String>,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub business_info: Option<BusinessInfo>,
    #[serde(default)]
    pub service_plans: Vec<ServicePlan>,
    #[serde(default)]
    pub faq: Vec<FaqItem>,
    #[serde(default)]
    pub business_hours: Option<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl ChatbotConfig {
    pub fn is_empty(&self) -> bool {
        self.identity.trim().is_empty()
            && self.role.is_empty()
            && self.rules.is_empty()
            && self.business_info.is_none()
            && self.service_plans.is_empty()
            && self.faq.is_empty()
            && self.business_hours.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub guarantee: Option<String>,
}

impl BusinessInfo {
    pub fn has_any(&self) -> bool {
        self.name.is_some()
            || self.domain.is_some()
            || self.email.is_some()
            || self.location.is_some()
            || self.description.is_some()
            || self.guarantee.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlan {
    pub name: String,
    pub price: String,
    pub currency: String,
    pub period: String,
    #[serde(default)]
    pub badge: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub savings: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaqItem {
    pub q: String,
    pub a: String,
}

/// One inbound message normalized across channels. Lives for the duration of
/// a single request.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub external_id: Option<String>,
    pub sender_id: String,
    pub recipient_id: String,
    pub text: String,
    pub is_echo: bool,
    pub channel: Channel,
}

// Platform webhook envelope. Field names are the platform's own, so no
// camelCase renaming here.

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagingEvent {
    pub sender: Party,
    pub recipient: Party,
    #[serde(default)]
    pub message: Option<MessagePayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Party {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    #[serde(default)]
    pub messages: Vec<ChatTurn>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyAnalyticsRecord {
    pub tenant_id: String,
    pub date: String,
    pub total_conversations: i64,
    pub after_hours_conversations: i64,
    pub avg_response_time_ms: f64,
    pub avg_messages_per_conversation: f64,
    pub peak_hour: i32,
    pub channel_webchat: i64,
    pub channel_instagram: i64,
    pub leads_captured: i64,
}

impl DailyAnalyticsRecord {
    pub fn empty(tenant_id: &str, date: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            date: date.to_string(),
            total_conversations: 0,
            after_hours_conversations: 0,
            avg_response_time_ms: 0.0,
            avg_messages_per_conversation: 0.0,
            peak_hour: 0,
            channel_webchat: 0,
            channel_instagram: 0,
            leads_captured: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationLog {
    pub id: String,
    pub tenant_id: String,
    pub channel: String,
    pub user_text: String,
    pub reply_text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadRecord {
    pub id: String,
    pub tenant_id: String,
    pub conversation_id: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub channel: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementEvent {
    pub id: String,
    pub tenant_id: Option<String>,
    pub event_type: String,
    pub session_id: Option<String>,
    pub payload: Value,
    pub created_at: String,
}

/// Secrets and toggles read once at startup. An empty string disables the
/// related feature, it never crashes the process.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub verify_token: String,
    pub app_secret: String,
    pub fallback_to_first_active: bool,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self {
            verify_token: std::env::var("WEBHOOK_VERIFY_TOKEN").unwrap_or_default(),
            app_secret: std::env::var("WEBHOOK_APP_SECRET").unwrap_or_default(),
            fallback_to_first_active: std::env::var("DISABLE_TENANT_FALLBACK")
                .map(|v| v.trim().is_empty() || v == "0")
                .unwrap_or(true),
        }
    }
}

pub struct AppState {
    pub store: Store,
    pub dedup: DedupGuard,
    pub directory: TenantDirectory,
    pub analytics: Aggregator,
    pub gateway: Arc<dyn CompletionGateway>,
    pub dispatcher: Arc<dyn ChannelDispatcher>,
    pub config: RelayConfig,
}
