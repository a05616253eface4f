use std::collections::HashMap;
use std::sync::Mutex;

use sqlx::{PgPool, Row};

use crate::types::{
    ConversationLog, DailyAnalyticsRecord, EngagementEvent, LeadRecord, Tenant,
};

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tenants (\
        id TEXT PRIMARY KEY,\
        status TEXT NOT NULL DEFAULT 'active',\
        domain TEXT NOT NULL DEFAULT '',\
        platform_recipient_ids TEXT NOT NULL DEFAULT '[]',\
        config TEXT NOT NULL DEFAULT '{}')",
    "CREATE TABLE IF NOT EXISTS conversations (\
        id TEXT PRIMARY KEY,\
        tenant_id TEXT NOT NULL,\
        channel TEXT NOT NULL,\
        user_text TEXT NOT NULL,\
        reply_text TEXT NOT NULL,\
        created_at TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS leads (\
        id TEXT PRIMARY KEY,\
        tenant_id TEXT NOT NULL,\
        conversation_id TEXT,\
        email TEXT,\
        phone TEXT,\
        channel TEXT NOT NULL,\
        created_at TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS daily_analytics (\
        tenant_id TEXT NOT NULL,\
        date TEXT NOT NULL,\
        total_conversations BIGINT NOT NULL DEFAULT 0,\
        after_hours_conversations BIGINT NOT NULL DEFAULT 0,\
        avg_response_time_ms DOUBLE PRECISION NOT NULL DEFAULT 0,\
        avg_messages_per_conversation DOUBLE PRECISION NOT NULL DEFAULT 0,\
        peak_hour INTEGER NOT NULL DEFAULT 0,\
        channel_webchat BIGINT NOT NULL DEFAULT 0,\
        channel_instagram BIGINT NOT NULL DEFAULT 0,\
        leads_captured BIGINT NOT NULL DEFAULT 0,\
        PRIMARY KEY (tenant_id, date))",
    "CREATE TABLE IF NOT EXISTS engagement_events (\
        id TEXT PRIMARY KEY,\
        tenant_id TEXT,\
        event_type TEXT NOT NULL,\
        session_id TEXT,\
        payload TEXT NOT NULL DEFAULT '{}',\
        created_at TEXT NOT NULL)",
];

#[derive(Default)]
struct MemoryInner {
    tenants: Vec<Tenant>,
    conversations: Vec<ConversationLog>,
    leads: Vec<LeadRecord>,
    daily: HashMap<(String, String), DailyAnalyticsRecord>,
    engagement: Vec<EngagementEvent>,
}

enum StoreBackend {
    Memory(Mutex<MemoryInner>),
    Postgres(PgPool),
}

/// Tenant, conversation, lead, analytics and engagement storage. Backed by
/// Postgres in production and by an in-memory table set in tests and local
/// runs without a DATABASE_URL.
pub struct Store {
    backend: StoreBackend,
}

impl Store {
    pub fn memory() -> Self {
        Self {
            backend: StoreBackend::Memory(Mutex::new(MemoryInner::default())),
        }
    }

    pub fn memory_with_tenants(tenants: Vec<Tenant>) -> Self {
        Self {
            backend: StoreBackend::Memory(Mutex::new(MemoryInner {
                tenants,
                ..MemoryInner::default()
            })),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            backend: StoreBackend::Postgres(pool),
        }
    }

    pub async fn init_schema(&self) -> Result<(), String> {
        match &self.backend {
            StoreBackend::Memory(_) => Ok(()),
            StoreBackend::Postgres(pool) => {
                for statement in SCHEMA_STATEMENTS {
                    sqlx::query(statement)
                        .execute(pool)
                        .await
                        .map_err(|err| format!("schema bootstrap failed: {err}"))?;
                }
                Ok(())
            }
        }
    }

    /// Fresh read on every call: tenant configuration changes propagate
    /// without any cache invalidation step.
    pub async fn list_active_tenants(&self) -> Result<Vec<Tenant>, String> {
        match &self.backend {
            StoreBackend::Memory(inner) => {
                let inner = inner.lock().expect("store lock poisoned");
                Ok(inner
                    .tenants
                    .iter()
                    .filter(|t| t.is_active())
                    .cloned()
                    .collect())
            }
            StoreBackend::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT id, status, domain, platform_recipient_ids, config \
                     FROM tenants WHERE status = 'active' ORDER BY id",
                )
                .fetch_all(pool)
                .await
                .map_err(|err| format!("tenant query failed: {err}"))?;

                let mut tenants = Vec::with_capacity(rows.len());
                for row in rows {
                    let recipient_ids: String = row
                        .try_get("platform_recipient_ids")
                        .map_err(|err| err.to_string())?;
                    let config: String = row.try_get("config").map_err(|err| err.to_string())?;
                    tenants.push(Tenant {
                        id: row.try_get("id").map_err(|err| err.to_string())?,
                        status: row.try_get("status").map_err(|err| err.to_string())?,
                        domain: row.try_get("domain").map_err(|err| err.to_string())?,
                        platform_recipient_ids: serde_json::from_str(&recipient_ids)
                            .unwrap_or_default(),
                        config: serde_json::from_str(&config).unwrap_or_default(),
                    });
                }
                Ok(tenants)
            }
        }
    }

    pub async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), String> {
        match &self.backend {
            StoreBackend::Memory(inner) => {
                let mut inner = inner.lock().expect("store lock poisoned");
                if let Some(existing) = inner.tenants.iter_mut().find(|t| t.id == tenant.id) {
                    *existing = tenant.clone();
                } else {
                    inner.tenants.push(tenant.clone());
                }
                Ok(())
            }
            StoreBackend::Postgres(pool) => {
                let recipient_ids = serde_json::to_string(&tenant.platform_recipient_ids)
                    .map_err(|err| err.to_string())?;
                let config =
                    serde_json::to_string(&tenant.config).map_err(|err| err.to_string())?;
                sqlx::query(
                    "INSERT INTO tenants (id, status, domain, platform_recipient_ids, config) \
                     VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT (id) DO UPDATE SET \
                        status = EXCLUDED.status, \
                        domain = EXCLUDED.domain, \
                        platform_recipient_ids = EXCLUDED.platform_recipient_ids, \
                        config = EXCLUDED.config",
                )
                .bind(&tenant.id)
                .bind(&tenant.status)
                .bind(&tenant.domain)
                .bind(recipient_ids)
                .bind(config)
                .execute(pool)
                .await
                .map_err(|err| format!("tenant upsert failed: {err}"))?;
                Ok(())
            }
        }
    }

    pub async fn insert_conversation(&self, log: &ConversationLog) -> Result<(), String> {
        match &self.backend {
            StoreBackend::Memory(inner) => {
                inner
                    .lock()
                    .expect("store lock poisoned")
                    .conversations
                    .push(log.clone());
                Ok(())
            }
            StoreBackend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO conversations (id, tenant_id, channel, user_text, reply_text, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(&log.id)
                .bind(&log.tenant_id)
                .bind(&log.channel)
                .bind(&log.user_text)
                .bind(&log.reply_text)
                .bind(&log.created_at)
                .execute(pool)
                .await
                .map_err(|err| format!("conversation insert failed: {err}"))?;
                Ok(())
            }
        }
    }

    /// Most recently created conversation for a tenant. Lead association is
    /// best-effort: under interleaved exchanges this can point at a sibling
    /// conversation.
    pub async fn latest_conversation_id(&self, tenant_id: &str) -> Result<Option<String>, String> {
        match &self.backend {
            StoreBackend::Memory(inner) => {
                let inner = inner.lock().expect("store lock poisoned");
                Ok(inner
                    .conversations
                    .iter()
                    .rev()
                    .find(|c| c.tenant_id == tenant_id)
                    .map(|c| c.id.clone()))
            }
            StoreBackend::Postgres(pool) => {
                let id: Option<String> = sqlx::query_scalar(
                    "SELECT id FROM conversations WHERE tenant_id = $1 \
                     ORDER BY created_at DESC LIMIT 1",
                )
                .bind(tenant_id)
                .fetch_optional(pool)
                .await
                .map_err(|err| format!("conversation lookup failed: {err}"))?;
                Ok(id)
            }
        }
    }

    pub async fn insert_lead(&self, lead: &LeadRecord) -> Result<(), String> {
        match &self.backend {
            StoreBackend::Memory(inner) => {
                inner
                    .lock()
                    .expect("store lock poisoned")
                    .leads
                    .push(lead.clone());
                Ok(())
            }
            StoreBackend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO leads (id, tenant_id, conversation_id, email, phone, channel, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(&lead.id)
                .bind(&lead.tenant_id)
                .bind(&lead.conversation_id)
                .bind(&lead.email)
                .bind(&lead.phone)
                .bind(&lead.channel)
                .bind(&lead.created_at)
                .execute(pool)
                .await
                .map_err(|err| format!("lead insert failed: {err}"))?;
                Ok(())
            }
        }
    }

    pub async fn get_daily(
        &self,
        tenant_id: &str,
        date: &str,
    ) -> Result<Option<DailyAnalyticsRecord>, String> {
        match &self.backend {
            StoreBackend::Memory(inner) => {
                let inner = inner.lock().expect("store lock poisoned");
                Ok(inner
                    .daily
                    .get(&(tenant_id.to_string(), date.to_string()))
                    .cloned())
            }
            StoreBackend::Postgres(pool) => {
                let row = sqlx::query(
                    "SELECT tenant_id, date, total_conversations, after_hours_conversations, \
                            avg_response_time_ms, avg_messages_per_conversation, peak_hour, \
                            channel_webchat, channel_instagram, leads_captured \
                     FROM daily_analytics WHERE tenant_id = $1 AND date = $2",
                )
                .bind(tenant_id)
                .bind(date)
                .fetch_optional(pool)
                .await
                .map_err(|err| format!("analytics lookup failed: {err}"))?;

                let Some(row) = row else {
                    return Ok(None);
                };
                Ok(Some(DailyAnalyticsRecord {
                    tenant_id: row.try_get("tenant_id").map_err(|err| err.to_string())?,
                    date: row.try_get("date").map_err(|err| err.to_string())?,
                    total_conversations: row
                        .try_get("total_conversations")
                        .map_err(|err| err.to_string())?,
                    after_hours_conversations: row
                        .try_get("after_hours_conversations")
                        .map_err(|err| err.to_string())?,
                    avg_response_time_ms: row
                        .try_get("avg_response_time_ms")
                        .map_err(|err| err.to_string())?,
                    avg_messages_per_conversation: row
                        .try_get("avg_messages_per_conversation")
                        .map_err(|err| err.to_string())?,
                    peak_hour: row.try_get("peak_hour").map_err(|err| err.to_string())?,
                    channel_webchat: row
                        .try_get("channel_webchat")
                        .map_err(|err| err.to_string())?,
                    channel_instagram: row
                        .try_get("channel_instagram")
                        .map_err(|err| err.to_string())?,
                    leads_captured: row
                        .try_get("leads_captured")
                        .map_err(|err| err.to_string())?,
                }))
            }
        }
    }

    pub async fn put_daily(&self, record: &DailyAnalyticsRecord) -> Result<(), String> {
        match &self.backend {
            StoreBackend::Memory(inner) => {
                inner
                    .lock()
                    .expect("store lock poisoned")
                    .daily
                    .insert((record.tenant_id.clone(), record.date.clone()), record.clone());
                Ok(())
            }
            StoreBackend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO daily_analytics \
                        (tenant_id, date, total_conversations, after_hours_conversations, \
                         avg_response_time_ms, avg_messages_per_conversation, peak_hour, \
                         channel_webchat, channel_instagram, leads_captured) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                     ON CONFLICT (tenant_id, date) DO UPDATE SET \
                        total_conversations = EXCLUDED.total_conversations, \
                        after_hours_conversations = EXCLUDED.after_hours_conversations, \
                        avg_response_time_ms = EXCLUDED.avg_response_time_ms, \
                        avg_messages_per_conversation = EXCLUDED.avg_messages_per_conversation, \
                        peak_hour = EXCLUDED.peak_hour, \
                        channel_webchat = EXCLUDED.channel_webchat, \
                        channel_instagram = EXCLUDED.channel_instagram, \
                        leads_captured = EXCLUDED.leads_captured",
                )
                .bind(&record.tenant_id)
                .bind(&record.date)
                .bind(record.total_conversations)
                .bind(record.after_hours_conversations)
                .bind(record.avg_response_time_ms)
                .bind(record.avg_messages_per_conversation)
                .bind(record.peak_hour)
                .bind(record.channel_webchat)
                .bind(record.channel_instagram)
                .bind(record.leads_captured)
                .execute(pool)
                .await
                .map_err(|err| format!("analytics upsert failed: {err}"))?;
                Ok(())
            }
        }
    }

    pub async fn insert_engagement(&self, event: &EngagementEvent) -> Result<(), String> {
        match &self.backend {
            StoreBackend::Memory(inner) => {
                inner
                    .lock()
                    .expect("store lock poisoned")
                    .engagement
                    .push(event.clone());
                Ok(())
            }
            StoreBackend::Postgres(pool) => {
                let payload =
                    serde_json::to_string(&event.payload).map_err(|err| err.to_string())?;
                sqlx::query(
                    "INSERT INTO engagement_events (id, tenant_id, event_type, session_id, payload, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(&event.id)
                .bind(&event.tenant_id)
                .bind(&event.event_type)
                .bind(&event.session_id)
                .bind(payload)
                .bind(&event.created_at)
                .execute(pool)
                .await
                .map_err(|err| format!("engagement insert failed: {err}"))?;
                Ok(())
            }
        }
    }

    /// Test and report helpers over the memory backend.
    pub async fn leads_for_tenant(&self, tenant_id: &str) -> Result<Vec<LeadRecord>, String> {
        match &self.backend {
            StoreBackend::Memory(inner) => {
                let inner = inner.lock().expect("store lock poisoned");
                Ok(inner
                    .leads
                    .iter()
                    .filter(|l| l.tenant_id == tenant_id)
                    .cloned()
                    .collect())
            }
            StoreBackend::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT id, tenant_id, conversation_id, email, phone, channel, created_at \
                     FROM leads WHERE tenant_id = $1 ORDER BY created_at",
                )
                .bind(tenant_id)
                .fetch_all(pool)
                .await
                .map_err(|err| format!("lead query failed: {err}"))?;
                let mut leads = Vec::with_capacity(rows.len());
                for row in rows {
                    leads.push(LeadRecord {
                        id: row.try_get("id").map_err(|err| err.to_string())?,
                        tenant_id: row.try_get("tenant_id").map_err(|err| err.to_string())?,
                        conversation_id: row
                            .try_get("conversation_id")
                            .map_err(|err| err.to_string())?,
                        email: row.try_get("email").map_err(|err| err.to_string())?,
                        phone: row.try_get("phone").map_err(|err| err.to_string())?,
                        channel: row.try_get("channel").map_err(|err| err.to_string())?,
                        created_at: row.try_get("created_at").map_err(|err| err.to_string())?,
                    });
                }
                Ok(leads)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_iso;

    fn tenant(id: &str, status: &str) -> Tenant {
        Tenant {
            id: id.to_string(),
            status: status.to_string(),
            domain: format!("{id}.example"),
            platform_recipient_ids: vec![format!("page-{id}")],
            config: Default::default(),
        }
    }

    #[tokio::test]
    async fn active_tenant_listing_filters_inactive() {
        let store = Store::memory_with_tenants(vec![tenant("a", "active"), tenant("b", "inactive")]);
        let active = store.list_active_tenants().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
    }

    #[tokio::test]
    async fn latest_conversation_is_most_recent_insert() {
        let store = Store::memory();
        for n in 0..3 {
            store
                .insert_conversation(&ConversationLog {
                    id: format!("conv-{n}"),
                    tenant_id: "a".to_string(),
                    channel: "webchat".to_string(),
                    user_text: "hi".to_string(),
                    reply_text: "hello".to_string(),
                    created_at: now_iso(),
                })
                .await
                .unwrap();
        }
        let latest = store.latest_conversation_id("a").await.unwrap();
        assert_eq!(latest.as_deref(), Some("conv-2"));
        assert_eq!(store.latest_conversation_id("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn daily_record_roundtrips_and_overwrites() {
        let store = Store::memory();
        assert_eq!(store.get_daily("a", "2026-08-25").await.unwrap(), None);

        let mut record = DailyAnalyticsRecord::empty("a", "2026-08-25");
        record.total_conversations = 1;
        store.put_daily(&record).await.unwrap();

        record.total_conversations = 2;
        store.put_daily(&record).await.unwrap();

        let stored = store.get_daily("a", "2026-08-25").await.unwrap().unwrap();
        assert_eq!(stored.total_conversations, 2);
    }
}
