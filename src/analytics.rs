use chrono::{DateTime, Duration, Timelike, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::leads::LeadHit;
use crate::store::Store;
use crate::types::{now_iso, Channel, DailyAnalyticsRecord, LeadRecord};

/// Business-hours window in local time, after shifting UTC by a fixed offset
/// (AEST, matching the lead extractor's phone tuning).
const LOCAL_UTC_OFFSET_HOURS: i64 = 10;
const BUSINESS_OPEN_HOUR: u32 = 9;
const BUSINESS_CLOSE_HOUR: u32 = 17;

fn local_date_and_hour(timestamp: DateTime<Utc>) -> (String, u32) {
    let local = timestamp + Duration::hours(LOCAL_UTC_OFFSET_HOURS);
    (local.format("%Y-%m-%d").to_string(), local.hour())
}

fn is_after_hours(local_hour: u32) -> bool {
    local_hour < BUSINESS_OPEN_HOUR || local_hour >= BUSINESS_CLOSE_HOUR
}

fn weighted_mean(old_avg: f64, old_count: i64, sample: f64) -> f64 {
    (old_avg * old_count as f64 + sample) / (old_count + 1) as f64
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Merge one completed exchange into the daily record. Pure, so the running
/// average behavior is testable without a store.
pub fn merge_exchange(
    existing: Option<DailyAnalyticsRecord>,
    tenant_id: &str,
    date: &str,
    channel: Channel,
    response_time_ms: Option<f64>,
    message_count: Option<f64>,
    local_hour: u32,
) -> DailyAnalyticsRecord {
    let mut record =
        existing.unwrap_or_else(|| DailyAnalyticsRecord::empty(tenant_id, date));
    let old_count = record.total_conversations;

    record.total_conversations += 1;
    if is_after_hours(local_hour) {
        record.after_hours_conversations += 1;
    }
    if let Some(sample) = response_time_ms {
        record.avg_response_time_ms = weighted_mean(record.avg_response_time_ms, old_count, sample);
    }
    if let Some(sample) = message_count {
        record.avg_messages_per_conversation = round_one_decimal(weighted_mean(
            record.avg_messages_per_conversation,
            old_count,
            sample,
        ));
    }
    // Last write wins, kept for parity with historical reports even though a
    // histogram max would be more truthful.
    record.peak_hour = local_hour as i32;
    match channel {
        Channel::Webchat => record.channel_webchat += 1,
        Channel::Instagram => record.channel_instagram += 1,
    }
    record
}

fn merge_lead(existing: Option<DailyAnalyticsRecord>, tenant_id: &str, date: &str) -> DailyAnalyticsRecord {
    let mut record =
        existing.unwrap_or_else(|| DailyAnalyticsRecord::empty(tenant_id, date));
    record.leads_captured += 1;
    record
}

/// Accumulates per-tenant, per-day counters via read-merge-upsert. The
/// read-modify-write is serialized behind one async mutex; the deployment is
/// single-instance so this is the whole story for write safety. Callers run
/// it from detached tasks and treat every error as log-and-forget.
pub struct Aggregator {
    gate: Mutex<()>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self { gate: Mutex::new(()) }
    }

    pub async fn record_exchange(
        &self,
        store: &Store,
        tenant_id: &str,
        channel: Channel,
        response_time_ms: Option<f64>,
        message_count: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> Result<(), String> {
        let (date, local_hour) = local_date_and_hour(timestamp);
        let _guard = self.gate.lock().await;
        let existing = store.get_daily(tenant_id, &date).await?;
        let merged = merge_exchange(
            existing,
            tenant_id,
            &date,
            channel,
            response_time_ms,
            message_count,
            local_hour,
        );
        store.put_daily(&merged).await
    }

    /// Attach the lead to the tenant's most recent conversation and bump the
    /// day's lead counter through the same merge discipline.
    pub async fn record_lead(
        &self,
        store: &Store,
        tenant_id: &str,
        channel: Channel,
        hit: &LeadHit,
        timestamp: DateTime<Utc>,
    ) -> Result<(), String> {
        let conversation_id = store.latest_conversation_id(tenant_id).await?;
        store
            .insert_lead(&LeadRecord {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                conversation_id,
                email: hit.email.clone(),
                phone: hit.phone.clone(),
                channel: channel.as_str().to_string(),
                created_at: now_iso(),
            })
            .await?;

        let (date, _) = local_date_and_hour(timestamp);
        let _guard = self.gate.lock().await;
        let existing = store.get_daily(tenant_id, &date).await?;
        let merged = merge_lead(existing, tenant_id, &date);
        store.put_daily(&merged).await
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}
