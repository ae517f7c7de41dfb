//! Consumption delta extraction and snapshot upserts
//!
//! A MODIFY on a composite bucket row carries every limit of the
//! (entity, resource) in one stream event. Deltas come from diffing the
//! `b_{limit}_tc` monotonic counters between the OLD and NEW images; the
//! shared `rf` timestamp dates the consumption.
//!
//! Snapshot rows are deliberately FLAT: one update both creates the row
//! (SET ... if-not-exists for the identity fields) and increments the
//! counters (ADD). A nested map cannot do that atomically, because a SET of
//! the map path overlaps an ADD inside it, so per-limit counters live as
//! top-level attributes named by the limit.

use chrono::{DateTime, Datelike, TimeZone, Utc};

use crate::models::{Window, MILLI};
use crate::schema;
use crate::store::{
    get_n, get_s, AttrValue, Key, StreamEventType, StreamRecord, UpdateOp,
};

/// Net consumption of one limit, reconstructed from a stream record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionDelta {
    /// Namespace the bucket belongs to.
    pub namespace: String,
    /// Consuming entity.
    pub entity_id: String,
    /// Resource consumed.
    pub resource: String,
    /// Limit whose counter moved.
    pub limit_name: String,
    /// Millitokens consumed (negative when tokens were returned).
    pub tokens_delta_milli: i64,
    /// Bucket refill timestamp at the time of the change.
    pub timestamp_ms: i64,
}

/// Whether a stream record describes a bucket shard row.
pub fn is_bucket_record(key: &Key) -> bool {
    key.sk == schema::SK_STATE && key.pk.contains("/BUCKET#")
}

/// Namespace prefix of a partition key.
pub fn namespace_of(key: &Key) -> Option<&str> {
    key.pk.split('/').next().filter(|ns| !ns.is_empty())
}

/// Extract one delta per limit whose consumption counter changed.
///
/// Non-bucket records, non-MODIFY events, zero deltas, counters missing
/// from either image, and the `__wcu__` infrastructure limit are all
/// skipped.
pub fn extract_deltas(record: &StreamRecord) -> Vec<ConsumptionDelta> {
    if record.event != StreamEventType::Modify || !is_bucket_record(&record.key) {
        return Vec::new();
    }
    let (Some(new_image), Some(old_image)) = (&record.new_image, &record.old_image) else {
        return Vec::new();
    };
    let Some(namespace) = namespace_of(&record.key) else {
        return Vec::new();
    };
    let Some(entity_id) = get_s(new_image, "entity_id").filter(|id| !id.is_empty()) else {
        return Vec::new();
    };
    let Some(resource) = get_s(new_image, "resource").filter(|r| !r.is_empty()) else {
        return Vec::new();
    };
    let rf_ms = get_n(new_image, "rf").unwrap_or(0);

    let mut deltas = Vec::new();
    for limit_name in schema::limit_names_in(new_image.keys().map(String::as_str)) {
        if limit_name == schema::WCU_LIMIT_NAME {
            continue;
        }
        let attr = schema::bucket_attr(&limit_name, schema::FIELD_TC);
        let (Some(new_tc), Some(old_tc)) = (get_n(new_image, &attr), get_n(old_image, &attr))
        else {
            continue;
        };
        let tokens_delta_milli = new_tc - old_tc;
        if tokens_delta_milli == 0 {
            continue;
        }
        deltas.push(ConsumptionDelta {
            namespace: namespace.to_string(),
            entity_id: entity_id.to_string(),
            resource: resource.to_string(),
            limit_name,
            tokens_delta_milli,
            timestamp_ms: rf_ms,
        });
    }
    deltas
}

// ============================================================================
// Windows
// ============================================================================

/// ISO timestamp of the window containing `timestamp_ms`.
pub fn window_key(timestamp_ms: i64, window: Window) -> String {
    let dt = DateTime::from_timestamp_millis(timestamp_ms).unwrap_or(DateTime::UNIX_EPOCH);
    match window {
        Window::Hourly => dt.format("%Y-%m-%dT%H:00:00Z").to_string(),
        Window::Daily => dt.format("%Y-%m-%dT00:00:00Z").to_string(),
        Window::Monthly => dt.format("%Y-%m-01T00:00:00Z").to_string(),
    }
}

/// ISO timestamp of the last second of a window.
pub fn window_end(window_start: &str, window: Window) -> String {
    let Ok(dt) = DateTime::parse_from_rfc3339(&window_start.replace('Z', "+00:00")) else {
        return window_start.to_string();
    };
    let dt = dt.with_timezone(&Utc);
    let end = match window {
        Window::Hourly => dt + chrono::Duration::seconds(3599),
        Window::Daily => dt + chrono::Duration::seconds(86_399),
        Window::Monthly => {
            let (year, month) = if dt.month() == 12 {
                (dt.year() + 1, 1)
            } else {
                (dt.year(), dt.month() + 1)
            };
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
                .single()
                .map(|next| next - chrono::Duration::seconds(1))
                .unwrap_or(dt)
        }
    };
    end.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Snapshot expiry in epoch seconds.
pub fn snapshot_ttl(now_ms: i64, ttl_days: i64) -> i64 {
    now_ms / 1000 + ttl_days * 86_400
}

/// Build the atomic snapshot upsert for one delta and window.
///
/// Counters are stored in whole tokens; the event count rides along so
/// dashboards can distinguish one large consume from many small ones.
pub fn build_snapshot_update(delta: &ConsumptionDelta, window: Window, ttl_epoch_s: i64) -> UpdateOp {
    let start = window_key(delta.timestamp_ms, window);
    let key = Key::new(
        schema::pk_entity(&delta.namespace, &delta.entity_id),
        schema::sk_usage(&delta.resource, &start),
    );

    UpdateOp::new(key)
        .set("entity_id", delta.entity_id.as_str())
        .set_if_not_exists("resource", delta.resource.as_str())
        .set_if_not_exists("window", window.as_str())
        .set_if_not_exists("window_start", start.as_str())
        .set_if_not_exists(
            "GSI2PK",
            schema::gsi2_pk_resource(&delta.namespace, &delta.resource),
        )
        .set_if_not_exists(
            "GSI2SK",
            schema::gsi2_sk_usage(&start, &delta.entity_id),
        )
        .set_if_not_exists("GSI4PK", delta.namespace.as_str())
        .set_if_not_exists("ttl", AttrValue::N(ttl_epoch_s))
        .add(delta.limit_name.clone(), delta.tokens_delta_milli.div_euclid(MILLI))
        .add("total_events", 1)
}
