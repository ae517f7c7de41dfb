//! Audit archival
//!
//! Expired audit rows flow through the stream as REMOVE events. The
//! archiver deserialises them, groups by calendar-day partition, and
//! writes one gzipped JSONL object per partition to an object store
//! under `audit/year=YYYY/month=MM/day=DD/`. One bad record never aborts
//! the batch; errors are collected and reported alongside the successes.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::warn;

use crate::schema;
use crate::store::{get_s, AttrValue, StreamEventType, StreamRecord};

/// MIME type of the archived objects.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/x-ndjson";

/// Content encoding of the archived objects.
pub const ARCHIVE_CONTENT_ENCODING: &str = "gzip";

/// Archive sink errors.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The sink rejected the write.
    #[error("object store error: {0}")]
    Sink(String),

    /// I/O failure building or writing the object.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where archived objects land. Production deployments bind this to a
/// blob store; tests and the local CLI use the in-memory and filesystem
/// sinks below.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write one object.
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        content_encoding: &str,
    ) -> Result<(), ArchiveError>;
}

/// In-memory object sink for tests.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryObjectStore {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored object keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Body of one stored object.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|e| e.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
        _content_encoding: &str,
    ) -> Result<(), ArchiveError> {
        self.objects.insert(key.to_string(), body);
        Ok(())
    }
}

/// Filesystem object sink: object keys become paths under a root
/// directory. Used by the local CLI backend.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Sink rooted at a directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
        _content_encoding: &str,
    ) -> Result<(), ArchiveError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        Ok(())
    }
}

// ============================================================================
// Event extraction
// ============================================================================

/// One audit event as it will appear in the archive.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ArchivedEvent {
    /// Event id (UUIDv7).
    pub event_id: String,
    /// Client wall-clock timestamp, ISO-8601.
    pub timestamp: String,
    /// Entity the action targeted.
    pub entity_id: String,
    /// Action performed.
    pub action: String,
    /// Acting principal.
    pub principal: Option<String>,
    /// Resource the action targeted.
    pub resource: Option<String>,
    /// Structured action details.
    pub details: serde_json::Value,
}

/// Extract an archivable audit event from a stream record. Only REMOVE
/// events of audit rows qualify; everything else returns `None`.
pub fn extract_audit_event(record: &StreamRecord) -> Option<ArchivedEvent> {
    if record.event != StreamEventType::Remove {
        return None;
    }
    if !record.key.sk.starts_with(schema::SK_AUDIT) || !record.key.pk.contains("/AUDIT#") {
        return None;
    }
    let image = record.old_image.as_ref()?;

    Some(ArchivedEvent {
        event_id: get_s(image, "event_id")
            .map(str::to_string)
            .unwrap_or_else(|| record.key.sk.trim_start_matches("#AUDIT#").to_string()),
        timestamp: get_s(image, "timestamp").unwrap_or_default().to_string(),
        entity_id: get_s(image, "entity_id").unwrap_or_default().to_string(),
        action: get_s(image, "action").unwrap_or_default().to_string(),
        principal: get_s(image, "principal").map(str::to_string),
        resource: get_s(image, "resource").map(str::to_string),
        details: image
            .get("details")
            .map(AttrValue::to_json)
            .unwrap_or(serde_json::Value::Null),
    })
}

// ============================================================================
// Object layout
// ============================================================================

/// Gzipped JSONL body: one compact JSON object per line.
pub fn create_jsonl_gzip(events: &[ArchivedEvent]) -> Result<Vec<u8>, ArchiveError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        let line = serde_json::to_string(event)
            .map_err(|e| ArchiveError::Sink(format!("serialisation failed: {e}")))?;
        encoder.write_all(line.as_bytes())?;
        encoder.write_all(b"\n")?;
    }
    Ok(encoder.finish()?)
}

/// Calendar-day partition of an event timestamp. Falls back to the
/// supplied wall clock when the timestamp does not parse.
pub fn partition_key(timestamp: &str, fallback_ms: i64) -> String {
    let dt = DateTime::parse_from_rfc3339(&timestamp.replace('Z', "+00:00"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| DateTime::from_timestamp_millis(fallback_ms))
        .unwrap_or_default();
    format!(
        "audit/year={}/month={:02}/day={:02}",
        dt.format("%Y"),
        dt.format("%m"),
        dt.format("%d")
    )
}

/// Full object key inside a partition. Colons and plus signs in the
/// timestamp are sanitised for filename safety.
pub fn object_key(partition: &str, request_id: &str, timestamp: &str) -> String {
    let sanitised = timestamp.replace([':', '+'], "-");
    format!("{partition}/audit-{request_id}-{sanitised}.jsonl.gz")
}

/// Archive a batch of audit events, one object per day partition.
/// Returns the number of events archived; sink failures are logged,
/// appended to `errors`, and do not abort the remaining partitions.
pub async fn archive_audit_events(
    sink: &dyn ObjectStore,
    events: Vec<ArchivedEvent>,
    request_id: &str,
    now_ms: i64,
    errors: &mut Vec<String>,
) -> usize {
    if events.is_empty() {
        return 0;
    }

    let mut by_partition: BTreeMap<String, Vec<ArchivedEvent>> = BTreeMap::new();
    for event in events {
        by_partition
            .entry(partition_key(&event.timestamp, now_ms))
            .or_default()
            .push(event);
    }

    let mut archived = 0;
    for (partition, group) in by_partition {
        let timestamp = group
            .first()
            .map(|e| e.timestamp.clone())
            .unwrap_or_default();
        let count = group.len();
        let body = match create_jsonl_gzip(&group) {
            Ok(body) => body,
            Err(err) => {
                warn!(%partition, %err, "failed to build archive object");
                errors.push(format!("archive {partition}: {err}"));
                continue;
            }
        };
        let key = object_key(&partition, request_id, &timestamp);
        match sink
            .put(&key, body, ARCHIVE_CONTENT_TYPE, ARCHIVE_CONTENT_ENCODING)
            .await
        {
            Ok(()) => archived += count,
            Err(err) => {
                warn!(%key, %err, "failed to write archive object");
                errors.push(format!("archive {key}: {err}"));
            }
        }
    }
    archived
}
