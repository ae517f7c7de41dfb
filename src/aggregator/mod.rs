//! Stream-driven aggregation
//!
//! Consumes ordered change-stream batches and performs, per batch:
//!
//! 1. **Delta extraction**: consumption deltas from bucket MODIFY
//!    images.
//! 2. **Snapshot upserts**: one flat atomic update per
//!    (entity, resource, window, delta).
//! 3. **Proactive refill**: tops up buckets trending empty, commutative
//!    with concurrent client consumes.
//! 4. **Proactive sharding**: doubles `shard_count` under write-capacity
//!    pressure and materialises the new shard rows.
//! 5. **Audit archival**: expired audit rows become gzipped JSONL
//!    objects.
//!
//! Per-record failures are captured into the result's `errors` list; the
//! batch always completes. Snapshot failures are also reflected in
//! `retryable` so the stream consumer can avoid advancing its offset
//! past them.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::models::{Clock, Window};
use crate::store::{StreamRecord, WideRowStore};

pub mod archive;
pub mod delta;
pub mod refill;

pub use archive::{ArchivedEvent, FsObjectStore, MemoryObjectStore, ObjectStore};
pub use delta::{build_snapshot_update, extract_deltas, window_end, window_key, ConsumptionDelta};
pub use refill::{
    aggregate_bucket_states, propagate_shard_count, try_proactive_shard, try_refill_bucket,
    BucketRefillState, LimitRefillInfo,
};

/// Aggregator tuning knobs.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Windows to maintain snapshots for.
    pub windows: Vec<Window>,
    /// Snapshot retention.
    pub snapshot_ttl_days: i64,
    /// Write-capacity consumption fraction that triggers shard doubling.
    /// Deliberately a knob: the right threshold depends on the table's
    /// provisioned throughput.
    pub wcu_shard_threshold: f64,
    /// Enable proactive refill.
    pub refill_enabled: bool,
    /// Enable proactive sharding.
    pub sharding_enabled: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            windows: vec![Window::Hourly, Window::Daily],
            snapshot_ttl_days: 90,
            wcu_shard_threshold: 0.8,
            refill_enabled: true,
            sharding_enabled: true,
        }
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessResult {
    /// Stream records inspected.
    pub processed_count: usize,
    /// Snapshot updates written.
    pub snapshots_updated: usize,
    /// Buckets proactively refilled.
    pub refills_applied: usize,
    /// New shard rows created.
    pub shards_created: usize,
    /// Audit events archived.
    pub events_archived: usize,
    /// Per-record errors. The batch completed despite them.
    pub errors: Vec<String>,
    /// Whether any snapshot write failed and the batch should be
    /// redelivered by the stream machinery.
    pub retryable: bool,
}

/// The stream worker.
pub struct StreamAggregator {
    store: Arc<dyn WideRowStore>,
    sink: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    config: AggregatorConfig,
}

impl StreamAggregator {
    /// Aggregator over a store and an archival sink.
    pub fn new(
        store: Arc<dyn WideRowStore>,
        sink: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            store,
            sink,
            clock,
            config,
        }
    }

    /// Process one ordered batch of stream records.
    pub async fn process_batch(&self, records: &[StreamRecord]) -> ProcessResult {
        let started = std::time::Instant::now();
        let now_ms = self.clock.now_ms();
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut result = ProcessResult {
            processed_count: records.len(),
            ..ProcessResult::default()
        };

        info!(record_count = records.len(), %request_id, "batch processing started");

        // 1+2. Consumption deltas into window snapshots.
        for record in records {
            for delta in delta::extract_deltas(record) {
                for window in &self.config.windows {
                    let ttl = delta::snapshot_ttl(now_ms, self.config.snapshot_ttl_days);
                    let op = delta::build_snapshot_update(&delta, *window, ttl);
                    match self.store.update_item(op).await {
                        Ok(_) => result.snapshots_updated += 1,
                        Err(err) => {
                            warn!(
                                entity_id = %delta.entity_id,
                                resource = %delta.resource,
                                limit_name = %delta.limit_name,
                                window = %window,
                                %err,
                                "snapshot update failed"
                            );
                            result.errors.push(format!(
                                "snapshot {}/{} {}: {err}",
                                delta.entity_id, delta.resource, window
                            ));
                            result.retryable = true;
                        }
                    }
                }
            }
        }

        // 3. Proactive refill per bucket, from the batch's net view.
        if self.config.refill_enabled {
            for state in refill::aggregate_bucket_states(records).values() {
                match refill::try_refill_bucket(self.store.as_ref(), state, now_ms).await {
                    Ok(true) => {
                        debug!(
                            entity_id = %state.entity_id,
                            resource = %state.resource,
                            shard = state.shard,
                            "proactive refill applied"
                        );
                        result.refills_applied += 1;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        result
                            .errors
                            .push(format!("refill {}/{}: {err}", state.entity_id, state.resource));
                    }
                }

                if self.config.sharding_enabled {
                    match refill::try_proactive_shard(
                        self.store.as_ref(),
                        state,
                        self.config.wcu_shard_threshold,
                    )
                    .await
                    {
                        Ok(true) => {
                            info!(
                                entity_id = %state.entity_id,
                                resource = %state.resource,
                                shard_count = state.shard_count * 2,
                                "shard count doubled"
                            );
                        }
                        Ok(false) => {}
                        Err(err) => {
                            result
                                .errors
                                .push(format!("shard {}/{}: {err}", state.entity_id, state.resource));
                        }
                    }
                }
            }
        }

        // 4. Materialise shards announced by shard_count changes.
        if self.config.sharding_enabled {
            for record in records {
                match refill::propagate_shard_count(self.store.as_ref(), record).await {
                    Ok(created) => result.shards_created += created as usize,
                    Err(err) => result.errors.push(format!("shard propagation: {err}")),
                }
            }
        }

        // 5. Archive expired audit rows.
        let events: Vec<ArchivedEvent> = records.iter().filter_map(archive::extract_audit_event).collect();
        result.events_archived += archive::archive_audit_events(
            self.sink.as_ref(),
            events,
            &request_id,
            now_ms,
            &mut result.errors,
        )
        .await;

        info!(
            processed_count = result.processed_count,
            snapshots_updated = result.snapshots_updated,
            refills_applied = result.refills_applied,
            shards_created = result.shards_created,
            events_archived = result.events_archived,
            error_count = result.errors.len(),
            processing_time_ms = started.elapsed().as_millis() as u64,
            "batch processing completed"
        );
        result
    }
}
