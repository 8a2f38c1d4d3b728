//! Correlation-keyed stage log for end-to-end request forensics.
//!
//! Every stage transition appends here before the next stage begins, so the
//! record for an artifact reads as the dispatcher's program order. Writes
//! never fail the caller: anything that goes wrong is logged and swallowed.
//! Records age out after a sliding TTL; completed requests additionally get
//! a short delayed eviction so their logs stay queryable for a few minutes.

use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metrics::epoch_ms;

/// Sliding lifetime of one tracking record.
const RECORD_TTL: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Clone, Debug, Serialize)]
pub struct StageRecord {
    pub stage: String,
    pub timestamp_ms: u64,
    pub payload: serde_json::Value,
}

struct TrackingRecord {
    stages: Vec<StageRecord>,
    last_touch: Instant,
}

#[derive(Clone)]
pub struct TrackingStore {
    records: Arc<DashMap<String, TrackingRecord>>,
}

impl TrackingStore {
    pub fn new() -> Self {
        Self { records: Arc::new(DashMap::new()) }
    }

    /// Appends a stage entry with a per-record monotonic timestamp.
    pub fn append(&self, artifact_id: &str, stage: &str, payload: serde_json::Value) {
        let now = Instant::now();
        let mut record = self
            .records
            .entry(artifact_id.to_string())
            .or_insert_with(|| TrackingRecord { stages: Vec::new(), last_touch: now });

        // Wall clock can step backwards; the stage log must not.
        let floor = record.stages.last().map(|s| s.timestamp_ms).unwrap_or(0);
        let timestamp_ms = epoch_ms().max(floor);

        record.stages.push(StageRecord {
            stage: stage.to_string(),
            timestamp_ms,
            payload,
        });
        record.last_touch = now;
        tracing::debug!(artifact_id, stage, "stage recorded");
    }

    /// Full ordered stage list for an artifact, if still retained.
    pub fn record(&self, artifact_id: &str) -> Option<Vec<StageRecord>> {
        self.records.get(artifact_id).map(|r| r.stages.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Removes the record after `delay`. Used once a request terminates so
    /// the log survives briefly for inspection.
    pub fn schedule_eviction(&self, artifact_id: &str, delay: Duration) {
        let records = self.records.clone();
        let artifact_id = artifact_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            records.remove(&artifact_id);
        });
    }

    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.records
            .retain(|_, r| now.duration_since(r.last_touch) < RECORD_TTL);
    }

    pub async fn janitor(&self, interval: Duration, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(interval.max(Duration::from_secs(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tick.tick() => self.sweep_expired(),
            }
        }
    }
}

impl Default for TrackingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn stages_append_in_order_with_monotonic_timestamps() {
        let store = TrackingStore::new();
        for stage in ["received", "acquire-slot", "hash", "completed"] {
            store.append("art-1", stage, json!({}));
        }

        let stages = store.record("art-1").unwrap();
        assert_eq!(
            stages.iter().map(|s| s.stage.as_str()).collect::<Vec<_>>(),
            vec!["received", "acquire-slot", "hash", "completed"]
        );
        for pair in stages.windows(2) {
            assert!(pair[0].timestamp_ms <= pair[1].timestamp_ms);
        }
    }

    #[tokio::test]
    async fn unknown_artifact_has_no_record() {
        let store = TrackingStore::new();
        assert!(store.record("nope").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_eviction_removes_record() {
        let store = TrackingStore::new();
        store.append("art-2", "received", json!({}));
        store.schedule_eviction("art-2", Duration::from_secs(300));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(store.record("art-2").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(store.record("art-2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_stale_records() {
        let store = TrackingStore::new();
        store.append("old", "received", json!({}));
        tokio::time::advance(RECORD_TTL + Duration::from_secs(1)).await;
        store.append("fresh", "received", json!({}));

        store.sweep_expired();
        assert!(store.record("old").is_none());
        assert!(store.record("fresh").is_some());
    }
}
