//! In-memory stream bus with consumer-group semantics.
//!
//! The default backend: an append-only log per stream, per-group cursors,
//! and a pending list per group that empties on ack. Pending entries carry
//! their delivery time so `reclaim_stale` can re-deliver messages stranded
//! by a consumer that died before acking. Used in production as the
//! embedded fallback and everywhere in tests, where `set_connected`
//! simulates an outage without tearing anything down.
//!
//! Streams are bounded rings: the oldest entries fall off once a stream
//! reaches its capacity, matching the approximate trimming a real deployment
//! applies with MAXLEN.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Fields, MessageId, StreamBus};
use crate::metrics::epoch_ms;

/// Entries retained per stream before the oldest are dropped.
const STREAM_CAPACITY: usize = 10_000;

struct Entry {
    seq: u64,
    id: MessageId,
    fields: Fields,
}

struct PendingEntry {
    seq: u64,
    /// Last delivery time; reset when the message is reclaimed.
    delivered_at: Instant,
}

#[derive(Default)]
struct GroupState {
    /// Sequence of the last entry delivered to this group.
    cursor: u64,
    /// Delivered but not yet acked, by message id.
    pending: HashMap<String, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: VecDeque<Entry>,
    groups: HashMap<String, GroupState>,
}

struct StreamInner {
    state: Mutex<StreamState>,
    appended: Notify,
}

pub struct MemoryBus {
    streams: DashMap<String, Arc<StreamInner>>,
    seq: AtomicU64,
    connected: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            seq: AtomicU64::new(0),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulates losing or regaining the bus. While disconnected every
    /// operation fails the way a dead socket would.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Messages delivered to `group` on `stream` and not yet acked.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .get(stream)
            .map(|s| {
                s.state
                    .lock()
                    .groups
                    .get(group)
                    .map(|g| g.pending.len())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Total entries currently retained on a stream.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams
            .get(stream)
            .map(|s| s.state.lock().entries.len())
            .unwrap_or(0)
    }

    fn stream(&self, name: &str) -> Arc<StreamInner> {
        self.streams
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(StreamInner {
                    state: Mutex::new(StreamState::default()),
                    appended: Notify::new(),
                })
            })
            .clone()
    }

    fn check_connected(&self) -> anyhow::Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow::anyhow!("bus unreachable"))
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamBus for MemoryBus {
    async fn publish(&self, stream: &str, fields: &Fields) -> anyhow::Result<MessageId> {
        self.check_connected()?;
        let inner = self.stream(stream);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let id = MessageId(format!("{}-{seq}", epoch_ms()));

        let mut state = inner.state.lock();
        if state.entries.len() == STREAM_CAPACITY {
            state.entries.pop_front();
        }
        state.entries.push_back(Entry { seq, id: id.clone(), fields: fields.clone() });
        drop(state);

        inner.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> anyhow::Result<()> {
        self.check_connected()?;
        let inner = self.stream(stream);
        let mut state = inner.state.lock();
        // Creating an existing group is success, like BUSYGROUP.
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        batch: usize,
        block: Duration,
    ) -> anyhow::Result<Vec<(MessageId, Fields)>> {
        self.check_connected()?;
        let inner = self.stream(stream);
        let deadline = Instant::now() + block;

        loop {
            // Register wakeup interest before looking, so an append landing
            // between the check and the wait is never missed.
            let mut appended = std::pin::pin!(inner.appended.notified());
            appended.as_mut().enable();

            {
                let mut state = inner.state.lock();
                let cursor = state.groups.entry(group.to_string()).or_default().cursor;

                let fresh: Vec<(u64, MessageId, Fields)> = state
                    .entries
                    .iter()
                    .filter(|e| e.seq > cursor)
                    .take(batch.max(1))
                    .map(|e| (e.seq, e.id.clone(), e.fields.clone()))
                    .collect();

                if !fresh.is_empty() {
                    let now = Instant::now();
                    let group_state = state.groups.entry(group.to_string()).or_default();
                    let mut out = Vec::with_capacity(fresh.len());
                    for (seq, id, fields) in fresh {
                        group_state.cursor = seq;
                        group_state
                            .pending
                            .insert(id.0.clone(), PendingEntry { seq, delivered_at: now });
                        out.push((id, fields));
                    }
                    return Ok(out);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = &mut appended => {}
                _ = tokio::time::sleep(remaining) => return Ok(Vec::new()),
            }
            self.check_connected()?;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &MessageId) -> anyhow::Result<()> {
        self.check_connected()?;
        let inner = self.stream(stream);
        let mut state = inner.state.lock();
        if let Some(group_state) = state.groups.get_mut(group) {
            if group_state.pending.remove(&id.0).is_none() {
                tracing::debug!(stream, group, id = %id, "ack for a message not pending");
            }
        }
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        min_idle: Duration,
    ) -> anyhow::Result<Vec<(MessageId, Fields)>> {
        self.check_connected()?;
        let inner = self.stream(stream);
        let mut state = inner.state.lock();
        let now = Instant::now();

        let stale: Vec<(String, u64)> = match state.groups.get(group) {
            Some(group_state) => group_state
                .pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
                .map(|(id, p)| (id.clone(), p.seq))
                .collect(),
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        for (id, seq) in stale {
            let fields = state
                .entries
                .iter()
                .find(|e| e.seq == seq)
                .map(|e| e.fields.clone());
            let Some(group_state) = state.groups.get_mut(group) else { break };
            match fields {
                Some(fields) => {
                    if let Some(pending) = group_state.pending.get_mut(&id) {
                        pending.delivered_at = now;
                    }
                    out.push((MessageId(id), fields));
                }
                None => {
                    // The entry fell off the bounded ring; nothing left to
                    // redeliver, so stop carrying it as pending.
                    tracing::warn!(stream, group, id = %id, "pending message trimmed before reclaim");
                    group_state.pending.remove(&id);
                }
            }
        }
        Ok(out)
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
