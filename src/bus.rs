//! Bidirectional stream client over a log-structured message bus.
//!
//! The bus has Redis Streams semantics: append-only streams with monotonic
//! ids, named consumer groups with per-group cursors, and explicit acks for
//! delivered messages. Two backends satisfy the same [`StreamBus`] trait:
//! the built-in in-memory bus (always available, also the test double) and,
//! behind the `redis-bus` feature, a real Redis connection.
//!
//! [`BusClient`] layers on top: the stream name table, request/response
//! pairing keyed by artifact id, fire-and-forget telemetry emission, and
//! degraded mode. When the backend is unreachable, publishes become no-ops
//! and awaited responses synthesize a neutral degraded outcome after a
//! bounded simulated delay — a first-class result, never an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BusConfig;
use crate::error::{DispatchError, Result, Severity};
use crate::metrics::epoch_ms;

pub mod memory;
pub mod pairing;
#[cfg(feature = "redis-bus")]
pub mod redis;

use pairing::WaiterRegistry;

/// Stream names. Identifiers only; deployments may remap them in config
/// front-ends, the core refers to them through this table.
pub mod streams {
    pub const MIRROR_REQUEST: &str = "req.mirror";
    pub const MIRROR_RESPONSE: &str = "resp.mirror";
    pub const SUPERIOR_REQUEST: &str = "req.superior";
    pub const SUPERIOR_RESPONSE: &str = "resp.superior";
    pub const STATUS: &str = "status";
    pub const PERF_METRICS: &str = "perf.metrics";
    pub const ERROR_ALERTS: &str = "error.alerts";
    pub const SECURITY_EVENTS: &str = "security.events";
    pub const AUDIT: &str = "audit";
}

/// Field names every request/response message carries.
pub mod fields {
    pub const ARTIFACT_ID: &str = "artifactId";
    pub const CORRELATION_ID: &str = "correlationId";
    pub const PAYLOAD: &str = "payload";
    pub const TIMESTAMP_MS: &str = "timestampMs";
    pub const VERSION: &str = "version";
}

/// Consumer group the core reads response streams with.
pub const CORE_GROUP: &str = "argus-core";

/// Simulated latency of a synthesized degraded response.
const DEGRADED_DELAY: Duration = Duration::from_millis(25);

/// Bus-assigned message id. Opaque to the core; ordering is the backend's
/// concern.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Flat string field map, the shape both backends speak natively.
pub type Fields = HashMap<String, String>;

/// The two remote decision services reached over the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemoteKind {
    Mirror,
    Superior,
}

impl RemoteKind {
    pub fn request_stream(&self) -> &'static str {
        match self {
            Self::Mirror => streams::MIRROR_REQUEST,
            Self::Superior => streams::SUPERIOR_REQUEST,
        }
    }

    pub fn response_stream(&self) -> &'static str {
        match self {
            Self::Mirror => streams::MIRROR_RESPONSE,
            Self::Superior => streams::SUPERIOR_RESPONSE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mirror => "mirror",
            Self::Superior => "superior",
        }
    }
}

impl std::fmt::Display for RemoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log-structured message bus with consumer groups.
///
/// `publish` appends and returns the new id. `consume` reads the next batch
/// for a group cursor, blocking up to `block`; delivered messages stay
/// pending until `ack`. `ensure_group` is idempotent: "already exists" is
/// success. `reclaim_stale` is the redelivery half of the delivery
/// guarantee: without it, a consumer dying between consume and ack would
/// strand the message in the group's pending list forever.
#[async_trait]
pub trait StreamBus: Send + Sync + 'static {
    async fn publish(&self, stream: &str, fields: &Fields) -> anyhow::Result<MessageId>;

    async fn ensure_group(&self, stream: &str, group: &str) -> anyhow::Result<()>;

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        batch: usize,
        block: Duration,
    ) -> anyhow::Result<Vec<(MessageId, Fields)>>;

    async fn ack(&self, stream: &str, group: &str, id: &MessageId) -> anyhow::Result<()>;

    /// Re-delivers messages that were consumed but never acked.
    ///
    /// Messages pending for `group` longer than `min_idle` are claimed for
    /// `consumer` and returned; their idle clock resets and they remain
    /// pending until acked (XPENDING + XCLAIM semantics).
    async fn reclaim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> anyhow::Result<Vec<(MessageId, Fields)>>;

    /// Whether the backend currently believes it can reach the bus.
    fn connected(&self) -> bool;
}

/// Outcome of a paired request: the decoded response payload, a synthesized
/// neutral result because the bus is unreachable, or a deadline expiry the
/// caller chose to absorb rather than fail on.
#[derive(Clone, Debug)]
pub enum RemoteOutcome {
    Payload(serde_json::Value),
    Degraded,
    Timeout,
}

#[derive(Clone)]
pub struct BusClient {
    backend: Arc<dyn StreamBus>,
    cfg: BusConfig,
    waiters: WaiterRegistry,
    consumer_name: String,
}

impl BusClient {
    pub fn new(backend: Arc<dyn StreamBus>, cfg: BusConfig) -> Self {
        Self {
            backend,
            cfg,
            waiters: WaiterRegistry::new(),
            consumer_name: format!("core-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    /// True while the backend is unreachable and the client is operating in
    /// degraded mode.
    pub fn degraded(&self) -> bool {
        !self.backend.connected()
    }

    pub fn waiters(&self) -> &WaiterRegistry {
        &self.waiters
    }

    /// Spawns the background consumers for both response streams, plus the
    /// janitor that reclaims pending messages stranded by a dead consumer.
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks: Vec<JoinHandle<()>> = [RemoteKind::Mirror, RemoteKind::Superior]
            .into_iter()
            .map(|kind| {
                let client = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { client.response_consumer(kind, shutdown).await })
            })
            .collect();

        let client = self.clone();
        tasks.push(tokio::spawn(async move {
            client.pending_reclaimer(shutdown).await
        }));
        tasks
    }

    /// Appends to a stream. In degraded mode this is a no-op returning
    /// `Ok(None)`; a reachable bus that still fails is a [`DispatchError::Bus`].
    pub async fn publish(&self, stream: &str, fields: &Fields) -> Result<Option<MessageId>> {
        if self.degraded() {
            tracing::debug!(stream, "bus degraded, publish dropped");
            return Ok(None);
        }
        match self.backend.publish(stream, fields).await {
            Ok(id) => Ok(Some(id)),
            Err(_) if self.degraded() => Ok(None),
            Err(e) => Err(DispatchError::Bus(e.to_string())),
        }
    }

    /// Sends a request to `kind` and awaits the paired response.
    ///
    /// The waiter is registered before the publish so a fast responder can
    /// never slip between them. On deadline expiry the waiter is removed and
    /// a [`DispatchError::Timeout`] is returned; callers translate that into
    /// a timeout envelope.
    pub async fn send_request(
        &self,
        kind: RemoteKind,
        artifact_id: &str,
        correlation_id: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RemoteOutcome> {
        if self.degraded() {
            tokio::time::sleep(DEGRADED_DELAY).await;
            return Ok(RemoteOutcome::Degraded);
        }

        let rx = self.waiters.register(kind, artifact_id);

        let mut msg = Fields::new();
        msg.insert(fields::ARTIFACT_ID.into(), artifact_id.to_string());
        msg.insert(fields::CORRELATION_ID.into(), correlation_id.to_string());
        msg.insert(fields::PAYLOAD.into(), payload.to_string());
        msg.insert(fields::TIMESTAMP_MS.into(), epoch_ms().to_string());
        msg.insert(fields::VERSION.into(), env!("CARGO_PKG_VERSION").into());

        if let Err(e) = self.backend.publish(kind.request_stream(), &msg).await {
            self.waiters.remove(kind, artifact_id);
            if self.degraded() {
                tokio::time::sleep(DEGRADED_DELAY).await;
                return Ok(RemoteOutcome::Degraded);
            }
            return Err(DispatchError::Bus(e.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(RemoteOutcome::Payload(value)),
            Ok(Err(_)) => {
                // Waiter was cancelled (request abort or shutdown).
                Err(DispatchError::Timeout {
                    what: format!("{kind} response (cancelled)"),
                    ms: timeout.as_millis() as u64,
                })
            }
            Err(_) => {
                self.waiters.remove(kind, artifact_id);
                Err(DispatchError::Timeout {
                    what: format!("{kind} response"),
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Drops any registered waiters for an aborted or finished request.
    /// Responses that arrive later are still consumed and acked, then
    /// discarded.
    pub fn cancel_waiters(&self, artifact_id: &str) {
        self.waiters.cancel(artifact_id);
    }

    /// Publishes a high-severity error alert. Emission failure is logged,
    /// never raised.
    pub async fn emit_alert(&self, category: &str, severity: Severity, correlation_id: &str) {
        if severity < Severity::High {
            return;
        }
        self.publish_event(
            streams::ERROR_ALERTS,
            json!({
                "category": category,
                "severity": severity,
                "correlationId": correlation_id,
                "timestampMs": epoch_ms(),
            }),
        )
        .await;
    }

    /// Publishes a security event raised during input validation.
    pub async fn emit_security_event(&self, correlation_id: &str, reason: &str) {
        self.publish_event(
            streams::SECURITY_EVENTS,
            json!({
                "correlationId": correlation_id,
                "reason": reason,
                "timestampMs": epoch_ms(),
            }),
        )
        .await;
    }

    /// Fire-and-forget JSON emission used by telemetry, status, and audit.
    pub async fn publish_event(&self, stream: &str, payload: serde_json::Value) {
        let mut msg = Fields::new();
        msg.insert(fields::PAYLOAD.into(), payload.to_string());
        msg.insert(fields::TIMESTAMP_MS.into(), epoch_ms().to_string());
        msg.insert(fields::VERSION.into(), env!("CARGO_PKG_VERSION").into());
        if let Err(e) = self.publish(stream, &msg).await {
            tracing::warn!(stream, error = %e, "telemetry emission failed");
        }
    }

    /// Idempotent group creation with exponential backoff: up to 3 attempts,
    /// 1s × 2^attempt, capped by config.
    pub async fn ensure_group_with_retry(&self, stream: &str, group: &str) -> Result<()> {
        let cap = Duration::from_millis(self.cfg.retry_backoff_max_ms.max(1));
        let mut last_err = None;
        for attempt in 0..3u32 {
            match self.backend.ensure_group(stream, group).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(stream, group, attempt, error = %e, "group creation failed");
                    last_err = Some(e);
                }
            }
            if attempt < 2 {
                let backoff = Duration::from_secs(1) * 2u32.pow(attempt);
                tokio::time::sleep(backoff.min(cap)).await;
            }
        }
        Err(DispatchError::Bus(format!(
            "could not create group '{group}' on '{stream}': {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn response_consumer(&self, kind: RemoteKind, shutdown: CancellationToken) {
        let stream = kind.response_stream();
        let mut group_ready = false;

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            if self.degraded() {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
                group_ready = false;
                continue;
            }
            if !group_ready {
                match self.ensure_group_with_retry(stream, CORE_GROUP).await {
                    Ok(()) => group_ready = true,
                    Err(e) => {
                        tracing::warn!(stream, error = %e, "consumer group unavailable");
                        continue;
                    }
                }
            }

            let batch = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = self.backend.consume(
                    stream,
                    CORE_GROUP,
                    &self.consumer_name,
                    16,
                    Duration::from_millis(1_000),
                ) => result,
            };

            match batch {
                Ok(messages) => {
                    for (id, fields) in messages {
                        self.handle_response(kind, &fields);
                        if let Err(e) = self.backend.ack(stream, CORE_GROUP, &id).await {
                            tracing::warn!(stream, %id, error = %e, "ack failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(stream, error = %e, "consume failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                    }
                }
            }
        }
    }

    /// Periodically re-claims response-stream messages whose consumer died
    /// between consume and ack, then processes and acks them so no delivered
    /// message stays pending forever.
    async fn pending_reclaimer(&self, shutdown: CancellationToken) {
        let min_idle = Duration::from_millis(self.cfg.pending_min_idle_ms.max(1_000));
        let mut tick = tokio::time::interval(min_idle / 2);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }
            if self.degraded() {
                continue;
            }
            for kind in [RemoteKind::Mirror, RemoteKind::Superior] {
                let stream = kind.response_stream();
                match self
                    .backend
                    .reclaim_stale(stream, CORE_GROUP, &self.consumer_name, min_idle)
                    .await
                {
                    Ok(messages) => {
                        if messages.is_empty() {
                            continue;
                        }
                        tracing::info!(stream, count = messages.len(), "reclaimed stale pending messages");
                        for (id, body) in messages {
                            self.handle_response(kind, &body);
                            if let Err(e) = self.backend.ack(stream, CORE_GROUP, &id).await {
                                tracing::warn!(stream, %id, error = %e, "ack after reclaim failed");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(stream, error = %e, "pending reclaim failed");
                    }
                }
            }
        }
    }

    /// Completes the waiter paired with a response message. Messages without
    /// a waiter (abort, duplicate response) are dropped after the ack.
    fn handle_response(&self, kind: RemoteKind, body: &Fields) {
        let Some(artifact_id) = body.get(fields::ARTIFACT_ID) else {
            tracing::warn!(stream = kind.response_stream(), "response without artifact id");
            return;
        };
        let payload = body
            .get(fields::PAYLOAD)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null);
        if !self.waiters.complete(kind, artifact_id, payload) {
            tracing::debug!(artifact_id, %kind, "response had no waiter, discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryBus;

    fn client(bus: &Arc<MemoryBus>) -> BusClient {
        BusClient::new(bus.clone() as Arc<dyn StreamBus>, BusConfig::default())
    }

    /// Test-side responder: consumes requests and answers on the response
    /// stream, echoing the artifact id.
    async fn respond_once(bus: Arc<MemoryBus>, kind: RemoteKind, reply: serde_json::Value) {
        bus.ensure_group(kind.request_stream(), "responder").await.unwrap();
        loop {
            let batch = bus
                .consume(kind.request_stream(), "responder", "r1", 4, Duration::from_millis(200))
                .await
                .unwrap();
            if let Some((id, body)) = batch.into_iter().next() {
                let artifact = body.get(fields::ARTIFACT_ID).cloned().unwrap();
                let mut out = Fields::new();
                out.insert(fields::ARTIFACT_ID.into(), artifact);
                out.insert(fields::PAYLOAD.into(), reply.to_string());
                bus.publish(kind.response_stream(), &out).await.unwrap();
                bus.ack(kind.request_stream(), "responder", &id).await.unwrap();
                return;
            }
        }
    }

    #[tokio::test]
    async fn request_response_pairing() {
        let bus = Arc::new(MemoryBus::new());
        let client = client(&bus);
        let shutdown = CancellationToken::new();
        let tasks = client.start(shutdown.clone());

        tokio::spawn(respond_once(
            bus.clone(),
            RemoteKind::Mirror,
            json!({"networks": []}),
        ));

        let outcome = client
            .send_request(
                RemoteKind::Mirror,
                "art-1",
                "corr-1",
                json!({"hash": "abc"}),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        match outcome {
            RemoteOutcome::Payload(v) => assert_eq!(v["networks"], json!([])),
            RemoteOutcome::Degraded => panic!("unexpected degraded outcome"),
            RemoteOutcome::Timeout => panic!("unexpected timeout outcome"),
        }

        shutdown.cancel();
        for t in tasks {
            let _ = t.await;
        }
    }

    #[tokio::test]
    async fn response_timeout_removes_waiter() {
        let bus = Arc::new(MemoryBus::new());
        let client = client(&bus);

        let err = client
            .send_request(
                RemoteKind::Superior,
                "art-2",
                "corr-2",
                json!({}),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Timeout { .. }));
        assert_eq!(client.waiters().len(), 0);
    }

    #[tokio::test]
    async fn degraded_mode_synthesizes_outcome() {
        let bus = Arc::new(MemoryBus::new());
        bus.set_connected(false);
        let client = client(&bus);

        let outcome = client
            .send_request(
                RemoteKind::Mirror,
                "art-3",
                "corr-3",
                json!({}),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, RemoteOutcome::Degraded));

        // publish is a silent no-op
        let id = client.publish(streams::STATUS, &Fields::new()).await.unwrap();
        assert!(id.is_none());
    }

    #[tokio::test]
    async fn group_creation_is_idempotent_through_retry() {
        let bus = Arc::new(MemoryBus::new());
        let client = client(&bus);
        client
            .ensure_group_with_retry(streams::MIRROR_RESPONSE, CORE_GROUP)
            .await
            .unwrap();
        client
            .ensure_group_with_retry(streams::MIRROR_RESPONSE, CORE_GROUP)
            .await
            .unwrap();
    }
}
