//! Per-request orchestration: the engine facade and the dispatch pipeline.
//!
//! [`Argus`] owns every component and exposes the core's whole API surface:
//! `submit` one artifact and get a verdict, `health_snapshot` for probes,
//! `start`/`shutdown` for the process lifecycle. One request walks a linear
//! stage sequence — validate, admit, hash, cache, analyzers, mirror, fuse,
//! superior, compose, store — with every transition appended to the
//! tracking store first, the analysis stages wrapped by the circuit
//! breaker, and cleanup that always runs no matter how the request ends.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::analyzers::runner::{AnalyzerAggregate, AnalyzerRunner};
use crate::analyzers::{AnalyzerInput, AnalyzerRegistry};
use crate::artifact::{ContentHash, FileArtifact, new_artifact_id, new_correlation_id};
use crate::breaker::CircuitBreaker;
use crate::bus::memory::MemoryBus;
use crate::bus::{BusClient, RemoteKind, RemoteOutcome, StreamBus, streams};
use crate::cache::VerdictCache;
use crate::config::ArgusConfig;
use crate::error::{DispatchError, RequestError, Result, Severity};
use crate::events::{CoreEvent, EventArbiter, EventCounters};
use crate::fusion;
use crate::governor::ConcurrencyGovernor;
use crate::health::{
    self, HealthSnapshot, SnapshotSlot, StatusInputs, overall_status, violation_counts,
};
use crate::metrics::{MetricKind, MetricsObservatory, epoch_ms};
use crate::tracking::TrackingStore;
use crate::verdict::{
    MirrorEnvelope, NetworkScore, SuperiorDecision, SuperiorEnvelope, Verdict, VerdictDetails,
};

/// How long a finished request's tracking record stays queryable.
const TRACKING_LINGER: Duration = Duration::from_secs(300);

/// Builder for the engine. External collaborators — the bus backend, the
/// analyzers, event subscribers — are injected here; everything else is
/// constructed from config.
pub struct ArgusBuilder {
    config: ArgusConfig,
    registry: AnalyzerRegistry,
    backend: Option<Arc<dyn StreamBus>>,
    arbiter: EventArbiter,
}

impl ArgusBuilder {
    pub fn new() -> Self {
        Self {
            config: ArgusConfig::default(),
            registry: AnalyzerRegistry::new(),
            backend: None,
            arbiter: EventArbiter::new(),
        }
    }

    pub fn config(mut self, config: ArgusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn crate::analyzers::Analyzer>) -> Self {
        self.registry.register(analyzer);
        self
    }

    /// Swaps the bus backend; defaults to the in-memory bus.
    pub fn bus_backend(mut self, backend: Arc<dyn StreamBus>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// The event arbiter subscribers are registered on before `build`.
    pub fn events(&self) -> &EventArbiter {
        &self.arbiter
    }

    pub fn build(self) -> Argus {
        let arbiter = self.arbiter;
        let counters = EventCounters::subscribe(&arbiter);
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryBus::new()) as Arc<dyn StreamBus>);

        Argus {
            metrics: Arc::new(MetricsObservatory::new(
                self.config.performance.clone(),
                arbiter.clone(),
            )),
            breaker: Arc::new(CircuitBreaker::new(
                "analysis-pipeline",
                self.config.circuit_breaker.clone(),
                arbiter.clone(),
            )),
            governor: ConcurrencyGovernor::new(self.config.concurrency.clone()),
            cache: VerdictCache::new(self.config.cache.clone()),
            tracking: TrackingStore::new(),
            bus: BusClient::new(backend, self.config.bus.clone()),
            runner: Arc::new(AnalyzerRunner::new(
                Arc::new(self.registry),
                Duration::from_millis(self.config.analyzers.timeout_ms),
            )),
            analyzer_settings: Arc::new(self.config.analyzers.settings.clone()),
            inflight: Arc::new(DashMap::new()),
            snapshot_slot: SnapshotSlot::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            arbiter,
            counters,
            config: self.config,
        }
    }
}

impl Default for ArgusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The dispatch core. Construct with [`Argus::builder`], call
/// [`Argus::start`] to launch the background loops, share behind an `Arc`.
pub struct Argus {
    config: ArgusConfig,
    arbiter: EventArbiter,
    counters: EventCounters,
    metrics: Arc<MetricsObservatory>,
    breaker: Arc<CircuitBreaker>,
    governor: ConcurrencyGovernor,
    cache: VerdictCache,
    tracking: TrackingStore,
    bus: BusClient,
    runner: Arc<AnalyzerRunner>,
    analyzer_settings: Arc<serde_json::Value>,
    /// Content hashes with a computation in flight, for duplicate coalescing.
    inflight: Arc<DashMap<String, Arc<Notify>>>,
    snapshot_slot: SnapshotSlot,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

enum InflightClaim {
    /// This request computes; the guard releases the claim on drop.
    Owner(InflightGuard),
    /// Another request finished first; its verdict was served from cache.
    CachedMeanwhile(Verdict),
}

struct InflightGuard {
    map: Arc<DashMap<String, Arc<Notify>>>,
    key: String,
    notify: Arc<Notify>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.key);
        self.notify.notify_waiters();
    }
}

impl Argus {
    pub fn builder() -> ArgusBuilder {
        ArgusBuilder::new()
    }

    /// Launches background loops: response consumers, memory sampler,
    /// cache/tracking janitors, governor bucket sweeper, status heartbeat.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.extend(self.bus.start(self.shutdown.clone()));

        let metrics = self.metrics.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move { metrics.memory_sampler(token).await }));

        let cache = self.cache.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            cache.janitor(Duration::from_secs(60), token).await
        }));

        let tracking = self.tracking.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            tracking.janitor(Duration::from_secs(300), token).await
        }));

        let governor = self.governor.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => governor.sweep_idle_buckets(),
                }
            }
        }));

        let bus = self.bus.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {
                        bus.publish_event(
                            streams::STATUS,
                            json!({"status": "alive", "timestampMs": epoch_ms()}),
                        )
                        .await;
                    }
                }
            }
        }));

        tracing::info!(analyzers = self.runner.registry().len(), "dispatch core started");
    }

    /// Drains and stops: cancels background loops and outstanding waiters.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.bus.waiters().cancel_all();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("dispatch core stopped");
    }

    pub fn events(&self) -> &EventArbiter {
        &self.arbiter
    }

    pub fn tracking(&self) -> &TrackingStore {
        &self.tracking
    }

    pub fn cache(&self) -> &VerdictCache {
        &self.cache
    }

    /// Submits one artifact for analysis and waits for its verdict.
    ///
    /// Returns within the request deadline plus a few milliseconds of
    /// scheduling tolerance, regardless of collaborator behavior: every
    /// blocking step inherits the deadline and the whole request is raced
    /// against it.
    pub async fn submit(
        &self,
        artifact: FileArtifact,
        client_id: &str,
        priority: i32,
        correlation_id: Option<String>,
        deadline: Option<Duration>,
    ) -> std::result::Result<Verdict, RequestError> {
        self.submit_with_abort(
            artifact,
            client_id,
            priority,
            correlation_id,
            deadline,
            CancellationToken::new(),
        )
        .await
    }

    /// [`Argus::submit`] with an abort signal from the ingress collaborator.
    ///
    /// On abort the outstanding response waiters are cancelled and the
    /// governor slot is released; requests already on the bus are not
    /// recalled — their responses are consumed, acked, and discarded.
    pub async fn submit_with_abort(
        &self,
        artifact: FileArtifact,
        client_id: &str,
        priority: i32,
        correlation_id: Option<String>,
        deadline: Option<Duration>,
        abort: CancellationToken,
    ) -> std::result::Result<Verdict, RequestError> {
        let correlation_id = correlation_id.unwrap_or_else(new_correlation_id);
        let artifact_id = new_artifact_id();
        let deadline = deadline
            .unwrap_or(Duration::from_millis(self.config.concurrency.default_timeout_ms));

        let result = tokio::select! {
            outcome = tokio::time::timeout(
                deadline,
                self.run_request(&artifact, &artifact_id, &correlation_id, client_id, priority, deadline),
            ) => match outcome {
                Ok(inner) => inner,
                Err(_) => Err(DispatchError::Timeout {
                    what: "request deadline".into(),
                    ms: deadline.as_millis() as u64,
                }),
            },
            _ = abort.cancelled() => {
                tracing::debug!(artifact_id = %artifact_id, "request aborted by client");
                Err(DispatchError::Timeout {
                    what: "request aborted by client".into(),
                    ms: 0,
                })
            }
        };

        // Cleanup runs on every path. The governor permit is released by its
        // own drop inside run_request's future.
        self.bus.cancel_waiters(&artifact_id);
        self.tracking.schedule_eviction(&artifact_id, TRACKING_LINGER);
        artifact.cleanup().await;

        match result {
            Ok(verdict) => Ok(verdict),
            Err(kind) => {
                self.tracking.append(
                    &artifact_id,
                    "failed",
                    json!({"category": kind.category(), "retryable": kind.retryable()}),
                );
                if kind.severity() >= Severity::High {
                    self.bus
                        .emit_alert(kind.category(), kind.severity(), &correlation_id)
                        .await;
                }
                self.bus
                    .publish_event(
                        streams::AUDIT,
                        json!({
                            "artifactId": artifact_id,
                            "correlationId": correlation_id,
                            "outcome": "failed",
                            "category": kind.category(),
                        }),
                    )
                    .await;
                Err(RequestError { correlation_id, kind })
            }
        }
    }

    async fn run_request(
        &self,
        artifact: &FileArtifact,
        artifact_id: &str,
        correlation_id: &str,
        client_id: &str,
        priority: i32,
        deadline: Duration,
    ) -> Result<Verdict> {
        let started = Instant::now();

        self.tracking.append(
            artifact_id,
            "received",
            json!({
                "class": artifact.class().as_str(),
                "sizeBytes": artifact.size_bytes(),
                "clientId": client_id,
                "correlationId": correlation_id,
            }),
        );
        self.validate(artifact, correlation_id).await?;

        let permit = self
            .governor
            .acquire(artifact_id, client_id, priority, deadline)
            .await?;
        self.tracking.append(
            artifact_id,
            "acquire-slot",
            json!({"waitMs": permit.waited().as_millis() as u64}),
        );

        let hash_started = Instant::now();
        let hash = artifact.content_hash().await?;
        self.metrics
            .record(MetricKind::HeavyOp, hash_started.elapsed().as_millis() as f64);
        self.tracking
            .append(artifact_id, "hash", json!({"prefix": hash.prefix()}));

        self.tracking.append(artifact_id, "cache-lookup", json!({}));
        if let Some(mut verdict) = self.cache.lookup(&hash) {
            return Ok(self.finish_cached(artifact_id, correlation_id, started, &mut verdict));
        }

        let _claim = match self.claim_inflight(&hash, deadline).await? {
            InflightClaim::CachedMeanwhile(mut verdict) => {
                return Ok(self.finish_cached(artifact_id, correlation_id, started, &mut verdict));
            }
            InflightClaim::Owner(guard) => guard,
        };

        let pipeline_timeout = Duration::from_millis(self.config.concurrency.default_timeout_ms);
        let verdict = self
            .breaker
            .call(
                self.analysis_pipeline(artifact, artifact_id, correlation_id, &hash, started),
                pipeline_timeout,
            )
            .await?;

        self.cache.store(&hash, &verdict);
        self.tracking.append(
            artifact_id,
            "store-cache",
            json!({"ttlSecs": self.config.cache.ttl_secs(verdict.confidence_level)}),
        );
        self.finish(artifact_id, correlation_id, started, &verdict).await;
        Ok(verdict)
    }

    /// Steps 5–9: analyzers, mirror exchange, fusion, superior exchange,
    /// verdict composition. Runs inside the circuit breaker.
    async fn analysis_pipeline(
        &self,
        artifact: &FileArtifact,
        artifact_id: &str,
        correlation_id: &str,
        hash: &ContentHash,
        started: Instant,
    ) -> Result<Verdict> {
        self.tracking.append(
            artifact_id,
            "analyzers",
            json!({"registered": self.runner.registry().len()}),
        );
        let input = AnalyzerInput {
            artifact_id: artifact_id.to_string(),
            correlation_id: correlation_id.to_string(),
            path: artifact.path().map(|p| p.to_path_buf()),
            data: artifact.bytes(),
            class: artifact.class(),
            settings: self.analyzer_settings.clone(),
        };
        let fanout_started = Instant::now();
        let aggregate = self.runner.run_all(&input).await;
        self.metrics
            .record(MetricKind::HeavyOp, fanout_started.elapsed().as_millis() as f64);

        let mirror = self
            .remote_exchange(
                RemoteKind::Mirror,
                artifact_id,
                correlation_id,
                self.mirror_payload(hash, &aggregate),
                Duration::from_millis(self.config.bus.mirror_timeout_ms),
            )
            .await?;
        let mirror_env = decode_mirror(mirror);

        let consensus = fusion::fuse(&aggregate, &mirror_env);
        self.tracking.append(
            artifact_id,
            "fuse-local-mirror",
            json!({
                "votes": consensus.votes,
                "positiveRatio": consensus.positive_ratio,
                "level": consensus.level.as_str(),
            }),
        );

        let superior = self
            .remote_exchange(
                RemoteKind::Superior,
                artifact_id,
                correlation_id,
                json!({
                    "contentHash": hash.as_str(),
                    "consensus": {
                        "isAuthentic": consensus.is_authentic,
                        "positiveRatio": consensus.positive_ratio,
                        "weightedConfidence": consensus.weighted_confidence,
                    },
                }),
                Duration::from_millis(self.config.bus.superior_timeout_ms),
            )
            .await?;
        let superior_env = decode_superior(superior);

        let confidence_level = fusion::final_confidence(&consensus, &superior_env);
        let total_ms = started.elapsed().as_millis() as u64;
        let performance_class = fusion::classify_performance(
            total_ms,
            self.config.performance.file_proc_p95_ms,
            self.config.performance.file_proc_p99_ms,
        );
        let degraded =
            mirror_env.is_degraded() || superior_env.is_degraded() || self.bus.degraded();

        let verdict = Verdict {
            is_authentic: consensus.is_authentic,
            confidence_level,
            artifact_class: artifact.class(),
            content_hash_prefix: hash.prefix().to_string(),
            performance_class,
            correlation_id: correlation_id.to_string(),
            timestamp_utc: epoch_ms(),
            cache_hit: false,
            degraded,
            details: VerdictDetails {
                local: aggregate.results.clone().into_iter().collect(),
                mirror: mirror_env,
                consensus,
                superior: superior_env,
            },
        };
        self.tracking.append(
            artifact_id,
            "compose-verdict",
            json!({
                "isAuthentic": verdict.is_authentic,
                "confidenceLevel": verdict.confidence_level.as_str(),
            }),
        );
        Ok(verdict)
    }

    /// One request/response leg with stage tracking and round-trip metrics.
    async fn remote_exchange(
        &self,
        kind: RemoteKind,
        artifact_id: &str,
        correlation_id: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RemoteOutcome> {
        self.tracking
            .append(artifact_id, &format!("{kind}-send"), json!({}));
        let sent = Instant::now();
        let outcome = self
            .bus
            .send_request(kind, artifact_id, correlation_id, payload, timeout)
            .await;

        let (status, result) = match outcome {
            Ok(RemoteOutcome::Payload(v)) => {
                self.metrics
                    .record(MetricKind::BusRoundTrip, sent.elapsed().as_millis() as f64);
                ("ok", Ok(RemoteOutcome::Payload(v)))
            }
            Ok(RemoteOutcome::Degraded) => ("degraded", Ok(RemoteOutcome::Degraded)),
            Ok(RemoteOutcome::Timeout) | Err(DispatchError::Timeout { .. }) => {
                // Timeouts degrade the envelope, they never fail the request.
                ("timeout", Ok(RemoteOutcome::Timeout))
            }
            Err(e) => ("error", Err(e)),
        };
        self.tracking
            .append(artifact_id, &format!("{kind}-await"), json!({"status": status}));
        result
    }

    fn mirror_payload(&self, hash: &ContentHash, aggregate: &AnalyzerAggregate) -> serde_json::Value {
        let scores: serde_json::Map<String, serde_json::Value> = aggregate
            .results
            .iter()
            .filter_map(|(name, r)| r.score.map(|s| (name.clone(), json!(s))))
            .collect();
        json!({
            "contentHash": hash.as_str(),
            "localScores": scores,
            "successCount": aggregate.success_count,
            "totalCount": aggregate.total_count,
        })
    }

    fn finish_cached(
        &self,
        artifact_id: &str,
        correlation_id: &str,
        started: Instant,
        verdict: &mut Verdict,
    ) -> Verdict {
        verdict.correlation_id = correlation_id.to_string();
        self.tracking
            .append(artifact_id, "completed", json!({"cacheHit": true}));
        self.metrics
            .record(MetricKind::RequestLatency, started.elapsed().as_millis() as f64);
        verdict.clone()
    }

    async fn finish(
        &self,
        artifact_id: &str,
        correlation_id: &str,
        started: Instant,
        verdict: &Verdict,
    ) {
        self.tracking
            .append(artifact_id, "completed", json!({"cacheHit": false}));
        let total_ms = started.elapsed().as_millis() as u64;
        self.metrics.record(MetricKind::RequestLatency, total_ms as f64);
        self.bus
            .publish_event(
                streams::PERF_METRICS,
                json!({
                    "correlationId": correlation_id,
                    "totalMs": total_ms,
                    "performanceClass": verdict.performance_class,
                }),
            )
            .await;
        self.bus
            .publish_event(
                streams::AUDIT,
                json!({
                    "artifactId": artifact_id,
                    "correlationId": correlation_id,
                    "outcome": "completed",
                    "isAuthentic": verdict.is_authentic,
                    "confidenceLevel": verdict.confidence_level.as_str(),
                }),
            )
            .await;
    }

    async fn validate(&self, artifact: &FileArtifact, correlation_id: &str) -> Result<()> {
        let limit = self.config.security.max_file_bytes();
        if artifact.size_bytes() > limit {
            return Err(DispatchError::Validation(format!(
                "file of {} bytes exceeds the {} byte limit",
                artifact.size_bytes(),
                limit
            )));
        }
        if !self
            .config
            .security
            .allowed_classes
            .contains(&artifact.class())
        {
            return Err(DispatchError::Validation(format!(
                "class '{}' is not accepted",
                artifact.class()
            )));
        }
        if self.config.security.header_validate {
            let head = artifact.head(16).await?;
            if !artifact.class().matches_signature(&head) {
                let reason = format!(
                    "magic bytes disagree with declared class '{}'",
                    artifact.class()
                );
                self.arbiter.emit_detached(CoreEvent::Security {
                    correlation_id: correlation_id.to_string(),
                    reason: reason.clone(),
                });
                self.bus.emit_security_event(correlation_id, &reason).await;
                return Err(DispatchError::Security(reason));
            }
        }
        Ok(())
    }

    /// Claims the right to compute for a content hash, or waits for the
    /// in-flight computation and serves its cached verdict.
    async fn claim_inflight(&self, hash: &ContentHash, deadline: Duration) -> Result<InflightClaim> {
        let key = hash.as_str().to_string();
        let wait_deadline = Instant::now() + deadline;
        loop {
            let notify = match self.inflight.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let notify = Arc::new(Notify::new());
                    slot.insert(notify.clone());
                    return Ok(InflightClaim::Owner(InflightGuard {
                        map: self.inflight.clone(),
                        key,
                        notify,
                    }));
                }
                dashmap::mapref::entry::Entry::Occupied(slot) => slot.get().clone(),
            };

            let remaining = wait_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DispatchError::Timeout {
                    what: "duplicate request coalescing".into(),
                    ms: deadline.as_millis() as u64,
                });
            }
            // A short cap keeps us polling the cache even if the owner's
            // completion notification slipped past us.
            let _ = tokio::time::timeout(remaining.min(Duration::from_millis(250)), notify.notified())
                .await;
            if let Some(verdict) = self.cache.lookup(hash) {
                return Ok(InflightClaim::CachedMeanwhile(verdict));
            }
            // Owner failed or is still running; try to claim again.
        }
    }

    /// Builds the aggregated health snapshot and remembers it in the
    /// lock-free slot for cheap re-reads.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        let circuit = self.breaker.snapshot();
        let memory = self.metrics.memory_status();
        let request_p95 = self.metrics.percentile(MetricKind::RequestLatency, 0.95);
        let status = overall_status(&StatusInputs {
            circuit_state: circuit.state,
            bus_degraded: self.bus.degraded(),
            request_p95_ms: request_p95,
            request_p95_target_ms: self.config.performance.api_p95_ms,
            memory_pressure: memory.pressure,
        });

        let snapshot = HealthSnapshot {
            status,
            timestamp_ms: health::stamp(),
            metrics: self.metrics.summaries(),
            memory,
            circuit,
            governor: self.governor.utilization(),
            bus_degraded: self.bus.degraded(),
            analyzers: self
                .runner
                .registry()
                .names()
                .into_iter()
                .map(String::from)
                .collect(),
            analyzer_load_errors: self.runner.registry().load_errors().to_vec(),
            cache_entries: self.cache.len(),
            tracked_requests: self.tracking.len(),
            violations: violation_counts(&self.counters),
        };
        self.snapshot_slot.store(snapshot.clone());
        snapshot
    }

    /// The last snapshot built by [`Argus::health_snapshot`], if any.
    pub fn last_health_snapshot(&self) -> Option<Arc<HealthSnapshot>> {
        self.snapshot_slot.last()
    }
}

fn decode_mirror(outcome: RemoteOutcome) -> MirrorEnvelope {
    match outcome {
        RemoteOutcome::Degraded => MirrorEnvelope::Degraded,
        RemoteOutcome::Timeout => MirrorEnvelope::Timeout,
        RemoteOutcome::Payload(value) => {
            #[derive(serde::Deserialize)]
            struct MirrorPayload {
                #[serde(default)]
                networks: Vec<NetworkScore>,
            }
            match serde_json::from_value::<MirrorPayload>(value) {
                Ok(payload) => MirrorEnvelope::Ok { networks: payload.networks },
                Err(e) => {
                    tracing::warn!(error = %e, "malformed mirror payload treated as timeout");
                    MirrorEnvelope::Timeout
                }
            }
        }
    }
}

fn decode_superior(outcome: RemoteOutcome) -> SuperiorEnvelope {
    match outcome {
        RemoteOutcome::Degraded => SuperiorEnvelope::Degraded,
        RemoteOutcome::Timeout => SuperiorEnvelope::Timeout,
        RemoteOutcome::Payload(value) => match serde_json::from_value::<SuperiorDecision>(value) {
            Ok(decision) => SuperiorEnvelope::Ok(decision),
            Err(e) => {
                tracing::warn!(error = %e, "malformed superior payload treated as timeout");
                SuperiorEnvelope::Timeout
            }
        },
    }
}
