//! Rolling latency windows with on-demand percentiles and violation events.
//!
//! Each metric keeps a bounded ring of recent samples; nothing is computed
//! eagerly. P50/P95/P99 are sorted out of the current window when asked for.
//! On insertion the current P95/P99 are checked against the configured
//! targets and a violation event is emitted on breach, rate-limited by a
//! per-metric cooldown so alert storms are suppressed. A background sampler
//! watches process memory the same way. Nothing in this module returns an
//! error or panics.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::PerformanceConfig;
use crate::events::{CoreEvent, EventArbiter};

/// The latency families the observatory tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Whole-request wall clock.
    RequestLatency,
    /// One bus publish/consume round trip.
    BusRoundTrip,
    /// Storage-shaped operations (cache, tracking).
    StorageOp,
    /// Heavy CPU passes: hashing, analyzer fan-out.
    HeavyOp,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestLatency => "request_latency",
            Self::BusRoundTrip => "bus_round_trip",
            Self::StorageOp => "storage_op",
            Self::HeavyOp => "heavy_op",
        }
    }

    /// Window capacity per family.
    fn capacity(&self) -> usize {
        match self {
            Self::RequestLatency => 1_000,
            Self::BusRoundTrip | Self::StorageOp => 500,
            Self::HeavyOp => 200,
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::RequestLatency => 0,
            Self::BusRoundTrip => 1,
            Self::StorageOp => 2,
            Self::HeavyOp => 3,
        }
    }

    const ALL: [MetricKind; 4] = [
        Self::RequestLatency,
        Self::BusRoundTrip,
        Self::StorageOp,
        Self::HeavyOp,
    ];
}

/// Point-in-time summary of one metric window.
#[derive(Clone, Debug, Serialize)]
pub struct MetricSummary {
    pub metric: &'static str,
    pub count: usize,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

/// Process memory as seen by the sampler.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct MemoryStatus {
    pub used_mb: u64,
    pub limit_mb: u64,
    pub pressure: bool,
}

pub struct MetricsObservatory {
    windows: [Mutex<VecDeque<f64>>; 4],
    cfg: PerformanceConfig,
    arbiter: EventArbiter,
    /// Last violation emission per (metric, percentile).
    cooldowns: DashMap<(usize, &'static str), Instant>,
}

impl MetricsObservatory {
    pub fn new(cfg: PerformanceConfig, arbiter: EventArbiter) -> Self {
        Self {
            windows: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            cfg,
            arbiter,
            cooldowns: DashMap::new(),
        }
    }

    /// Records one sample and checks the window against its targets.
    pub fn record(&self, kind: MetricKind, ms: f64) {
        if !ms.is_finite() || ms < 0.0 {
            return;
        }
        {
            let mut window = self.windows[kind.index()].lock();
            if window.len() == kind.capacity() {
                window.pop_front();
            }
            window.push_back(ms);
        }
        self.check_violation(kind, "p95", 0.95);
        self.check_violation(kind, "p99", 0.99);
    }

    /// Percentile over the current window, `p` in `(0, 1]`.
    pub fn percentile(&self, kind: MetricKind, p: f64) -> Option<f64> {
        let window = self.windows[kind.index()].lock();
        percentile_of(&window, p)
    }

    pub fn summaries(&self) -> Vec<MetricSummary> {
        MetricKind::ALL
            .iter()
            .map(|kind| {
                let window = self.windows[kind.index()].lock();
                MetricSummary {
                    metric: kind.as_str(),
                    count: window.len(),
                    p50: percentile_of(&window, 0.50),
                    p95: percentile_of(&window, 0.95),
                    p99: percentile_of(&window, 0.99),
                }
            })
            .collect()
    }

    /// P95/P99 targets per metric family.
    pub fn targets(&self, kind: MetricKind) -> (u64, u64) {
        match kind {
            MetricKind::RequestLatency => (self.cfg.api_p95_ms, self.cfg.api_p99_ms),
            MetricKind::BusRoundTrip | MetricKind::StorageOp => {
                (self.cfg.db_p95_ms, self.cfg.db_p95_ms * 2)
            }
            MetricKind::HeavyOp => (self.cfg.file_proc_p95_ms, self.cfg.file_proc_p99_ms),
        }
    }

    pub fn memory_status(&self) -> MemoryStatus {
        let used_mb = current_rss_mb().unwrap_or(0);
        let limit_mb = self.cfg.memory_limit_mb;
        let threshold = limit_mb * u64::from(self.cfg.memory_pressure_pct) / 100;
        MemoryStatus { used_mb, limit_mb, pressure: used_mb > threshold }
    }

    fn check_violation(&self, kind: MetricKind, label: &'static str, p: f64) {
        let (p95_target, p99_target) = self.targets(kind);
        let threshold_ms = if label == "p95" { p95_target } else { p99_target };
        let Some(observed) = self.percentile(kind, p) else { return };
        if observed <= threshold_ms as f64 {
            return;
        }
        if !self.cooldown_elapsed((kind.index(), label)) {
            return;
        }
        self.arbiter.emit_detached(CoreEvent::PerformanceViolation {
            metric: kind.as_str(),
            percentile: label,
            observed_ms: observed,
            threshold_ms,
        });
    }

    fn cooldown_elapsed(&self, key: (usize, &'static str)) -> bool {
        let cooldown = Duration::from_millis(self.cfg.violation_cooldown_ms);
        let now = Instant::now();
        match self.cooldowns.entry(key) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if now.duration_since(*slot.get()) >= cooldown {
                    slot.insert(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Long-running heap sampler. Exits when `shutdown` fires.
    pub async fn memory_sampler(&self, shutdown: CancellationToken) {
        let interval = Duration::from_millis(self.cfg.memory_sample_interval_ms.max(1_000));
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }
            let status = self.memory_status();
            if status.pressure && self.cooldown_elapsed((usize::MAX, "memory")) {
                let percent = if status.limit_mb > 0 {
                    (status.used_mb * 100 / status.limit_mb).min(255) as u8
                } else {
                    0
                };
                self.arbiter.emit_detached(CoreEvent::MemoryPressure {
                    used_mb: status.used_mb,
                    limit_mb: status.limit_mb,
                    percent,
                });
            }
        }
    }
}

fn percentile_of(window: &VecDeque<f64>, p: f64) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    Some(sorted[rank - 1])
}

/// Milliseconds since the Unix epoch. The only wall-clock read in the core;
/// everything else measures with monotonic instants.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Resident set size in MB, best effort. Linux reads `/proc/self/statm`;
/// other platforms report 0 and the pressure check stays quiet.
fn current_rss_mb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let page_size = 4096u64;
        Some(resident_pages * page_size / (1024 * 1024))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventCounters, EventKind};

    fn observatory() -> MetricsObservatory {
        MetricsObservatory::new(PerformanceConfig::default(), EventArbiter::new())
    }

    #[test]
    fn percentiles_over_known_window() {
        let m = observatory();
        for i in 1..=100 {
            m.record(MetricKind::RequestLatency, i as f64);
        }
        assert_eq!(m.percentile(MetricKind::RequestLatency, 0.50), Some(50.0));
        assert_eq!(m.percentile(MetricKind::RequestLatency, 0.95), Some(95.0));
        assert_eq!(m.percentile(MetricKind::RequestLatency, 0.99), Some(99.0));
    }

    #[test]
    fn window_is_bounded() {
        let m = observatory();
        for i in 0..1_500 {
            m.record(MetricKind::HeavyOp, i as f64);
        }
        let summary = m
            .summaries()
            .into_iter()
            .find(|s| s.metric == "heavy_op")
            .unwrap();
        assert_eq!(summary.count, 200);
        // oldest samples were evicted
        assert!(summary.p50.unwrap() > 1_000.0);
    }

    #[test]
    fn empty_window_has_no_percentiles() {
        let m = observatory();
        assert_eq!(m.percentile(MetricKind::BusRoundTrip, 0.95), None);
    }

    #[tokio::test]
    async fn breach_emits_one_violation_within_cooldown() {
        let arbiter = EventArbiter::new();
        let counters = EventCounters::subscribe(&arbiter);
        let m = MetricsObservatory::new(PerformanceConfig::default(), arbiter);

        // every sample far above the 200ms p95 target
        for _ in 0..50 {
            m.record(MetricKind::RequestLatency, 5_000.0);
        }
        tokio::task::yield_now().await;
        // p95 and p99 each fire once, then the cooldown suppresses the rest
        for _ in 0..20 {
            if counters.count(EventKind::PerformanceViolation) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(counters.count(EventKind::PerformanceViolation), 2);
    }

    #[test]
    fn rejects_garbage_samples() {
        let m = observatory();
        m.record(MetricKind::StorageOp, f64::NAN);
        m.record(MetricKind::StorageOp, -5.0);
        assert_eq!(m.percentile(MetricKind::StorageOp, 0.5), None);
    }
}
