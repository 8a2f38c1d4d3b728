//! Aggregated health snapshot for external probes.
//!
//! Pulls the observable state of every component into one serializable
//! snapshot and derives an overall status. The rules: any open circuit or a
//! degraded bus each count as a major signal — one makes the system at
//! least `degraded`, two make it `critical`. A request-latency P95 beyond
//! 1.5× its target or memory pressure also force at least `degraded`.

use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::sync::Arc;

use crate::analyzers::LoadError;
use crate::breaker::{CircuitSnapshot, CircuitState};
use crate::events::{EventCounters, EventKind};
use crate::governor::GovernorUtilization;
use crate::metrics::{MemoryStatus, MetricSummary, epoch_ms};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Ok,
    Degraded,
    Critical,
}

/// Recent event counts per category.
#[derive(Clone, Debug, Serialize)]
pub struct ViolationCounts {
    pub performance: u64,
    pub memory_pressure: u64,
    pub circuit_changes: u64,
    pub security: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthState,
    pub timestamp_ms: u64,
    pub metrics: Vec<MetricSummary>,
    pub memory: MemoryStatus,
    pub circuit: CircuitSnapshot,
    pub governor: GovernorUtilization,
    pub bus_degraded: bool,
    pub analyzers: Vec<String>,
    pub analyzer_load_errors: Vec<LoadError>,
    pub cache_entries: usize,
    pub tracked_requests: usize,
    pub violations: ViolationCounts,
}

/// Inputs the status rules look at, separated from the snapshot assembly so
/// the rules stay unit-testable.
pub struct StatusInputs {
    pub circuit_state: CircuitState,
    pub bus_degraded: bool,
    pub request_p95_ms: Option<f64>,
    pub request_p95_target_ms: u64,
    pub memory_pressure: bool,
}

pub fn overall_status(inputs: &StatusInputs) -> HealthState {
    let mut major = 0;
    if inputs.circuit_state == CircuitState::Open {
        major += 1;
    }
    if inputs.bus_degraded {
        major += 1;
    }
    if major >= 2 {
        return HealthState::Critical;
    }

    let p95_breached = inputs
        .request_p95_ms
        .is_some_and(|p95| p95 > inputs.request_p95_target_ms as f64 * 1.5);

    if major == 1 || p95_breached || inputs.memory_pressure {
        HealthState::Degraded
    } else {
        HealthState::Ok
    }
}

pub fn violation_counts(counters: &EventCounters) -> ViolationCounts {
    ViolationCounts {
        performance: counters.count(EventKind::PerformanceViolation),
        memory_pressure: counters.count(EventKind::MemoryPressure),
        circuit_changes: counters.count(EventKind::CircuitStateChange),
        security: counters.count(EventKind::Security),
    }
}

/// Lock-free slot holding the most recently built snapshot, so probes can
/// read the last known state without touching the components.
#[derive(Default)]
pub struct SnapshotSlot {
    last: ArcSwapOption<HealthSnapshot>,
}

impl SnapshotSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, snapshot: HealthSnapshot) {
        self.last.store(Some(Arc::new(snapshot)));
    }

    pub fn last(&self) -> Option<Arc<HealthSnapshot>> {
        self.last.load_full()
    }
}

/// Convenience used by the snapshot assembly.
pub fn stamp() -> u64 {
    epoch_ms()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> StatusInputs {
        StatusInputs {
            circuit_state: CircuitState::Closed,
            bus_degraded: false,
            request_p95_ms: Some(100.0),
            request_p95_target_ms: 200,
            memory_pressure: false,
        }
    }

    #[test]
    fn healthy_by_default() {
        assert_eq!(overall_status(&inputs()), HealthState::Ok);
    }

    #[test]
    fn one_major_signal_is_degraded() {
        let mut i = inputs();
        i.circuit_state = CircuitState::Open;
        assert_eq!(overall_status(&i), HealthState::Degraded);

        let mut i = inputs();
        i.bus_degraded = true;
        assert_eq!(overall_status(&i), HealthState::Degraded);
    }

    #[test]
    fn two_major_signals_are_critical() {
        let mut i = inputs();
        i.circuit_state = CircuitState::Open;
        i.bus_degraded = true;
        assert_eq!(overall_status(&i), HealthState::Critical);
    }

    #[test]
    fn slow_p95_is_degraded() {
        let mut i = inputs();
        i.request_p95_ms = Some(301.0); // > 200 * 1.5
        assert_eq!(overall_status(&i), HealthState::Degraded);

        i.request_p95_ms = Some(300.0); // exactly at the line is fine
        assert_eq!(overall_status(&i), HealthState::Ok);
    }

    #[test]
    fn memory_pressure_is_degraded() {
        let mut i = inputs();
        i.memory_pressure = true;
        assert_eq!(overall_status(&i), HealthState::Degraded);
    }

    #[test]
    fn half_open_circuit_is_not_major() {
        let mut i = inputs();
        i.circuit_state = CircuitState::HalfOpen;
        assert_eq!(overall_status(&i), HealthState::Ok);
    }

    #[test]
    fn snapshot_slot_keeps_latest() {
        let slot = SnapshotSlot::new();
        assert!(slot.last().is_none());
    }
}
