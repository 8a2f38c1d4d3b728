//! Circuit breaker around the analysis pipeline.
//!
//! Classic three-state machine: CLOSED admits everything and counts
//! consecutive failures; OPEN rejects immediately until the reset timeout
//! elapses; HALF_OPEN admits a bounded number of concurrent probes and
//! closes again after enough of them succeed. A timeout counts as a failure,
//! and any failure during HALF_OPEN reopens the circuit regardless of probe
//! successes so far. Rejection is a distinct error kind so callers can tell
//! "refused fast" from "ran and failed".

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::{DispatchError, Result};
use crate::events::{CoreEvent, EventArbiter};
use crate::metrics::epoch_ms;

/// Transition history ring capacity.
const TRANSITION_RING: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at_ms: u64,
}

/// Health-facing snapshot of one breaker.
#[derive(Clone, Debug, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_failure_ms: Option<u64>,
    pub last_success_ms: Option<u64>,
    pub half_open_in_flight: u32,
    pub transitions: Vec<Transition>,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    last_failure: Option<Instant>,
    last_failure_ms: Option<u64>,
    last_success_ms: Option<u64>,
    total_failures: u64,
    total_successes: u64,
    transitions: SmallVec<[Transition; TRANSITION_RING]>,
}

/// Whether a call was admitted as a CLOSED call or a HALF_OPEN probe.
#[derive(Clone, Copy)]
enum Admission {
    Closed,
    Probe,
}

pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    arbiter: EventArbiter,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: CircuitBreakerConfig, arbiter: EventArbiter) -> Self {
        Self {
            name: name.into(),
            cfg,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                last_failure: None,
                last_failure_ms: None,
                last_success_ms: None,
                total_failures: 0,
                total_successes: 0,
                transitions: SmallVec::new(),
            }),
            arbiter,
        }
    }

    /// Races `op` against `timeout` under breaker accounting.
    ///
    /// In OPEN state the operation is never started and
    /// [`DispatchError::CircuitOpen`] comes back immediately. A timeout maps
    /// to [`DispatchError::Timeout`] and counts as a failure. When the
    /// breaker is disabled by config only the timeout race remains.
    pub async fn call<T, F>(&self, op: F, timeout: Duration) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.cfg.enabled {
            return match tokio::time::timeout(timeout, op).await {
                Ok(result) => result,
                Err(_) => Err(self.timeout_error(timeout)),
            };
        }

        let admission = self.admit()?;
        match tokio::time::timeout(timeout, op).await {
            Ok(Ok(value)) => {
                self.on_success(admission);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure(admission);
                Err(e)
            }
            Err(_) => {
                self.on_failure(admission);
                Err(self.timeout_error(timeout))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            last_failure_ms: inner.last_failure_ms,
            last_success_ms: inner.last_success_ms,
            half_open_in_flight: inner.half_open_in_flight,
            transitions: inner.transitions.to_vec(),
        }
    }

    fn timeout_error(&self, timeout: Duration) -> DispatchError {
        DispatchError::Timeout {
            what: format!("operation guarded by circuit '{}'", self.name),
            ms: timeout.as_millis() as u64,
        }
    }

    fn admit(&self) -> Result<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Closed),
            CircuitState::Open => {
                let reset = Duration::from_millis(self.cfg.reset_timeout_ms);
                let ready = inner
                    .last_failure
                    .map(|at| at.elapsed() >= reset)
                    .unwrap_or(true);
                if !ready {
                    return Err(DispatchError::CircuitOpen { name: self.name.clone() });
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 1;
                Ok(Admission::Probe)
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.cfg.half_open_max {
                    return Err(DispatchError::HalfOpenSaturated { name: self.name.clone() });
                }
                inner.half_open_in_flight += 1;
                Ok(Admission::Probe)
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        inner.last_success_ms = Some(epoch_ms());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                if matches!(admission, Admission::Probe) {
                    inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.cfg.half_open_max {
                        self.transition(&mut inner, CircuitState::Closed);
                        inner.consecutive_failures = 0;
                        inner.half_open_in_flight = 0;
                    }
                }
            }
            // A straggler finishing after the circuit re-opened; counted, no
            // state change.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_ms = Some(epoch_ms());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.cfg.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                if matches!(admission, Admission::Probe) {
                    inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                }
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        if inner.transitions.len() == TRANSITION_RING {
            inner.transitions.remove(0);
        }
        inner.transitions.push(Transition { from, to, at_ms: epoch_ms() });
        tracing::info!(circuit = %self.name, %from, %to, "circuit state change");
        self.arbiter.emit_detached(CoreEvent::CircuitStateChange {
            circuit: self.name.clone(),
            from,
            to,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(cfg: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new("pipeline", cfg, EventArbiter::new())
    }

    fn fast_cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 3,
            reset_timeout_ms: 1_000,
            half_open_max: 2,
        }
    }

    async fn fail(b: &CircuitBreaker) {
        let _ = b
            .call(
                async { Err::<(), _>(DispatchError::Internal("boom".into())) },
                Duration::from_secs(1),
            )
            .await;
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32> {
        b.call(async { Ok(7) }, Duration::from_secs(1)).await
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let b = breaker(fast_cfg());
        for _ in 0..3 {
            fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_rejects_without_invoking_op() {
        let b = breaker(fast_cfg());
        for _ in 0..3 {
            fail(&b).await;
        }

        let invoked = Arc::new(AtomicUsize::new(0));
        let seen = invoked.clone();
        let result = b
            .call(
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Duration::from_secs(1),
            )
            .await;

        assert!(matches!(result, Err(DispatchError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_enough_successes() {
        let b = breaker(fast_cfg());
        for _ in 0..3 {
            fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_immediately() {
        let b = breaker(fast_cfg());
        for _ in 0..3 {
            fail(&b).await;
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let b = breaker(CircuitBreakerConfig { failure_threshold: 1, ..fast_cfg() });
        let result = b
            .call(
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                },
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(result, Err(DispatchError::Timeout { .. })));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn disabled_breaker_passes_through() {
        let b = breaker(CircuitBreakerConfig { enabled: false, ..fast_cfg() });
        for _ in 0..10 {
            fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(succeed(&b).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn transitions_are_recorded() {
        let b = breaker(fast_cfg());
        for _ in 0..3 {
            fail(&b).await;
        }
        let snap = b.snapshot();
        assert_eq!(snap.transitions.len(), 1);
        assert_eq!(snap.transitions[0].from, CircuitState::Closed);
        assert_eq!(snap.transitions[0].to, CircuitState::Open);
        assert_eq!(snap.total_failures, 3);
    }
}
