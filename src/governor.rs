//! Admission control: slots, a priority queue, and per-client rate budgets.
//!
//! The governor owns three gates, checked in order: a fixed-window request
//! budget per client, a counted set of execution slots, and a bounded
//! priority queue for requests that must wait. Higher priority wins; ties go
//! to the earlier arrival. Slots are released through an RAII permit, so a
//! request that acquired one releases it exactly once no matter how it ends.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::ConcurrencyConfig;
use crate::error::{DispatchError, Result};

/// One queued admission request.
#[derive(Clone, Debug)]
pub struct QueueTicket {
    pub artifact_id: String,
    pub client_id: String,
    pub priority: i32,
    enqueued_seq: u64,
}

struct Waiter {
    ticket: QueueTicket,
    admit: oneshot::Sender<()>,
}

struct QueueState {
    active: HashSet<String>,
    queue: Vec<Waiter>,
    seq: u64,
}

struct ClientBucket {
    used: u32,
    window_start: Instant,
}

struct Shared {
    cfg: ConcurrencyConfig,
    state: Mutex<QueueState>,
    buckets: DashMap<String, ClientBucket>,
}

/// Utilization figures for the health snapshot.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct GovernorUtilization {
    pub active: usize,
    pub max_concurrent: usize,
    pub queued: usize,
    pub queue_limit: usize,
}

/// Held for the lifetime of an admitted request; dropping it frees the slot
/// and wakes the best waiter.
pub struct SlotPermit {
    shared: Arc<Shared>,
    artifact_id: String,
    waited: Duration,
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit")
            .field("artifact_id", &self.artifact_id)
            .field("waited", &self.waited)
            .finish()
    }
}

impl SlotPermit {
    /// How long this request queued before admission. Zero for immediate entry.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.shared.release(&self.artifact_id);
    }
}

#[derive(Clone)]
pub struct ConcurrencyGovernor {
    shared: Arc<Shared>,
}

impl ConcurrencyGovernor {
    pub fn new(cfg: ConcurrencyConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                state: Mutex::new(QueueState {
                    active: HashSet::new(),
                    queue: Vec::new(),
                    seq: 0,
                }),
                buckets: DashMap::new(),
            }),
        }
    }

    /// Admits a request or queues it until a slot frees up.
    ///
    /// Rejections, in check order: [`DispatchError::RateLimited`] when the
    /// client's window budget is spent, [`DispatchError::QueueFull`] when
    /// the wait queue is at its limit, [`DispatchError::QueueTimeout`] when
    /// `wait_timeout` elapses before admission.
    pub async fn acquire(
        &self,
        artifact_id: &str,
        client_id: &str,
        priority: i32,
        wait_timeout: Duration,
    ) -> Result<SlotPermit> {
        self.shared.check_rate(client_id)?;

        let rx = {
            let mut state = self.shared.state.lock();
            if state.active.len() < self.shared.cfg.max_concurrent {
                state.active.insert(artifact_id.to_string());
                return Ok(self.permit(artifact_id, Duration::ZERO));
            }
            if state.queue.len() >= self.shared.cfg.queue_limit {
                return Err(DispatchError::QueueFull { limit: self.shared.cfg.queue_limit });
            }
            let (tx, rx) = oneshot::channel();
            state.seq += 1;
            let seq = state.seq;
            state.queue.push(Waiter {
                ticket: QueueTicket {
                    artifact_id: artifact_id.to_string(),
                    client_id: client_id.to_string(),
                    priority,
                    enqueued_seq: seq,
                },
                admit: tx,
            });
            debug_assert!(
                state.active.len() + state.queue.len()
                    <= self.shared.cfg.max_concurrent + self.shared.cfg.queue_limit
            );
            rx
        };

        let started = Instant::now();
        match tokio::time::timeout(wait_timeout, rx).await {
            Ok(Ok(())) => Ok(self.permit(artifact_id, started.elapsed())),
            Ok(Err(_)) => Err(DispatchError::Internal(
                "admission queue dropped a parked waiter".into(),
            )),
            Err(_) => {
                let still_queued = {
                    let mut state = self.shared.state.lock();
                    match state
                        .queue
                        .iter()
                        .position(|w| w.ticket.artifact_id == artifact_id)
                    {
                        Some(pos) => {
                            state.queue.swap_remove(pos);
                            true
                        }
                        None => false,
                    }
                };
                if !still_queued {
                    // Admitted in the same instant the deadline fired; the
                    // slot is ours and must go back.
                    self.shared.release(artifact_id);
                }
                Err(DispatchError::QueueTimeout)
            }
        }
    }

    /// Frees the slot held for `artifact_id` and wakes the best waiter.
    /// Releasing an id that holds no slot is a no-op (and logged).
    pub fn release(&self, artifact_id: &str) {
        self.shared.release(artifact_id);
    }

    pub fn utilization(&self) -> GovernorUtilization {
        let state = self.shared.state.lock();
        GovernorUtilization {
            active: state.active.len(),
            max_concurrent: self.shared.cfg.max_concurrent,
            queued: state.queue.len(),
            queue_limit: self.shared.cfg.queue_limit,
        }
    }

    /// Drops client buckets idle for more than two rate windows.
    pub fn sweep_idle_buckets(&self) {
        let window = Duration::from_millis(self.shared.cfg.rate_window_ms);
        let now = Instant::now();
        self.shared
            .buckets
            .retain(|_, b| now.duration_since(b.window_start) < window * 2);
    }

    fn permit(&self, artifact_id: &str, waited: Duration) -> SlotPermit {
        SlotPermit {
            shared: self.shared.clone(),
            artifact_id: artifact_id.to_string(),
            waited,
        }
    }
}

impl Shared {
    fn check_rate(&self, client_id: &str) -> Result<()> {
        let window = Duration::from_millis(self.cfg.rate_window_ms);
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| ClientBucket { used: 0, window_start: now });
        if now.duration_since(bucket.window_start) >= window {
            bucket.used = 0;
            bucket.window_start = now;
        }
        if bucket.used >= self.cfg.rate_max {
            return Err(DispatchError::RateLimited { client: client_id.to_string() });
        }
        bucket.used += 1;
        Ok(())
    }

    fn release(&self, artifact_id: &str) {
        let mut state = self.state.lock();
        if !state.active.remove(artifact_id) {
            tracing::warn!(artifact_id, "release without a held slot, ignoring");
            return;
        }
        self.process_queue(&mut state);
    }

    /// Wakes waiters into free slots, best ticket first: highest priority,
    /// then earliest arrival within the class.
    fn process_queue(&self, state: &mut QueueState) {
        while state.active.len() < self.cfg.max_concurrent && !state.queue.is_empty() {
            let best = state
                .queue
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.ticket
                        .priority
                        .cmp(&b.ticket.priority)
                        .then(b.ticket.enqueued_seq.cmp(&a.ticket.enqueued_seq))
                })
                .map(|(i, _)| i);
            let Some(idx) = best else { return };
            let waiter = state.queue.remove(idx);
            let id = waiter.ticket.artifact_id.clone();
            state.active.insert(id.clone());
            if waiter.admit.send(()).is_err() {
                // Waiter gave up between parking and wakeup.
                state.active.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(max: usize, queue: usize) -> ConcurrencyGovernor {
        ConcurrencyGovernor::new(ConcurrencyConfig {
            max_concurrent: max,
            queue_limit: queue,
            rate_max: 1_000,
            ..ConcurrencyConfig::default()
        })
    }

    #[tokio::test]
    async fn immediate_admission_below_capacity() {
        let g = governor(2, 10);
        let a = g.acquire("a", "c1", 0, Duration::from_secs(1)).await.unwrap();
        let b = g.acquire("b", "c1", 0, Duration::from_secs(1)).await.unwrap();
        assert_eq!(a.waited(), Duration::ZERO);
        assert_eq!(g.utilization().active, 2);
        drop(a);
        drop(b);
        assert_eq!(g.utilization().active, 0);
    }

    #[tokio::test]
    async fn queue_full_rejects_immediately() {
        let g = governor(1, 0);
        let _held = g.acquire("a", "c1", 0, Duration::from_secs(1)).await.unwrap();
        let err = g
            .acquire("b", "c1", 0, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull { limit: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_timeout_removes_waiter() {
        let g = governor(1, 5);
        let _held = g.acquire("a", "c1", 0, Duration::from_secs(5)).await.unwrap();
        let err = g
            .acquire("b", "c1", 0, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::QueueTimeout));
        assert_eq!(g.utilization().queued, 0);
    }

    #[tokio::test]
    async fn waiter_admitted_on_release_by_priority() {
        let g = governor(1, 5);
        let held = g.acquire("a", "c1", 0, Duration::from_secs(5)).await.unwrap();

        let g_low = g.clone();
        let low = tokio::spawn(async move {
            g_low.acquire("low", "c1", 1, Duration::from_secs(5)).await
        });
        let g_high = g.clone();
        let high = tokio::spawn(async move {
            g_high.acquire("high", "c1", 9, Duration::from_secs(5)).await
        });

        // both parked
        while g.utilization().queued < 2 {
            tokio::task::yield_now().await;
        }
        drop(held);

        let winner = high.await.unwrap().unwrap();
        assert!(winner.waited() >= Duration::ZERO);
        // low is still parked until the winner releases
        assert_eq!(g.utilization().queued, 1);
        drop(winner);
        low.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fifo_within_a_priority_class() {
        let g = governor(1, 5);
        let held = g.acquire("a", "c1", 0, Duration::from_secs(5)).await.unwrap();

        let g1 = g.clone();
        let first = tokio::spawn(async move {
            let p = g1.acquire("first", "c1", 3, Duration::from_secs(5)).await;
            (Instant::now(), p)
        });
        while g.utilization().queued < 1 {
            tokio::task::yield_now().await;
        }
        let g2 = g.clone();
        let second = tokio::spawn(async move {
            let p = g2.acquire("second", "c1", 3, Duration::from_secs(5)).await;
            (Instant::now(), p)
        });
        while g.utilization().queued < 2 {
            tokio::task::yield_now().await;
        }

        drop(held);
        let (t_first, p_first) = first.await.unwrap();
        drop(p_first.unwrap());
        let (t_second, p_second) = second.await.unwrap();
        p_second.unwrap();
        assert!(t_first <= t_second);
    }

    #[tokio::test]
    async fn rate_budget_per_client_window() {
        let g = ConcurrencyGovernor::new(ConcurrencyConfig {
            max_concurrent: 10,
            queue_limit: 10,
            rate_max: 2,
            rate_window_ms: 60_000,
            ..ConcurrencyConfig::default()
        });
        let _a = g.acquire("a", "c1", 0, Duration::from_secs(1)).await.unwrap();
        let _b = g.acquire("b", "c1", 0, Duration::from_secs(1)).await.unwrap();
        let err = g
            .acquire("c", "c1", 0, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RateLimited { .. }));

        // a different client has its own budget
        g.acquire("d", "c2", 0, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rate_window_resets() {
        let g = ConcurrencyGovernor::new(ConcurrencyConfig {
            max_concurrent: 10,
            queue_limit: 10,
            rate_max: 1,
            rate_window_ms: 1_000,
            ..ConcurrencyConfig::default()
        });
        let _a = g.acquire("a", "c1", 0, Duration::from_secs(1)).await.unwrap();
        assert!(g.acquire("b", "c1", 0, Duration::from_secs(1)).await.is_err());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        g.acquire("c", "c1", 0, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn release_without_slot_is_noop() {
        let g = governor(1, 1);
        g.release("ghost");
        assert_eq!(g.utilization().active, 0);
    }
}
