//! In-process event arbiter for the core's cross-cutting events.
//!
//! Components emit; the dispatcher and health module read. This is the only
//! back-channel between layers, and it is unidirectional: nothing inside a
//! handler may call back into the component that emitted. Subscribers are
//! registered at construction; tests register recording subscribers.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::{BoxFuture, join_all};

use crate::breaker::CircuitState;

/// Event kinds the core emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
  CircuitStateChange,
  PerformanceViolation,
  MemoryPressure,
  Security,
}

impl EventKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::CircuitStateChange => "circuit.state_change",
      Self::PerformanceViolation => "performance.violation",
      Self::MemoryPressure => "memory.pressure",
      Self::Security => "security.event",
    }
  }
}

/// A concrete event carried through the arbiter.
#[derive(Clone, Debug)]
pub enum CoreEvent {
  CircuitStateChange {
    circuit: String,
    from: CircuitState,
    to: CircuitState,
  },
  PerformanceViolation {
    metric: &'static str,
    percentile: &'static str,
    observed_ms: f64,
    threshold_ms: u64,
  },
  MemoryPressure {
    used_mb: u64,
    limit_mb: u64,
    percent: u8,
  },
  Security {
    correlation_id: String,
    reason: String,
  },
}

impl CoreEvent {
  pub fn kind(&self) -> EventKind {
    match self {
      Self::CircuitStateChange { .. } => EventKind::CircuitStateChange,
      Self::PerformanceViolation { .. } => EventKind::PerformanceViolation,
      Self::MemoryPressure { .. } => EventKind::MemoryPressure,
      Self::Security { .. } => EventKind::Security,
    }
  }
}

/// Boxed async event handler.
pub type EventHandler = Arc<dyn Fn(CoreEvent) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Inner {
  handlers: DashMap<EventKind, Vec<EventHandler>>,
}

/// Shared arbiter used to register and dispatch typed core events.
///
/// Cloning is cheap; all clones dispatch to the same handler set.
#[derive(Clone, Default)]
pub struct EventArbiter {
  inner: Arc<Inner>,
}

impl EventArbiter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a handler for one event kind.
  ///
  /// Handlers are invoked concurrently, in no particular order, whenever a
  /// matching event is emitted.
  pub fn on<F, Fut>(&self, kind: EventKind, handler: F)
  where
    F: Fn(CoreEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
  {
    let handler: EventHandler = Arc::new(move |event: CoreEvent| {
      let fut = handler(event);
      Box::pin(async move { fut.await })
    });

    self
      .inner
      .handlers
      .entry(kind)
      .or_insert_with(Vec::new)
      .push(handler);
  }

  /// Emits an event and awaits all registered handlers.
  pub async fn emit(&self, event: CoreEvent) {
    if let Some(entry) = self.inner.handlers.get(&event.kind()) {
      let handlers = entry.clone();
      drop(entry);

      let futures = handlers.into_iter().map(|handler| {
        let e = event.clone();
        handler(e)
      });

      let _ = join_all(futures).await;
    }
  }

  /// Emits without awaiting handler completion. For synchronous emitters
  /// (metric insertion, breaker transitions) that must not suspend.
  pub fn emit_detached(&self, event: CoreEvent) {
    if self.inner.handlers.contains_key(&event.kind()) {
      let arbiter = self.clone();
      tokio::spawn(async move { arbiter.emit(event).await });
    }
  }
}

/// Rolling per-kind event counters, fed by a subscription on every kind.
/// The health snapshot reads these as "recent violations per category".
#[derive(Clone, Default)]
pub struct EventCounters {
  counts: Arc<DashMap<EventKind, u64>>,
}

impl EventCounters {
  /// Creates counters and wires them into the arbiter.
  pub fn subscribe(arbiter: &EventArbiter) -> Self {
    let counters = Self::default();
    for kind in [
      EventKind::CircuitStateChange,
      EventKind::PerformanceViolation,
      EventKind::MemoryPressure,
      EventKind::Security,
    ] {
      let counts = counters.counts.clone();
      arbiter.on(kind, move |event| {
        let counts = counts.clone();
        async move {
          *counts.entry(event.kind()).or_insert(0) += 1;
        }
      });
    }
    counters
  }

  pub fn count(&self, kind: EventKind) -> u64 {
    self.counts.get(&kind).map(|c| *c).unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test]
  async fn handlers_fire_for_matching_kind_only() {
    let arbiter = EventArbiter::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    arbiter.on(EventKind::MemoryPressure, move |_| {
      let h = h.clone();
      async move {
        h.fetch_add(1, Ordering::SeqCst);
      }
    });

    arbiter
      .emit(CoreEvent::MemoryPressure { used_mb: 450, limit_mb: 500, percent: 90 })
      .await;
    arbiter
      .emit(CoreEvent::Security { correlation_id: "c".into(), reason: "sig".into() })
      .await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn counters_accumulate_per_kind() {
    let arbiter = EventArbiter::new();
    let counters = EventCounters::subscribe(&arbiter);

    for _ in 0..3 {
      arbiter
        .emit(CoreEvent::PerformanceViolation {
          metric: "request_latency",
          percentile: "p95",
          observed_ms: 400.0,
          threshold_ms: 200,
        })
        .await;
    }

    assert_eq!(counters.count(EventKind::PerformanceViolation), 3);
    assert_eq!(counters.count(EventKind::MemoryPressure), 0);
  }
}
