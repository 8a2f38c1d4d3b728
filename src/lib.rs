#![cfg_attr(docsrs, feature(doc_cfg))]

//! Asynchronous dispatch and reliability core for content-authenticity
//! analysis pipelines.
//!
//! Argus sits between an HTTP ingress and a fleet of analysis back-ends. It
//! accepts one file at a time, fans it out across local feature analyzers,
//! exchanges scores with remote "mirror" and "superior" decision networks
//! over a streams-style message bus, fuses everything into a consensus, and
//! returns a single verdict — all under one correlation id, with the
//! request recorded in a forensically queryable stage log.
//!
//! # High-level features
//! - Circuit breaker, priority admission queue, per-client rate budgets
//! - Content-hash dedup cache with confidence-weighted TTLs and in-flight
//!   request coalescing
//! - Bidirectional bus client with consumer groups, acks, request/response
//!   pairing, and a first-class degraded mode when the bus is unreachable
//! - Parallel analyzer fan-out with per-analyzer timeouts
//! - Rolling P50/P95/P99 latency windows with violation events and memory
//!   pressure sampling
//! - Aggregated health snapshot for external probes
//!
//! # Compatibility
//! - Runtime: `tokio`
//! - Bus: in-memory built-in, Redis Streams behind the `redis-bus` feature
//!
//! # Quickstart
//!
//! ```rust,no_run
//! use argus::dispatcher::Argus;
//! use argus::artifact::{ArtifactClass, FileArtifact};
//!
//! # async fn example() {
//! let engine = Argus::builder().build();
//! engine.start();
//!
//! let artifact = FileArtifact::from_bytes(&b"\xFF\xD8\xFF..."[..], ArtifactClass::Image);
//! let verdict = engine.submit(artifact, "client-1", 0, None, None).await;
//! # let _ = verdict;
//! # }
//! ```
//!
//! # Key concepts
//! - [dispatcher::Argus] owns the components and drives one request
//!   end-to-end.
//! - [analyzers::Analyzer] is the contract feature detectors implement.
//! - [bus::StreamBus] is the seam between the core and the message bus.
//! - [verdict::Verdict] is the terminal result of one request.
//!
//! # Feature flags
//! - `redis-bus` — Redis Streams backend for the bus client
//! - `argus-tracing` — structured tracing subscriber

/// Feature analyzer contract, registry, and parallel runner.
pub mod analyzers;

/// File artifacts, identifiers, and content hashing.
pub mod artifact;

/// Circuit breaker around the analysis pipeline.
pub mod breaker;

/// Stream bus client: backends, consumer groups, request/response pairing.
pub mod bus;

/// Verdict cache keyed by content hash.
pub mod cache;

/// Process-wide configuration.
pub mod config;

/// Engine facade and per-request orchestration.
pub mod dispatcher;

/// Error taxonomy.
pub mod error;

/// Typed in-process event arbiter.
pub mod events;

/// Score fusion and consensus classification.
pub mod fusion;

/// Slots, priority queue, and per-client rate budgets.
pub mod governor;

/// Aggregated health snapshot.
pub mod health;

/// Rolling latency windows and the memory sampler.
pub mod metrics;

/// Correlation-keyed stage log.
pub mod tracking;

/// Structured tracing subscriber setup.
#[cfg(feature = "argus-tracing")]
#[cfg_attr(docsrs, doc(cfg(feature = "argus-tracing")))]
pub mod tracing;

/// Result data model: analyzer results, envelopes, consensus, verdicts.
pub mod verdict;

pub use artifact::{ArtifactClass, ContentHash, FileArtifact};
pub use config::ArgusConfig;
pub use dispatcher::{Argus, ArgusBuilder};
pub use error::{DispatchError, RequestError, Severity};
pub use verdict::{ConfidenceLevel, Verdict};
