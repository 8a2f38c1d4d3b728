//! Result data model: analyzer results, remote envelopes, consensus, and
//! the terminal verdict of a request.
//!
//! Everything here is wire-facing (serde both ways) and immutable once
//! produced. Construction logic lives with the components; this module only
//! defines shapes and the small classification helpers they share.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::artifact::ArtifactClass;

/// How much an individual analyzer or network trusts its own score.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
    Error,
}

impl Confidence {
    /// Numeric weight used by consensus fusion.
    pub fn weight(&self) -> f64 {
        match self {
            Self::High => 1.0,
            Self::Medium => 0.7,
            Self::Low => 0.4,
            Self::Error => 0.0,
        }
    }
}

/// Confidence classification of a whole verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    ReviewRequired,
}

impl ConfidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::ReviewRequired => "review_required",
        }
    }
}

/// How the request's total latency compares to the configured targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceClass {
    Optimal,
    Acceptable,
    Degraded,
}

/// Outcome of one analyzer over one artifact. Produced once, never mutated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyzerResult {
    pub analyzer: String,
    pub version: String,
    /// Synthetic-likelihood score in `[0, 1]`; `None` when the analyzer
    /// could not score the artifact.
    pub score: Option<f64>,
    pub confidence: Confidence,
    /// Opaque analyzer-specific findings, passed through to the verdict.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub detail: serde_json::Map<String, serde_json::Value>,
    pub duration_ms: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Where a consensus vote came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteKind {
    Local,
    Mirror,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteSource {
    pub kind: VoteKind,
    pub name: String,
}

/// Fused view of local analyzer votes plus mirror-network votes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalConsensus {
    pub votes: usize,
    pub positives: usize,
    pub positive_ratio: f64,
    pub weighted_confidence: f64,
    pub level: ConfidenceLevel,
    pub is_authentic: bool,
    pub sources: SmallVec<[VoteSource; 8]>,
}

/// One decision network's score inside a mirror response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkScore {
    pub name: String,
    pub score: f64,
    pub confidence: Confidence,
    /// Wire payloads from the mirror service spell this `durationMs`.
    #[serde(default, alias = "durationMs")]
    pub duration_ms: u64,
}

/// Mirror-network reply, or the reason there is none.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MirrorEnvelope {
    Ok { networks: Vec<NetworkScore> },
    Timeout,
    Degraded,
}

impl MirrorEnvelope {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded)
    }
}

/// Superior-network decision payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuperiorDecision {
    #[serde(alias = "isAuthentic")]
    pub is_authentic: bool,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Superior-network reply, or the reason there is none.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SuperiorEnvelope {
    Ok(SuperiorDecision),
    Timeout,
    Degraded,
}

impl SuperiorEnvelope {
    pub fn decision(&self) -> Option<&SuperiorDecision> {
        match self {
            Self::Ok(d) => Some(d),
            _ => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded)
    }
}

/// Per-source breakdown attached to a verdict.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerdictDetails {
    /// Local analyzer results, keyed by analyzer name. Empty on cache hits.
    pub local: BTreeMap<String, AnalyzerResult>,
    pub mirror: MirrorEnvelope,
    pub consensus: LocalConsensus,
    pub superior: SuperiorEnvelope,
}

/// Terminal result of one request. Produced exactly once per successful
/// request; cache hits return a stored clone with `cache_hit` set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Verdict {
    pub is_authentic: bool,
    pub confidence_level: ConfidenceLevel,
    pub artifact_class: ArtifactClass,
    pub content_hash_prefix: String,
    pub performance_class: PerformanceClass,
    pub correlation_id: String,
    /// Milliseconds since the Unix epoch, UTC.
    pub timestamp_utc: u64,
    #[serde(default)]
    pub cache_hit: bool,
    /// True when any leg of the pipeline ran in bus-degraded mode.
    #[serde(default)]
    pub degraded: bool,
    pub details: VerdictDetails,
}
