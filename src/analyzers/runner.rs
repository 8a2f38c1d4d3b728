//! Parallel analyzer invocation with per-analyzer timeouts.
//!
//! All registered analyzers run concurrently over the same input; each is
//! bounded by its own deadline. One analyzer timing out or failing yields a
//! failed result for that analyzer only and never disturbs the others. A
//! malformed outcome (score outside `[0, 1]`) is coerced to an unscored
//! error result rather than poisoning consensus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::Instant;

use super::{Analyzer, AnalyzerInput, AnalyzerRegistry};
use crate::verdict::{AnalyzerResult, Confidence};

/// Joined outcome of one parallel fan-out.
#[derive(Clone, Debug, Default)]
pub struct AnalyzerAggregate {
    /// Per-analyzer results, keyed by analyzer name.
    pub results: HashMap<String, AnalyzerResult>,
    /// Human-readable failure notes, one per failed analyzer.
    pub errors: Vec<String>,
    /// Wall clock of the whole parallel join.
    pub total_duration_ms: u64,
    pub success_count: usize,
    pub total_count: usize,
}

pub struct AnalyzerRunner {
    registry: Arc<AnalyzerRegistry>,
    timeout: Duration,
}

impl AnalyzerRunner {
    pub fn new(registry: Arc<AnalyzerRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &AnalyzerRegistry {
        &self.registry
    }

    /// Runs every registered analyzer concurrently over `input`.
    ///
    /// Zero registered analyzers yield an empty aggregate; consensus falls
    /// back to its no-votes default.
    pub async fn run_all(&self, input: &AnalyzerInput) -> AnalyzerAggregate {
        let started = Instant::now();
        let invocations = self
            .registry
            .iter()
            .map(|analyzer| self.run_one(analyzer.clone(), input));
        let results = join_all(invocations).await;

        let mut aggregate = AnalyzerAggregate {
            total_count: results.len(),
            ..AnalyzerAggregate::default()
        };
        for result in results {
            if result.ok {
                aggregate.success_count += 1;
            } else if let Some(error) = &result.error {
                aggregate.errors.push(format!("{}: {error}", result.analyzer));
            }
            aggregate.results.insert(result.analyzer.clone(), result);
        }
        aggregate.total_duration_ms = started.elapsed().as_millis() as u64;
        aggregate
    }

    async fn run_one(&self, analyzer: Arc<dyn Analyzer>, input: &AnalyzerInput) -> AnalyzerResult {
        let name = analyzer.name().to_string();
        let version = analyzer.version().to_string();
        let started = Instant::now();

        let outcome = tokio::time::timeout(self.timeout, analyzer.analyze(input)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(out)) => {
                // Coerce out-of-range scores instead of trusting them.
                let malformed = out.score.is_some_and(|s| !(0.0..=1.0).contains(&s) || s.is_nan());
                if malformed {
                    tracing::warn!(analyzer = %name, score = ?out.score, "malformed analyzer score");
                    return AnalyzerResult {
                        analyzer: name,
                        version,
                        score: None,
                        confidence: Confidence::Error,
                        detail: out.detail,
                        duration_ms,
                        ok: false,
                        error: Some("score outside [0, 1]".into()),
                    };
                }
                AnalyzerResult {
                    analyzer: name,
                    version,
                    score: out.score,
                    confidence: out.confidence,
                    detail: out.detail,
                    duration_ms,
                    ok: true,
                    error: None,
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(analyzer = %name, error = %e, "analyzer failed");
                AnalyzerResult {
                    analyzer: name,
                    version,
                    score: None,
                    confidence: Confidence::Error,
                    detail: serde_json::Map::new(),
                    duration_ms,
                    ok: false,
                    error: Some(e.to_string()),
                }
            }
            Err(_) => {
                tracing::warn!(analyzer = %name, timeout_ms = self.timeout.as_millis() as u64, "analyzer timed out");
                AnalyzerResult {
                    analyzer: name,
                    version,
                    score: None,
                    confidence: Confidence::Error,
                    detail: serde_json::Map::new(),
                    duration_ms,
                    ok: false,
                    error: Some(format!("timed out after {} ms", self.timeout.as_millis())),
                }
            }
        }
    }
}
