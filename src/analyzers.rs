//! Analyzer capability: the plugin contract and the registry.
//!
//! Feature analyzers are independent detectors (EXIF coherence, noise
//! residue, compression history, …) that each score one artifact. The core
//! never looks inside them; it only demands the [`Analyzer`] contract.
//! Implementations are registered at construction into an
//! [`AnalyzerRegistry`]; an analyzer that cannot be registered is recorded
//! as a load error and skipped, never fatal. Registered analyzers are
//! treated as immutable: any per-call state belongs inside the
//! implementation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::artifact::ArtifactClass;
use crate::verdict::Confidence;

pub mod runner;

/// Everything an analyzer receives for one invocation.
#[derive(Clone, Debug)]
pub struct AnalyzerInput {
    pub artifact_id: String,
    pub correlation_id: String,
    /// On-disk location, when the artifact is file-backed.
    pub path: Option<std::path::PathBuf>,
    /// In-memory bytes, when it is not.
    pub data: Option<Bytes>,
    pub class: ArtifactClass,
    /// Operator-provided settings bag, shared by all analyzers.
    pub settings: Arc<serde_json::Value>,
}

/// What an analyzer reports back on success.
#[derive(Clone, Debug)]
pub struct AnalyzerOutcome {
    /// Synthetic-likelihood score in `[0, 1]`, or `None` when the artifact
    /// could not be scored (unsupported variant, missing metadata).
    pub score: Option<f64>,
    pub confidence: Confidence,
    /// Analyzer-specific findings surfaced verbatim in the verdict.
    pub detail: serde_json::Map<String, serde_json::Value>,
}

impl AnalyzerOutcome {
    pub fn scored(score: f64, confidence: Confidence) -> Self {
        Self { score: Some(score), confidence, detail: serde_json::Map::new() }
    }

    pub fn unscored() -> Self {
        Self { score: None, confidence: Confidence::Low, detail: serde_json::Map::new() }
    }
}

/// Contract every feature analyzer satisfies.
///
/// Implementations must be side-effect-free with respect to each other:
/// the runner invokes all of them concurrently over the same input.
#[async_trait]
pub trait Analyzer: Send + Sync + 'static {
    /// Unique name, surfaced in results and verdict details.
    fn name(&self) -> &'static str;

    /// Implementation version, surfaced next to the name.
    fn version(&self) -> &'static str;

    async fn analyze(&self, input: &AnalyzerInput) -> anyhow::Result<AnalyzerOutcome>;
}

/// Why an analyzer was rejected at registration.
#[derive(Clone, Debug, Serialize)]
pub struct LoadError {
    pub analyzer: String,
    pub reason: String,
}

/// Compile-time capability registry.
///
/// The set of analyzers is fixed once the engine is built; discovery
/// happens in code, not on the filesystem. Rejections are recorded and the
/// registry keeps going.
#[derive(Default)]
pub struct AnalyzerRegistry {
    analyzers: Vec<Arc<dyn Analyzer>>,
    load_errors: Vec<LoadError>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one analyzer. Duplicate or empty names are recorded as
    /// load errors and skipped.
    pub fn register(&mut self, analyzer: Arc<dyn Analyzer>) {
        let name = analyzer.name();
        if name.trim().is_empty() {
            self.load_errors.push(LoadError {
                analyzer: "<unnamed>".into(),
                reason: "analyzer declared an empty name".into(),
            });
            return;
        }
        if self.analyzers.iter().any(|a| a.name() == name) {
            self.load_errors.push(LoadError {
                analyzer: name.into(),
                reason: "duplicate analyzer name".into(),
            });
            return;
        }
        tracing::info!(analyzer = name, version = analyzer.version(), "analyzer registered");
        self.analyzers.push(analyzer);
    }

    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Analyzer>> {
        self.analyzers.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.analyzers.iter().map(|a| a.name()).collect()
    }

    pub fn load_errors(&self) -> &[LoadError] {
        &self.load_errors
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::time::Duration;

    /// Deterministic analyzer for tests: fixed score, optional delay or
    /// forced failure.
    pub struct StubAnalyzer {
        pub stub_name: &'static str,
        pub score: Option<f64>,
        pub confidence: Confidence,
        pub delay: Duration,
        pub fail: bool,
    }

    impl StubAnalyzer {
        pub fn scoring(name: &'static str, score: f64, confidence: Confidence) -> Self {
            Self {
                stub_name: name,
                score: Some(score),
                confidence,
                delay: Duration::ZERO,
                fail: false,
            }
        }

        pub fn failing(name: &'static str) -> Self {
            Self {
                stub_name: name,
                score: None,
                confidence: Confidence::Error,
                delay: Duration::ZERO,
                fail: true,
            }
        }

        pub fn slow(name: &'static str, delay: Duration) -> Self {
            Self {
                stub_name: name,
                score: Some(0.5),
                confidence: Confidence::Medium,
                delay,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Analyzer for StubAnalyzer {
        fn name(&self) -> &'static str {
            self.stub_name
        }

        fn version(&self) -> &'static str {
            "test"
        }

        async fn analyze(&self, _input: &AnalyzerInput) -> anyhow::Result<AnalyzerOutcome> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                anyhow::bail!("stub analyzer failed on purpose");
            }
            Ok(AnalyzerOutcome {
                score: self.score,
                confidence: self.confidence,
                detail: serde_json::Map::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StubAnalyzer;
    use super::*;

    #[test]
    fn duplicate_names_become_load_errors() {
        let mut registry = AnalyzerRegistry::new();
        registry.register(Arc::new(StubAnalyzer::scoring("exif", 0.9, Confidence::High)));
        registry.register(Arc::new(StubAnalyzer::scoring("exif", 0.1, Confidence::Low)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.load_errors().len(), 1);
        assert_eq!(registry.load_errors()[0].analyzer, "exif");
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut registry = AnalyzerRegistry::new();
        registry.register(Arc::new(StubAnalyzer::scoring("", 0.9, Confidence::High)));
        assert!(registry.is_empty());
        assert_eq!(registry.load_errors().len(), 1);
    }

    #[test]
    fn names_reflect_registration_order() {
        let mut registry = AnalyzerRegistry::new();
        registry.register(Arc::new(StubAnalyzer::scoring("noise", 0.2, Confidence::Medium)));
        registry.register(Arc::new(StubAnalyzer::scoring("exif", 0.9, Confidence::High)));
        assert_eq!(registry.names(), vec!["noise", "exif"]);
    }
}
