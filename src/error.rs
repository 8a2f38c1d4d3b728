//! Error taxonomy for the dispatch core.
//!
//! Every failure that can terminate a request is a variant of [`DispatchError`],
//! carrying enough structure for callers to branch on category, severity, and
//! retryability without string matching. Analyzer failures never appear here:
//! they are captured inside an `AnalyzerResult` and absorbed by consensus.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// How bad a failure is, for alerting and health rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("security check failed: {0}")]
    Security(String),

    #[error("client {client} exhausted its request budget for this window")]
    RateLimited { client: String },

    #[error("admission queue is full ({limit} waiting)")]
    QueueFull { limit: usize },

    #[error("timed out waiting for an execution slot")]
    QueueTimeout,

    #[error("{what} timed out after {ms} ms")]
    Timeout { what: String, ms: u64 },

    #[error("circuit '{name}' is open")]
    CircuitOpen { name: String },

    #[error("circuit '{name}' is probing recovery, retry later")]
    HalfOpenSaturated { name: String },

    #[error("bus operation failed: {0}")]
    Bus(String),

    #[error("analyzer failure: {0}")]
    Analyzer(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Stable category tag used in alerts, audit entries, and tracking stages.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Security(_) => "security",
            Self::RateLimited { .. } => "rate_limited",
            Self::QueueFull { .. } => "queue_full",
            Self::QueueTimeout => "queue_timeout",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::HalfOpenSaturated { .. } => "circuit_half_open",
            Self::Bus(_) => "bus",
            Self::Analyzer(_) => "analyzer",
            Self::Internal(_) => "internal",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Validation(_) => Severity::Low,
            Self::Security(_) => Severity::High,
            Self::RateLimited { .. } | Self::QueueFull { .. } | Self::QueueTimeout => {
                Severity::Medium
            }
            Self::Timeout { .. } => Severity::Medium,
            Self::CircuitOpen { .. } => Severity::Critical,
            Self::HalfOpenSaturated { .. } => Severity::Medium,
            Self::Bus(_) => Severity::High,
            Self::Analyzer(_) => Severity::Medium,
            Self::Internal(_) => Severity::Critical,
        }
    }

    /// Whether the caller may usefully retry the same request later.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::QueueFull { .. }
                | Self::QueueTimeout
                | Self::Timeout { .. }
                | Self::CircuitOpen { .. }
                | Self::HalfOpenSaturated { .. }
        )
    }
}

/// Boundary error returned by `submit`: the failure plus the correlation id
/// the caller needs to find the request in the tracking store. Stack details
/// never cross this boundary.
#[derive(Error, Debug)]
#[error("{kind}")]
pub struct RequestError {
    pub correlation_id: String,
    pub kind: DispatchError,
}

impl RequestError {
    pub fn category(&self) -> &'static str {
        self.kind.category()
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_are_ordered() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn governor_rejections_are_retryable() {
        assert!(DispatchError::RateLimited { client: "c1".into() }.retryable());
        assert!(DispatchError::QueueFull { limit: 0 }.retryable());
        assert!(DispatchError::QueueTimeout.retryable());
        assert!(!DispatchError::Validation("too large".into()).retryable());
        assert!(!DispatchError::Bus("gone".into()).retryable());
    }

    #[test]
    fn categories_are_stable() {
        let e = DispatchError::CircuitOpen { name: "pipeline".into() };
        assert_eq!(e.category(), "circuit_open");
        assert_eq!(e.severity(), Severity::Critical);
    }
}
