//! Process-wide configuration, read once at construction.
//!
//! Every tunable the core recognizes lives here, grouped the way the
//! components consume them. All sections deserialize with `serde` and fall
//! back to their documented defaults field by field, so a partial config
//! file is always valid.

use serde::Deserialize;

/// Top-level configuration handed to [`crate::dispatcher::ArgusBuilder`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ArgusConfig {
    pub performance: PerformanceConfig,
    pub concurrency: ConcurrencyConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub security: SecurityConfig,
    pub bus: BusConfig,
    pub cache: CacheConfig,
    pub analyzers: AnalyzerConfig,
}

/// Latency targets and memory limits for the observatory.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// P95 target for request admission paths, in milliseconds.
    pub api_p95_ms: u64,
    /// P99 target for request admission paths, in milliseconds.
    pub api_p99_ms: u64,
    /// P95 target for a full file-processing pass, in milliseconds.
    pub file_proc_p95_ms: u64,
    /// P99 target for a full file-processing pass, in milliseconds.
    pub file_proc_p99_ms: u64,
    /// P95 target for storage/bus round trips, in milliseconds.
    pub db_p95_ms: u64,
    /// Heap ceiling the memory sampler compares against.
    pub memory_limit_mb: u64,
    /// Percentage of `memory_limit_mb` above which pressure events fire.
    pub memory_pressure_pct: u8,
    /// Interval between heap samples, in milliseconds.
    pub memory_sample_interval_ms: u64,
    /// Minimum spacing between violation events per metric, in milliseconds.
    pub violation_cooldown_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            api_p95_ms: 200,
            api_p99_ms: 500,
            file_proc_p95_ms: 2_000,
            file_proc_p99_ms: 5_000,
            db_p95_ms: 100,
            memory_limit_mb: 500,
            memory_pressure_pct: 80,
            memory_sample_interval_ms: 10_000,
            violation_cooldown_ms: 60_000,
        }
    }
}

/// Admission control: slots, queueing, and per-client request budgets.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent: usize,
    pub queue_limit: usize,
    /// Deadline applied to a request when the caller does not supply one.
    pub default_timeout_ms: u64,
    /// Deadline for a single bus stream operation.
    pub stream_timeout_ms: u64,
    /// Length of the per-client rate window.
    pub rate_window_ms: u64,
    /// Requests allowed per client per window.
    pub rate_max: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 50,
            queue_limit: 100,
            default_timeout_ms: 30_000,
            stream_timeout_ms: 15_000,
            rate_window_ms: 60_000,
            rate_max: 100,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that trip CLOSED to OPEN.
    pub failure_threshold: u32,
    /// Time spent OPEN before the first HALF_OPEN probe is admitted.
    pub reset_timeout_ms: u64,
    /// Successful probes required to close again; also the concurrent probe cap.
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_max: 3,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub max_file_mb: u64,
    /// MIME classes accepted at the boundary.
    pub allowed_classes: Vec<crate::artifact::ArtifactClass>,
    pub scan_malware: bool,
    /// Verify the file's magic bytes agree with the declared class.
    pub header_validate: bool,
}

impl SecurityConfig {
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_mb * 1024 * 1024
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_file_mb: 50,
            allowed_classes: vec![
                crate::artifact::ArtifactClass::Image,
                crate::artifact::ArtifactClass::Pdf,
                crate::artifact::ArtifactClass::Video,
            ],
            scan_malware: false,
            header_validate: true,
        }
    }
}

/// Message-bus connection and pairing deadlines.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Cap on the exponential backoff between group-creation retries.
    pub retry_backoff_max_ms: u64,
    /// Deadline for a mirror request/response pair.
    pub mirror_timeout_ms: u64,
    /// Deadline for a superior request/response pair.
    pub superior_timeout_ms: u64,
    /// Pending messages idle longer than this are reclaimed and re-delivered.
    pub pending_min_idle_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6379,
            password: None,
            db: 0,
            connect_timeout_ms: 10_000,
            command_timeout_ms: 5_000,
            retry_backoff_max_ms: 2_000,
            mirror_timeout_ms: 5_000,
            superior_timeout_ms: 8_000,
            pending_min_idle_ms: 30_000,
        }
    }
}

/// Verdict cache TTLs, keyed by the confidence of the stored verdict.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_high_secs: u64,
    pub ttl_medium_secs: u64,
    pub ttl_low_secs: u64,
    pub ttl_review_required_secs: u64,
}

impl CacheConfig {
    pub fn ttl_secs(&self, level: crate::verdict::ConfidenceLevel) -> u64 {
        use crate::verdict::ConfidenceLevel::*;
        match level {
            High => self.ttl_high_secs,
            Medium => self.ttl_medium_secs,
            Low => self.ttl_low_secs,
            ReviewRequired => self.ttl_review_required_secs,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_high_secs: 14_400,
            ttl_medium_secs: 7_200,
            ttl_low_secs: 3_600,
            ttl_review_required_secs: 1_800,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Per-analyzer invocation deadline.
    pub timeout_ms: u64,
    /// Opaque settings bag forwarded to every analyzer invocation.
    pub settings: serde_json::Value,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            settings: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::ConfidenceLevel;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ArgusConfig::default();
        assert_eq!(cfg.performance.api_p95_ms, 200);
        assert_eq!(cfg.performance.api_p99_ms, 500);
        assert_eq!(cfg.concurrency.max_concurrent, 50);
        assert_eq!(cfg.concurrency.queue_limit, 100);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
        assert!(cfg.circuit_breaker.enabled);
        assert_eq!(cfg.security.max_file_mb, 50);
        assert_eq!(cfg.bus.mirror_timeout_ms, 5_000);
        assert_eq!(cfg.bus.superior_timeout_ms, 8_000);
        assert_eq!(cfg.bus.pending_min_idle_ms, 30_000);
        assert_eq!(cfg.cache.ttl_secs(ConfidenceLevel::High), 14_400);
        assert_eq!(cfg.cache.ttl_secs(ConfidenceLevel::ReviewRequired), 1_800);
        assert_eq!(cfg.analyzers.timeout_ms, 10_000);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: ArgusConfig =
            serde_json::from_str(r#"{"concurrency": {"max_concurrent": 2}}"#).unwrap();
        assert_eq!(cfg.concurrency.max_concurrent, 2);
        assert_eq!(cfg.concurrency.queue_limit, 100);
        assert_eq!(cfg.performance.memory_limit_mb, 500);
    }
}
