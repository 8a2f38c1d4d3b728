//! Content-hash keyed verdict cache with confidence-weighted TTLs.
//!
//! Behavior:
//! - `lookup` returns a stored verdict only while it is unexpired, with
//!   `cache_hit` set on the returned clone.
//! - `store` overwrites any prior entry; the TTL comes from the verdict's
//!   confidence level, so low-trust verdicts age out faster.
//! - Storage is in-memory; TTL-based cleanup runs periodically and expired
//!   entries are also dropped lazily on read.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::artifact::ContentHash;
use crate::config::CacheConfig;
use crate::verdict::{ConfidenceLevel, Verdict};

#[derive(Clone)]
struct CacheEntry {
  verdict: Verdict,
  cached_at: Instant,
  ttl: Duration,
  confidence: ConfidenceLevel,
  version: &'static str,
}

impl CacheEntry {
  fn expired(&self) -> bool {
    self.cached_at.elapsed() > self.ttl
  }
}

/// Metadata surfaced next to a cached verdict for forensics.
#[derive(Clone, Debug, serde::Serialize)]
pub struct CacheEntryMeta {
  pub age_secs: u64,
  pub ttl_secs: u64,
  pub confidence: ConfidenceLevel,
  pub version: &'static str,
}

#[derive(Clone)]
pub struct VerdictCache {
  map: std::sync::Arc<DashMap<String, CacheEntry>>,
  cfg: CacheConfig,
}

impl VerdictCache {
  pub fn new(cfg: CacheConfig) -> Self {
    Self { map: std::sync::Arc::new(DashMap::new()), cfg }
  }

  /// Returns the cached verdict for `hash` if present and unexpired.
  /// The returned clone has `cache_hit = true`.
  pub fn lookup(&self, hash: &ContentHash) -> Option<Verdict> {
    let key = hash.as_str();
    {
      let entry = self.map.get(key)?;
      if !entry.expired() {
        let mut verdict = entry.verdict.clone();
        verdict.cache_hit = true;
        return Some(verdict);
      }
    }
    self.map.remove(key);
    None
  }

  pub fn meta(&self, hash: &ContentHash) -> Option<CacheEntryMeta> {
    let entry = self.map.get(hash.as_str())?;
    if entry.expired() {
      return None;
    }
    Some(CacheEntryMeta {
      age_secs: entry.cached_at.elapsed().as_secs(),
      ttl_secs: entry.ttl.as_secs(),
      confidence: entry.confidence,
      version: entry.version,
    })
  }

  /// Stores `verdict` under `hash`, replacing any prior entry.
  pub fn store(&self, hash: &ContentHash, verdict: &Verdict) {
    let confidence = verdict.confidence_level;
    let ttl = Duration::from_secs(self.cfg.ttl_secs(confidence));
    self.map.insert(
      hash.as_str().to_string(),
      CacheEntry {
        verdict: verdict.clone(),
        cached_at: Instant::now(),
        ttl,
        confidence,
        version: env!("CARGO_PKG_VERSION"),
      },
    );
  }

  pub fn len(&self) -> usize {
    self.map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }

  pub fn sweep_expired(&self) {
    self.map.retain(|_, entry| !entry.expired());
  }

  /// Periodic cleanup loop; exits when `shutdown` fires.
  pub async fn janitor(&self, interval: Duration, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(interval.max(Duration::from_secs(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = tick.tick() => self.sweep_expired(),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifact::ArtifactClass;
  use crate::verdict::*;
  use smallvec::SmallVec;

  fn verdict(level: ConfidenceLevel) -> Verdict {
    Verdict {
      is_authentic: true,
      confidence_level: level,
      artifact_class: ArtifactClass::Image,
      content_hash_prefix: "0123456789abcdef".into(),
      performance_class: PerformanceClass::Optimal,
      correlation_id: "corr-1".into(),
      timestamp_utc: 0,
      cache_hit: false,
      degraded: false,
      details: VerdictDetails {
        local: Default::default(),
        mirror: MirrorEnvelope::Ok { networks: vec![] },
        consensus: LocalConsensus {
          votes: 1,
          positives: 1,
          positive_ratio: 1.0,
          weighted_confidence: 1.0,
          level,
          is_authentic: true,
          sources: SmallVec::new(),
        },
        superior: SuperiorEnvelope::Timeout,
      },
    }
  }

  fn hash(data: &[u8]) -> ContentHash {
    ContentHash::of_bytes(data)
  }

  #[tokio::test]
  async fn lookup_marks_cache_hit() {
    let cache = VerdictCache::new(CacheConfig::default());
    let h = hash(b"a");
    cache.store(&h, &verdict(ConfidenceLevel::High));

    let got = cache.lookup(&h).unwrap();
    assert!(got.cache_hit);
    assert!(!cache.lookup(&hash(b"b")).is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn entries_expire_by_confidence() {
    let cache = VerdictCache::new(CacheConfig {
      ttl_high_secs: 100,
      ttl_review_required_secs: 10,
      ..CacheConfig::default()
    });
    let trusted = hash(b"trusted");
    let disputed = hash(b"disputed");
    cache.store(&trusted, &verdict(ConfidenceLevel::High));
    cache.store(&disputed, &verdict(ConfidenceLevel::ReviewRequired));

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(cache.lookup(&disputed).is_none());
    assert!(cache.lookup(&trusted).is_some());

    tokio::time::advance(Duration::from_secs(100)).await;
    assert!(cache.lookup(&trusted).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn store_overwrites_and_sweep_drops_expired() {
    let cache = VerdictCache::new(CacheConfig { ttl_low_secs: 5, ..CacheConfig::default() });
    let h = hash(b"x");
    cache.store(&h, &verdict(ConfidenceLevel::Low));
    cache.store(&h, &verdict(ConfidenceLevel::Low));
    assert_eq!(cache.len(), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    cache.sweep_expired();
    assert!(cache.is_empty());
  }

  #[tokio::test]
  async fn meta_reports_entry_details() {
    let cache = VerdictCache::new(CacheConfig::default());
    let h = hash(b"m");
    cache.store(&h, &verdict(ConfidenceLevel::Medium));
    let meta = cache.meta(&h).unwrap();
    assert_eq!(meta.ttl_secs, 7_200);
    assert!(matches!(meta.confidence, ConfidenceLevel::Medium));
  }
}
