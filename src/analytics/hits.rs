// src/analytics/hits.rs

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::kv::KvGateway;

/// Counter window: each counter expires five minutes after creation, so
/// the rates reflect recent traffic only.
const COUNTER_TTL: Duration = Duration::from_secs(300);

/// Hit/miss telemetry for one fingerprint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Per-fingerprint cache telemetry on shared counters.
///
/// Everything here is best-effort: the counters feed the pre-warmer,
/// nothing more, so failures are logged at debug and swallowed. When
/// hit tracking is disabled every operation is a no-op and
/// `needs_prewarming` is always false.
pub struct HitTracker {
    kv: Arc<dyn KvGateway>,
    enabled: bool,
    default_threshold: u64,
}

impl std::fmt::Debug for HitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HitTracker")
            .field("enabled", &self.enabled)
            .field("default_threshold", &self.default_threshold)
            .finish()
    }
}

fn hits_key(fingerprint: &str) -> String {
    format!("cache:hits:{}", fingerprint)
}

fn miss_key(fingerprint: &str) -> String {
    format!("cache:hits:{}:miss", fingerprint)
}

fn threshold_key(fingerprint: &str) -> String {
    format!("cache:threshold:{}", fingerprint)
}

impl HitTracker {
    pub fn new(kv: Arc<dyn KvGateway>, enabled: bool, default_threshold: u64) -> Self {
        Self {
            kv,
            enabled,
            default_threshold,
        }
    }

    pub async fn record_hit(&self, fingerprint: &str) {
        self.bump(&hits_key(fingerprint)).await;
    }

    pub async fn record_miss(&self, fingerprint: &str) {
        self.bump(&miss_key(fingerprint)).await;
    }

    async fn bump(&self, key: &str) {
        if !self.enabled {
            return;
        }

        match self.kv.incr_by(key, 1).await {
            // First increment created the key; give it its window
            Ok(1) => {
                if let Err(e) = self.kv.expire(key, COUNTER_TTL).await {
                    debug!(key, error = %e, "counter expire failed");
                }
            }
            Ok(_) => {}
            Err(e) => debug!(key, error = %e, "counter increment failed"),
        }
    }

    async fn read_counter(&self, key: &str) -> u64 {
        match self.kv.get(key).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                debug!(key, error = %e, "counter read failed");
                0
            }
        }
    }

    /// Current hit/miss counts for a fingerprint
    pub async fn stats(&self, fingerprint: &str) -> CacheStats {
        let hits = self.read_counter(&hits_key(fingerprint)).await;
        let misses = self.read_counter(&miss_key(fingerprint)).await;
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };

        CacheStats {
            hits,
            misses,
            hit_rate,
        }
    }

    /// A key qualifies for pre-warming when it is both busy and missing
    /// often: hit rate under 50% on more than `threshold` samples.
    pub async fn needs_prewarming(&self, fingerprint: &str) -> bool {
        if !self.enabled {
            return false;
        }

        let threshold = match self.kv.get(&threshold_key(fingerprint)).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(self.default_threshold),
            _ => self.default_threshold,
        };

        let stats = self.stats(fingerprint).await;
        stats.hit_rate < 0.5 && stats.hits + stats.misses > threshold
    }

    /// Fingerprints whose counters say they should be re-warmed
    pub async fn hot_keys(&self) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }

        let keys = match self.kv.keys("cache:hits:*").await {
            Ok(keys) => keys,
            Err(e) => {
                debug!(error = %e, "counter scan failed");
                return Vec::new();
            }
        };

        // Derive unique fingerprints from hit and miss counters alike
        let fingerprints: BTreeSet<String> = keys
            .iter()
            .filter_map(|key| key.strip_prefix("cache:hits:"))
            .map(|rest| rest.strip_suffix(":miss").unwrap_or(rest).to_string())
            .collect();

        let mut hot = Vec::new();
        for fingerprint in fingerprints {
            if self.needs_prewarming(&fingerprint).await {
                hot.push(fingerprint);
            }
        }
        hot
    }
}
