// src/analytics/service.rs

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::analytics::{daily_fingerprint, top_fingerprint, HitTracker};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::kv::KvGateway;
use crate::storage::{ActivityLog, CallerRegistry, TopCallerRow};

/// One caller-day in the daily-usage report. Rows stay per-caller; the
/// service never sums across callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyUsageEntry {
    pub caller_id: String,
    pub date: NaiveDate,
    pub count: i64,
    pub avg_elapsed: f64,
    pub errors: i64,
}

/// Read-through cache over the durable log's aggregations.
///
/// Reads try the KV cache first and fall back to the database; the
/// cache fill is fire-and-forget so a slow or dead KV store never
/// delays a response. Hit/miss telemetry flows to the tracker on every
/// lookup.
pub struct AnalyticsService {
    kv: Arc<dyn KvGateway>,
    log: Arc<dyn ActivityLog>,
    callers: Arc<dyn CallerRegistry>,
    hits: Arc<HitTracker>,
    config: CacheConfig,
}

impl std::fmt::Debug for AnalyticsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsService")
            .field("cache_version", &self.config.version)
            .finish()
    }
}

impl AnalyticsService {
    pub fn new(
        kv: Arc<dyn KvGateway>,
        log: Arc<dyn ActivityLog>,
        callers: Arc<dyn CallerRegistry>,
        hits: Arc<HitTracker>,
        config: CacheConfig,
    ) -> Self {
        Self {
            kv,
            log,
            callers,
            hits,
            config,
        }
    }

    /// Bumping CACHE_VERSION moves every entry to a fresh namespace
    fn cache_key(&self, fingerprint: &str) -> String {
        format!("cache:{}:{}", self.config.version, fingerprint)
    }

    /// Daily usage across all active callers, per-caller rows preserved,
    /// sorted by (date desc, count desc)
    pub async fn daily_usage(&self, days: u32) -> Result<Vec<DailyUsageEntry>> {
        let fingerprint = daily_fingerprint(days);

        if let Some(cached) = self.cache_read(&fingerprint).await {
            if let Ok(entries) = serde_json::from_str(&cached) {
                return Ok(entries);
            }
            warn!(%fingerprint, "undecodable cache payload, recomputing");
        }

        let entries = self.compute_daily(days).await?;
        self.cache_fill(&fingerprint, &entries, self.config.daily_ttl);
        Ok(entries)
    }

    /// Busiest callers over the trailing window; the aggregation is
    /// already global so the parameters pass straight through
    pub async fn top_callers(&self, hours: u32, limit: u32) -> Result<Vec<TopCallerRow>> {
        let fingerprint = top_fingerprint(hours, limit);

        if let Some(cached) = self.cache_read(&fingerprint).await {
            if let Ok(rows) = serde_json::from_str(&cached) {
                return Ok(rows);
            }
            warn!(%fingerprint, "undecodable cache payload, recomputing");
        }

        let rows = self.log.top_callers(limit, hours).await?;
        self.cache_fill(&fingerprint, &rows, self.config.top_ttl);
        Ok(rows)
    }

    /// Recompute daily usage and write the cache unconditionally
    pub async fn prewarm_daily(&self, days: u32) -> Result<()> {
        let entries = self.compute_daily(days).await?;
        self.cache_write(&daily_fingerprint(days), &entries, self.config.daily_ttl)
            .await;
        Ok(())
    }

    /// Recompute top callers and write the cache unconditionally
    pub async fn prewarm_top(&self, hours: u32, limit: u32) -> Result<()> {
        let rows = self.log.top_callers(limit, hours).await?;
        self.cache_write(&top_fingerprint(hours, limit), &rows, self.config.top_ttl)
            .await;
        Ok(())
    }

    async fn compute_daily(&self, days: u32) -> Result<Vec<DailyUsageEntry>> {
        let callers = self.callers.list_active().await?;

        let mut entries = Vec::new();
        for caller in callers {
            let rows = self.log.daily_usage(&caller.id, days).await?;
            entries.extend(rows.into_iter().map(|row| DailyUsageEntry {
                caller_id: caller.id.clone(),
                date: row.date,
                count: row.count,
                avg_elapsed: row.avg_elapsed,
                errors: row.errors,
            }));
        }

        entries.sort_by(|a, b| b.date.cmp(&a.date).then(b.count.cmp(&a.count)));
        Ok(entries)
    }

    /// Cache lookup with telemetry. Empty payloads count as misses so a
    /// bad fill can never pin an empty result.
    async fn cache_read(&self, fingerprint: &str) -> Option<String> {
        match self.kv.get(&self.cache_key(fingerprint)).await {
            Ok(Some(payload)) if !payload.is_empty() => {
                self.hits.record_hit(fingerprint).await;
                Some(payload)
            }
            Ok(_) => {
                self.hits.record_miss(fingerprint).await;
                None
            }
            Err(e) => {
                debug!(fingerprint, error = %e, "cache read skipped");
                self.hits.record_miss(fingerprint).await;
                None
            }
        }
    }

    /// Fire-and-forget cache fill after a read-through miss
    fn cache_fill<T: Serialize>(&self, fingerprint: &str, value: &[T], ttl: Duration) {
        if value.is_empty() {
            return;
        }
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(fingerprint, error = %e, "cache fill serialization failed");
                return;
            }
        };

        let kv = Arc::clone(&self.kv);
        let key = self.cache_key(fingerprint);
        let fingerprint = fingerprint.to_string();
        tokio::spawn(async move {
            if let Err(e) = kv.set(&key, &payload, Some(ttl)).await {
                warn!(%fingerprint, error = %e, "cache write failed");
            }
        });
    }

    /// Awaited cache write used by the pre-warm path
    async fn cache_write<T: Serialize>(&self, fingerprint: &str, value: &[T], ttl: Duration) {
        if value.is_empty() {
            // Never cache an empty aggregate
            return;
        }
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(fingerprint, error = %e, "prewarm serialization failed");
                return;
            }
        };

        if let Err(e) = self
            .kv
            .set(&self.cache_key(fingerprint), &payload, Some(ttl))
            .await
        {
            warn!(fingerprint, error = %e, "prewarm cache write failed");
        }
    }
}
