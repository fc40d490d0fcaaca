// src/limiter/mod.rs

pub mod local;

pub use local::LocalLimiter;

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::kv::KvGateway;
use crate::rate_limit_event;

/// Atomic sliding-window decision, evaluated in one round trip.
///
/// The member carries a random suffix so two requests landing in the
/// same millisecond never collide in the sorted set. Returns
/// {allowed, current, reset_ms}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local ceiling = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, 0, now - window_ms)
local current = redis.call('ZCARD', key)
if current >= ceiling then
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    local reset = now + window_ms
    if oldest[2] then
        reset = tonumber(oldest[2]) + window_ms
    end
    return {0, current, reset}
end
redis.call('ZADD', key, now, member)
redis.call('EXPIRE', key, math.floor(window_ms / 1000) + 60)
return {1, current + 1, now + window_ms}
"#;

/// Outcome of a rate-limit check
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,

    /// Ceiling applied to this caller
    pub limit: u64,

    /// Requests counted in the current window, including this one when
    /// allowed
    pub current: u64,

    /// Requests left before the ceiling
    pub remaining: u64,

    /// When the window frees a slot again
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Seconds a denied caller should wait before retrying
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.reset_at - now).num_seconds().max(0) as u64
    }
}

/// Sliding-window rate limiter keyed per caller.
///
/// The shared path is a single scripted evaluation against the KV
/// store, which makes the check-and-increment indivisible across
/// replicas. When the script cannot run the check falls through to the
/// process-local limiter; that path over-admits by at most the replica
/// count and is accepted as the availability trade.
pub struct RateLimiter {
    kv: Arc<dyn KvGateway>,
    local: Arc<LocalLimiter>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("default_ceiling", &self.config.default_ceiling)
            .field("window", &self.config.window)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvGateway>, config: RateLimitConfig) -> Self {
        let local = Arc::new(LocalLimiter::new(config.window));
        Self { kv, local, config }
    }

    /// Start the fallback limiter's eviction sweep
    pub fn start_sweep(&self) {
        self.local.start_sweep(self.config.sweep_interval);
    }

    /// Stop the eviction sweep
    pub fn stop_sweep(&self) {
        self.local.stop_sweep();
    }

    fn bucket_key(caller_id: &str) -> String {
        format!("rate_limit:{}", caller_id)
    }

    /// Check and record one request for `caller_id`.
    ///
    /// `ceiling` overrides the configured default (per-caller limits).
    /// This path fails open: a limiter that cannot reach shared state
    /// degrades to local counting rather than refusing traffic.
    pub async fn check(&self, caller_id: &str, ceiling: Option<u64>) -> RateLimitDecision {
        let limit = ceiling.unwrap_or(self.config.default_ceiling);
        let window_ms = self.config.window.as_millis() as u64;
        let now = Utc::now();
        let now_ms = now.timestamp_millis() as u64;

        let key = Self::bucket_key(caller_id);
        let member = format!("{}-{}", now_ms, rand::random::<u32>());
        let args = [
            now_ms.to_string(),
            window_ms.to_string(),
            limit.to_string(),
            member,
        ];

        let decision = match self
            .kv
            .eval_atomic(SLIDING_WINDOW_SCRIPT, &[key], &args)
            .await
        {
            Ok(values) if values.len() == 3 => {
                let allowed = values[0] == 1;
                let current = values[1].max(0) as u64;
                let reset_ms = values[2].max(0);
                RateLimitDecision {
                    allowed,
                    limit,
                    current,
                    remaining: limit.saturating_sub(current),
                    reset_at: Utc
                        .timestamp_millis_opt(reset_ms)
                        .single()
                        .unwrap_or(now + self.config.window),
                }
            }
            Ok(values) => {
                warn!(
                    caller_id,
                    len = values.len(),
                    "malformed script reply, using local fallback"
                );
                self.local_decision(caller_id, limit, now_ms, window_ms)
            }
            Err(e) => {
                warn!(caller_id, error = %e, "KV check failed, using local fallback");
                self.local_decision(caller_id, limit, now_ms, window_ms)
            }
        };

        rate_limit_event!(caller_id, decision.allowed, decision.limit, decision.current);
        decision
    }

    fn local_decision(
        &self,
        caller_id: &str,
        limit: u64,
        now_ms: u64,
        window_ms: u64,
    ) -> RateLimitDecision {
        let (allowed, current, reset_ms) = self.local.check(caller_id, now_ms, window_ms, limit);
        RateLimitDecision {
            allowed,
            limit,
            current,
            remaining: limit.saturating_sub(current),
            reset_at: Utc
                .timestamp_millis_opt(reset_ms as i64)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}
