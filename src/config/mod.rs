// src/config/mod.rs

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ApiError, Result};

/// Top-level configuration, assembled from the environment once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub ingest: IngestConfig,
    pub prewarm: PrewarmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Configuration for the KV gateway connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Primary (writer) connection URL
    pub url: String,

    /// Optional read replica; plain reads and subscriptions go here
    #[serde(default)]
    pub replica_url: Option<String>,

    /// Startup readiness deadline
    #[serde(default = "default_ready_timeout", with = "duration_serde")]
    pub ready_timeout: Duration,

    /// Per-operation deadline
    #[serde(default = "default_op_timeout", with = "duration_serde")]
    pub operation_timeout: Duration,
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_op_timeout() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,

    /// Optional read replica for aggregation queries
    #[serde(default)]
    pub read_url: Option<String>,

    #[serde(default = "default_pool_size")]
    pub max_connections: u32,

    /// Records older than this are eligible for deletion
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_pool_size() -> u32 {
    20
}

fn default_retention_days() -> u32 {
    90
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret, at least 32 bytes
    pub jwt_secret: String,

    /// 64 hex characters (32 bytes) for the AES-256-GCM key copy
    pub encryption_key: String,

    /// Lifetime of issued tokens
    #[serde(default = "default_token_ttl", with = "duration_serde")]
    pub token_ttl: Duration,
}

fn default_token_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

/// Configuration for the sliding-window rate limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Ceiling applied when the caller has no per-caller override
    #[serde(default = "default_ceiling")]
    pub default_ceiling: u64,

    /// Window duration
    #[serde(default = "default_window", with = "duration_serde")]
    pub window: Duration,

    /// How often the local fallback evicts empty entries
    #[serde(default = "default_sweep_interval", with = "duration_serde")]
    pub sweep_interval: Duration,
}

fn default_ceiling() -> u64 {
    1000
}

fn default_window() -> Duration {
    Duration::from_secs(3600)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(300)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl", with = "duration_serde")]
    pub daily_ttl: Duration,

    #[serde(default = "default_cache_ttl", with = "duration_serde")]
    pub top_ttl: Duration,

    /// Bumping the version logically invalidates every cache key
    #[serde(default = "default_cache_version")]
    pub version: String,

    #[serde(default = "default_true")]
    pub hit_tracking_enabled: bool,

    /// Minimum sample size before a key qualifies for pre-warming
    #[serde(default = "default_prewarm_threshold")]
    pub prewarm_threshold: u64,
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_cache_version() -> String {
    "v1".to_string()
}

fn default_prewarm_threshold() -> u64 {
    100
}

/// Configuration for the ingestion pipeline and its overflow buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_interval", with = "duration_serde")]
    pub batch_interval: Duration,

    /// Pending entries beyond this are dropped rather than re-queued
    #[serde(default = "default_pending_cap")]
    pub pending_cap: usize,

    #[serde(default = "default_overflow_max")]
    pub overflow_max_size: usize,

    #[serde(default = "default_overflow_age", with = "duration_serde")]
    pub overflow_max_age: Duration,

    #[serde(default = "default_cleanup_interval", with = "duration_serde")]
    pub overflow_cleanup_interval: Duration,
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_pending_cap() -> usize {
    1000
}

fn default_overflow_max() -> usize {
    10_000
}

fn default_overflow_age() -> Duration {
    Duration::from_secs(3600)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrewarmConfig {
    #[serde(default = "default_true")]
    pub on_startup: bool,

    #[serde(default = "default_true")]
    pub cron_enabled: bool,

    #[serde(default = "default_prewarm_interval", with = "duration_serde")]
    pub interval: Duration,
}

fn default_true() -> bool {
    true
}

fn default_prewarm_interval() -> Duration {
    Duration::from_secs(600)
}

impl AppConfig {
    /// Assemble configuration from the process environment.
    ///
    /// `dotenv` has already been applied by the caller; required variables
    /// missing here are startup failures.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            server: ServerConfig {
                host: env_or("HOST", default_host()),
                port: env_parse("PORT", default_port())?,
            },
            redis: RedisConfig {
                url: env_required("REDIS_URL")?,
                replica_url: env::var("REDIS_REPLICA_URL").ok().filter(|v| !v.is_empty()),
                ready_timeout: default_ready_timeout(),
                operation_timeout: default_op_timeout(),
            },
            database: DatabaseConfig {
                url: env_required("DATABASE_URL")?,
                read_url: env::var("DATABASE_READ_URL").ok().filter(|v| !v.is_empty()),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", default_pool_size())?,
                retention_days: env_parse("LOG_RETENTION_DAYS", default_retention_days())?,
            },
            auth: AuthConfig {
                jwt_secret: env_required("JWT_SECRET")?,
                encryption_key: env_required("ENCRYPTION_KEY")?,
                token_ttl: default_token_ttl(),
            },
            rate_limit: RateLimitConfig {
                default_ceiling: env_parse("DEFAULT_RATE_LIMIT", default_ceiling())?,
                window: Duration::from_secs(env_parse(
                    "RATE_LIMIT_WINDOW_SECS",
                    default_window().as_secs(),
                )?),
                sweep_interval: default_sweep_interval(),
            },
            cache: CacheConfig {
                daily_ttl: Duration::from_secs(env_parse(
                    "CACHE_TTL_DAILY_SECS",
                    default_cache_ttl().as_secs(),
                )?),
                top_ttl: Duration::from_secs(env_parse(
                    "CACHE_TTL_TOP_SECS",
                    default_cache_ttl().as_secs(),
                )?),
                version: env_or("CACHE_VERSION", default_cache_version()),
                hit_tracking_enabled: env_parse("HIT_TRACKING_ENABLED", true)?,
                prewarm_threshold: env_parse("PREWARM_THRESHOLD", default_prewarm_threshold())?,
            },
            ingest: IngestConfig {
                batch_size: env_parse("BATCH_SIZE", default_batch_size())?,
                batch_interval: Duration::from_millis(env_parse(
                    "BATCH_INTERVAL_MS",
                    default_batch_interval().as_millis() as u64,
                )?),
                pending_cap: default_pending_cap(),
                overflow_max_size: env_parse("OVERFLOW_MAX_SIZE", default_overflow_max())?,
                overflow_max_age: default_overflow_age(),
                overflow_cleanup_interval: default_cleanup_interval(),
            },
            prewarm: PrewarmConfig {
                on_startup: env_parse("PREWARM_ON_STARTUP", true)?,
                cron_enabled: env_parse("PREWARM_CRON_ENABLED", true)?,
                interval: default_prewarm_interval(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the auth layer cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.len() < 32 {
            return Err(ApiError::Config(
                "JWT_SECRET must be at least 32 bytes".to_string(),
            ));
        }
        if self.auth.encryption_key.len() != 64
            || !self
                .auth
                .encryption_key
                .chars()
                .all(|c| c.is_ascii_hexdigit())
        {
            return Err(ApiError::Config(
                "ENCRYPTION_KEY must be 64 hex characters".to_string(),
            ));
        }
        if self.ingest.batch_size == 0 {
            return Err(ApiError::Config("BATCH_SIZE must be positive".to_string()));
        }
        Ok(())
    }
}

fn env_required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| ApiError::Config(format!("{} is not set", name)))
}

fn env_or(name: &str, default: String) -> String {
    env::var(name).unwrap_or(default)
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ApiError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

// Helper module to serialize/deserialize Duration with serde
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
