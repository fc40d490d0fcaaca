// src/storage/mod.rs

pub mod postgres;

pub use postgres::{PgActivityLog, PgCallerRegistry};

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use uuid::Uuid;

/// A registered API consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub name: String,
    pub email: String,
    pub is_active: bool,
    pub rate_limit: i32,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// A caller's API-key credential.
///
/// `key_hash` is the bcrypt verification hash; `key_enc` is the
/// AES-256-GCM copy kept for audit recovery. The raw key never lands
/// in storage.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: Uuid,
    pub caller_id: String,
    pub key_hash: String,
    pub key_enc: String,
    pub created_at: DateTime<Utc>,
}

/// Input for caller registration: the caller row plus its first credential
#[derive(Debug, Clone)]
pub struct NewCaller {
    pub id: String,
    pub name: String,
    pub email: String,
    pub rate_limit: i32,
    pub credential_id: Uuid,
    pub key_digest: String,
    pub key_hash: String,
    pub key_enc: String,
}

/// One API call made by a caller. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub caller_id: String,
    pub credential_id: Option<Uuid>,
    pub endpoint: String,
    pub method: String,
    pub status: i16,
    pub elapsed_ms: i32,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One calendar day of a single caller's activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyUsageRow {
    pub date: NaiveDate,
    pub count: i64,
    pub avg_elapsed: f64,
    pub errors: i64,
}

/// One caller's aggregate over a trailing window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopCallerRow {
    pub caller_id: String,
    pub count: i64,
    pub avg_elapsed: f64,
    pub errors: i64,
    pub last_access: DateTime<Utc>,
}

/// Core trait for the append-only activity log
#[async_trait]
pub trait ActivityLog: Send + Sync + Debug {
    /// Append a batch of records as a single statement
    async fn bulk_insert(&self, records: &[ActivityRecord]) -> Result<()>;

    /// Per-day aggregates for one caller over the last `days` days,
    /// newest day first; days without activity are absent
    async fn daily_usage(&self, caller_id: &str, days: u32) -> Result<Vec<DailyUsageRow>>;

    /// Busiest callers over the last `hours` hours, ordered by count
    async fn top_callers(&self, limit: u32, hours: u32) -> Result<Vec<TopCallerRow>>;

    /// Bulk delete of records past the retention threshold; returns the
    /// number of rows removed
    async fn delete_older_than(&self, days: u32) -> Result<u64>;
}

/// Core trait for caller identity and credential lookups
#[async_trait]
pub trait CallerRegistry: Send + Sync + Debug {
    /// Insert a caller and their first credential; duplicate email is a
    /// `Conflict`
    async fn create(&self, caller: NewCaller) -> Result<Caller>;

    async fn find_by_id(&self, caller_id: &str) -> Result<Option<Caller>>;

    /// Resolve an API key by its lookup digest
    async fn find_by_key_digest(&self, digest: &str) -> Result<Option<(Caller, Credential)>>;

    /// Record that the caller was just seen; best-effort
    async fn touch_last_seen(&self, caller_id: &str) -> Result<()>;

    /// Every caller with the active flag set
    async fn list_active(&self) -> Result<Vec<Caller>>;
}
