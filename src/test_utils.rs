// src/test_utils.rs

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ApiError, Result, StorageError};
use crate::kv::KvGateway;
use crate::storage::{
    ActivityLog, ActivityRecord, Caller, CallerRegistry, Credential, DailyUsageRow, NewCaller,
    TopCallerRow,
};

/// Mock implementation of the KvGateway trait for testing.
///
/// Implements the sliding-window script natively so the rate limiter
/// can be exercised without a Redis server, and loops published
/// messages back to subscribers so fan-out tests cover the full path.
#[derive(Debug, Default)]
pub struct MockKv {
    data: Arc<Mutex<HashMap<String, (String, Option<Instant>)>>>,
    buckets: Arc<Mutex<HashMap<String, Vec<u64>>>>,
    published: Arc<Mutex<Vec<(String, String)>>>,
    subscribers: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>>,
    unavailable: AtomicBool,
}

impl MockKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with KvUnavailable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ApiError::KvUnavailable("mock outage".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_expiry(&self, key: &str) -> bool {
        let mut data = self.data.lock().unwrap();
        if let Some((_, Some(expiry))) = data.get(key) {
            if *expiry <= Instant::now() {
                data.remove(key);
                return false;
            }
        }
        data.contains_key(key)
    }

    /// Everything published through this mock, oldest first
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    /// Push a payload to subscribers without going through publish
    pub fn emit(&self, channel: &str, payload: &str) {
        let subscribers = self.subscribers.lock().unwrap();
        if let Some(senders) = subscribers.get(channel) {
            for sender in senders {
                let _ = sender.send(payload.to_string());
            }
        }
    }
}

#[async_trait]
impl KvGateway for MockKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        if !self.check_expiry(key) {
            return Ok(None);
        }
        let data = self.data.lock().unwrap();
        Ok(data.get(key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;
        let expiry = ttl.map(|ttl| Instant::now() + ttl);
        let mut data = self.data.lock().unwrap();
        data.insert(key.to_string(), (value.to_string(), expiry));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let mut data = self.data.lock().unwrap();
        Ok(data.remove(key).is_some())
    }

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64> {
        self.check_available()?;
        if !self.check_expiry(key) {
            let mut data = self.data.lock().unwrap();
            data.insert(key.to_string(), (amount.to_string(), None));
            return Ok(amount);
        }

        let mut data = self.data.lock().unwrap();
        let (value, expiry) = data
            .get(key)
            .map(|(value, expiry)| (value.clone(), *expiry))
            .unwrap_or(("0".to_string(), None));
        let next = value.parse::<i64>().unwrap_or(0) + amount;
        data.insert(key.to_string(), (next.to_string(), expiry));
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let mut data = self.data.lock().unwrap();
        if let Some(entry) = data.get_mut(key) {
            entry.1 = Some(Instant::now() + ttl);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let prefix = pattern.trim_end_matches('*');
        let data = self.data.lock().unwrap();
        Ok(data
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn eval_atomic(
        &self,
        _script: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<i64>> {
        self.check_available()?;

        // Native rendition of the sliding-window script: trim, count,
        // admit-or-deny, reporting {allowed, current, reset_ms}
        let key = keys
            .first()
            .ok_or_else(|| ApiError::Internal("script needs a key".to_string()))?;
        let now: u64 = args[0].parse().unwrap_or(0);
        let window_ms: u64 = args[1].parse().unwrap_or(0);
        let ceiling: u64 = args[2].parse().unwrap_or(0);

        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key.clone()).or_default();
        let cutoff = now.saturating_sub(window_ms);
        bucket.retain(|&score| score > cutoff);

        if bucket.len() as u64 >= ceiling {
            let oldest = bucket.first().copied().unwrap_or(now);
            return Ok(vec![0, bucket.len() as i64, (oldest + window_ms) as i64]);
        }

        bucket.push(now);
        Ok(vec![1, bucket.len() as i64, (now + window_ms) as i64])
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.check_available()?;
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.to_string()));
        // Loop back to subscribers, like a real broker would
        self.emit(channel, payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

/// How the mock activity log should fail its next calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    None,
    Transient,
    Fatal,
}

/// Mock implementation of the ActivityLog trait.
///
/// Stores records in memory and computes the real aggregations over
/// them, so analytics tests exercise actual grouping and ordering.
#[derive(Debug)]
pub struct MockActivityLog {
    records: Arc<Mutex<Vec<ActivityRecord>>>,
    failure: Arc<Mutex<(FailureMode, usize)>>,
    insert_calls: Arc<Mutex<usize>>,
}

impl Default for MockActivityLog {
    fn default() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            failure: Arc::new(Mutex::new((FailureMode::None, 0))),
            insert_calls: Arc::new(Mutex::new(0)),
        }
    }
}

impl MockActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` storage calls with the given mode
    pub fn fail_next(&self, mode: FailureMode, count: usize) {
        *self.failure.lock().unwrap() = (mode, count);
    }

    fn take_failure(&self) -> Result<()> {
        let mut failure = self.failure.lock().unwrap();
        if failure.1 == 0 {
            return Ok(());
        }
        failure.1 -= 1;
        match failure.0 {
            FailureMode::None => Ok(()),
            FailureMode::Transient => Err(ApiError::Storage(StorageError::Transient(
                "connection refused".to_string(),
            ))),
            FailureMode::Fatal => Err(ApiError::Storage(StorageError::Fatal(
                "constraint violated".to_string(),
            ))),
        }
    }

    pub fn stored(&self) -> Vec<ActivityRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn stored_len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// How many bulk_insert calls were attempted (including failed ones)
    pub fn insert_calls(&self) -> usize {
        *self.insert_calls.lock().unwrap()
    }
}

#[async_trait]
impl ActivityLog for MockActivityLog {
    async fn bulk_insert(&self, records: &[ActivityRecord]) -> Result<()> {
        *self.insert_calls.lock().unwrap() += 1;
        self.take_failure()?;
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(())
    }

    async fn daily_usage(&self, caller_id: &str, days: u32) -> Result<Vec<DailyUsageRow>> {
        self.take_failure()?;
        let since = Utc::now() - ChronoDuration::days(days as i64);

        let records = self.records.lock().unwrap();
        let mut by_day: HashMap<chrono::NaiveDate, (i64, i64, i64)> = HashMap::new();
        for record in records
            .iter()
            .filter(|r| r.caller_id == caller_id && r.timestamp >= since)
        {
            let entry = by_day.entry(record.timestamp.date_naive()).or_default();
            entry.0 += 1;
            entry.1 += record.elapsed_ms as i64;
            if record.status >= 400 {
                entry.2 += 1;
            }
        }

        let mut rows: Vec<DailyUsageRow> = by_day
            .into_iter()
            .map(|(date, (count, elapsed_total, errors))| DailyUsageRow {
                date,
                count,
                avg_elapsed: elapsed_total as f64 / count as f64,
                errors,
            })
            .collect();
        rows.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(rows)
    }

    async fn top_callers(&self, limit: u32, hours: u32) -> Result<Vec<TopCallerRow>> {
        self.take_failure()?;
        let since = Utc::now() - ChronoDuration::hours(hours as i64);

        let records = self.records.lock().unwrap();
        let mut by_caller: HashMap<String, (i64, i64, i64, chrono::DateTime<Utc>)> = HashMap::new();
        for record in records.iter().filter(|r| r.timestamp >= since) {
            let entry = by_caller
                .entry(record.caller_id.clone())
                .or_insert((0, 0, 0, record.timestamp));
            entry.0 += 1;
            entry.1 += record.elapsed_ms as i64;
            if record.status >= 400 {
                entry.2 += 1;
            }
            if record.timestamp > entry.3 {
                entry.3 = record.timestamp;
            }
        }

        let mut rows: Vec<TopCallerRow> = by_caller
            .into_iter()
            .map(|(caller_id, (count, elapsed_total, errors, last_access))| TopCallerRow {
                caller_id,
                count,
                avg_elapsed: elapsed_total as f64 / count as f64,
                errors,
                last_access,
            })
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn delete_older_than(&self, days: u32) -> Result<u64> {
        self.take_failure()?;
        let cutoff = Utc::now() - ChronoDuration::days(days as i64);
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|record| record.timestamp >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

/// Mock implementation of the CallerRegistry trait
#[derive(Debug, Default)]
pub struct MockCallerRegistry {
    callers: Arc<Mutex<HashMap<String, Caller>>>,
    credentials: Arc<Mutex<HashMap<String, Credential>>>,
}

impl MockCallerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a caller directly, bypassing registration
    pub fn insert_caller(&self, caller: Caller) {
        self.callers
            .lock()
            .unwrap()
            .insert(caller.id.clone(), caller);
    }

    /// Seed a credential under its lookup digest
    pub fn insert_credential(&self, digest: &str, credential: Credential) {
        self.credentials
            .lock()
            .unwrap()
            .insert(digest.to_string(), credential);
    }
}

#[async_trait]
impl CallerRegistry for MockCallerRegistry {
    async fn create(&self, new_caller: NewCaller) -> Result<Caller> {
        let mut callers = self.callers.lock().unwrap();
        if callers.values().any(|c| c.email == new_caller.email) {
            return Err(ApiError::Conflict("email already registered".to_string()));
        }

        let caller = Caller {
            id: new_caller.id.clone(),
            name: new_caller.name,
            email: new_caller.email,
            is_active: true,
            rate_limit: new_caller.rate_limit,
            created_at: Utc::now(),
            last_seen_at: None,
        };
        callers.insert(caller.id.clone(), caller.clone());

        self.credentials.lock().unwrap().insert(
            new_caller.key_digest,
            Credential {
                id: new_caller.credential_id,
                caller_id: new_caller.id,
                key_hash: new_caller.key_hash,
                key_enc: new_caller.key_enc,
                created_at: Utc::now(),
            },
        );

        Ok(caller)
    }

    async fn find_by_id(&self, caller_id: &str) -> Result<Option<Caller>> {
        Ok(self.callers.lock().unwrap().get(caller_id).cloned())
    }

    async fn find_by_key_digest(&self, digest: &str) -> Result<Option<(Caller, Credential)>> {
        let credentials = self.credentials.lock().unwrap();
        let Some(credential) = credentials.get(digest).cloned() else {
            return Ok(None);
        };
        let callers = self.callers.lock().unwrap();
        Ok(callers
            .get(&credential.caller_id)
            .cloned()
            .map(|caller| (caller, credential)))
    }

    async fn touch_last_seen(&self, caller_id: &str) -> Result<()> {
        if let Some(caller) = self.callers.lock().unwrap().get_mut(caller_id) {
            caller.last_seen_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Caller>> {
        let mut active: Vec<Caller> = self
            .callers
            .lock()
            .unwrap()
            .values()
            .filter(|caller| caller.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }
}

/// Build an activity record with sensible defaults for tests
pub fn test_record(caller_id: &str, status: i16) -> ActivityRecord {
    ActivityRecord {
        caller_id: caller_id.to_string(),
        credential_id: Some(Uuid::new_v4()),
        endpoint: "/v1/things".to_string(),
        method: "GET".to_string(),
        status,
        elapsed_ms: 12,
        ip: Some("10.0.0.1".to_string()),
        user_agent: Some("test-agent".to_string()),
        timestamp: Utc::now(),
    }
}

/// Build an active caller row for tests
pub fn test_caller(id: &str, rate_limit: i32) -> Caller {
    Caller {
        id: id.to_string(),
        name: format!("caller {}", id),
        email: format!("{}@example.com", id.to_lowercase()),
        is_active: true,
        rate_limit,
        created_at: Utc::now(),
        last_seen_at: None,
    }
}
