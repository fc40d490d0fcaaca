// src/kv/mod.rs

pub mod redis;

pub use redis::RedisKv;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Core trait for the shared KV store the rest of the system talks to.
///
/// Values are strings: serialized JSON for cache entries and event
/// payloads, decimal integers for counters. Mutations go to the writer
/// connection, plain reads may be served by a replica.
#[async_trait]
pub trait KvGateway: Send + Sync {
    // Retrieves a value by key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    // Stores a value, optionally with a TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    // Deletes a key
    async fn del(&self, key: &str) -> Result<bool>;

    // Atomically increments a counter, creating it at 0 first
    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64>;

    // Sets expiration time for a key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    // Lists keys matching a glob pattern
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Evaluates a script atomically on the writer.
    ///
    /// The script must return an array of integers; the rate limiter's
    /// check-and-increment is the sole producer of these scripts.
    async fn eval_atomic(&self, script: &str, keys: &[String], args: &[String])
        -> Result<Vec<i64>>;

    // Publishes a payload on a pub/sub channel
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribes on a dedicated connection; received payloads are
    /// forwarded to the returned receiver in delivery order.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>>;
}
