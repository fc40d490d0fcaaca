// src/kv/redis.rs

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::RedisConfig;
use crate::error::{ApiError, Result};
use crate::kv::KvGateway;

/// Reconnection backoff: min(100 * 2^(n-1), 3000) ms, at most 5 attempts
const RECONNECT_BASE_MS: u64 = 100;
const RECONNECT_CAP_MS: u64 = 3000;
const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// How often the readiness probe pings the writer
const PROBE_INTERVAL: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Redis-backed KV gateway with a writer/reader connection split.
///
/// The writer carries every mutation, atomic script and publish; the
/// reader (a replica when one is configured) carries plain reads and
/// feeds subscriptions. A background probe pings the writer and flips
/// the readiness flag; while not ready every operation fails fast with
/// `KvUnavailable` instead of queueing behind a dead socket.
pub struct RedisKv {
    writer_client: Client,
    reader_client: Client,
    writer: Arc<tokio::sync::Mutex<ConnectionManager>>,
    reader: Arc<tokio::sync::Mutex<ConnectionManager>>,
    ready: Arc<AtomicBool>,
    probe_cancel: Arc<AtomicBool>,
    config: RedisConfig,
}

// Manually implement Debug - connection managers aren't Debug
impl fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisKv")
            .field("url", &self.config.url)
            .field("replica_url", &self.config.replica_url)
            .field("ready", &self.ready.load(Ordering::SeqCst))
            .finish()
    }
}

impl Clone for RedisKv {
    fn clone(&self) -> Self {
        Self {
            writer_client: self.writer_client.clone(),
            reader_client: self.reader_client.clone(),
            writer: Arc::clone(&self.writer),
            reader: Arc::clone(&self.reader),
            ready: Arc::clone(&self.ready),
            probe_cancel: Arc::clone(&self.probe_cancel),
            config: self.config.clone(),
        }
    }
}

impl RedisKv {
    /// Connects both logical clients and waits for readiness.
    ///
    /// When no replica is configured the reader shares the writer URL.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let writer_client = Client::open(config.url.as_str())?;
        let reader_url = config.replica_url.as_deref().unwrap_or(config.url.as_str());
        let reader_client = Client::open(reader_url)?;

        let writer = Self::manager_with_deadline(&writer_client, config.ready_timeout).await?;
        let reader = Self::manager_with_deadline(&reader_client, config.ready_timeout).await?;

        let gateway = Self {
            writer_client,
            reader_client,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            reader: Arc::new(tokio::sync::Mutex::new(reader)),
            ready: Arc::new(AtomicBool::new(true)),
            probe_cancel: Arc::new(AtomicBool::new(false)),
            config,
        };

        gateway.spawn_probe();
        info!(url = %gateway.config.url, "KV gateway connected");
        Ok(gateway)
    }

    async fn manager_with_deadline(client: &Client, deadline: Duration) -> Result<ConnectionManager> {
        match time::timeout(deadline, ConnectionManager::new(client.clone())).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ApiError::KvUnavailable(format!(
                "connection to {:?} timed out after {:?}",
                client.get_connection_info().addr,
                deadline
            ))),
        }
    }

    /// Ping the writer to check health with a timeout
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.writer.lock().await;
        let pong: String = match time::timeout(PROBE_TIMEOUT, redis::cmd("PING").query_async(&mut *conn)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ApiError::KvUnavailable(format!(
                    "PING timed out after {:?}",
                    PROBE_TIMEOUT
                )))
            }
        };

        if pong == "PONG" {
            Ok(())
        } else {
            Err(ApiError::KvUnavailable(format!(
                "unexpected PING response: {}",
                pong
            )))
        }
    }

    /// Whether the gateway currently accepts operations
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Stop the readiness probe task
    pub fn stop_probe(&self) {
        self.probe_cancel.store(true, Ordering::SeqCst);
    }

    /// Re-establish both connections with exponential backoff.
    ///
    /// After the attempt budget is exhausted the gateway stays not-ready
    /// and operations keep failing until the next successful call.
    pub async fn reconnect(&self) -> Result<()> {
        for attempt in 1..=RECONNECT_MAX_ATTEMPTS {
            let delay = Duration::from_millis(
                (RECONNECT_BASE_MS * 2u64.saturating_pow(attempt - 1)).min(RECONNECT_CAP_MS),
            );
            time::sleep(delay).await;

            debug!(attempt, ?delay, "KV reconnect attempt");
            let writer =
                Self::manager_with_deadline(&self.writer_client, self.config.ready_timeout).await;
            let reader =
                Self::manager_with_deadline(&self.reader_client, self.config.ready_timeout).await;

            match (writer, reader) {
                (Ok(w), Ok(r)) => {
                    *self.writer.lock().await = w;
                    *self.reader.lock().await = r;
                    self.ready.store(true, Ordering::SeqCst);
                    info!(attempt, "KV gateway reconnected");
                    return Ok(());
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(attempt, error = %e, "KV reconnect failed");
                }
            }
        }

        Err(ApiError::KvUnavailable(format!(
            "reconnect gave up after {} attempts",
            RECONNECT_MAX_ATTEMPTS
        )))
    }

    /// Background probe that keeps the readiness flag honest.
    ///
    /// On a failed ping the flag drops immediately; a reconnect sequence
    /// then runs in the same task so only one reconnect is in flight.
    fn spawn_probe(&self) -> task::JoinHandle<()> {
        let gateway = self.clone();

        task::spawn(async move {
            let mut interval_timer = time::interval(PROBE_INTERVAL);
            interval_timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                interval_timer.tick().await;

                if gateway.probe_cancel.load(Ordering::SeqCst) {
                    break;
                }

                if gateway.ping().await.is_ok() {
                    if !gateway.ready.swap(true, Ordering::SeqCst) {
                        info!("KV store is healthy again");
                    }
                    continue;
                }

                if gateway.ready.swap(false, Ordering::SeqCst) {
                    warn!("KV store is unhealthy, starting reconnect");
                }
                if let Err(e) = gateway.reconnect().await {
                    error!(error = %e, "KV reconnect exhausted, staying degraded");
                }
            }

            debug!("KV readiness probe stopped");
        })
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ApiError::KvUnavailable("gateway not ready".to_string()))
        }
    }

    /// Apply the per-operation deadline; expiry reads as transient
    async fn with_deadline<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match time::timeout(self.config.operation_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ApiError::KvUnavailable(format!(
                "{} timed out after {:?}",
                operation, self.config.operation_timeout
            ))),
        }
    }
}

#[async_trait]
impl KvGateway for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_ready()?;
        let mut conn = self.reader.lock().await;
        self.with_deadline("GET", conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.ensure_ready()?;
        let mut conn = self.writer.lock().await;
        match ttl {
            Some(ttl) => {
                self.with_deadline("SETEX", conn.set_ex(key, value, ttl.as_secs()))
                    .await
            }
            None => self.with_deadline("SET", conn.set(key, value)).await,
        }
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.ensure_ready()?;
        let mut conn = self.writer.lock().await;
        let removed: i64 = self.with_deadline("DEL", conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64> {
        self.ensure_ready()?;
        let mut conn = self.writer.lock().await;
        self.with_deadline("INCRBY", conn.incr(key, amount)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.ensure_ready()?;
        let mut conn = self.writer.lock().await;
        self.with_deadline("EXPIRE", conn.expire(key, ttl.as_secs() as i64))
            .await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.ensure_ready()?;
        let mut conn = self.reader.lock().await;
        self.with_deadline("KEYS", conn.keys(pattern)).await
    }

    async fn eval_atomic(
        &self,
        script: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<i64>> {
        self.ensure_ready()?;
        let script = redis::Script::new(script);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }

        let mut conn = self.writer.lock().await;
        self.with_deadline("EVALSHA", invocation.invoke_async(&mut *conn))
            .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.ensure_ready()?;
        let mut conn = self.writer.lock().await;
        let _: i64 = self.with_deadline("PUBLISH", conn.publish(channel, payload)).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        // Pub/sub needs its own connection; the reader client provides it
        let mut pubsub = self.reader_client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = channel.to_string();

        task::spawn(async move {
            use futures::StreamExt;

            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).is_err() {
                    // Receiver dropped; the subscription dies with it
                    break;
                }
            }
            debug!(channel = %channel, "pub/sub subscription closed");
        });

        Ok(rx)
    }
}
