// src/events/mod.rs

pub mod hub;
pub mod sse;

pub use hub::{Channel, OutboundEvent, SubscriberHandle, SubscriberHub};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task;
use tracing::{debug, warn};

use crate::error::Result;
use crate::kv::KvGateway;
use crate::storage::ActivityRecord;

/// Pub/sub channel every ingestion event is published on
pub const LOG_CHANNEL: &str = "api:log:new";

/// Wire form of one ingestion event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub caller_id: String,
    pub endpoint: String,
    pub method: String,
    pub status: i16,
    pub elapsed_ms: i32,
    pub timestamp: DateTime<Utc>,
}

impl From<&ActivityRecord> for ActivityEvent {
    fn from(record: &ActivityRecord) -> Self {
        Self {
            caller_id: record.caller_id.clone(),
            endpoint: record.endpoint.clone(),
            method: record.method.clone(),
            status: record.status,
            elapsed_ms: record.elapsed_ms,
            timestamp: record.timestamp,
        }
    }
}

/// Fans one ingestion event out to the durable pub/sub bus and to every
/// connected live subscriber.
///
/// The publish and subscribe sides meet only through the KV gateway:
/// events published here come back through the dedicated subscription
/// and are dispatched to the hub, so replicas see each other's traffic.
pub struct EventFanout {
    kv: Arc<dyn KvGateway>,
    hub: Arc<SubscriberHub>,
}

impl std::fmt::Debug for EventFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFanout")
            .field("subscribers", &self.hub.subscriber_count())
            .finish()
    }
}

impl EventFanout {
    pub fn new(kv: Arc<dyn KvGateway>, hub: Arc<SubscriberHub>) -> Self {
        Self { kv, hub }
    }

    pub fn hub(&self) -> &Arc<SubscriberHub> {
        &self.hub
    }

    /// Fire-and-forget publish of one ingestion event.
    ///
    /// Ingestion must never wait on (or fail because of) the bus, so the
    /// publish runs in its own task and failures only get logged.
    pub fn publish(&self, record: &ActivityRecord) {
        let event = ActivityEvent::from(record);
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "event serialization failed");
                return;
            }
        };

        let kv = Arc::clone(&self.kv);
        task::spawn(async move {
            if let Err(e) = kv.publish(LOG_CHANNEL, &payload).await {
                warn!(error = %e, "event publish failed");
            }
        });
    }

    /// Start consuming the log channel and dispatching to subscribers.
    ///
    /// Delivery order from the bus is preserved per subscriber: the
    /// consume loop is single-tasked and each subscriber's queue is FIFO.
    pub async fn start_consumer(self: &Arc<Self>) -> Result<task::JoinHandle<()>> {
        let mut rx = self.kv.subscribe(LOG_CHANNEL).await?;
        let fanout = Arc::clone(self);

        Ok(task::spawn(async move {
            while let Some(payload) = rx.recv().await {
                match serde_json::from_str::<ActivityEvent>(&payload) {
                    Ok(event) => fanout.hub.dispatch_log(&event),
                    Err(e) => warn!(error = %e, "undecodable event payload"),
                }
            }
            debug!("event consumer stopped");
        }))
    }
}

#[cfg(test)]
mod tests;
