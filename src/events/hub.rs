// src/events/hub.rs

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::ActivityEvent;

/// Channels a live subscriber can join explicitly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Daily,
    Top,
    Logs,
}

impl Channel {
    /// Parse the wire name used by subscribe/unsubscribe requests
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "usage:daily" => Some(Channel::Daily),
            "usage:top" => Some(Channel::Top),
            "logs" => Some(Channel::Logs),
            _ => None,
        }
    }
}

/// One event queued for delivery to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    /// SSE event name
    pub name: String,
    /// JSON payload
    pub payload: String,
}

struct Subscriber {
    caller_id: String,
    channels: HashSet<Channel>,
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

/// Membership registry for live subscribers.
///
/// Every subscriber is implicitly in `all-clients` and in their own
/// `client:<caller_id>` room; the named channels are opt-in. The inner
/// lock guards membership only; delivery goes through unbounded senders
/// so dispatch never blocks on a slow consumer.
#[derive(Default)]
pub struct SubscriberHub {
    inner: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for SubscriberHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; the handle releases every membership on drop
    pub fn join(
        self: &Arc<Self>,
        caller_id: &str,
        channels: HashSet<Channel>,
    ) -> (SubscriberHandle, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        if !self.closed.load(Ordering::SeqCst) {
            let mut inner = self.inner.lock().unwrap();
            inner.insert(
                id,
                Subscriber {
                    caller_id: caller_id.to_string(),
                    channels,
                    tx,
                },
            );
        }

        debug!(id, caller_id, "subscriber joined");
        (
            SubscriberHandle {
                id,
                hub: Arc::clone(self),
            },
            rx,
        )
    }

    fn leave(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.remove(&id).is_some() {
            debug!(id, "subscriber left");
        }
    }

    /// Join an extra channel after connect
    pub fn subscribe(&self, id: u64, channel: Channel) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(subscriber) = inner.get_mut(&id) {
            subscriber.channels.insert(channel);
        }
    }

    /// Leave a channel after connect
    pub fn unsubscribe(&self, id: u64, channel: Channel) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(subscriber) = inner.get_mut(&id) {
            subscriber.channels.remove(&channel);
        }
    }

    /// Deliver one ingestion event to the `logs` channel and to the
    /// caller's own room
    pub fn dispatch_log(&self, event: &ActivityEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(_) => return,
        };

        let inner = self.inner.lock().unwrap();
        for subscriber in inner.values() {
            let in_logs = subscriber.channels.contains(&Channel::Logs);
            let own_room = subscriber.caller_id == event.caller_id;
            if in_logs || own_room {
                // A dead receiver is cleaned up by its handle's Drop
                let _ = subscriber.tx.send(OutboundEvent {
                    name: "log:new".to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }

    /// Deliver an event to everyone joined to `channel`
    pub fn broadcast(&self, channel: Channel, name: &str, payload: &str) {
        let inner = self.inner.lock().unwrap();
        for subscriber in inner.values() {
            if subscriber.channels.contains(&channel) {
                let _ = subscriber.tx.send(OutboundEvent {
                    name: name.to_string(),
                    payload: payload.to_string(),
                });
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Disconnect everyone and refuse new joins; used during shutdown
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        inner.clear();
    }
}

/// RAII membership: dropping the handle releases the subscription
pub struct SubscriberHandle {
    id: u64,
    hub: Arc<SubscriberHub>,
}

impl SubscriberHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.hub.leave(self.id);
    }
}
