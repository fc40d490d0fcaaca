// src/events/sse.rs

use axum::response::sse::{Event, Sse};
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tokio_stream::wrappers::{IntervalStream, UnboundedReceiverStream};

use crate::analytics::AnalyticsService;
use crate::events::hub::{Channel, SubscriberHub};
use crate::storage::Caller;

/// Heartbeat cadence for idle connections
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Cadence of the periodic analytics pushes
const PUSH_INTERVAL: Duration = Duration::from_secs(10);

/// What a live stream asked to watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamChannel {
    All,
    Daily,
    Top,
    Logs,
}

impl StreamChannel {
    /// Parse the `channel` query parameter; anything unknown gets the
    /// full feed
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("daily") | Some("usage:daily") => StreamChannel::Daily,
            Some("top") | Some("usage:top") => StreamChannel::Top,
            Some("logs") => StreamChannel::Logs,
            _ => StreamChannel::All,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamChannel::All => "all",
            StreamChannel::Daily => "daily",
            StreamChannel::Top => "top",
            StreamChannel::Logs => "logs",
        }
    }

    fn memberships(&self) -> HashSet<Channel> {
        match self {
            StreamChannel::All => HashSet::from([Channel::Daily, Channel::Top, Channel::Logs]),
            StreamChannel::Daily => HashSet::from([Channel::Daily]),
            StreamChannel::Top => HashSet::from([Channel::Top]),
            StreamChannel::Logs => HashSet::from([Channel::Logs]),
        }
    }

    fn wants_daily(&self) -> bool {
        matches!(self, StreamChannel::All | StreamChannel::Daily)
    }

    fn wants_top(&self) -> bool {
        matches!(self, StreamChannel::All | StreamChannel::Top)
    }
}

type EventStream = BoxStream<'static, std::result::Result<Event, Infallible>>;

/// Build the long-lived SSE response for one subscriber.
///
/// The stream owns the hub membership (released when the client goes
/// away and the stream drops) and both timers; dropping the merged
/// stream cancels everything at once.
pub fn live_stream(
    analytics: Arc<AnalyticsService>,
    hub: Arc<SubscriberHub>,
    caller: &Caller,
    channel: StreamChannel,
) -> Sse<EventStream> {
    let (handle, rx) = hub.join(&caller.id, channel.memberships());

    let connected = json!({
        "caller_id": caller.id,
        "channel": channel.as_str(),
        "timestamp": Utc::now().to_rfc3339(),
    });
    let initial: EventStream = stream::once(async move {
        Ok(Event::default().event("connected").data(connected.to_string()))
    })
    .boxed();

    // The handle rides inside the fan-out closure so membership lasts
    // exactly as long as the stream does
    let fanout: EventStream = UnboundedReceiverStream::new(rx)
        .map(move |outbound| {
            let _membership = &handle;
            Ok(Event::default().event(outbound.name).data(outbound.payload))
        })
        .boxed();

    let heartbeat: EventStream =
        IntervalStream::new(interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL))
            .map(|_| {
                Ok(Event::default().comment(format!("heartbeat {}", Utc::now().timestamp_millis())))
            })
            .boxed();

    let mut sources: Vec<EventStream> = vec![initial, fanout, heartbeat];

    if channel.wants_daily() {
        let analytics = Arc::clone(&analytics);
        sources.push(
            IntervalStream::new(interval_at(Instant::now() + PUSH_INTERVAL, PUSH_INTERVAL))
                .then(move |_| {
                    let analytics = Arc::clone(&analytics);
                    async move {
                        let payload = match analytics.daily_usage(7).await {
                            Ok(rows) => serde_json::to_string(&rows).unwrap_or_else(|_| "[]".into()),
                            Err(_) => "[]".to_string(),
                        };
                        Ok(Event::default().event("usage:daily:update").data(payload))
                    }
                })
                .boxed(),
        );
    }

    if channel.wants_top() {
        sources.push(
            IntervalStream::new(interval_at(Instant::now() + PUSH_INTERVAL, PUSH_INTERVAL))
                .then(move |_| {
                    let analytics = Arc::clone(&analytics);
                    async move {
                        let payload = match analytics.top_callers(24, 3).await {
                            Ok(rows) => serde_json::to_string(&rows).unwrap_or_else(|_| "[]".into()),
                            Err(_) => "[]".to_string(),
                        };
                        Ok(Event::default().event("usage:top:update").data(payload))
                    }
                })
                .boxed(),
        );
    }

    Sse::new(stream::select_all(sources).boxed())
}
