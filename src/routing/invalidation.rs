//! # Route Invalidation
//!
//! Invalidation signals tell the route cache that its snapshot is stale. They arrive
//! from three places: the control plane over Redis pub/sub, the route-file watcher,
//! and the admin refresh endpoint. All of them are funnelled into one
//! [`InvalidationBus`] (a `tokio::sync::broadcast` channel) that the cache's
//! maintenance task listens on.
//!
//! ## Wire format
//! Pub/sub payloads are JSON objects such as `{"kind":"route","id":"orders"}`, or the
//! wildcard `*`. The cache always rebuilds the full snapshot, so an unparseable
//! payload is treated as the wildcard rather than ignored.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the in-process invalidation channel
const BUS_CAPACITY: usize = 64;

/// Delay before re-establishing a dropped pub/sub connection
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// What changed upstream of the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum InvalidationEvent {
    /// A route was created, updated, deleted or changed status
    Route(String),

    /// A rate-limit policy changed
    Policy(String),

    /// A consumer rate limit changed
    Consumer(String),

    /// Refresh everything
    All,
}

impl InvalidationEvent {
    /// Decode a pub/sub payload; anything unrecognised becomes [`InvalidationEvent::All`]
    pub fn parse(payload: &str) -> Self {
        let payload = payload.trim();
        if payload == "*" || payload.is_empty() {
            return Self::All;
        }
        serde_json::from_str(payload).unwrap_or(Self::All)
    }

    /// Encode for publishing
    pub fn to_payload(&self) -> String {
        match self {
            Self::All => "*".to_string(),
            other => serde_json::to_string(other).unwrap_or_else(|_| "*".to_string()),
        }
    }
}

/// In-process fan-out of invalidation events
#[derive(Debug, Clone)]
pub struct InvalidationBus {
    sender: broadcast::Sender<InvalidationEvent>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publish an event to every local subscriber
    ///
    /// Returns the number of subscribers that received it; zero is not an error.
    pub fn publish(&self, event: InvalidationEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.sender.subscribe()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards Redis pub/sub messages on `channel` into the local bus
///
/// The task reconnects forever; a dropped subscription means messages may have been
/// missed, so a wildcard event is published after every re-subscribe.
pub fn spawn_redis_listener(
    client: redis::Client,
    channel: String,
    bus: InvalidationBus,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut first_connect = true;
        loop {
            let mut pubsub = match client.get_async_connection().await {
                Ok(conn) => conn.into_pubsub(),
                Err(e) => {
                    error!(error = %e, "Failed to open Redis pub/sub connection, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            if let Err(e) = pubsub.subscribe(channel.as_str()).await {
                error!(error = %e, channel = %channel, "Failed to subscribe to route invalidations, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }

            info!(channel = %channel, "Subscribed to route invalidations");
            if !first_connect {
                bus.publish(InvalidationEvent::All);
            }
            first_connect = false;

            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Unreadable invalidation payload, refreshing everything");
                        String::new()
                    }
                };
                let event = InvalidationEvent::parse(&payload);
                debug!(?event, "Route invalidation received");
                bus.publish(event);
            }

            warn!(channel = %channel, "Route invalidation stream ended, reconnecting");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}
