//! Live event fan-out to subscribed sinks
//!
//! Every sink is a bounded mpsc channel owned by one long-lived connection.
//! Publishing is serialized by a publish lock so that all sinks observe the
//! same event order; the writes to different sinks run concurrently, each
//! under its own timeout. A sink that is closed or stays full past the timeout
//! is dropped without affecting the others.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::events::LiveEvent;
use crate::infrastructure::config::LiveConfig;

/// One live connection's receiving end
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<LiveEvent>,
}

pub struct LiveBroadcaster {
    sinks: RwLock<HashMap<Uuid, mpsc::Sender<LiveEvent>>>,
    publish_lock: Mutex<()>,
    sink_timeout: Duration,
    sink_buffer: usize,
}

impl LiveBroadcaster {
    pub fn new(sink_timeout: Duration, sink_buffer: usize) -> Self {
        Self {
            sinks: RwLock::new(HashMap::new()),
            publish_lock: Mutex::new(()),
            sink_timeout,
            sink_buffer: sink_buffer.max(1),
        }
    }

    pub fn from_config(config: &LiveConfig) -> Self {
        Self::new(config.sink_timeout(), config.sink_buffer)
    }

    /// Register a sink. Its first event is always `connected`.
    pub async fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.sink_buffer);

        // The channel is empty, so this cannot fail for lack of capacity
        let _ = sender.try_send(LiveEvent::Connected {
            subscriber_id: id,
            timestamp: chrono::Utc::now(),
        });

        let count = {
            let mut sinks = self.sinks.write().await;
            sinks.insert(id, sender);
            sinks.len()
        };
        info!("Live subscriber {} connected ({} active)", id, count);

        Subscription { id, receiver }
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        if self.sinks.write().await.remove(&id).is_some() {
            debug!("Live subscriber {} removed", id);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.sinks.read().await.len()
    }

    /// Publish one event; returns the number of sinks that accepted it
    pub async fn publish(&self, event: LiveEvent) -> usize {
        let _guard = self.publish_lock.lock().await;
        self.deliver(&event).await
    }

    /// Publish a cycle's events back to back; no other publisher can interleave
    pub async fn publish_all(&self, events: Vec<LiveEvent>) {
        if events.is_empty() {
            return;
        }
        let _guard = self.publish_lock.lock().await;
        for event in &events {
            self.deliver(event).await;
        }
    }

    async fn deliver(&self, event: &LiveEvent) -> usize {
        let sinks: Vec<(Uuid, mpsc::Sender<LiveEvent>)> = self
            .sinks
            .read()
            .await
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect();
        if sinks.is_empty() {
            return 0;
        }

        let sink_timeout = self.sink_timeout;
        let writes = sinks.into_iter().map(|(id, sender)| {
            let event = event.clone();
            async move {
                match time::timeout(sink_timeout, sender.send(event)).await {
                    Ok(Ok(())) => Ok(id),
                    Ok(Err(_)) => Err((id, "closed")),
                    Err(_) => Err((id, "timed out")),
                }
            }
        });

        let mut delivered = 0;
        let mut failed = Vec::new();
        for result in join_all(writes).await {
            match result {
                Ok(_) => delivered += 1,
                Err(failure) => failed.push(failure),
            }
        }

        if !failed.is_empty() {
            let mut sinks = self.sinks.write().await;
            for (id, reason) in failed {
                warn!("Dropping live subscriber {}: sink {}", id, reason);
                sinks.remove(&id);
            }
        }

        debug!("Published {} to {} sinks", event.event_name(), delivered);
        delivered
    }

    /// Periodic `heartbeat` carrying the subscriber count, until cancelled
    pub fn spawn_heartbeat(self: Arc<Self>, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let subscribers = self.subscriber_count().await;
                        self.publish(LiveEvent::heartbeat(subscribers)).await;
                    }
                }
            }
            debug!("Heartbeat task stopped");
        })
    }
}
