use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::Broker;
use super::types::{validate_topic, Event, EventPayload, WILDCARD_CHANNEL};
use crate::error::Result;

/// Events a subscription may have queued before new ones are dropped.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 1024;

/// Async subscriber callback.
pub type EventCallback = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    sender: mpsc::Sender<Event>,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventBusStats {
    /// Events published through this bus
    pub published: u64,
    /// Envelopes received from the broker
    pub received: u64,
    /// Envelopes that failed to decode
    pub malformed: u64,
    /// Deliveries dropped because a subscriber queue was full
    pub dropped: u64,
    /// Active subscriptions
    pub subscribers: usize,
    /// Broker backend
    pub broker: &'static str,
}

/// Topic-based event bus.
///
/// Publishing goes straight to the broker. A single listener task reads the
/// wildcard channel and hands each envelope to bounded per-subscription
/// queues, so a slow callback only delays its own subscription and every
/// subscriber sees a topic's events in broker order. A subscriber whose
/// queue is full misses events rather than stalling dispatch.
pub struct EventBus {
    broker: Arc<dyn Broker>,
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    queue_capacity: usize,
    next_id: AtomicU64,
    listener: Mutex<Option<CancellationToken>>,
    published: AtomicU64,
    received: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    /// Create a bus on top of `broker`. Call [`start_listening`](Self::start_listening)
    /// before expecting deliveries.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            subscriptions: RwLock::new(HashMap::new()),
            queue_capacity: DEFAULT_SUBSCRIBER_QUEUE,
            next_id: AtomicU64::new(1),
            listener: Mutex::new(None),
            published: AtomicU64::new(0),
            received: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Per-subscription queue size for subscriptions made after this call
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Wrap `data` in an envelope and publish it on `event_type` and on the
    /// wildcard channel.
    pub async fn publish(
        &self,
        event_type: &str,
        data: Value,
        source: &str,
    ) -> Result<Event> {
        validate_topic(event_type)?;
        let event = Event::new(event_type, data, source);
        let json = event.to_json()?;

        self.broker.publish(event_type, &json).await?;
        self.broker.publish(WILDCARD_CHANNEL, &json).await?;
        self.published.fetch_add(1, Ordering::Relaxed);

        debug!(event_type = %event_type, event_id = %event.event_id, "Event published");
        Ok(event)
    }

    /// Publish a typed payload.
    pub async fn publish_payload(&self, payload: &EventPayload, source: &str) -> Result<Event> {
        self.publish(payload.event_type(), payload.to_data()?, source)
            .await
    }

    /// Publish on `service.<service>.<event>`.
    pub async fn publish_service_event(
        &self,
        service: &str,
        event: &str,
        data: Value,
    ) -> Result<Event> {
        self.publish(&format!("service.{}.{}", service, event), data, service)
            .await
    }

    /// Publish on `system.<event>`.
    pub async fn publish_system_event(&self, event: &str, data: Value) -> Result<Event> {
        self.publish(&format!("system.{}", event), data, "system")
            .await
    }

    /// Subscribe to `topic` (or [`WILDCARD_CHANNEL`] for everything) and
    /// receive events on a channel.
    pub fn subscribe_channel(
        &self,
        topic: &str,
    ) -> (SubscriptionId, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        subs.entry(topic.to_string())
            .or_default()
            .push(Subscription { id, sender });

        debug!(topic = %topic, subscription = id.0, "Subscribed");
        (id, receiver)
    }

    /// Subscribe an async callback to `topic`.
    ///
    /// The callback runs on its own task; it never blocks dispatch to
    /// other subscribers. Must be called from within a Tokio runtime.
    pub fn subscribe(&self, topic: &str, callback: EventCallback) -> SubscriptionId {
        let (id, mut receiver) = self.subscribe_channel(topic);
        let topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                callback(event).await;
            }
            debug!(topic = %topic, "Subscription worker finished");
        });
        id
    }

    /// Remove a subscription. Returns false if it was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        subs.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Number of active subscriptions across all topics.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Whether the listener task is running.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Start the broker listener. Events published after this returns are
    /// dispatched to subscribers. The listener stops when `shutdown` fires
    /// or [`stop_listening`](Self::stop_listening) is called.
    pub async fn start_listening(self: &Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let token = shutdown.child_token();
        {
            let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = slot.as_ref() {
                if !existing.is_cancelled() {
                    debug!("Event bus listener already running");
                    return Ok(());
                }
            }
            *slot = Some(token.clone());
        }

        let mut stream = self.broker.listen().await?;
        let bus = Arc::clone(self);
        info!(broker = bus.broker.name(), "Event bus listening");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = stream.next() => match next {
                        Some(raw) => bus.dispatch(&raw),
                        None => {
                            warn!("Broker stream ended, reconnecting");
                            stream = match bus.reconnect(&token).await {
                                Some(s) => s,
                                None => break,
                            };
                        }
                    },
                    _ = token.cancelled() => break,
                }
            }
            info!("Event bus listener stopped");
        });

        Ok(())
    }

    /// Stop the broker listener.
    pub fn stop_listening(&self) {
        if let Some(token) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.published.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
            broker: self.broker.name(),
        }
    }

    async fn reconnect(
        &self,
        token: &CancellationToken,
    ) -> Option<futures::stream::BoxStream<'static, String>> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = token.cancelled() => return None,
            }
            match self.broker.listen().await {
                Ok(stream) => return Some(stream),
                Err(e) => error!(error = %e, "Failed to re-listen on broker"),
            }
        }
    }

    /// Route one raw envelope to exact-topic and wildcard subscribers.
    fn dispatch(&self, raw: &str) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let event = match Event::from_json(raw) {
            Ok(event) => event,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Dropping malformed event envelope");
                return;
            }
        };

        let subs = self
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let targets = subs
            .get(&event.event_type)
            .into_iter()
            .chain(subs.get(WILDCARD_CHANNEL))
            .flatten();

        for sub in targets {
            match sub.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription = sub.id.0,
                        event_type = %event.event_type,
                        "Subscriber queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscription = sub.id.0, "Subscriber dropped its receiver");
                }
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("broker", &self.broker.name())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
