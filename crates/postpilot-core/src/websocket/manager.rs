use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{normalize_subscription, ClientMessage, Outbound, ServerMessage};
use crate::error::{Error, Result};
use crate::event_bus::{Event, EventBus, EventPayload, SubscriptionId, WILDCARD_CHANNEL};
use crate::pipeline::PipelineState;

const TARGETED_SOURCE: &str = "orchestrator";
const ALL: &str = "all";

/// WebSocket fan-out configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketConfig {
    /// Time allowed for the `auth` frame
    pub auth_timeout: Duration,
    /// Idle time after which a liveness ping is sent; also the sweep period
    pub ping_interval: Duration,
    /// Grace period after the ping before the client is evicted
    pub pong_timeout: Duration,
    /// Outbound queue size per client; a full queue evicts the client
    pub channel_capacity: usize,
    /// Event bus categories forwarded to clients
    pub forward_categories: Vec<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            forward_categories: vec!["pipeline".to_string(), "system".to_string()],
        }
    }
}

impl WebSocketConfig {
    /// Set the authentication timeout
    #[must_use]
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Set ping interval and pong grace period
    #[must_use]
    pub fn with_liveness(mut self, ping_interval: Duration, pong_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.pong_timeout = pong_timeout;
        self
    }

    /// Set the per-client queue size
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Set the forwarded categories
    #[must_use]
    pub fn with_forward_categories(mut self, categories: Vec<String>) -> Self {
        self.forward_categories = categories;
        self
    }
}

struct WsClient {
    user_id: String,
    connected_at: chrono::DateTime<Utc>,
    subscriptions: BTreeSet<String>,
    sender: mpsc::Sender<Outbound>,
    last_seen: Instant,
}

/// Connection statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    /// Open connections
    pub total_connections: usize,
    /// Distinct users connected
    pub unique_users: usize,
    /// Connections per user id
    pub connections_per_user: BTreeMap<String, usize>,
    /// Whether the manager is forwarding bus events
    pub server_running: bool,
}

/// One authenticated connection as seen by the transport.
pub struct ClientConnection {
    /// Server-assigned id
    pub client_id: String,
    /// Authenticated user
    pub user_id: String,
    /// Frames to write to the socket; closed when the client is evicted
    pub outbound: mpsc::Receiver<Outbound>,
}

/// Fans bus events out to authenticated, subscribed WebSocket clients.
///
/// Transport agnostic: the HTTP layer performs the handshake with
/// [`await_auth`](Self::await_auth), registers the socket with
/// [`connect`](Self::connect), passes inbound text to
/// [`handle_client_message`](Self::handle_client_message) and writes whatever
/// arrives on the connection's outbound queue. Sends never block: a client
/// whose queue is full or closed is evicted.
pub struct WebSocketManager {
    config: WebSocketConfig,
    event_bus: Arc<EventBus>,
    clients: DashMap<String, WsClient>,
    running: AtomicBool,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl WebSocketManager {
    /// Create a manager; call [`start`](Self::start) to begin forwarding.
    #[must_use]
    pub fn new(config: WebSocketConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            config,
            event_bus,
            clients: DashMap::new(),
            running: AtomicBool::new(false),
            subscription: Mutex::new(None),
        }
    }

    /// Manager configuration
    #[must_use]
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Subscribe to the bus and spawn the forwarding and liveness loops.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("WebSocket manager already running");
            return;
        }

        let (id, mut events) = self.event_bus.subscribe_channel(WILDCARD_CHANNEL);
        *self.subscription.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);

        let manager = Arc::clone(self);
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => manager.on_bus_event(&event),
                        None => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
            manager.stop();
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.ping_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.sweep_connections();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        info!(
            categories = ?self.config.forward_categories,
            "WebSocket manager started"
        );
    }

    /// Stop forwarding and drop every connection.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            self.event_bus.unsubscribe(id);
        }
        let count = self.clients.len();
        self.clients.clear();
        info!(dropped_clients = count, "WebSocket manager stopped");
    }

    /// Whether bus events are being forwarded
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait for the first frame and validate it as an `auth` message.
    ///
    /// `first_message` resolves to the first text frame, or `None` if the
    /// socket closed. Fails with `Timeout` after `auth_timeout`.
    pub async fn await_auth<F>(&self, first_message: F) -> Result<String>
    where
        F: Future<Output = Option<String>>,
    {
        match tokio::time::timeout(self.config.auth_timeout, first_message).await {
            Err(_) => Err(Error::Timeout("authentication".to_string())),
            Ok(None) => Err(Error::Cancelled(
                "connection closed before authentication".to_string(),
            )),
            Ok(Some(text)) => Self::parse_auth(&text),
        }
    }

    /// Extract the user id from an `auth` frame.
    pub fn parse_auth(text: &str) -> Result<String> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Auth { user_id }) if !user_id.trim().is_empty() => Ok(user_id),
            Ok(ClientMessage::Auth { .. }) => Err(Error::Validation("Invalid user_id".to_string())),
            _ => Err(Error::Validation("Authentication required".to_string())),
        }
    }

    /// Register an authenticated client. The `connected` frame is already
    /// queued on the returned outbound channel.
    pub fn connect(&self, user_id: impl Into<String>) -> Result<ClientConnection> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(Error::Validation("Invalid user_id".to_string()));
        }

        let client_id = Uuid::new_v4().to_string();
        let (sender, outbound) = mpsc::channel(self.config.channel_capacity);
        let connected_at = Utc::now();
        sender
            .try_send(Outbound::Message(ServerMessage::Connected {
                client_id: client_id.clone(),
                timestamp: connected_at,
            }))
            .map_err(|e| Error::Internal(format!("failed to queue welcome frame: {}", e)))?;

        self.clients.insert(
            client_id.clone(),
            WsClient {
                user_id: user_id.clone(),
                connected_at,
                subscriptions: BTreeSet::new(),
                sender,
                last_seen: Instant::now(),
            },
        );
        info!(client_id = %client_id, user_id = %user_id, "WebSocket client connected");

        Ok(ClientConnection {
            client_id,
            user_id,
            outbound,
        })
    }

    /// Remove a client. Returns false if it was already gone.
    pub fn disconnect(&self, client_id: &str) -> bool {
        let removed = self.clients.remove(client_id).is_some();
        if removed {
            info!(client_id = %client_id, "WebSocket client disconnected");
        }
        removed
    }

    /// Record activity from a client (any frame or a transport pong).
    pub fn touch(&self, client_id: &str) {
        if let Some(mut client) = self.clients.get_mut(client_id) {
            client.last_seen = Instant::now();
        }
    }

    /// Handle a text frame from an authenticated client.
    pub fn handle_client_message(&self, client_id: &str, text: &str) -> Result<()> {
        let reply = {
            let mut client = self
                .clients
                .get_mut(client_id)
                .ok_or_else(|| Error::NotFound(format!("websocket client {}", client_id)))?;
            client.last_seen = Instant::now();

            match serde_json::from_str::<ClientMessage>(text) {
                Ok(ClientMessage::Subscribe { event_types }) => {
                    client
                        .subscriptions
                        .extend(event_types.iter().map(|e| normalize_subscription(e)));
                    debug!(client_id = %client_id, ?event_types, "Client subscribed");
                    ServerMessage::Subscribed {
                        event_types: client.subscriptions.iter().cloned().collect(),
                    }
                }
                Ok(ClientMessage::Unsubscribe { event_types }) => {
                    for entry in &event_types {
                        client.subscriptions.remove(&normalize_subscription(entry));
                    }
                    debug!(client_id = %client_id, ?event_types, "Client unsubscribed");
                    ServerMessage::Unsubscribed {
                        event_types: client.subscriptions.iter().cloned().collect(),
                    }
                }
                Ok(ClientMessage::Ping) => ServerMessage::Pong {
                    timestamp: Utc::now(),
                },
                Ok(ClientMessage::Auth { .. }) => ServerMessage::error("Already authenticated"),
                Err(e) => {
                    warn!(client_id = %client_id, error = %e, "Invalid message from client");
                    ServerMessage::error(format!("Invalid message format: {}", e))
                }
            }
        };
        self.send_to(client_id, Outbound::Message(reply));
        Ok(())
    }

    /// Subscription set of a client
    #[must_use]
    pub fn subscriptions(&self, client_id: &str) -> Option<Vec<String>> {
        self.clients
            .get(client_id)
            .map(|c| c.subscriptions.iter().cloned().collect())
    }

    fn on_bus_event(&self, event: &Event) {
        if !self
            .config
            .forward_categories
            .iter()
            .any(|c| c == event.category())
        {
            return;
        }
        self.dispatch_event(event);

        if let Ok(EventPayload::PipelineStateChanged {
            task_id,
            user_id,
            from_state,
            to_state,
            ..
        }) = event.payload()
        {
            let progress = if to_state == PipelineState::Failed {
                from_state.progress()
            } else {
                to_state.progress()
            };
            self.send_pipeline_progress(
                &task_id,
                &user_id,
                progress,
                &to_state.to_string(),
                serde_json::json!({ "from_state": from_state }),
            );
        }
    }

    /// Forward `event` to every client subscribed to its topic, its category
    /// or `all`. Returns the number of clients it was queued for.
    pub fn dispatch_event(&self, event: &Event) -> usize {
        let category = event.category();
        let message = ServerMessage::Event {
            category: category.to_string(),
            event_type: event.event_type.clone(),
            data: event.data.clone(),
            timestamp: event.timestamp,
            source: event.source.clone(),
        };
        self.deliver(
            |client| {
                client.subscriptions.contains(&event.event_type)
                    || client.subscriptions.contains(category)
                    || client.subscriptions.contains(ALL)
            },
            &message,
        )
    }

    /// Send an event to every connection of `user_id`, ignoring subscriptions.
    pub fn broadcast_to_user(&self, user_id: &str, event_type: &str, data: Value) -> usize {
        let message = Self::targeted(event_type, data);
        self.deliver(|client| client.user_id == user_id, &message)
    }

    /// Send an event to every connection, ignoring subscriptions.
    pub fn broadcast_to_all(&self, event_type: &str, data: Value) -> usize {
        let message = Self::targeted(event_type, data);
        self.deliver(|_| true, &message)
    }

    /// Push a `pipeline.progress` update to the pipeline's owner.
    pub fn send_pipeline_progress(
        &self,
        task_id: &str,
        user_id: &str,
        progress: f64,
        status: &str,
        details: Value,
    ) -> usize {
        self.broadcast_to_user(
            user_id,
            "pipeline.progress",
            serde_json::json!({
                "task_id": task_id,
                "progress": progress,
                "status": status,
                "details": details,
            }),
        )
    }

    fn targeted(event_type: &str, data: Value) -> ServerMessage {
        ServerMessage::Event {
            category: event_type
                .split('.')
                .next()
                .unwrap_or(event_type)
                .to_string(),
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
            source: TARGETED_SOURCE.to_string(),
        }
    }

    fn deliver(&self, filter: impl Fn(&WsClient) -> bool, message: &ServerMessage) -> usize {
        let mut delivered = 0;
        let mut evicted = Vec::new();
        for entry in self.clients.iter() {
            if !filter(entry.value()) {
                continue;
            }
            match entry.sender.try_send(Outbound::Message(message.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => evicted.push((entry.key().clone(), reason(&e))),
            }
        }
        self.evict(evicted);
        delivered
    }

    fn send_to(&self, client_id: &str, outbound: Outbound) {
        let failed = self
            .clients
            .get(client_id)
            .and_then(|client| client.sender.try_send(outbound).err().map(|e| reason(&e)));
        if let Some(why) = failed {
            self.evict(vec![(client_id.to_string(), why)]);
        }
    }

    fn evict(&self, clients: Vec<(String, &'static str)>) {
        for (client_id, why) in clients {
            if self.clients.remove(&client_id).is_some() {
                info!(client_id = %client_id, reason = why, "Removed WebSocket client");
            }
        }
    }

    /// Ping idle clients and evict the ones that stayed silent past the
    /// grace period. Returns the number evicted.
    pub fn sweep_connections(&self) -> usize {
        let now = Instant::now();
        let deadline = self.config.ping_interval + self.config.pong_timeout;
        let mut evicted = Vec::new();

        for entry in self.clients.iter() {
            let idle = now.saturating_duration_since(entry.last_seen);
            if idle >= deadline {
                evicted.push((entry.key().clone(), "liveness timeout"));
            } else if idle >= self.config.ping_interval {
                if let Err(e) = entry.sender.try_send(Outbound::Ping) {
                    evicted.push((entry.key().clone(), reason(&e)));
                }
            }
        }

        let count = evicted.len();
        self.evict(evicted);
        count
    }

    /// Connection counts
    #[must_use]
    pub fn get_connection_stats(&self) -> ConnectionStats {
        let mut connections_per_user = BTreeMap::new();
        for client in self.clients.iter() {
            *connections_per_user
                .entry(client.user_id.clone())
                .or_insert(0) += 1;
        }
        ConnectionStats {
            total_connections: self.clients.len(),
            unique_users: connections_per_user.len(),
            connections_per_user,
            server_running: self.is_running(),
        }
    }

    /// When a client connected
    #[must_use]
    pub fn connected_at(&self, client_id: &str) -> Option<chrono::DateTime<Utc>> {
        self.clients.get(client_id).map(|c| c.connected_at)
    }
}

fn reason<T>(err: &TrySendError<T>) -> &'static str {
    match err {
        TrySendError::Full(_) => "outbound queue full",
        TrySendError::Closed(_) => "connection closed",
    }
}
