use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::WILDCARD_CHANNEL;
use crate::error::{Error, Result};

/// Message transport underneath the [`EventBus`](super::EventBus).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a raw payload on `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open a stream of payloads arriving on the wildcard channel.
    ///
    /// The subscription is active once this returns.
    async fn listen(&self) -> Result<BoxStream<'static, String>>;

    /// Backend name for diagnostics
    fn name(&self) -> &'static str;
}

/// Redis pub/sub broker (for production)
pub struct RedisBroker {
    client: redis::Client,
}

impl RedisBroker {
    /// Create a new Redis broker
    ///
    /// # Errors
    ///
    /// Returns error if the Redis URL is invalid
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Configuration(format!("invalid redis url: {}", e)))?;
        Ok(Self { client })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Redis(format!("Redis connection failed: {}", e)))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(format!("Redis PUBLISH failed: {}", e)))?;
        debug!(channel = %channel, receivers, "Published to Redis");
        Ok(())
    }

    async fn listen(&self) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::Redis(format!("Redis pubsub connection failed: {}", e)))?;
        pubsub
            .subscribe(WILDCARD_CHANNEL)
            .await
            .map_err(|e| Error::Redis(format!("Redis SUBSCRIBE failed: {}", e)))?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(error = %e, "Dropping non-UTF-8 pubsub payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// In-process broker backed by `tokio::broadcast` (development and tests).
///
/// Slow listeners lag rather than block publishers; lagged messages are
/// dropped with a warning, which matches the at-least-once-or-less
/// semantics of Redis pub/sub.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    sender: broadcast::Sender<(String, String)>,
}

impl MemoryBroker {
    /// Create a broker buffering up to `capacity` messages per listener.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // send() returns Err if there are no listeners, which is fine
        let _ = self.sender.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn listen(&self) -> Result<BoxStream<'static, String>> {
        let rx = self.sender.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok((channel, payload)) if channel == WILDCARD_CHANNEL => {
                        return Some((payload, rx))
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memory broker listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
