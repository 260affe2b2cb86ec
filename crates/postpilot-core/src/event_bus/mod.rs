//! EventBus - topic publish/subscribe over a shared broker.
//!
//! Every event is written to the channel named by its `event_type` and
//! mirrored to [`WILDCARD_CHANNEL`]. The in-process dispatcher listens on the
//! wildcard channel only and routes each envelope to the exact-topic and
//! wildcard subscribers, so nothing is delivered twice.

mod broker;
mod bus;
mod types;

pub use broker::{Broker, MemoryBroker, RedisBroker};
pub use bus::{EventBus, EventBusStats, EventCallback, SubscriptionId, DEFAULT_SUBSCRIBER_QUEUE};
pub use types::{validate_topic, Event, EventPayload, WILDCARD_CHANNEL};
