//! Real-time fan-out of bus events to WebSocket clients
//!
//! The manager owns client registration, subscription matching and liveness;
//! the socket itself lives in the HTTP server, which pumps frames between the
//! connection and [`WebSocketManager`].

mod manager;
mod protocol;

pub use manager::{ClientConnection, ConnectionStats, WebSocketConfig, WebSocketManager};
pub use protocol::{normalize_subscription, ClientMessage, Outbound, ServerMessage};

#[cfg(test)]
mod tests;
