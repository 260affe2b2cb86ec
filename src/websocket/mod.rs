//! WebSocket transport
//!
//! `/ws` upgrades the connection, waits for the `auth` frame, then pumps
//! frames between the socket and the core [`WebSocketManager`]. The manager
//! owns subscriptions, fan-out and liveness; this module only moves bytes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use postpilot_core::{AppContext, ClientConnection, Error, Outbound, ServerMessage, WebSocketManager};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::middleware::auth::RequireAuth;

/// Create the WebSocket router
pub fn websocket_router() -> Router {
    Router::new().route("/ws", get(ws_handler))
}

/// WebSocket upgrade handler
async fn ws_handler(
    RequireAuth(_caller): RequireAuth,
    ws: WebSocketUpgrade,
    Extension(ctx): Extension<Arc<AppContext>>,
) -> impl IntoResponse {
    let manager = Arc::clone(&ctx.websocket);
    ws.on_upgrade(move |socket| handle_socket(socket, manager))
}

async fn handle_socket(socket: WebSocket, manager: Arc<WebSocketManager>) {
    let (mut sender, mut receiver) = socket.split();

    let connection = manager
        .await_auth(next_text(&mut receiver))
        .await
        .and_then(|user_id| manager.connect(user_id));
    let connection = match connection {
        Ok(connection) => connection,
        Err(e) => {
            debug!(error = %e, "WebSocket authentication failed");
            if let Ok(frame) = ServerMessage::error(auth_error_message(&e)).to_json() {
                let _ = sender.send(Message::Text(frame)).await;
            }
            let _ = sender.close().await;
            return;
        }
    };

    let ClientConnection {
        client_id,
        mut outbound,
        ..
    } = connection;

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let message = match frame {
                Outbound::Message(message) => match message.to_json() {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        warn!(error = %e, "Failed to encode WebSocket frame");
                        continue;
                    }
                },
                Outbound::Ping => Message::Ping(Vec::new()),
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let recv_manager = Arc::clone(&manager);
    let recv_client = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            recv_manager.touch(&recv_client);
            match message {
                Message::Text(text) => {
                    if let Err(e) = recv_manager.handle_client_message(&recv_client, &text) {
                        debug!(client_id = %recv_client, error = %e, "Dropping WebSocket client");
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    manager.disconnect(&client_id);
}

/// Resolves to the first text frame, or `None` once the socket closes.
async fn next_text(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => return Some(text),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

fn auth_error_message(err: &Error) -> String {
    match err {
        Error::Validation(message) => message.clone(),
        Error::Timeout(_) => "Authentication timeout".to_string(),
        other => other.to_string(),
    }
}
