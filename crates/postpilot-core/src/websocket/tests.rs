use super::*;
use crate::error::Error;
use crate::event_bus::{Event, EventBus, EventPayload, MemoryBroker};
use crate::pipeline::PipelineState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn manager_with(config: WebSocketConfig) -> (Arc<WebSocketManager>, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new(Arc::new(MemoryBroker::new(128))));
    (Arc::new(WebSocketManager::new(config, Arc::clone(&bus))), bus)
}

fn manager() -> Arc<WebSocketManager> {
    manager_with(WebSocketConfig::default()).0
}

fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Outbound::Message(message) = frame {
            out.push(message);
        }
    }
    out
}

fn connect_with(ws: &WebSocketManager, user: &str, subscriptions: &[&str]) -> ClientConnection {
    let mut conn = ws.connect(user).unwrap();
    if !subscriptions.is_empty() {
        let body = serde_json::json!({"type": "subscribe", "event_types": subscriptions});
        ws.handle_client_message(&conn.client_id, &body.to_string())
            .unwrap();
    }
    frames(&mut conn.outbound);
    conn
}

fn event_types(messages: &[ServerMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Event { event_type, .. } => Some(event_type.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_parse_auth() {
    assert_eq!(
        WebSocketManager::parse_auth(r#"{"type":"auth","user_id":"u1"}"#).unwrap(),
        "u1"
    );
    assert!(matches!(
        WebSocketManager::parse_auth(r#"{"type":"auth","user_id":""}"#),
        Err(Error::Validation(m)) if m == "Invalid user_id"
    ));
    assert!(matches!(
        WebSocketManager::parse_auth(r#"{"type":"ping"}"#),
        Err(Error::Validation(m)) if m == "Authentication required"
    ));
    assert!(WebSocketManager::parse_auth("not json").is_err());
}

#[tokio::test(start_paused = true)]
async fn test_auth_timeout() {
    let ws = manager();
    let result = ws.await_auth(futures::future::pending()).await;
    assert!(matches!(result, Err(Error::Timeout(_))));

    let closed = ws.await_auth(async { None }).await;
    assert!(matches!(closed, Err(Error::Cancelled(_))));

    let ok = ws
        .await_auth(async { Some(r#"{"type":"auth","user_id":"u7"}"#.to_string()) })
        .await
        .unwrap();
    assert_eq!(ok, "u7");
}

#[tokio::test]
async fn test_connect_sends_welcome() {
    let ws = manager();
    let mut conn = ws.connect("u1").unwrap();

    let welcome = frames(&mut conn.outbound);
    assert!(matches!(
        &welcome[..],
        [ServerMessage::Connected { client_id, .. }] if *client_id == conn.client_id
    ));
    assert!(ws.connected_at(&conn.client_id).is_some());
    assert!(ws.connect("  ").is_err());
}

#[tokio::test]
async fn test_subscribe_unsubscribe_and_ping() {
    let ws = manager();
    let mut conn = ws.connect("u1").unwrap();
    frames(&mut conn.outbound);

    ws.handle_client_message(
        &conn.client_id,
        r#"{"type":"subscribe","event_types":["pipeline.*","system.health_check"]}"#,
    )
    .unwrap();
    ws.handle_client_message(
        &conn.client_id,
        r#"{"type":"unsubscribe","event_types":["system.health_check"]}"#,
    )
    .unwrap();
    ws.handle_client_message(&conn.client_id, r#"{"type":"ping"}"#)
        .unwrap();
    ws.handle_client_message(&conn.client_id, "{oops").unwrap();

    let replies = frames(&mut conn.outbound);
    assert_eq!(
        replies[0],
        ServerMessage::Subscribed {
            event_types: vec!["pipeline".to_string(), "system.health_check".to_string()]
        }
    );
    assert_eq!(
        replies[1],
        ServerMessage::Unsubscribed {
            event_types: vec!["pipeline".to_string()]
        }
    );
    assert!(matches!(replies[2], ServerMessage::Pong { .. }));
    assert!(matches!(&replies[3], ServerMessage::Error { message } if message.starts_with("Invalid message format")));
    assert_eq!(ws.subscriptions(&conn.client_id).unwrap(), vec!["pipeline"]);

    assert!(matches!(
        ws.handle_client_message("missing", r#"{"type":"ping"}"#),
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delivery_iff_topic_category_or_all() {
    let ws = manager();
    let mut by_topic = connect_with(&ws, "a", &["pipeline.posted"]);
    let mut by_category = connect_with(&ws, "b", &["system"]);
    let mut by_all = connect_with(&ws, "c", &["all"]);
    let mut nothing = connect_with(&ws, "d", &[]);
    let mut other_topic = connect_with(&ws, "e", &["pipeline.failed"]);

    let posted = Event::new("pipeline.posted", serde_json::json!({"post_id": "p"}), "engine");
    let health = Event::new("system.health_check", serde_json::json!({}), "health_monitor");
    assert_eq!(ws.dispatch_event(&posted), 2);
    assert_eq!(ws.dispatch_event(&health), 2);

    assert_eq!(event_types(&frames(&mut by_topic.outbound)), vec!["pipeline.posted"]);
    assert_eq!(
        event_types(&frames(&mut by_category.outbound)),
        vec!["system.health_check"]
    );
    assert_eq!(
        event_types(&frames(&mut by_all.outbound)),
        vec!["pipeline.posted", "system.health_check"]
    );
    assert!(frames(&mut nothing.outbound).is_empty());
    assert!(frames(&mut other_topic.outbound).is_empty());
}

#[tokio::test]
async fn test_event_frame_contents() {
    let ws = manager();
    let mut conn = connect_with(&ws, "a", &["pipeline"]);
    let event = Event::new("pipeline.scheduled", serde_json::json!({"task_id": "t"}), "engine");
    ws.dispatch_event(&event);

    match frames(&mut conn.outbound).pop().unwrap() {
        ServerMessage::Event {
            category,
            event_type,
            data,
            timestamp,
            source,
        } => {
            assert_eq!(category, "pipeline");
            assert_eq!(event_type, "pipeline.scheduled");
            assert_eq!(data["task_id"], "t");
            assert_eq!(timestamp, event.timestamp);
            assert_eq!(source, "engine");
        }
        other => panic!("unexpected frame {:?}", other),
    }
}

#[tokio::test]
async fn test_targeted_sends_bypass_subscriptions() {
    let ws = manager();
    let mut alice_1 = connect_with(&ws, "alice", &[]);
    let mut alice_2 = connect_with(&ws, "alice", &[]);
    let mut bob = connect_with(&ws, "bob", &[]);

    assert_eq!(
        ws.send_pipeline_progress("t1", "alice", 40.0, "SCHEDULE", serde_json::json!({})),
        2
    );
    assert_eq!(ws.broadcast_to_all("system.notice", serde_json::json!({"msg": "hi"})), 3);

    let alice_frames = frames(&mut alice_1.outbound);
    assert_eq!(event_types(&alice_frames), vec!["pipeline.progress", "system.notice"]);
    if let ServerMessage::Event { data, source, .. } = &alice_frames[0] {
        assert_eq!(data["task_id"], "t1");
        assert_eq!(data["progress"], 40.0);
        assert_eq!(data["status"], "SCHEDULE");
        assert_eq!(source, "orchestrator");
    }
    assert_eq!(frames(&mut alice_2.outbound).len(), 2);
    assert_eq!(event_types(&frames(&mut bob.outbound)), vec!["system.notice"]);
}

#[tokio::test]
async fn test_closed_or_full_clients_are_evicted() {
    let ws = manager_with(WebSocketConfig::default().with_channel_capacity(2)).0;
    let closed = connect_with(&ws, "gone", &["all"]);
    drop(closed.outbound);
    let _full = connect_with(&ws, "slow", &["all"]);
    let mut healthy = connect_with(&ws, "ok", &["all"]);

    for i in 0..3 {
        ws.dispatch_event(&Event::new("pipeline.started", serde_json::json!({ "i": i }), "e"));
        frames(&mut healthy.outbound);
    }

    let stats = ws.get_connection_stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.connections_per_user.get("ok"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_liveness_sweep_pings_then_evicts() {
    let ws = manager_with(
        WebSocketConfig::default().with_liveness(Duration::from_secs(60), Duration::from_secs(10)),
    )
    .0;
    let mut idle = connect_with(&ws, "idle", &[]);
    let active = connect_with(&ws, "active", &[]);

    tokio::time::advance(Duration::from_secs(61)).await;
    ws.touch(&active.client_id);
    assert_eq!(ws.sweep_connections(), 0);
    assert_eq!(idle.outbound.try_recv().unwrap(), Outbound::Ping);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(ws.sweep_connections(), 1);
    assert_eq!(ws.get_connection_stats().total_connections, 1);
    assert!(ws.subscriptions(&active.client_id).is_some());
}

#[tokio::test]
async fn test_stats_and_disconnect() {
    let ws = manager();
    let a = connect_with(&ws, "alice", &[]);
    let _b = connect_with(&ws, "alice", &[]);
    let _c = connect_with(&ws, "bob", &[]);

    let stats = ws.get_connection_stats();
    assert_eq!(stats.total_connections, 3);
    assert_eq!(stats.unique_users, 2);
    assert_eq!(stats.connections_per_user["alice"], 2);
    assert!(!stats.server_running);

    assert!(ws.disconnect(&a.client_id));
    assert!(!ws.disconnect(&a.client_id));
    assert_eq!(ws.get_connection_stats().total_connections, 2);
}

#[tokio::test]
async fn test_forwards_bus_events_and_progress() {
    let (ws, bus) = manager_with(WebSocketConfig::default());
    let token = CancellationToken::new();
    bus.start_listening(token.clone()).await.unwrap();
    ws.start(token.clone());
    assert!(ws.is_running());

    let mut watcher = connect_with(&ws, "owner", &["pipeline"]);
    let mut retry_fan = connect_with(&ws, "other", &["all"]);

    bus.publish_payload(
        &EventPayload::PipelineStateChanged {
            task_id: "t1".to_string(),
            user_id: "owner".to_string(),
            from_state: PipelineState::Upload,
            to_state: PipelineState::Caption,
            timestamp: chrono::Utc::now(),
        },
        "pipeline_engine",
    )
    .await
    .unwrap();
    bus.publish("retry.task_completed", serde_json::json!({}), "retry_manager")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let received = frames(&mut watcher.outbound);
    assert_eq!(
        event_types(&received),
        vec!["pipeline.state_changed", "pipeline.progress"]
    );
    if let ServerMessage::Event { data, .. } = &received[1] {
        assert_eq!(data["progress"], 40.0);
        assert_eq!(data["status"], "CAPTION");
    }
    // retry events are not forwarded
    assert_eq!(
        event_types(&frames(&mut retry_fan.outbound)),
        vec!["pipeline.state_changed"]
    );

    token.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!ws.is_running());
    assert_eq!(ws.get_connection_stats().total_connections, 0);
}
