mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, TestServer, BOUND_DEVICE, PASSWORD, TOKEN};
use latch_core::backend::BackendClient;
use latch_core::realtime::channel::ChannelSettings;
use latch_core::{
    ChannelPhase, CommandDispatch, LatchConfig, LockContext, LockState, LockStateCell,
    MemorySessionStore, RealtimeChannel, SessionStore, TungsteniteConnector, UpdateSource,
};
use serde_json::json;

fn subscribe_frame(device_id: &str) -> String {
    format!(r#"{{"type":"subscribe","deviceId":"{device_id}"}}"#)
}

#[tokio::test]
async fn test_channel_follows_device_over_websocket() {
    let server = TestServer::start().await;
    server.backend.set_status("front", json!("LOCKED"));

    let mut config = LatchConfig::default();
    config.backend.base_url = server.base_url();
    let backend = Arc::new(BackendClient::new(&server.base_url(), Duration::from_secs(5)).unwrap());
    let cell = LockStateCell::new();
    let channel = RealtimeChannel::new(
        ChannelSettings::from(&config),
        Arc::new(TungsteniteConnector),
        backend,
        cell.clone(),
    );

    channel.connect("front");
    eventually("subscribe frame", || {
        server.backend.socket_frames() == vec![subscribe_frame("front")]
    })
    .await;
    assert!(channel.is_open());

    eventually("status seed", || cell.state() == LockState::Locked).await;
    assert_eq!(cell.current().source, Some(UpdateSource::Http));

    server
        .backend
        .push(json!({ "type": "status", "deviceId": "back", "status": "UNLOCKED" }));
    server
        .backend
        .push(json!({ "type": "status", "deviceId": "front", "status": "UNLOCKED" }));
    eventually("realtime push", || cell.state() == LockState::Unlocked).await;
    assert_eq!(cell.current().source, Some(UpdateSource::Realtime));

    channel.disconnect_all();
    assert_eq!(channel.phase(), ChannelPhase::Idle);
    assert_eq!(channel.device_id(), None);
}

#[tokio::test]
async fn test_channel_retries_until_server_appears() {
    // Reserve a port, then release it so the first attempts are refused.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let mut config = LatchConfig::default();
    config.backend.base_url = format!("http://{addr}/");
    config.realtime.backoff_base_ms = 20;
    config.realtime.backoff_cap_ms = 40;
    let backend = Arc::new(BackendClient::new(&config.backend.base_url, Duration::from_secs(1)).unwrap());
    let channel = RealtimeChannel::new(
        ChannelSettings::from(&config),
        Arc::new(TungsteniteConnector),
        backend,
        LockStateCell::new(),
    );

    channel.connect("front");
    eventually("a scheduled retry", || channel.reconnect_attempt() >= 2).await;
    assert!(!channel.is_open());

    channel.disconnect_all();
    assert_eq!(channel.phase(), ChannelPhase::Idle);
    assert_eq!(channel.reconnect_attempt(), 0);
}

#[tokio::test]
async fn test_context_sign_in_to_remote_lock() {
    let server = TestServer::start().await;
    let mut config = LatchConfig::default();
    config.backend.base_url = server.base_url();
    let store = Arc::new(MemorySessionStore::default());

    let context = LockContext::new(&config, None, Arc::new(TungsteniteConnector), store.clone()).unwrap();
    assert!(context.restore_session().is_none());
    assert_eq!(context.device_id(), None);

    context.sign_in("ada@example.com", PASSWORD).await.unwrap();
    assert_eq!(context.device_id().as_deref(), Some(BOUND_DEVICE));
    assert_eq!(store.get_session().unwrap().device_id(), Some(BOUND_DEVICE));

    eventually("subscribe frame", || {
        server.backend.socket_frames() == vec![subscribe_frame(BOUND_DEVICE)]
    })
    .await;
    let updates = context.subscribe_lock_updates();
    eventually("status seed", || updates.borrow().source == Some(UpdateSource::Http)).await;
    assert!(context.is_device_connected());
    assert!(!context.is_locked());

    let mut transitions = context.lock_transitions();
    let dispatch = context.lock().await;
    assert!(matches!(dispatch, CommandDispatch::Remote(_)));
    dispatch.settled().await;
    assert_eq!(
        server.backend.commands(),
        vec![(BOUND_DEVICE.to_string(), "LOCK".to_string())]
    );
    let bearer = format!("Bearer {TOKEN}");
    let lock_auth = server.backend.lock_auth();
    assert!(!lock_auth.is_empty());
    assert!(lock_auth.iter().all(|auth| auth.as_deref() == Some(bearer.as_str())));

    server
        .backend
        .push(json!({ "type": "status", "deviceId": BOUND_DEVICE, "status": "LOCKED" }));
    assert_eq!(transitions.next().await, Some(true));
    assert!(context.is_locked());

    let settings = context.fetch_settings().await.unwrap();
    assert!(!settings.notis_enabled);

    context.sign_out();
    assert!(store.get_session().is_none());
    assert!(!context.is_device_connected());
}
