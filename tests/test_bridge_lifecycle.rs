//! Whole-bridge startup, broker loss and shutdown against the mock transport


use pc2mqtt::client::{ClientEvent, CloseReason, ConnectionState};
use pc2mqtt::config::BridgeConfig;
use pc2mqtt::testing::MockTransport;
use pc2mqtt::Bridge;
use rumqttc::ConnectReturnCode;
use std::sync::Arc;
use test_helpers::{eventually, next_event, wait_for_state};

fn config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.device.id = "office".to_string();
    config.mqtt.reconnect_interval_ms = 40;
    config.handlers.uptime.interval_secs = 3600;
    config
}

#[tokio::test]
async fn test_bridge_subscribes_builtins_and_answers_uptime() {
    let transport = Arc::new(MockTransport::new());
    let bridge = Bridge::new(config(), transport.clone()).unwrap();

    let report = bridge.start().await.unwrap();
    assert!(report.is_complete());
    assert!(wait_for_state(bridge.client(), ConnectionState::Connected).await);

    assert!(
        eventually(|| {
            let subs = transport.subscriptions();
            subs.contains(&"hermes/audioServer/hassio/playBytes/#".to_string())
                && subs.contains(&"office/uptime/get".to_string())
        })
        .await
    );

    let router = bridge.router().clone();
    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while router.routes_for("uptime").await.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    transport.inject_message("office/uptime/get", "").await;
    assert!(
        eventually(|| transport
            .published()
            .iter()
            .any(|(topic, _, _)| topic == "office/uptime"))
        .await
    );

    bridge.shutdown().await.unwrap();
    assert_eq!(bridge.client().state(), ConnectionState::Shutdown);
}

#[tokio::test]
async fn test_bridge_restores_subscriptions_after_broker_loss() {
    let transport = Arc::new(MockTransport::new());
    let bridge = Bridge::new(config(), transport.clone()).unwrap();
    bridge.start().await.unwrap();
    assert!(wait_for_state(bridge.client(), ConnectionState::Connected).await);

    let router = bridge.router().clone();
    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while router.patterns().await.len() < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let mut events = bridge.client().subscribe_events();
    transport.clear_operations();
    transport.drop_connection("broker restarted").await;

    assert_eq!(
        next_event(&mut events, |e| matches!(e, ClientEvent::Closed { .. })).await,
        Some(ClientEvent::closed(CloseReason::ConnectionLost))
    );
    assert!(next_event(&mut events, |e| *e == ClientEvent::Connected).await.is_some());

    assert!(
        eventually(|| {
            let subs = transport.subscriptions();
            subs.contains(&"hermes/audioServer/hassio/playBytes/#".to_string())
                && subs.contains(&"office/uptime/get".to_string())
        })
        .await
    );
    bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bridge_starts_handlers_while_broker_refuses() {
    let transport = Arc::new(MockTransport::new());
    transport.set_connect_code(ConnectReturnCode::ServiceUnavailable);
    let bridge = Bridge::new(config(), transport.clone()).unwrap();

    let report = bridge.start().await.unwrap();
    assert_eq!(report.loaded, vec!["relay", "uptime"]);
    assert!(eventually(|| transport.connect_count() >= 2).await);
    assert!(!bridge.client().is_connected());

    transport.set_connect_code(ConnectReturnCode::Success);
    assert!(wait_for_state(bridge.client(), ConnectionState::Connected).await);
    assert!(eventually(|| transport.subscriptions().len() >= 2).await);

    bridge.shutdown().await.unwrap();
    assert!(bridge.handlers().handler_ids().await.is_empty());
}
