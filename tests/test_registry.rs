//! Registry and reachability tests
//!
//! Tests focus on how the registry routes operations by identity and how
//! network reports fan out to every connection.

use hermes::keepalive::TokioWakeTimer;
use hermes::network::NetworkMonitor;
use hermes::power::CountingWakeLock;
use hermes::store::{MemoryMessageStore, MessageStore};
use hermes::testing::{inbound, MockEngineFactory, RecordingListener};
use hermes::types::{AckMode, ClientIdentity, ConnectOptions};
use hermes::{ConnectionRegistry, ConnectionState, HermesError};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

fn identity(client_id: &str) -> ClientIdentity {
    ClientIdentity::new("tcp://broker.test:1883", client_id, "com.example.tests")
}

fn registry() -> (Arc<ConnectionRegistry>, Arc<MockEngineFactory>) {
    let factory = Arc::new(MockEngineFactory::new());
    let registry =
        ConnectionRegistry::new(factory.clone(), Arc::new(MemoryMessageStore::new())).unwrap();
    (registry, factory)
}

#[tokio::test]
async fn test_operations_on_unknown_client_fail() {
    let (registry, _) = registry();
    let stranger = identity("stranger");

    assert!(matches!(
        registry.connect(&stranger).await,
        Err(HermesError::UnknownClient(id)) if id == stranger
    ));
    assert!(matches!(
        registry.publish(&stranger, "t", "x", Default::default(), false).await,
        Err(HermesError::UnknownClient(_))
    ));
    assert!(matches!(
        registry.close(&stranger).await,
        Err(HermesError::UnknownClient(_))
    ));
    assert!(matches!(
        registry.buffered_message_count(&stranger).await,
        Err(HermesError::UnknownClient(_))
    ));
}

#[tokio::test]
async fn test_register_is_idempotent() {
    let (registry, factory) = registry();
    let info = registry.client_info(identity("once"));

    let first = registry.register(info.clone()).await.unwrap();
    let second = registry
        .register(info.with_ack_mode(AckMode::Manual))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(factory.created(), 1);
    assert_eq!(registry.identities().await, vec![first]);
}

#[tokio::test]
async fn test_register_rejects_bad_identity() {
    let (registry, factory) = registry();

    let empty_id = registry.client_info(ClientIdentity::new("tcp://b:1883", "", "app"));
    assert!(matches!(
        registry.register(empty_id).await,
        Err(HermesError::InvalidArgument(_))
    ));

    let bad_uri = registry.client_info(ClientIdentity::new("not a uri", "c", "app"));
    assert!(matches!(
        registry.register(bad_uri).await,
        Err(HermesError::InvalidArgument(_))
    ));
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn test_same_client_id_on_two_apps_are_separate() {
    let (registry, factory) = registry();
    let a = ClientIdentity::new("tcp://broker.test:1883", "shared", "com.example.a");
    let b = ClientIdentity::new("tcp://broker.test:1883", "shared", "com.example.b");

    registry.register(registry.client_info(a.clone())).await.unwrap();
    registry.register(registry.client_info(b.clone())).await.unwrap();
    registry.connect(&a).await.unwrap();

    assert_eq!(factory.created(), 2);
    assert!(registry.is_connected(&a).await.unwrap());
    assert!(!registry.is_connected(&b).await.unwrap());
}

#[tokio::test]
async fn test_close_removes_registration_and_keeps_backlog() {
    let store = Arc::new(MemoryMessageStore::new());
    let factory = Arc::new(MockEngineFactory::new());
    let registry = ConnectionRegistry::new(factory.clone(), store.clone()).unwrap();
    let listener = Arc::new(RecordingListener::new());
    registry.add_listener(listener.clone());

    let client = registry
        .register(
            registry
                .client_info(identity("closing"))
                .with_ack_mode(AckMode::Manual),
        )
        .await
        .unwrap();
    registry.connect(&client).await.unwrap();
    factory.engine(&client).unwrap().deliver(inbound("c/1", "x", 1));
    assert!(listener.wait_for("message_arrived", 1, Duration::from_secs(2)).await);

    registry.close(&client).await.unwrap();

    assert!(!registry.is_registered(&client).await);
    assert_eq!(store.count(&client).await.unwrap(), 1);

    // A new registration starts from the stored backlog
    registry.register(registry.client_info(client.clone())).await.unwrap();
    assert_eq!(registry.backlog(&client).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_close_all_releases_every_engine() {
    let (registry, factory) = registry();
    let clients = ["a", "b", "c"];
    for name in clients {
        let client = registry.register(registry.client_info(identity(name))).await.unwrap();
        registry.connect(&client).await.unwrap();
    }

    registry.close_all().await;

    assert!(registry.identities().await.is_empty());
    for name in clients {
        assert!(factory.engine(&identity(name)).unwrap().is_closed());
    }
}

#[tokio::test]
async fn test_broadcast_failures_stay_per_connection() {
    let (registry, factory) = registry();
    let healthy = registry.register(registry.client_info(identity("healthy"))).await.unwrap();
    let broken = registry.register(registry.client_info(identity("broken"))).await.unwrap();
    registry.connect(&healthy).await.unwrap();
    registry.connect(&broken).await.unwrap();

    registry.on_network_offline().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    factory.engine(&broken).unwrap().set_fail_connect(true);
    registry.on_network_online().await;

    // The healthy session is restored from the engine's event stream
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !registry.is_connected(&healthy).await.unwrap() {
        assert!(tokio::time::Instant::now() < deadline, "healthy client never recovered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        registry.connection_state(&broken).await.unwrap(),
        ConnectionState::Idle
    );
}

#[tokio::test]
async fn test_duplicate_online_restores_session_once() {
    let factory = Arc::new(MockEngineFactory::new());
    let wake_lock = Arc::new(CountingWakeLock::new());
    let registry = ConnectionRegistry::with_host(
        factory.clone(),
        Arc::new(MemoryMessageStore::new()),
        Arc::new(TokioWakeTimer::new(Handle::current())),
        wake_lock.clone(),
    )
    .unwrap();
    let monitor = NetworkMonitor::new(registry.clone(), wake_lock.clone());

    let options = ConnectOptions {
        automatic_reconnect: true,
        ..Default::default()
    };
    let client = registry
        .register(registry.client_info(identity("flappy")).with_options(options))
        .await
        .unwrap();
    registry.connect(&client).await.unwrap();

    assert!(monitor.on_reachability_changed(false).await);
    assert!(!monitor.is_online().await);
    // The loss probe fires and is skipped while offline
    tokio::time::sleep(Duration::from_millis(200)).await;
    let engine = factory.engine(&client).unwrap();
    assert_eq!(engine.calls().reconnects, 0);

    assert!(monitor.on_reachability_changed(true).await);
    assert!(!monitor.on_reachability_changed(true).await);

    // The engine session outlived the offline report, so recovery is a new handshake
    let calls = engine.calls();
    assert_eq!(calls.connects, 2);
    assert_eq!(calls.reconnects, 0);
    assert_eq!(
        registry.connection_state(&client).await.unwrap(),
        ConnectionState::Connected
    );
    assert_eq!(wake_lock.held(), 0);
    assert!(wake_lock.acquired_total() >= 2);
}

#[tokio::test]
async fn test_offline_skips_clean_sessions() {
    let (registry, _) = registry();
    let options = ConnectOptions {
        clean_session: true,
        ..Default::default()
    };
    let client = registry
        .register(registry.client_info(identity("clean")).with_options(options))
        .await
        .unwrap();
    registry.connect(&client).await.unwrap();

    registry.on_network_offline().await;

    assert_eq!(
        registry.connection_state(&client).await.unwrap(),
        ConnectionState::Connected
    );
}
