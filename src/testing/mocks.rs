//! Mock implementations for testing
//!
//! `MockEngine` stands in for a broker session: tests drive it from the
//! outside (`deliver`, `drop_connection`) and inspect what the connection
//! asked of it through `calls()`.

use crate::dispatch::{Event, EventListener};
use crate::store::{MemoryMessageStore, MessageStore, StoreError, StoredMessage};
use crate::transport::{EngineError, EngineEvent, EngineEventSender, EngineFactory, ProtocolEngine};
use crate::types::{ClientIdentity, ConnectOptions, DeliveryToken, InboundMessage, OutboundMessage, Qos};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type PublishedMessage = (String, Bytes, Qos, bool);

/// Everything a connection asked of a `MockEngine`
#[derive(Debug, Clone, Default)]
pub struct EngineCalls {
    pub connects: usize,
    pub disconnects: usize,
    pub reconnects: usize,
    pub activity_checks: usize,
    pub closes: usize,
    pub last_quiesce: Option<Duration>,
    pub last_options: Option<ConnectOptions>,
    pub published: Vec<PublishedMessage>,
    pub subscribed: Vec<(String, Qos)>,
    pub unsubscribed: Vec<String>,
    pub acknowledged: Vec<u16>,
}

/// Scripted protocol engine
#[derive(Debug)]
pub struct MockEngine {
    identity: ClientIdentity,
    events: EngineEventSender,
    connected: AtomicBool,
    closed: AtomicBool,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    connect_delay_ms: AtomicU64,
    reconnect_delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<EngineCalls>,
}

impl MockEngine {
    pub fn new(identity: ClientIdentity, events: EngineEventSender) -> Self {
        Self {
            identity,
            events,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            connect_delay_ms: AtomicU64::new(0),
            reconnect_delay_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(EngineCalls::default()),
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn calls(&self) -> EngineCalls {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, f: impl FnOnce(&mut EngineCalls)) {
        if let Ok(mut calls) = self.calls.lock() {
            f(&mut calls);
        }
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay before an engine-driven reconnect completes its handshake
    pub fn set_reconnect_delay(&self, delay: Duration) {
        self.reconnect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Highest number of handshakes observed running at the same time
    pub fn max_concurrent_connects(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulate a broker publish on a subscribed topic
    pub fn deliver(&self, message: InboundMessage) {
        let _ = self.events.send(EngineEvent::MessageArrived(message));
    }

    /// Simulate the network dropping the session
    pub fn drop_connection(&self, cause: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(EngineEvent::ConnectionLost {
            cause: cause.to_string(),
        });
    }

    /// Simulate the broker acknowledging a QoS 1/2 publish
    pub fn confirm_delivery(&self, token: DeliveryToken) {
        let _ = self.events.send(EngineEvent::DeliveryComplete { token });
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_connected(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::NotConnected)
        }
    }

    fn complete_handshake(&self, reconnected: bool) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(EngineEvent::ConnectComplete {
            reconnected,
            server_uri: self.identity.server_uri.clone(),
        });
    }
}

#[async_trait]
impl ProtocolEngine for MockEngine {
    async fn connect(&self, options: &ConnectOptions) -> Result<(), EngineError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        self.record(|c| {
            c.connects += 1;
            c.last_options = Some(options.clone());
        });

        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.ensure_open()?;
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(EngineError::ConnectionFailedStr(
                "Mock connection refused".to_string(),
            ));
        }
        self.complete_handshake(false);
        Ok(())
    }

    async fn disconnect(&self, quiesce: Duration) -> Result<(), EngineError> {
        self.record(|c| {
            c.disconnects += 1;
            c.last_quiesce = Some(quiesce);
        });
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// QoS 0 publishes complete as soon as they are sent; QoS 1/2 wait for
    /// `confirm_delivery`
    async fn publish(&self, message: &OutboundMessage) -> Result<(), EngineError> {
        self.ensure_connected()?;
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(EngineError::PublishFailed("Mock publish failure".into()));
        }
        self.record(|c| {
            c.published.push((
                message.topic.clone(),
                message.payload.clone(),
                message.qos,
                message.retained,
            ))
        });
        if message.qos == Qos::AtMostOnce {
            let _ = self.events.send(EngineEvent::DeliveryComplete {
                token: message.token,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, filters: &[(String, Qos)]) -> Result<(), EngineError> {
        self.ensure_connected()?;
        self.record(|c| c.subscribed.extend_from_slice(filters));
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), EngineError> {
        self.ensure_connected()?;
        self.record(|c| c.unsubscribed.extend_from_slice(topics));
        Ok(())
    }

    /// While the session is still up there is nothing to retry, so the
    /// call is recorded and nothing else happens
    async fn reconnect(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.record(|c| c.reconnects += 1);
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(EngineError::NotConnected);
        }

        let delay = self.reconnect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.ensure_open()?;
        self.complete_handshake(true);
        Ok(())
    }

    async fn check_for_activity(&self) -> Result<(), EngineError> {
        self.record(|c| c.activity_checks += 1);
        self.ensure_connected()
    }

    async fn acknowledge_delivery(&self, packet_id: u16) -> Result<(), EngineError> {
        self.record(|c| c.acknowledged.push(packet_id));
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.record(|c| c.closes += 1);
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Hands out `MockEngine`s and keeps them reachable by identity
#[derive(Debug, Default)]
pub struct MockEngineFactory {
    engines: Mutex<HashMap<ClientIdentity, Arc<MockEngine>>>,
    created: AtomicUsize,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent engine built for `identity`
    pub fn engine(&self, identity: &ClientIdentity) -> Option<Arc<MockEngine>> {
        self.engines.lock().ok()?.get(identity).cloned()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(
        &self,
        identity: &ClientIdentity,
        events: EngineEventSender,
    ) -> Result<Arc<dyn ProtocolEngine>, EngineError> {
        let engine = Arc::new(MockEngine::new(identity.clone(), events));
        if let Ok(mut engines) = self.engines.lock() {
            engines.insert(identity.clone(), engine.clone());
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(engine)
    }
}

/// Listener that keeps every event it sees
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }

    /// Payloads of delivered messages, in delivery order
    pub fn messages(&self) -> Vec<StoredMessage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::MessageArrived { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    /// Poll until `name` has been seen `count` times or `timeout` elapses
    pub async fn wait_for(&self, name: &str, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count(name) >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Memory store whose writes can be made to fail
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryMessageStore,
    fail_saves: AtomicBool,
    fail_clears: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_saves() -> Self {
        let store = Self::default();
        store.set_fail_saves(true);
        store
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_clears(&self, fail: bool) {
        self.fail_clears.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageStore for FailingStore {
    async fn save(
        &self,
        client: &ClientIdentity,
        message: &InboundMessage,
    ) -> Result<StoredMessage, StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("Mock disk full".to_string()));
        }
        self.inner.save(client, message).await
    }

    async fn delete(&self, client: &ClientIdentity, message_id: &str) -> Result<bool, StoreError> {
        self.inner.delete(client, message_id).await
    }

    async fn get_all(&self, client: &ClientIdentity) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner.get_all(client).await
    }

    async fn clear(&self, client: &ClientIdentity) -> Result<usize, StoreError> {
        if self.fail_clears.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("Mock store locked".to_string()));
        }
        self.inner.clear(client).await
    }
}

/// Shorthand for a QoS 1 inbound message
pub fn inbound(topic: &str, payload: &str, packet_id: u16) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        payload: Bytes::from(payload.to_string()),
        qos: Qos::AtLeastOnce,
        retained: false,
        duplicate: false,
        packet_id: Some(packet_id),
    }
}
