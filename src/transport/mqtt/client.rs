//! Impure I/O side of the rumqttc adapter
//!
//! `RumqttcEngine` owns one rumqttc client plus a supervisor task that polls
//! the event loop, translates packets into `EngineEvent`s and, once a session
//! has been established, re-polls with backoff after losses. rumqttc restores
//! the session itself when polled again after an error.

use super::connection::{configure_mqtt_options, to_rumqttc_qos, EngineState, ReconnectConfig};
use super::health_monitor::{
    HealthMonitor, ReconnectPolicy, ReconnectionDecision, SupervisorEvent,
};
use super::message_handler::{DeliveryTracker, EventRoute, MessageHandler};
use crate::transport::{
    EngineError, EngineEvent, EngineEventSender, EngineFactory, ProtocolEngine,
};
use crate::types::{ClientIdentity, ConnectOptions, OutboundMessage, Qos};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{Filter, Publish};
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// State shared between the engine handle and its supervisor task
struct SupervisorShared {
    client_label: String,
    server_uri: String,
    events: EngineEventSender,
    state_tx: watch::Sender<EngineState>,
    pending_acks: Mutex<HashMap<u16, Publish>>,
    deliveries: Mutex<DeliveryTracker>,
    disconnect_requested: AtomicBool,
    retry_now: Notify,
}

struct Supervisor {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// rumqttc-backed protocol engine
pub struct RumqttcEngine {
    identity: ClientIdentity,
    reconnect_config: ReconnectConfig,
    shared: Arc<SupervisorShared>,
    client: Mutex<Option<AsyncClient>>,
    supervisor: Mutex<Option<Supervisor>>,
    /// Held from token enqueue until rumqttc accepted the request, so the
    /// tracker FIFO matches request order
    publish_order: Mutex<()>,
    state_rx: watch::Receiver<EngineState>,
}

impl RumqttcEngine {
    pub fn new(
        identity: ClientIdentity,
        reconnect_config: ReconnectConfig,
        events: EngineEventSender,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);
        let shared = Arc::new(SupervisorShared {
            client_label: identity.key(),
            server_uri: identity.server_uri.clone(),
            events,
            state_tx,
            pending_acks: Mutex::new(HashMap::new()),
            deliveries: Mutex::new(DeliveryTracker::default()),
            disconnect_requested: AtomicBool::new(false),
            retry_now: Notify::new(),
        });

        Self {
            identity,
            reconnect_config,
            shared,
            client: Mutex::new(None),
            supervisor: Mutex::new(None),
            publish_order: Mutex::new(()),
            state_rx,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state_rx.borrow().clone()
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<EngineState>,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    EngineState::Connected => return Ok(()),
                    EngineState::Disconnected(reason) => {
                        return Err(EngineError::ConnectionFailedStr(reason.clone()));
                    }
                    EngineState::Closed => return Err(EngineError::Closed),
                    EngineState::Idle | EngineState::Connecting | EngineState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(EngineError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(EngineError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    fn transition(shared: &SupervisorShared, event: SupervisorEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let previous = shared.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&shared.client_label, &previous, &next);
        }
    }

    /// Stop the supervisor without waiting for in-flight work
    async fn stop_supervisor(&self) {
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            let _ = supervisor.shutdown_tx.send(true);
            supervisor.handle.abort();
        }
    }

    async fn with_client<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnOnce(AsyncClient) -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        let client = self
            .client
            .lock()
            .await
            .clone()
            .ok_or(EngineError::NotConnected)?;
        op(client).await
    }

    fn require_connected(&self) -> Result<(), EngineError> {
        match &*self.state_rx.borrow() {
            EngineState::Closed => Err(EngineError::Closed),
            state if HealthMonitor::can_send(state) => Ok(()),
            _ => Err(EngineError::NotConnected),
        }
    }

    /// Supervisor loop: poll until shutdown, disconnect, or an unrecoverable loss
    async fn run_supervisor(
        shared: Arc<SupervisorShared>,
        mut event_loop: EventLoop,
        mut shutdown_rx: watch::Receiver<bool>,
        reconnect_config: ReconnectConfig,
        automatic_reconnect: bool,
    ) {
        info!(client = %shared.client_label, "Starting MQTT event loop supervisor");
        let mut has_connected = false;
        let mut session_up = false;
        let mut reconnect_attempts = 0u32;

        loop {
            let loss = tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                polled = event_loop.poll() => match polled {
                    Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                        EventRoute::ConnectionAcknowledged { session_present } => {
                            Self::transition(&shared, SupervisorEvent::ConnAckReceived);
                            debug!(client = %shared.client_label, session_present, "ConnAck received");
                            let _ = shared.events.send(EngineEvent::ConnectComplete {
                                reconnected: has_connected,
                                server_uri: shared.server_uri.clone(),
                            });
                            has_connected = true;
                            session_up = true;
                            reconnect_attempts = 0;
                            None
                        }
                        EventRoute::MessageReceived(publish) => {
                            let message = MessageHandler::to_inbound_message(&publish);
                            if let Some(packet_id) = message.packet_id {
                                shared.pending_acks.lock().await.insert(packet_id, publish);
                            }
                            let _ = shared.events.send(EngineEvent::MessageArrived(message));
                            None
                        }
                        EventRoute::PublishSent { packet_id } => {
                            let sent = shared.deliveries.lock().await.on_publish_sent(packet_id);
                            if let Some(token) = sent {
                                let _ = shared.events.send(EngineEvent::DeliveryComplete { token });
                            }
                            None
                        }
                        EventRoute::DeliveryConfirmed { packet_id } => {
                            let acked = shared.deliveries.lock().await.on_acknowledged(packet_id);
                            match acked {
                                Some(token) => {
                                    let _ = shared.events.send(EngineEvent::DeliveryComplete { token });
                                }
                                None => debug!(client = %shared.client_label, packet_id, "Ack for untracked publish"),
                            }
                            None
                        }
                        EventRoute::Disconnected => Some("Broker disconnected".to_string()),
                        EventRoute::SubscriptionConfirmed { packet_id } => {
                            debug!(client = %shared.client_label, packet_id, "Subscription confirmed");
                            None
                        }
                        EventRoute::InfrastructureEvent(event) => {
                            tracing::trace!(client = %shared.client_label, "MQTT event: {}", event);
                            None
                        }
                        EventRoute::OutgoingEvent => None,
                    },
                    Err(e) => Some(e.to_string()),
                }
            };

            let Some(reason) = loss else {
                continue;
            };

            let disconnect_requested = shared.disconnect_requested.load(Ordering::SeqCst);
            if disconnect_requested {
                Self::transition(&shared, SupervisorEvent::ClientDisconnected);
                break;
            }

            Self::transition(&shared, SupervisorEvent::NetworkError(reason.clone()));
            // Unacked inbound messages are redelivered by the broker on the next session
            shared.pending_acks.lock().await.clear();
            if session_up {
                session_up = false;
                let _ = shared.events.send(EngineEvent::ConnectionLost {
                    cause: reason.clone(),
                });
            }

            let policy = ReconnectPolicy {
                shutdown_requested: *shutdown_rx.borrow(),
                disconnect_requested,
                has_connected,
                automatic_reconnect,
            };
            match HealthMonitor::should_attempt_reconnection(
                reconnect_attempts,
                &reconnect_config,
                policy,
            ) {
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    reconnect_attempts = attempt;
                    Self::transition(&shared, SupervisorEvent::ReconnectionStarted(attempt));
                    info!(
                        client = %shared.client_label,
                        attempt,
                        delay_ms,
                        "Reconnecting after session loss"
                    );
                    if !Self::interruptible_sleep(&shared, shutdown_rx.clone(), delay_ms).await {
                        break;
                    }
                }
                ReconnectionDecision::AbortInitialHandshake => {
                    debug!(client = %shared.client_label, reason = %reason, "Initial handshake failed");
                    break;
                }
                decision => {
                    info!(client = %shared.client_label, ?decision, "Supervisor stopping");
                    break;
                }
            }
        }

        info!(client = %shared.client_label, "MQTT event loop supervisor stopped");
    }

    /// Sleep for the backoff delay. Returns false if shutdown was requested.
    /// A `reconnect()` call cuts the wait short.
    async fn interruptible_sleep(
        shared: &SupervisorShared,
        mut shutdown_rx: watch::Receiver<bool>,
        delay_ms: u64,
    ) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = shared.retry_now.notified() => {
                debug!(client = %shared.client_label, "Backoff interrupted by reconnect request");
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }
}

#[async_trait]
impl ProtocolEngine for RumqttcEngine {
    async fn connect(&self, options: &ConnectOptions) -> Result<(), EngineError> {
        if matches!(self.state(), EngineState::Closed) {
            return Err(EngineError::Closed);
        }
        self.stop_supervisor().await;

        let mqtt_options = configure_mqtt_options(&self.identity, options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        *self.client.lock().await = Some(client);

        self.shared.disconnect_requested.store(false, Ordering::SeqCst);
        self.shared.pending_acks.lock().await.clear();
        // Publishes of a replaced client never complete
        self.shared.deliveries.lock().await.clear();
        Self::transition(&self.shared, SupervisorEvent::HandshakeStarted);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::run_supervisor(
            self.shared.clone(),
            event_loop,
            shutdown_rx,
            self.reconnect_config.clone(),
            options.automatic_reconnect,
        ));
        *self.supervisor.lock().await = Some(Supervisor {
            handle,
            shutdown_tx,
        });

        let timeout = HealthMonitor::calculate_connection_timeout(options.connection_timeout);
        let confirmed =
            Self::wait_for_connection_confirmation(self.state_rx.clone(), timeout).await;
        if let Err(e) = &confirmed {
            warn!(client = %self.identity, error = %e, "Handshake did not complete");
            self.stop_supervisor().await;
            Self::transition(
                &self.shared,
                SupervisorEvent::NetworkError(e.to_string()),
            );
        }
        confirmed
    }

    async fn disconnect(&self, quiesce: Duration) -> Result<(), EngineError> {
        self.shared.disconnect_requested.store(true, Ordering::SeqCst);

        let request = match self.client.lock().await.clone() {
            Some(client) if !quiesce.is_zero() => client
                .disconnect()
                .await
                .map_err(|e| EngineError::DisconnectFailed(Box::new(e))),
            _ => Ok(()),
        };

        if let Some(supervisor) = self.supervisor.lock().await.take() {
            let Supervisor {
                mut handle,
                shutdown_tx,
            } = supervisor;
            if quiesce.is_zero() {
                handle.abort();
            } else {
                match tokio::time::timeout(quiesce, &mut handle).await {
                    Ok(Ok(())) => debug!(client = %self.identity, "Supervisor shut down gracefully"),
                    Ok(Err(e)) if !e.is_cancelled() => {
                        warn!(client = %self.identity, "Supervisor ended with error: {}", e);
                    }
                    Ok(Err(_)) => {}
                    Err(_) => {
                        warn!(client = %self.identity, "Quiesce timeout elapsed, forcing disconnect");
                        let _ = shutdown_tx.send(true);
                        handle.abort();
                    }
                }
            }
        }

        Self::transition(&self.shared, SupervisorEvent::ClientDisconnected);
        self.shared.pending_acks.lock().await.clear();
        self.shared.deliveries.lock().await.clear();
        request
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), EngineError> {
        self.require_connected()?;
        let _order = self.publish_order.lock().await;
        self.shared
            .deliveries
            .lock()
            .await
            .enqueue(message.token, message.qos);

        let topic = message.topic.clone();
        let payload = message.payload.clone();
        let (qos, retained) = (to_rumqttc_qos(message.qos), message.retained);
        let result = self
            .with_client(|client| async move {
                client
                    .publish(topic, qos, retained, payload)
                    .await
                    .map_err(|e| EngineError::PublishFailed(Box::new(e)))
            })
            .await;
        if result.is_err() {
            self.shared.deliveries.lock().await.cancel(message.token);
        }
        result
    }

    async fn subscribe(&self, filters: &[(String, Qos)]) -> Result<(), EngineError> {
        self.require_connected()?;
        let filters: Vec<Filter> = filters
            .iter()
            .map(|(topic, qos)| Filter::new(topic.clone(), to_rumqttc_qos(*qos)))
            .collect();
        self.with_client(|client| async move {
            client
                .subscribe_many(filters)
                .await
                .map_err(|e| EngineError::SubscriptionFailed(Box::new(e)))
        })
        .await
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), EngineError> {
        self.require_connected()?;
        let topics = topics.to_vec();
        self.with_client(|client| async move {
            for topic in topics {
                client
                    .unsubscribe(topic)
                    .await
                    .map_err(|e| EngineError::UnsubscribeFailed(Box::new(e)))?;
            }
            Ok(())
        })
        .await
    }

    async fn reconnect(&self) -> Result<(), EngineError> {
        let supervisor = self.supervisor.lock().await;
        let alive = supervisor.as_ref().is_some_and(|s| !s.handle.is_finished());
        match self.state() {
            EngineState::Closed => Err(EngineError::Closed),
            // The socket is healthy; waking the supervisor would do nothing
            EngineState::Connected if alive => Err(EngineError::SessionActive),
            EngineState::Disconnected(_) | EngineState::Reconnecting(_) if alive => {
                self.shared.retry_now.notify_one();
                Ok(())
            }
            _ => Err(EngineError::NotConnected),
        }
    }

    async fn check_for_activity(&self) -> Result<(), EngineError> {
        // rumqttc pings on its own schedule while polled; a dead link surfaces as a poll error
        self.require_connected()?;
        let supervisor = self.supervisor.lock().await;
        match supervisor.as_ref() {
            Some(s) if !s.handle.is_finished() => Ok(()),
            _ => Err(EngineError::NotConnected),
        }
    }

    async fn acknowledge_delivery(&self, packet_id: u16) -> Result<(), EngineError> {
        let Some(publish) = self.shared.pending_acks.lock().await.remove(&packet_id) else {
            debug!(client = %self.identity, packet_id, "No pending broker ack for packet");
            return Ok(());
        };
        self.with_client(|client| async move {
            client
                .ack(&publish)
                .await
                .map_err(|e| EngineError::AckFailed(Box::new(e)))
        })
        .await
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.shared.disconnect_requested.store(true, Ordering::SeqCst);
        self.stop_supervisor().await;
        self.client.lock().await.take();
        self.shared.pending_acks.lock().await.clear();
        self.shared.deliveries.lock().await.clear();
        Self::transition(&self.shared, SupervisorEvent::Released);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        HealthMonitor::can_send(&self.state_rx.borrow())
    }
}

impl Drop for RumqttcEngine {
    fn drop(&mut self) {
        // Can't await in Drop; abort the supervisor so it doesn't outlive the handle
        if let Ok(mut supervisor) = self.supervisor.try_lock() {
            if let Some(supervisor) = supervisor.take() {
                let _ = supervisor.shutdown_tx.send(true);
                supervisor.handle.abort();
            }
        } else {
            error!(client = %self.identity, "Supervisor lock held during drop");
        }
    }
}

/// Builds a `RumqttcEngine` per client sharing one backoff configuration
#[derive(Debug, Clone, Default)]
pub struct RumqttcEngineFactory {
    reconnect_config: ReconnectConfig,
}

impl RumqttcEngineFactory {
    pub fn new(reconnect_config: ReconnectConfig) -> Self {
        Self { reconnect_config }
    }
}

impl EngineFactory for RumqttcEngineFactory {
    fn create(
        &self,
        identity: &ClientIdentity,
        events: EngineEventSender,
    ) -> Result<Arc<dyn ProtocolEngine>, EngineError> {
        // Fail fast on unusable URIs instead of at first connect
        super::connection::parse_broker_uri(&identity.server_uri)?;
        Ok(Arc::new(RumqttcEngine::new(
            identity.clone(),
            self.reconnect_config.clone(),
            events,
        )))
    }
}
