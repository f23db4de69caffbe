//! One broker connection and its lifecycle
//!
//! A `Connection` owns the protocol engine for one `ClientIdentity`, its
//! offline publish buffer and its subscription set. Application requests
//! arrive as method calls; engine callbacks arrive as `EngineEvent`s on a
//! channel drained by a task that holds the connection weakly, so closing a
//! connection also ends its event task.
//!
//! Every inbound message is written to the `MessageStore` before the broker
//! is acknowledged and before any listener sees it.

pub mod buffer;
pub mod state;
pub mod subscriptions;

pub use buffer::OfflineBuffer;
pub use state::{next_state, ConnectionState, StateCell, Transition};
pub use subscriptions::SubscriptionSet;

use crate::dispatch::{Event, EventDispatcher};
use crate::error::{HermesError, HermesResult};
use crate::keepalive::{KeepAliveScheduler, KeepAliveTarget, WakeTimer, IMMEDIATE_RETRY_DELAY};
use crate::network::NetworkStatus;
use crate::power::WakeLock;
use crate::store::MessageStore;
use crate::transport::{
    engine_event_channel, EngineEvent, EngineEventReceiver, EngineFactory, ProtocolEngine,
};
use crate::types::{
    AckMode, BufferOptions, ClientIdentity, ClientInfo, DeliveryToken, InboundMessage,
    OutboundMessage, Qos,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument, Span};

/// How long an engine-driven reconnect may run when no connection timeout is set
const DEFAULT_RECONNECT_WINDOW: Duration = Duration::from_secs(30);

/// Shared collaborators handed to every connection by the registry
#[derive(Clone)]
pub struct ConnectionContext {
    pub engine_factory: Arc<dyn EngineFactory>,
    pub dispatcher: EventDispatcher,
    pub timer: Arc<dyn WakeTimer>,
    pub wake_lock: Arc<dyn WakeLock>,
    pub network: Arc<NetworkStatus>,
    pub runtime: Handle,
}

pub struct Connection {
    info: ClientInfo,
    engine: Arc<dyn ProtocolEngine>,
    state: StateCell,
    /// Bumped by every connect, disconnect and close; a handshake whose
    /// epoch is stale when it completes must not touch state
    epoch: AtomicU64,
    has_connected: AtomicBool,
    user_disconnected: AtomicBool,
    /// The offline buffer only accepts publishes once a session has existed
    buffer_armed: AtomicBool,
    buffer: Mutex<OfflineBuffer>,
    subscriptions: Mutex<SubscriptionSet>,
    /// Message ids delivered during the current session
    session_ledger: Mutex<HashSet<String>>,
    next_token: AtomicU64,
    /// Publishes handed to the engine and not yet complete, with their topics
    pending_deliveries: Mutex<BTreeMap<DeliveryToken, String>>,
    /// Set while an engine-driven reconnect runs; expires after the
    /// handshake window so a silent failure cannot block later attempts
    engine_reconnect: std::sync::Mutex<Option<Instant>>,
    dispatcher: EventDispatcher,
    keep_alive: Arc<KeepAliveScheduler>,
    network: Arc<NetworkStatus>,
    span: Span,
    event_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Build a connection in `Idle` and start draining its engine events
    pub fn new(info: ClientInfo, context: &ConnectionContext) -> HermesResult<Arc<Self>> {
        let identity = info.identity.clone();
        let (events_tx, events_rx) = engine_event_channel();
        let engine = context.engine_factory.create(&identity, events_tx)?;
        let span = crate::connection_span!(client = %identity);

        let keep_alive = KeepAliveScheduler::new(
            format!("keepalive:{identity}"),
            info.options.keep_alive,
            context.timer.clone(),
            context.wake_lock.clone(),
            context.runtime.clone(),
        );
        let buffer = OfflineBuffer::new(info.options.buffer);

        let connection = Arc::new(Self {
            state: StateCell::new(identity.key()),
            info,
            engine,
            epoch: AtomicU64::new(0),
            has_connected: AtomicBool::new(false),
            user_disconnected: AtomicBool::new(false),
            buffer_armed: AtomicBool::new(false),
            buffer: Mutex::new(buffer),
            subscriptions: Mutex::new(SubscriptionSet::new()),
            session_ledger: Mutex::new(HashSet::new()),
            next_token: AtomicU64::new(0),
            pending_deliveries: Mutex::new(BTreeMap::new()),
            engine_reconnect: std::sync::Mutex::new(None),
            dispatcher: context.dispatcher.clone(),
            keep_alive,
            network: context.network.clone(),
            span,
            event_task: std::sync::Mutex::new(None),
        });

        let weak = Arc::downgrade(&connection);
        let target: Weak<dyn KeepAliveTarget> = weak;
        connection.keep_alive.init(target);

        let handle = context.runtime.spawn(
            Self::drain_engine_events(Arc::downgrade(&connection), events_rx)
                .instrument(connection.span.clone()),
        );
        if let Ok(mut slot) = connection.event_task.lock() {
            *slot = Some(handle);
        }

        debug!(parent: &connection.span, "Connection registered");
        Ok(connection)
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.info.identity
    }

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn store(&self) -> &Arc<dyn MessageStore> {
        &self.info.store
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Open a session. At most one handshake is in flight per connection.
    pub async fn connect(&self) -> HermesResult<()> {
        self.connect_inner().instrument(self.span.clone()).await
    }

    async fn connect_inner(&self) -> HermesResult<()> {
        match self.state() {
            ConnectionState::Closed => return Err(HermesError::Closed),
            ConnectionState::Connected => {
                debug!("Already connected");
                return Ok(());
            }
            ConnectionState::Connecting => {
                warn!("Connect already in progress, request ignored");
                return Ok(());
            }
            ConnectionState::Disconnecting => {
                return Err(HermesError::ConnectAborted(
                    "disconnect in progress".to_string(),
                ));
            }
            ConnectionState::Idle | ConnectionState::ConnectionLost(_) => {}
        }

        if self.state.apply(Transition::BeginConnect).is_none() {
            warn!(state = %self.state(), "Lost connect race, request ignored");
            return Ok(());
        }
        let epoch = self.next_epoch();
        self.user_disconnected.store(false, Ordering::SeqCst);
        self.end_engine_reconnect();
        self.session_ledger.lock().await.clear();
        // A new handshake replaces the engine session along with its in-flight publishes
        self.abandon_pending_deliveries().await;

        if self.info.options.clean_session {
            if let Err(e) = self.store().clear(self.identity()).await {
                error!(error = %e, "Could not purge backlog for clean session");
                self.fail_handshake(epoch, e.to_string());
                return Err(e.into());
            }
        }

        info!(server_uri = %self.identity().server_uri, "Connecting");
        let result = self.engine.connect(&self.info.options).await;

        if self.epoch.load(Ordering::SeqCst) != epoch || self.state() != ConnectionState::Connecting
        {
            debug!(state = %self.state(), "Handshake superseded");
            return Err(HermesError::ConnectAborted(format!(
                "superseded while connecting, now {}",
                self.state()
            )));
        }

        match result {
            Ok(()) => {
                self.state.apply(Transition::HandshakeSucceeded);
                self.has_connected.store(true, Ordering::SeqCst);
                self.dispatcher.dispatch(Event::ConnectSucceeded {
                    client: self.identity().clone(),
                });
                self.on_session_established().await;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Handshake failed");
                self.fail_handshake(epoch, e.to_string());
                Err(HermesError::handshake_failure(e.to_string()))
            }
        }
    }

    fn fail_handshake(&self, epoch: u64, error: String) {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.state.apply(Transition::HandshakeFailed);
        }
        self.dispatcher.dispatch(Event::ConnectFailed {
            client: self.identity().clone(),
            error,
        });
    }

    /// Runs once for every session, first or restored
    async fn on_session_established(&self) {
        if self.buffer.lock().await.is_enabled() {
            self.buffer_armed.store(true, Ordering::SeqCst);
        }
        self.deliver_backlog().await;
        self.flush_buffer().await;
        self.resubscribe().await;
        if !self.keep_alive.interval().is_zero() {
            self.keep_alive.start();
        }
    }

    /// Replay stored messages not yet delivered in this session, oldest first
    async fn deliver_backlog(&self) {
        let ledger = self.session_ledger.lock().await;
        let backlog = match self
            .store()
            .get_all(self.identity())
            .instrument(crate::store_span!(op = "get_all"))
            .await
        {
            Ok(backlog) => backlog,
            Err(e) => {
                error!(error = %e, "Could not read backlog");
                return;
            }
        };

        let pending: Vec<_> = backlog
            .into_iter()
            .filter(|message| !ledger.contains(&message.message_id))
            .collect();
        drop(ledger);

        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "Delivering stored backlog");
        for message in pending {
            self.dispatch_arrival(message);
        }
    }

    async fn flush_buffer(&self) {
        let queued = self.buffer.lock().await.drain();
        if queued.is_empty() {
            return;
        }
        debug!(count = queued.len(), "Flushing offline buffer");

        let mut remaining = queued.into_iter();
        while let Some(message) = remaining.next() {
            if let Err(e) = self.send_publish(&message).await {
                warn!(error = %e, "Buffer flush interrupted");
                let mut unsent = vec![message];
                unsent.extend(remaining);
                self.buffer.lock().await.requeue_front(unsent);
                return;
            }
        }
    }

    async fn resubscribe(&self) {
        let filters = self.subscriptions.lock().await.filters();
        if filters.is_empty() {
            return;
        }
        let topics: Vec<String> = filters.iter().map(|(topic, _)| topic.clone()).collect();
        debug!(count = topics.len(), "Restoring subscriptions");
        match self.engine.subscribe(&filters).await {
            Ok(()) => self.dispatcher.dispatch(Event::Subscribed {
                client: self.identity().clone(),
                topics,
            }),
            Err(e) => self.dispatcher.dispatch(Event::SubscribeFailed {
                client: self.identity().clone(),
                topics,
                error: e.to_string(),
            }),
        }
    }

    /// Publish now, or queue while disconnected if the buffer is armed.
    /// The returned token is reported again by the matching `DeliveryComplete`.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: Qos,
        retained: bool,
    ) -> HermesResult<DeliveryToken> {
        validate_publish_topic(topic)?;
        let state = self.state();
        if state == ConnectionState::Closed {
            return Err(HermesError::Closed);
        }
        let message = OutboundMessage {
            token: DeliveryToken(self.next_token.fetch_add(1, Ordering::SeqCst) + 1),
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retained,
        };

        if state == ConnectionState::Connected {
            self.send_publish(&message).await?;
            return Ok(message.token);
        }

        let mut buffer = self.buffer.lock().await;
        if !(self.buffer_armed.load(Ordering::SeqCst) && buffer.is_enabled()) {
            return Err(HermesError::NotConnected { state });
        }
        let token = message.token;
        for evicted in buffer.push(message)? {
            debug!(parent: &self.span, topic = %evicted.topic, token = %evicted.token, "Offline buffer full, oldest publish dropped");
        }
        debug!(parent: &self.span, queued = buffer.len(), %token, "Publish buffered while offline");
        Ok(token)
    }

    async fn send_publish(&self, message: &OutboundMessage) -> HermesResult<()> {
        self.pending_deliveries
            .lock()
            .await
            .insert(message.token, message.topic.clone());
        let result = self.engine.publish(message).await;

        match result {
            Ok(()) => {
                self.dispatcher.dispatch(Event::Published {
                    client: self.identity().clone(),
                    token: message.token,
                    topic: message.topic.clone(),
                });
                Ok(())
            }
            Err(e) => {
                self.pending_deliveries.lock().await.remove(&message.token);
                self.dispatcher.dispatch(Event::PublishFailed {
                    client: self.identity().clone(),
                    topic: message.topic.clone(),
                    error: e.to_string(),
                });
                Err(HermesError::PublishFailed(e.to_string()))
            }
        }
    }

    /// Subscribe to `topics`. The request is remembered even when it cannot
    /// be sent, and replayed on the next session.
    pub async fn subscribe(&self, topics: &[String], qos: Qos) -> HermesResult<()> {
        validate_topics(topics)?;
        if self.state() == ConnectionState::Closed {
            return Err(HermesError::Closed);
        }

        let added = self.subscriptions.lock().await.merge(topics, qos);
        let state = self.state();
        if state != ConnectionState::Connected {
            debug!(parent: &self.span, ?topics, "Subscription recorded for next session");
            return Err(HermesError::NotConnected { state });
        }

        if added.is_empty() {
            self.dispatcher.dispatch(Event::Subscribed {
                client: self.identity().clone(),
                topics: topics.to_vec(),
            });
            return Ok(());
        }

        match self.engine.subscribe(&added).await {
            Ok(()) => {
                self.dispatcher.dispatch(Event::Subscribed {
                    client: self.identity().clone(),
                    topics: topics.to_vec(),
                });
                Ok(())
            }
            Err(e) => {
                let failed: Vec<String> = added.into_iter().map(|(topic, _)| topic).collect();
                self.subscriptions.lock().await.remove(&failed);
                self.dispatcher.dispatch(Event::SubscribeFailed {
                    client: self.identity().clone(),
                    topics: topics.to_vec(),
                    error: e.to_string(),
                });
                Err(HermesError::SubscriptionFailed(e.to_string()))
            }
        }
    }

    pub async fn unsubscribe(&self, topics: &[String]) -> HermesResult<()> {
        validate_topics(topics)?;
        let state = self.state();
        match state {
            ConnectionState::Closed => return Err(HermesError::Closed),
            ConnectionState::Connected => {}
            _ => return Err(HermesError::NotConnected { state }),
        }

        match self.engine.unsubscribe(topics).await {
            Ok(()) => {
                self.subscriptions.lock().await.remove(topics);
                self.dispatcher.dispatch(Event::Unsubscribed {
                    client: self.identity().clone(),
                    topics: topics.to_vec(),
                });
                Ok(())
            }
            Err(e) => {
                self.dispatcher.dispatch(Event::UnsubscribeFailed {
                    client: self.identity().clone(),
                    topics: topics.to_vec(),
                    error: e.to_string(),
                });
                Err(HermesError::UnsubscribeFailed(e.to_string()))
            }
        }
    }

    /// Application-initiated disconnect; the connection stays down until
    /// `connect()` is called again
    pub async fn disconnect(&self, quiesce: Duration) -> HermesResult<()> {
        self.user_disconnected.store(true, Ordering::SeqCst);
        self.disconnect_inner(quiesce)
            .instrument(self.span.clone())
            .await
    }

    async fn disconnect_inner(&self, quiesce: Duration) -> HermesResult<()> {
        match self.state() {
            ConnectionState::Closed => return Err(HermesError::Closed),
            ConnectionState::Idle => {
                self.dispatcher.dispatch(Event::Disconnected {
                    client: self.identity().clone(),
                });
                return Ok(());
            }
            _ => {}
        }

        if self.state.apply(Transition::BeginDisconnect).is_none() {
            debug!(state = %self.state(), "Disconnect already in progress");
            return Ok(());
        }
        self.next_epoch();
        self.keep_alive.stop();
        self.end_engine_reconnect();

        info!(quiesce_ms = quiesce.as_millis() as u64, "Disconnecting");
        let result = self.engine.disconnect(quiesce).await;
        self.state.apply(Transition::DisconnectFinished);
        self.session_ledger.lock().await.clear();
        self.abandon_pending_deliveries().await;

        if self.info.options.clean_session {
            if let Err(e) = self.store().clear(self.identity()).await {
                error!(error = %e, "Could not purge clean-session backlog after disconnect");
            }
        }

        match result {
            Ok(()) => {
                self.dispatcher.dispatch(Event::Disconnected {
                    client: self.identity().clone(),
                });
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Engine disconnect failed");
                self.dispatcher.dispatch(Event::DisconnectFailed {
                    client: self.identity().clone(),
                    error: e.to_string(),
                });
                Err(HermesError::DisconnectFailed(e.to_string()))
            }
        }
    }

    /// Re-establish a dropped session. Skipped while a handshake, an engine
    /// reconnect or a disconnect is in flight, while offline, when already
    /// connected, and after the application disconnected explicitly.
    pub async fn reconnect(&self) -> HermesResult<()> {
        self.reconnect_inner().instrument(self.span.clone()).await
    }

    async fn reconnect_inner(&self) -> HermesResult<()> {
        let state = self.state();
        let skip = match &state {
            ConnectionState::Closed => return Err(HermesError::Closed),
            ConnectionState::Connecting => Some("handshake in progress"),
            _ if !self.network.is_online() => Some("network offline"),
            ConnectionState::Disconnecting => Some("disconnect in progress"),
            ConnectionState::Connected => Some("already connected"),
            _ if self.user_disconnected.load(Ordering::SeqCst) => Some("disconnected by application"),
            _ if !self.has_connected.load(Ordering::SeqCst) => Some("never connected"),
            _ => None,
        };
        if let Some(reason) = skip {
            debug!(state = %state, reason, "Reconnect skipped");
            return Ok(());
        }

        if self.info.options.automatic_reconnect {
            if self.engine.is_connected() {
                // Lost locally (network offline) while the engine session
                // stayed up; only a fresh handshake brings it back
                debug!("Engine session still up, starting a new handshake");
                return self.connect_inner().await;
            }
            if !self.begin_engine_reconnect() {
                debug!(state = %state, reason = "engine reconnect in progress", "Reconnect skipped");
                return Ok(());
            }
            match self.engine.reconnect().await {
                Ok(()) => {
                    debug!("Engine reconnect triggered");
                    return Ok(());
                }
                Err(e) => {
                    self.end_engine_reconnect();
                    debug!(error = %e, "Engine cannot resume, starting a new handshake");
                }
            }
        } else if self.info.options.clean_session {
            debug!("Clean session without auto-reconnect, not retrying");
            return Ok(());
        }

        self.connect_inner().await
    }

    /// Claim the engine-reconnect slot. Fails while an earlier engine
    /// reconnect is still inside its handshake window.
    fn begin_engine_reconnect(&self) -> bool {
        let Ok(mut slot) = self.engine_reconnect.lock() else {
            return false;
        };
        let now = Instant::now();
        if slot.is_some_and(|deadline| now < deadline) {
            return false;
        }
        let window = match self.info.options.connection_timeout {
            timeout if timeout.is_zero() => DEFAULT_RECONNECT_WINDOW,
            timeout => timeout,
        };
        *slot = Some(now + window);
        true
    }

    fn end_engine_reconnect(&self) {
        if let Ok(mut slot) = self.engine_reconnect.lock() {
            *slot = None;
        }
    }

    async fn abandon_pending_deliveries(&self) {
        let mut pending = self.pending_deliveries.lock().await;
        if !pending.is_empty() {
            debug!(count = pending.len(), "In-flight publishes abandoned with their session");
            pending.clear();
        }
    }

    /// Tokens of publishes handed to the engine and not yet complete,
    /// oldest first. Publishes still in the offline buffer are not included.
    pub async fn pending_delivery_tokens(&self) -> Vec<DeliveryToken> {
        self.pending_deliveries.lock().await.keys().copied().collect()
    }

    /// Host reported the network gone
    pub async fn offline(&self) -> HermesResult<()> {
        if self.state() == ConnectionState::Connected && !self.info.options.clean_session {
            self.on_connection_lost("network offline".to_string())
                .instrument(self.span.clone())
                .await;
        }
        Ok(())
    }

    /// Release the engine. Persisted messages are left in the store.
    pub async fn close(&self) -> HermesResult<()> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }
        self.next_epoch();
        self.state.apply(Transition::Release);
        self.keep_alive.stop();
        self.end_engine_reconnect();

        if let Err(e) = self.engine.close().await {
            warn!(parent: &self.span, error = %e, "Engine close failed");
        }
        if let Ok(mut slot) = self.event_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        info!(parent: &self.span, "Connection closed");
        Ok(())
    }

    /// Delete a delivered message (MANUAL mode). Returns false if it was
    /// already gone.
    pub async fn acknowledge(&self, message_id: &str) -> HermesResult<bool> {
        if self.info.ack_mode != AckMode::Manual {
            return Err(HermesError::invalid_argument(
                "acknowledge is only valid in manual ack mode",
            ));
        }
        let removed = self.store().delete(self.identity(), message_id).await?;
        debug!(parent: &self.span, message_id, removed, "Message acknowledged");
        Ok(removed)
    }

    /// Stored messages not yet acknowledged, oldest first
    pub async fn backlog(&self) -> HermesResult<Vec<crate::store::StoredMessage>> {
        Ok(self.store().get_all(self.identity()).await?)
    }

    pub async fn buffered_message_count(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub async fn buffered_message(&self, index: usize) -> Option<OutboundMessage> {
        self.buffer.lock().await.get(index).cloned()
    }

    pub async fn delete_buffered_message(&self, index: usize) -> HermesResult<OutboundMessage> {
        self.buffer
            .lock()
            .await
            .remove(index)
            .ok_or_else(|| HermesError::invalid_argument(format!("no buffered message at {index}")))
    }

    pub async fn buffer_options(&self) -> BufferOptions {
        self.buffer.lock().await.options()
    }

    pub async fn set_buffer_options(&self, options: BufferOptions) {
        self.buffer.lock().await.set_options(options);
        if !options.enabled {
            self.buffer_armed.store(false, Ordering::SeqCst);
        } else if self.has_connected.load(Ordering::SeqCst) {
            self.buffer_armed.store(true, Ordering::SeqCst);
        }
    }

    pub async fn subscriptions(&self) -> Vec<(String, Qos)> {
        self.subscriptions.lock().await.filters()
    }

    async fn drain_engine_events(connection: Weak<Connection>, mut events: EngineEventReceiver) {
        while let Some(event) = events.recv().await {
            let Some(connection) = connection.upgrade() else {
                break;
            };
            connection.handle_engine_event(event).await;
        }
        debug!("Engine event stream ended");
    }

    async fn handle_engine_event(&self, event: EngineEvent) {
        if self.state() == ConnectionState::Closed {
            debug!(?event, "Engine event after close ignored");
            return;
        }

        match event {
            EngineEvent::ConnectComplete {
                reconnected,
                server_uri,
            } => {
                self.end_engine_reconnect();
                self.dispatcher.dispatch(Event::ConnectComplete {
                    client: self.identity().clone(),
                    reconnected,
                    server_uri,
                });
                // First handshakes are finished by connect(); only engine-driven
                // recoveries are completed here
                if reconnected
                    && matches!(self.state(), ConnectionState::ConnectionLost(_))
                    && self.state.apply(Transition::HandshakeSucceeded).is_some()
                {
                    self.on_session_established().await;
                }
            }
            EngineEvent::ConnectionLost { cause } => self.on_connection_lost(cause).await,
            EngineEvent::MessageArrived(message) => self.on_message_arrived(message).await,
            EngineEvent::DeliveryComplete { token } => {
                let Some(topic) = self.pending_deliveries.lock().await.remove(&token) else {
                    debug!(%token, "Completion for a publish no longer tracked");
                    return;
                };
                self.dispatcher.dispatch(Event::DeliveryComplete {
                    client: self.identity().clone(),
                    token,
                    topic,
                });
            }
        }
    }

    async fn on_connection_lost(&self, cause: String) {
        self.end_engine_reconnect();
        if self.state.apply(Transition::Lost(cause.clone())).is_none() {
            debug!(cause = %cause, "Loss reported while not connected");
            return;
        }
        self.session_ledger.lock().await.clear();
        self.dispatcher.dispatch(Event::ConnectionLost {
            client: self.identity().clone(),
            cause,
        });

        if self.info.options.automatic_reconnect {
            // A probe in ConnectionLost triggers reconnect()
            self.keep_alive.schedule(IMMEDIATE_RETRY_DELAY);
        } else {
            self.keep_alive.stop();
            if let Err(e) = self.disconnect_inner(Duration::ZERO).await {
                warn!(error = %e, "Forced disconnect after loss failed");
            }
        }
    }

    /// Persist, then acknowledge to the broker, then dispatch
    async fn on_message_arrived(&self, message: InboundMessage) {
        let mut ledger = self.session_ledger.lock().await;
        let stored = match self
            .store()
            .save(self.identity(), &message)
            .instrument(crate::store_span!(op = "save", topic = %message.topic))
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                drop(ledger);
                error!(topic = %message.topic, error = %e, "Could not persist inbound message");
                self.dispatcher.dispatch(Event::PersistenceFailed {
                    client: self.identity().clone(),
                    topic: message.topic,
                    error: e.to_string(),
                });
                return;
            }
        };
        ledger.insert(stored.message_id.clone());
        drop(ledger);

        if let Some(packet_id) = message.packet_id {
            if let Err(e) = self.engine.acknowledge_delivery(packet_id).await {
                warn!(packet_id, error = %e, "Broker acknowledgment failed");
            }
        }
        debug!(topic = %stored.topic, message_id = %stored.message_id, "Message persisted");
        self.dispatch_arrival(stored);
    }

    fn dispatch_arrival(&self, message: crate::store::StoredMessage) {
        let event = Event::MessageArrived {
            client: self.identity().clone(),
            message,
        };
        match self.info.ack_mode {
            AckMode::Auto => self.dispatcher.dispatch_auto_ack(event, self.store().clone()),
            AckMode::Manual => self.dispatcher.dispatch(event),
        }
    }
}

#[async_trait]
impl KeepAliveTarget for Connection {
    async fn check_for_activity(&self) -> Result<(), HermesError> {
        match self.state() {
            ConnectionState::Connected => Ok(self.engine.check_for_activity().await?),
            ConnectionState::ConnectionLost(_) => self.reconnect().await,
            ConnectionState::Closed => Err(HermesError::Closed),
            ConnectionState::Idle | ConnectionState::Connecting | ConnectionState::Disconnecting => {
                Ok(())
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.event_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

fn validate_publish_topic(topic: &str) -> HermesResult<()> {
    if topic.is_empty() {
        return Err(HermesError::invalid_argument("topic must not be empty"));
    }
    if topic.contains(['+', '#']) {
        return Err(HermesError::invalid_argument(format!(
            "wildcards are not allowed in publish topics: {topic}"
        )));
    }
    Ok(())
}

fn validate_topics(topics: &[String]) -> HermesResult<()> {
    if topics.is_empty() {
        return Err(HermesError::invalid_argument("no topics given"));
    }
    if topics.iter().any(|t| t.is_empty()) {
        return Err(HermesError::invalid_argument("topic filters must not be empty"));
    }
    Ok(())
}
