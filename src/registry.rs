//! Multi-client registry
//!
//! The registry owns every `Connection`, keyed by `ClientIdentity`, and is
//! the public entry point of the crate. The map lock is held only to look up
//! or mutate entries; operations on different identities run concurrently.

use crate::connection::{Connection, ConnectionContext, ConnectionState};
use crate::dispatch::{EventDispatcher, EventListener};
use crate::error::{HermesError, HermesResult};
use crate::keepalive::{TokioWakeTimer, WakeTimer};
use crate::network::{NetworkStatus, ReachabilityListener};
use crate::power::{CountingWakeLock, WakeLock};
use crate::store::{MessageStore, StoredMessage};
use crate::transport::EngineFactory;
use crate::types::{
    BufferOptions, ClientIdentity, ClientInfo, DeliveryToken, OutboundMessage, Qos,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, Instrument};
use url::Url;

pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ClientIdentity, Arc<Connection>>>,
    context: ConnectionContext,
    default_store: Arc<dyn MessageStore>,
    dispatcher_task: JoinHandle<()>,
}

impl ConnectionRegistry {
    /// Registry with tokio timers and no host power management.
    /// Must be called from within a tokio runtime.
    pub fn new(
        engine_factory: Arc<dyn EngineFactory>,
        default_store: Arc<dyn MessageStore>,
    ) -> HermesResult<Arc<Self>> {
        let runtime = current_runtime()?;
        let timer = Arc::new(TokioWakeTimer::new(runtime.clone()));
        Self::with_host(
            engine_factory,
            default_store,
            timer,
            Arc::new(CountingWakeLock::new()),
        )
    }

    /// Registry using the host's wake-capable timer and wake lock
    pub fn with_host(
        engine_factory: Arc<dyn EngineFactory>,
        default_store: Arc<dyn MessageStore>,
        timer: Arc<dyn WakeTimer>,
        wake_lock: Arc<dyn WakeLock>,
    ) -> HermesResult<Arc<Self>> {
        let runtime = current_runtime()?;
        let (dispatcher, dispatcher_task) = EventDispatcher::spawn();
        let context = ConnectionContext {
            engine_factory,
            dispatcher,
            timer,
            wake_lock,
            network: Arc::new(NetworkStatus::new()),
            runtime,
        };

        Ok(Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            context,
            default_store,
            dispatcher_task,
        }))
    }

    /// `ClientInfo` with default options and the registry's store
    pub fn client_info(&self, identity: ClientIdentity) -> ClientInfo {
        ClientInfo::new(identity, self.default_store.clone())
    }

    pub fn wake_lock(&self) -> Arc<dyn WakeLock> {
        self.context.wake_lock.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.context.dispatcher.add_listener(listener);
    }

    /// Wait until every event produced so far has reached the listeners
    pub async fn flush_events(&self) {
        self.context.dispatcher.flush().await;
    }

    /// Create a connection for `info` unless one exists. Idempotent: an
    /// existing registration is returned untouched.
    pub async fn register(&self, info: ClientInfo) -> HermesResult<ClientIdentity> {
        validate_identity(&info.identity)?;

        let mut connections = self.connections.lock().await;
        if connections.contains_key(&info.identity) {
            debug!(client = %info.identity, "Client already registered");
            return Ok(info.identity);
        }

        let identity = info.identity.clone();
        let connection = Connection::new(info, &self.context)?;
        connections.insert(identity.clone(), connection);
        info!(client = %identity, "Client registered");
        Ok(identity)
    }

    async fn get(&self, identity: &ClientIdentity) -> HermesResult<Arc<Connection>> {
        self.connections
            .lock()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| HermesError::UnknownClient(identity.clone()))
    }

    async fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().await.values().cloned().collect()
    }

    pub async fn identities(&self) -> Vec<ClientIdentity> {
        let mut identities: Vec<_> = self.connections.lock().await.keys().cloned().collect();
        identities.sort();
        identities
    }

    pub async fn is_registered(&self, identity: &ClientIdentity) -> bool {
        self.connections.lock().await.contains_key(identity)
    }

    pub async fn connect(&self, identity: &ClientIdentity) -> HermesResult<()> {
        self.get(identity).await?.connect().await
    }

    pub async fn disconnect(&self, identity: &ClientIdentity, quiesce: Duration) -> HermesResult<()> {
        self.get(identity).await?.disconnect(quiesce).await
    }

    /// Release the connection and forget it. Stored messages are kept.
    pub async fn close(&self, identity: &ClientIdentity) -> HermesResult<()> {
        let connection = self
            .connections
            .lock()
            .await
            .remove(identity)
            .ok_or_else(|| HermesError::UnknownClient(identity.clone()))?;
        connection.close().await
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.connections.lock().await.drain().map(|(_, c)| c).collect();
        info!(count = drained.len(), "Closing all clients");
        self.broadcast(drained, "close", |c| async move { c.close().await })
            .await;
    }

    pub async fn disconnect_all(&self, quiesce: Duration) {
        let connections = self.all().await;
        self.broadcast(connections, "disconnect", move |c| async move {
            c.disconnect(quiesce).await
        })
        .await;
    }

    pub async fn publish(
        &self,
        identity: &ClientIdentity,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: Qos,
        retained: bool,
    ) -> HermesResult<DeliveryToken> {
        self.get(identity)
            .await?
            .publish(topic, payload, qos, retained)
            .await
    }

    /// Publishes sent on `identity` and not yet confirmed
    pub async fn pending_delivery_tokens(
        &self,
        identity: &ClientIdentity,
    ) -> HermesResult<Vec<DeliveryToken>> {
        Ok(self.get(identity).await?.pending_delivery_tokens().await)
    }

    pub async fn subscribe(
        &self,
        identity: &ClientIdentity,
        topics: &[String],
        qos: Qos,
    ) -> HermesResult<()> {
        self.get(identity).await?.subscribe(topics, qos).await
    }

    pub async fn unsubscribe(&self, identity: &ClientIdentity, topics: &[String]) -> HermesResult<()> {
        self.get(identity).await?.unsubscribe(topics).await
    }

    pub async fn acknowledge(&self, identity: &ClientIdentity, message_id: &str) -> HermesResult<bool> {
        self.get(identity).await?.acknowledge(message_id).await
    }

    pub async fn is_connected(&self, identity: &ClientIdentity) -> HermesResult<bool> {
        Ok(self.get(identity).await?.is_connected())
    }

    pub async fn connection_state(&self, identity: &ClientIdentity) -> HermesResult<ConnectionState> {
        Ok(self.get(identity).await?.state())
    }

    pub async fn backlog(&self, identity: &ClientIdentity) -> HermesResult<Vec<StoredMessage>> {
        self.get(identity).await?.backlog().await
    }

    pub async fn buffered_message_count(&self, identity: &ClientIdentity) -> HermesResult<usize> {
        Ok(self.get(identity).await?.buffered_message_count().await)
    }

    pub async fn buffered_message(
        &self,
        identity: &ClientIdentity,
        index: usize,
    ) -> HermesResult<Option<OutboundMessage>> {
        Ok(self.get(identity).await?.buffered_message(index).await)
    }

    pub async fn delete_buffered_message(
        &self,
        identity: &ClientIdentity,
        index: usize,
    ) -> HermesResult<OutboundMessage> {
        self.get(identity).await?.delete_buffered_message(index).await
    }

    pub async fn set_buffer_options(
        &self,
        identity: &ClientIdentity,
        options: BufferOptions,
    ) -> HermesResult<()> {
        self.get(identity).await?.set_buffer_options(options).await;
        Ok(())
    }

    /// Network came back: every connection gets a `reconnect()`
    pub async fn on_network_online(&self) {
        self.context.network.set_online(true);
        let connections = self.all().await;
        self.broadcast(connections, "reconnect", |c| async move { c.reconnect().await })
            .await;
    }

    /// Network went away: every connection gets an `offline()`
    pub async fn on_network_offline(&self) {
        self.context.network.set_online(false);
        let connections = self.all().await;
        self.broadcast(connections, "offline", |c| async move { c.offline().await })
            .await;
    }

    /// Run `op` on every connection concurrently. Failures are logged per
    /// connection and never returned.
    async fn broadcast<F, Fut>(&self, connections: Vec<Arc<Connection>>, op_name: &'static str, op: F)
    where
        F: Fn(Arc<Connection>) -> Fut,
        Fut: Future<Output = HermesResult<()>> + Send + 'static,
    {
        let span = crate::registry_span!(op = op_name, count = connections.len());
        let mut tasks = JoinSet::new();
        for connection in connections {
            let identity = connection.identity().clone();
            let fut = op(connection);
            tasks.spawn_on(
                async move { (identity, fut.await) }.instrument(span.clone()),
                &self.context.runtime,
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((identity, Err(e))) => {
                    error!(parent: &span, client = %identity, error = %e, "Broadcast {} failed", op_name);
                }
                Err(e) => error!(parent: &span, error = %e, "Broadcast {} task panicked", op_name),
            }
        }
    }
}

#[async_trait]
impl ReachabilityListener for ConnectionRegistry {
    async fn on_network_online(&self) {
        ConnectionRegistry::on_network_online(self).await;
    }

    async fn on_network_offline(&self) {
        ConnectionRegistry::on_network_offline(self).await;
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.dispatcher_task.abort();
    }
}

fn current_runtime() -> HermesResult<Handle> {
    Handle::try_current().map_err(|e| {
        HermesError::invalid_argument(format!("registry must be created inside a tokio runtime: {e}"))
    })
}

/// Broker URI and client id must be usable before anything is allocated
fn validate_identity(identity: &ClientIdentity) -> HermesResult<()> {
    if identity.server_uri.trim().is_empty() {
        return Err(HermesError::invalid_argument("server_uri must not be empty"));
    }
    if Url::parse(&identity.server_uri).is_err() {
        return Err(HermesError::invalid_argument(format!(
            "server_uri is not a valid URI: {}",
            identity.server_uri
        )));
    }
    if identity.client_id.trim().is_empty() {
        return Err(HermesError::invalid_argument("client_id must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identity() {
        assert!(validate_identity(&ClientIdentity::new("tcp://b:1883", "c", "app")).is_ok());
        assert!(validate_identity(&ClientIdentity::new("", "c", "app")).is_err());
        assert!(validate_identity(&ClientIdentity::new("tcp://b:1883", " ", "app")).is_err());
        assert!(validate_identity(&ClientIdentity::new("no scheme", "c", "app")).is_err());
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let result = ConnectionRegistry::new(
            Arc::new(crate::testing::MockEngineFactory::new()),
            Arc::new(crate::store::MemoryMessageStore::new()),
        );
        assert!(matches!(result, Err(HermesError::InvalidArgument(_))));
    }
}
