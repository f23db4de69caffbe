//! Event dispatch
//!
//! Connections produce `Event`s from any task; a single dispatcher task
//! consumes them and calls listeners in order. In AUTO acknowledgment mode
//! the dispatcher deletes a persisted message once every listener has
//! returned for it.

use crate::store::{MessageStore, StoredMessage};
use crate::types::{ClientIdentity, DeliveryToken};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Everything a listener can observe, each tagged with its client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ConnectSucceeded {
        client: ClientIdentity,
    },
    ConnectFailed {
        client: ClientIdentity,
        error: String,
    },
    /// A session came up; `reconnected` is true when the engine restored it on its own
    ConnectComplete {
        client: ClientIdentity,
        reconnected: bool,
        server_uri: String,
    },
    ConnectionLost {
        client: ClientIdentity,
        cause: String,
    },
    Disconnected {
        client: ClientIdentity,
    },
    DisconnectFailed {
        client: ClientIdentity,
        error: String,
    },
    MessageArrived {
        client: ClientIdentity,
        message: StoredMessage,
    },
    /// The broker confirmed the publish that returned `token`
    DeliveryComplete {
        client: ClientIdentity,
        token: DeliveryToken,
        topic: String,
    },
    Published {
        client: ClientIdentity,
        token: DeliveryToken,
        topic: String,
    },
    PublishFailed {
        client: ClientIdentity,
        topic: String,
        error: String,
    },
    Subscribed {
        client: ClientIdentity,
        topics: Vec<String>,
    },
    SubscribeFailed {
        client: ClientIdentity,
        topics: Vec<String>,
        error: String,
    },
    Unsubscribed {
        client: ClientIdentity,
        topics: Vec<String>,
    },
    UnsubscribeFailed {
        client: ClientIdentity,
        topics: Vec<String>,
        error: String,
    },
    /// An arrival could not be stored; the broker was not acknowledged
    PersistenceFailed {
        client: ClientIdentity,
        topic: String,
        error: String,
    },
}

impl Event {
    pub fn client(&self) -> &ClientIdentity {
        match self {
            Event::ConnectSucceeded { client }
            | Event::ConnectFailed { client, .. }
            | Event::ConnectComplete { client, .. }
            | Event::ConnectionLost { client, .. }
            | Event::Disconnected { client }
            | Event::DisconnectFailed { client, .. }
            | Event::MessageArrived { client, .. }
            | Event::DeliveryComplete { client, .. }
            | Event::Published { client, .. }
            | Event::PublishFailed { client, .. }
            | Event::Subscribed { client, .. }
            | Event::SubscribeFailed { client, .. }
            | Event::Unsubscribed { client, .. }
            | Event::UnsubscribeFailed { client, .. }
            | Event::PersistenceFailed { client, .. } => client,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::ConnectSucceeded { .. } => "connect_succeeded",
            Event::ConnectFailed { .. } => "connect_failed",
            Event::ConnectComplete { .. } => "connect_complete",
            Event::ConnectionLost { .. } => "connection_lost",
            Event::Disconnected { .. } => "disconnected",
            Event::DisconnectFailed { .. } => "disconnect_failed",
            Event::MessageArrived { .. } => "message_arrived",
            Event::DeliveryComplete { .. } => "delivery_complete",
            Event::Published { .. } => "published",
            Event::PublishFailed { .. } => "publish_failed",
            Event::Subscribed { .. } => "subscribed",
            Event::SubscribeFailed { .. } => "subscribe_failed",
            Event::Unsubscribed { .. } => "unsubscribed",
            Event::UnsubscribeFailed { .. } => "unsubscribe_failed",
            Event::PersistenceFailed { .. } => "persistence_failed",
        }
    }
}

/// Receives every dispatched event
///
/// Listeners run on the dispatcher task and should return quickly. A panic
/// is caught and logged; it counts as a failed delivery.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

enum DispatchCommand {
    Deliver {
        event: Event,
        auto_ack: Option<Arc<dyn MessageStore>>,
    },
    Flush(oneshot::Sender<()>),
}

type ListenerList = Arc<RwLock<Vec<Arc<dyn EventListener>>>>;

/// Cloneable producer handle onto the dispatcher task
#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<DispatchCommand>,
    listeners: ListenerList,
}

impl EventDispatcher {
    /// Spawn the dispatcher task. It ends when every handle is dropped.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listeners: ListenerList = Arc::new(RwLock::new(Vec::new()));
        let handle = tokio::spawn(Self::run(rx, listeners.clone()));
        (Self { tx, listeners }, handle)
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(_) => error!("Listener list poisoned, listener not added"),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn dispatch(&self, event: Event) {
        self.send(DispatchCommand::Deliver {
            event,
            auto_ack: None,
        });
    }

    /// Dispatch a `MessageArrived` and delete it from `store` once delivered
    pub fn dispatch_auto_ack(&self, event: Event, store: Arc<dyn MessageStore>) {
        self.send(DispatchCommand::Deliver {
            event,
            auto_ack: Some(store),
        });
    }

    /// Resolves once everything dispatched before this call has been handled
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(DispatchCommand::Flush(done_tx));
        let _ = done_rx.await;
    }

    fn send(&self, command: DispatchCommand) {
        if self.tx.send(command).is_err() {
            warn!("Dispatcher task has stopped, event dropped");
        }
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<DispatchCommand>, listeners: ListenerList) {
        debug!("Event dispatcher started");
        while let Some(command) = rx.recv().await {
            match command {
                DispatchCommand::Deliver { event, auto_ack } => {
                    let delivered = Self::deliver(&event, &listeners);
                    if let (Some(store), Event::MessageArrived { client, message }) =
                        (auto_ack, &event)
                    {
                        Self::auto_acknowledge(store, client, message, delivered).await;
                    }
                }
                DispatchCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Event dispatcher stopped");
    }

    /// Returns true when at least one listener saw the event and none panicked
    fn deliver(event: &Event, listeners: &ListenerList) -> bool {
        let snapshot: Vec<Arc<dyn EventListener>> = match listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => {
                error!("Listener list poisoned, event dropped");
                return false;
            }
        };

        let mut delivered = !snapshot.is_empty();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
                error!(
                    client = %event.client(),
                    event = event.name(),
                    "Listener panicked"
                );
                delivered = false;
            }
        }
        delivered
    }

    async fn auto_acknowledge(
        store: Arc<dyn MessageStore>,
        client: &ClientIdentity,
        message: &StoredMessage,
        delivered: bool,
    ) {
        if !delivered {
            debug!(
                client = %client,
                message_id = %message.message_id,
                "Message not confirmed by listeners, kept for replay"
            );
            return;
        }
        match store.delete(client, &message.message_id).await {
            Ok(true) => debug!(client = %client, message_id = %message.message_id, "Auto-acknowledged"),
            Ok(false) => debug!(client = %client, message_id = %message.message_id, "Already acknowledged"),
            Err(e) => error!(
                client = %client,
                message_id = %message.message_id,
                error = %e,
                "Auto-acknowledge failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMessageStore;
    use crate::types::{InboundMessage, Qos};
    use bytes::Bytes;
    use std::sync::Mutex;

    fn client() -> ClientIdentity {
        ClientIdentity::new("tcp://localhost:1883", "dispatch", "app")
    }

    fn inbound(topic: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"x"),
            qos: Qos::AtLeastOnce,
            retained: false,
            duplicate: false,
            packet_id: Some(1),
        }
    }

    #[tokio::test]
    async fn test_listeners_see_events_in_order() {
        let (dispatcher, _task) = EventDispatcher::spawn();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.add_listener(Arc::new(move |event: &Event| {
            sink.lock().unwrap().push(event.name());
        }));

        dispatcher.dispatch(Event::ConnectSucceeded { client: client() });
        dispatcher.dispatch(Event::Disconnected { client: client() });
        dispatcher.flush().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["connect_succeeded", "disconnected"]
        );
    }

    #[tokio::test]
    async fn test_auto_ack_deletes_after_delivery() {
        let (dispatcher, _task) = EventDispatcher::spawn();
        dispatcher.add_listener(Arc::new(|_: &Event| {}));
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let stored = store.save(&client(), &inbound("a")).await.unwrap();

        dispatcher.dispatch_auto_ack(
            Event::MessageArrived {
                client: client(),
                message: stored,
            },
            store.clone(),
        );
        dispatcher.flush().await;

        assert_eq!(store.count(&client()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_panicking_listener_keeps_message() {
        let (dispatcher, _task) = EventDispatcher::spawn();
        let after = Arc::new(Mutex::new(0));
        let counter = after.clone();
        dispatcher.add_listener(Arc::new(|_: &Event| panic!("listener bug")));
        dispatcher.add_listener(Arc::new(move |_: &Event| {
            *counter.lock().unwrap() += 1;
        }));
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let stored = store.save(&client(), &inbound("a")).await.unwrap();

        dispatcher.dispatch_auto_ack(
            Event::MessageArrived {
                client: client(),
                message: stored,
            },
            store.clone(),
        );
        dispatcher.flush().await;

        assert_eq!(*after.lock().unwrap(), 1, "later listeners still run");
        assert_eq!(store.count(&client()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_no_listeners_keeps_message() {
        let (dispatcher, _task) = EventDispatcher::spawn();
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let stored = store.save(&client(), &inbound("a")).await.unwrap();

        dispatcher.dispatch_auto_ack(
            Event::MessageArrived {
                client: client(),
                message: stored,
            },
            store.clone(),
        );
        dispatcher.flush().await;
        assert_eq!(store.count(&client()).await.unwrap(), 1);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(Event::ConnectionLost {
            client: client(),
            cause: "eof".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "connection_lost");
        assert_eq!(json["client"]["client_id"], "dispatch");
        assert_eq!(json["cause"], "eof");
    }
}
