//! Protocol engine boundary
//!
//! The wire codec lives behind `ProtocolEngine`. A `Connection` drives the
//! engine through this trait and receives the engine's asynchronous
//! callbacks as `EngineEvent`s on a channel, so every callback is handled by
//! a single `match` on the connection side.

use crate::types::{
    ClientIdentity, ConnectOptions, DeliveryToken, InboundMessage, OutboundMessage, Qos,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Errors raised by a protocol engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Unsubscribe failed")]
    UnsubscribeFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Disconnect failed")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Acknowledgment failed")]
    AckFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Engine not connected")]
    NotConnected,
    #[error("Engine session is still active")]
    SessionActive,
    #[error("Engine closed")]
    Closed,
}

/// Callbacks from the engine, in the order the engine observed them
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A handshake finished; `reconnected` is true for engine-driven retries
    ConnectComplete {
        reconnected: bool,
        server_uri: String,
    },
    ConnectionLost {
        cause: String,
    },
    MessageArrived(InboundMessage),
    /// The publish handed over with `token` is complete: sent for QoS 0,
    /// acknowledged by the broker for QoS 1 and 2
    DeliveryComplete {
        token: DeliveryToken,
    },
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Client-side handle onto one broker session
///
/// `connect` resolves only once the broker has accepted the session.
/// Broker-level acknowledgment of inbound QoS 1/2 messages is withheld until
/// `acknowledge_delivery` is called.
#[async_trait::async_trait]
pub trait ProtocolEngine: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<(), EngineError>;

    /// Graceful disconnect; waits at most `quiesce` for in-flight work
    async fn disconnect(&self, quiesce: Duration) -> Result<(), EngineError>;

    /// Hand a publish to the wire. Completion is reported later as
    /// `DeliveryComplete` carrying `message.token`.
    async fn publish(&self, message: &OutboundMessage) -> Result<(), EngineError>;

    async fn subscribe(&self, filters: &[(String, Qos)]) -> Result<(), EngineError>;

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), EngineError>;

    /// Cut short the engine's own reconnect backoff. Fails with
    /// `SessionActive` while the session is up and `NotConnected` when the
    /// engine is not retrying; callers then start a new handshake.
    async fn reconnect(&self) -> Result<(), EngineError>;

    /// Liveness probe used by the keep-alive scheduler
    async fn check_for_activity(&self) -> Result<(), EngineError>;

    async fn acknowledge_delivery(&self, packet_id: u16) -> Result<(), EngineError>;

    /// Release all engine resources; the engine is unusable afterwards
    async fn close(&self) -> Result<(), EngineError>;

    fn is_connected(&self) -> bool;
}

/// Builds one engine per registered client
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        identity: &ClientIdentity,
        events: EngineEventSender,
    ) -> Result<Arc<dyn ProtocolEngine>, EngineError>;
}

/// Channel pair for a new engine
pub fn engine_event_channel() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        let errors = vec![
            EngineError::ConnectionFailed("refused".to_string().into()),
            EngineError::ConnectionFailedStr("timeout".to_string()),
            EngineError::PublishFailed("full".to_string().into()),
            EngineError::SubscriptionFailed("denied".to_string().into()),
            EngineError::InvalidBrokerUrl("nope".to_string()),
            EngineError::NotConnected,
            EngineError::SessionActive,
            EngineError::Closed,
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[tokio::test]
    async fn test_event_channel_preserves_order() {
        let (tx, mut rx) = engine_event_channel();
        tx.send(EngineEvent::DeliveryComplete {
            token: DeliveryToken(1),
        })
        .unwrap();
        tx.send(EngineEvent::ConnectionLost {
            cause: "eof".to_string(),
        })
        .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(EngineEvent::DeliveryComplete {
                token: DeliveryToken(1)
            })
        );
        assert!(matches!(
            rx.recv().await,
            Some(EngineEvent::ConnectionLost { .. })
        ));
    }
}
