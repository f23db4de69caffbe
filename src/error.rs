//! Error types for the connection manager
//!
//! Each layer owns a narrow error enum (`EngineError`, `StoreError`,
//! `ConfigError`); `HermesError` is what the public registry and connection
//! APIs return. Precondition violations are returned synchronously, engine
//! failures after a request has been accepted travel as events instead.

use crate::connection::ConnectionState;
use crate::types::ClientIdentity;
use thiserror::Error;

/// Main error type for registry and connection operations
#[derive(Debug, Error)]
pub enum HermesError {
    #[error("Unknown client: {0}")]
    UnknownClient(ClientIdentity),

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(#[from] crate::store::StoreError),

    #[error("Transient network loss: {0}")]
    TransientNetworkLoss(String),

    #[error("Connection closed")]
    Closed,

    #[error("Connect aborted: {0}")]
    ConnectAborted(String),

    #[error("Offline buffer full ({capacity} messages)")]
    BufferFull { capacity: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Unsubscribe failed: {0}")]
    UnsubscribeFailed(String),

    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),

    #[error("Protocol engine error: {0}")]
    Engine(#[from] crate::transport::EngineError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl HermesError {
    /// Create invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create handshake failure error
    pub fn handshake_failure<S: Into<String>>(message: S) -> Self {
        Self::HandshakeFailure(message.into())
    }

    /// True for errors that a later `reconnect()` may clear on its own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HermesError::TransientNetworkLoss(_)
                | HermesError::HandshakeFailure(_)
                | HermesError::NotConnected { .. }
                | HermesError::ConnectAborted(_)
        )
    }
}

/// Result type for connection manager operations
pub type HermesResult<T> = Result<T, HermesError>;
