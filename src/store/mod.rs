//! Durable storage for inbound messages
//!
//! Every message that arrives from a broker is written here before any
//! listener sees it, so a process crash between arrival and consumption
//! loses nothing. Records are scoped by `ClientIdentity` and come back in
//! arrival order.

use crate::types::{ClientIdentity, InboundMessage, Qos};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod sled_store;

pub use memory::MemoryMessageStore;
pub use sled_store::SledMessageStore;

/// A persisted inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Unique id handed to the application for acknowledgment
    pub message_id: String,
    pub client: ClientIdentity,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retained: bool,
    pub duplicate: bool,
    pub arrived_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Message store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(#[from] sled::Error),
    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable per-client message backlog
///
/// Implementations must make each `save` and `delete` atomic and durable
/// before returning, and must never leak records across identities.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist an arrival and assign its message id
    async fn save(
        &self,
        client: &ClientIdentity,
        message: &InboundMessage,
    ) -> Result<StoredMessage, StoreError>;

    /// Remove one record; returns false when it was not present
    async fn delete(&self, client: &ClientIdentity, message_id: &str) -> Result<bool, StoreError>;

    /// All records for `client`, oldest first
    async fn get_all(&self, client: &ClientIdentity) -> Result<Vec<StoredMessage>, StoreError>;

    /// Remove every record for `client`, returning how many were removed
    async fn clear(&self, client: &ClientIdentity) -> Result<usize, StoreError>;

    async fn count(&self, client: &ClientIdentity) -> Result<usize, StoreError> {
        Ok(self.get_all(client).await?.len())
    }
}
