//! Volatile message store
//!
//! Same contract as the sled store minus durability. Used when no store path
//! is configured and by the test suite.

use super::{MessageStore, StoreError, StoredMessage};
use crate::types::{ClientIdentity, InboundMessage};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_sequence: u64,
    clients: HashMap<ClientIdentity, BTreeMap<u64, StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save(
        &self,
        client: &ClientIdentity,
        message: &InboundMessage,
    ) -> Result<StoredMessage, StoreError> {
        let mut inner = self.inner.lock().await;
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let record = StoredMessage {
            message_id: Uuid::new_v4().to_string(),
            client: client.clone(),
            topic: message.topic.clone(),
            payload: message.payload.to_vec(),
            qos: message.qos,
            retained: message.retained,
            duplicate: message.duplicate,
            arrived_at: Utc::now(),
        };
        inner
            .clients
            .entry(client.clone())
            .or_default()
            .insert(sequence, record.clone());
        Ok(record)
    }

    async fn delete(&self, client: &ClientIdentity, message_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(records) = inner.clients.get_mut(client) else {
            return Ok(false);
        };
        let sequence = records
            .iter()
            .find(|(_, record)| record.message_id == message_id)
            .map(|(sequence, _)| *sequence);
        Ok(sequence.and_then(|s| records.remove(&s)).is_some())
    }

    async fn get_all(&self, client: &ClientIdentity) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .clients
            .get(client)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, client: &ClientIdentity) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .clients
            .remove(client)
            .map(|records| records.len())
            .unwrap_or(0))
    }
}
