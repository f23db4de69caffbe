//! sled-backed message store
//!
//! Key layout: `identity key` + `0x00` + big-endian sequence number. The
//! sequence comes from `Db::generate_id`, which is monotonic across restarts,
//! so a prefix scan returns one client's backlog in arrival order.

use super::{MessageStore, StoreError, StoredMessage};
use crate::types::{ClientIdentity, InboundMessage};
use async_trait::async_trait;
use chrono::Utc;
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

const TREE_NAME: &str = "inbound_messages";
const KEY_SEPARATOR: u8 = 0x00;

#[derive(Clone)]
pub struct SledMessageStore {
    db: Db,
    messages: Tree,
}

impl SledMessageStore {
    /// Open (or create) a store rooted at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(db)
    }

    /// Non-durable store for tests and dry runs
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        let messages = db.open_tree(TREE_NAME)?;
        Ok(Self { db, messages })
    }

    fn client_prefix(client: &ClientIdentity) -> Vec<u8> {
        let mut prefix = client.key().into_bytes();
        prefix.push(KEY_SEPARATOR);
        prefix
    }

    fn record_key(client: &ClientIdentity, sequence: u64) -> Vec<u8> {
        let mut key = Self::client_prefix(client);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    /// Message ids carry the sequence so deletes need no index lookup
    fn format_message_id(sequence: u64) -> String {
        format!("{sequence:016x}-{}", Uuid::new_v4())
    }

    fn parse_sequence(message_id: &str) -> Option<u64> {
        let (sequence, _) = message_id.split_once('-')?;
        u64::from_str_radix(sequence, 16).ok()
    }

    fn decode(bytes: &[u8]) -> Result<StoredMessage, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait]
impl MessageStore for SledMessageStore {
    async fn save(
        &self,
        client: &ClientIdentity,
        message: &InboundMessage,
    ) -> Result<StoredMessage, StoreError> {
        let sequence = self.db.generate_id()?;
        let record = StoredMessage {
            message_id: Self::format_message_id(sequence),
            client: client.clone(),
            topic: message.topic.clone(),
            payload: message.payload.to_vec(),
            qos: message.qos,
            retained: message.retained,
            duplicate: message.duplicate,
            arrived_at: Utc::now(),
        };

        let serialized = serde_json::to_vec(&record)?;
        self.messages
            .insert(Self::record_key(client, sequence), serialized)?;
        self.messages.flush_async().await?;

        debug!(
            client = %client,
            message_id = %record.message_id,
            topic = %record.topic,
            "Persisted inbound message"
        );
        Ok(record)
    }

    async fn delete(&self, client: &ClientIdentity, message_id: &str) -> Result<bool, StoreError> {
        let Some(sequence) = Self::parse_sequence(message_id) else {
            warn!(client = %client, message_id, "Ignoring malformed message id");
            return Ok(false);
        };

        let key = Self::record_key(client, sequence);
        let Some(existing) = self.messages.get(&key)? else {
            return Ok(false);
        };

        // Sequence collision guard: the uuid half must match too
        let record = Self::decode(&existing)?;
        if record.message_id != message_id {
            return Ok(false);
        }

        let removed = self
            .messages
            .compare_and_swap(&key, Some(existing), None as Option<&[u8]>)?
            .is_ok();
        if removed {
            self.messages.flush_async().await?;
        }
        Ok(removed)
    }

    async fn get_all(&self, client: &ClientIdentity) -> Result<Vec<StoredMessage>, StoreError> {
        self.messages
            .scan_prefix(Self::client_prefix(client))
            .map(|entry| {
                let (_, value) = entry?;
                Self::decode(&value)
            })
            .collect()
    }

    async fn clear(&self, client: &ClientIdentity) -> Result<usize, StoreError> {
        let mut batch = sled::Batch::default();
        let mut removed = 0usize;
        for entry in self.messages.scan_prefix(Self::client_prefix(client)) {
            let (key, _) = entry?;
            batch.remove(key);
            removed += 1;
        }

        if removed > 0 {
            self.messages.apply_batch(batch)?;
            self.messages.flush_async().await?;
        }
        debug!(client = %client, removed, "Cleared stored messages");
        Ok(removed)
    }

    async fn count(&self, client: &ClientIdentity) -> Result<usize, StoreError> {
        let mut count = 0usize;
        for entry in self.messages.scan_prefix(Self::client_prefix(client)) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

impl std::fmt::Debug for SledMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledMessageStore")
            .field("db", &"sled::Db")
            .field("tree", &TREE_NAME)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Qos;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn client(id: &str) -> ClientIdentity {
        ClientIdentity::new("tcp://localhost:1883", id, "test-app")
    }

    fn message(topic: &str, payload: &'static str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload.as_bytes()),
            qos: Qos::AtLeastOnce,
            retained: false,
            duplicate: false,
            packet_id: Some(1),
        }
    }

    #[test]
    fn test_message_id_carries_sequence() {
        let id = SledMessageStore::format_message_id(42);
        assert_eq!(SledMessageStore::parse_sequence(&id), Some(42));
        assert_eq!(SledMessageStore::parse_sequence("garbage"), None);
    }

    #[test]
    fn test_record_keys_sort_by_sequence() {
        let c = client("a");
        let first = SledMessageStore::record_key(&c, 9);
        let second = SledMessageStore::record_key(&c, 10);
        let third = SledMessageStore::record_key(&c, 256);
        assert!(first < second);
        assert!(second < third);
    }

    #[tokio::test]
    async fn test_save_get_delete() {
        let store = SledMessageStore::temporary().unwrap();
        let c = client("a");

        let saved = store.save(&c, &message("t/1", "hello")).await.unwrap();
        assert_eq!(saved.topic, "t/1");
        assert_eq!(saved.payload_str(), Some("hello"));

        let all = store.get_all(&c).await.unwrap();
        assert_eq!(all, vec![saved.clone()]);

        assert!(store.delete(&c, &saved.message_id).await.unwrap());
        assert!(!store.delete(&c, &saved.message_id).await.unwrap());
        assert!(store.get_all(&c).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_scoped_to_client() {
        let store = SledMessageStore::temporary().unwrap();
        let saved = store.save(&client("a"), &message("t", "x")).await.unwrap();

        assert!(!store.delete(&client("b"), &saved.message_id).await.unwrap());
        assert_eq!(store.count(&client("a")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let c = client("durable");
        {
            let store = SledMessageStore::open(dir.path()).unwrap();
            store.save(&c, &message("t", "one")).await.unwrap();
            store.save(&c, &message("t", "two")).await.unwrap();
        }

        let store = SledMessageStore::open(dir.path()).unwrap();
        let payloads: Vec<_> = store
            .get_all(&c)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
