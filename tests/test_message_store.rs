//! Message store contract tests
//!
//! Both backends must give the same answers: arrival order, identity
//! scoping and idempotent deletes. The sled backend must also survive a
//! reopen of its directory.

use hermes::store::{MemoryMessageStore, MessageStore, SledMessageStore};
use hermes::testing::inbound;
use hermes::types::ClientIdentity;
use tempfile::TempDir;

fn client(client_id: &str) -> ClientIdentity {
    ClientIdentity::new("tcp://broker.test:1883", client_id, "com.example.tests")
}

async fn check_store_contract(store: &dyn MessageStore) {
    let alice = client("alice");
    let bob = client("bob");

    let first = store.save(&alice, &inbound("a/1", "one", 1)).await.unwrap();
    let second = store.save(&alice, &inbound("a/2", "two", 2)).await.unwrap();
    store.save(&bob, &inbound("b/1", "other", 3)).await.unwrap();
    assert_ne!(first.message_id, second.message_id);
    assert_eq!(first.client, alice);

    let backlog = store.get_all(&alice).await.unwrap();
    assert_eq!(
        backlog.iter().map(|m| m.topic.as_str()).collect::<Vec<_>>(),
        vec!["a/1", "a/2"]
    );

    assert!(store.delete(&alice, &first.message_id).await.unwrap());
    assert!(!store.delete(&alice, &first.message_id).await.unwrap());
    // Another identity cannot remove alice's records
    assert!(!store.delete(&bob, &second.message_id).await.unwrap());
    assert_eq!(store.count(&alice).await.unwrap(), 1);

    assert_eq!(store.clear(&alice).await.unwrap(), 1);
    assert_eq!(store.count(&alice).await.unwrap(), 0);
    assert_eq!(store.count(&bob).await.unwrap(), 1);
}

#[tokio::test]
async fn test_memory_store_contract() {
    check_store_contract(&MemoryMessageStore::new()).await;
}

#[tokio::test]
async fn test_sled_store_contract() {
    let dir = TempDir::new().unwrap();
    let store = SledMessageStore::open(dir.path()).unwrap();
    check_store_contract(&store).await;
}

#[tokio::test]
async fn test_sled_backlog_survives_reopen_in_order() {
    let dir = TempDir::new().unwrap();
    let alice = client("alice");

    let saved: Vec<String> = {
        let store = SledMessageStore::open(dir.path()).unwrap();
        let mut ids = Vec::new();
        for n in 0..5u16 {
            let stored = store
                .save(&alice, &inbound(&format!("t/{n}"), "x", n + 1))
                .await
                .unwrap();
            ids.push(stored.message_id);
        }
        store.delete(&alice, &ids[1]).await.unwrap();
        ids
    };

    let reopened = SledMessageStore::open(dir.path()).unwrap();
    let backlog = reopened.get_all(&alice).await.unwrap();
    let ids: Vec<_> = backlog.iter().map(|m| m.message_id.clone()).collect();
    assert_eq!(ids, vec![saved[0].clone(), saved[2].clone(), saved[3].clone(), saved[4].clone()]);

    // New saves after a reopen still sort after the old ones
    let later = reopened.save(&alice, &inbound("t/late", "x", 99)).await.unwrap();
    let backlog = reopened.get_all(&alice).await.unwrap();
    assert_eq!(backlog.last().unwrap().message_id, later.message_id);
}

#[tokio::test]
async fn test_stored_message_keeps_delivery_flags() {
    let store = SledMessageStore::temporary().unwrap();
    let alice = client("alice");
    let mut message = inbound("flags", "payload", 4);
    message.retained = true;
    message.duplicate = true;

    let stored = store.save(&alice, &message).await.unwrap();
    let loaded = store.get_all(&alice).await.unwrap().remove(0);

    assert_eq!(loaded, stored);
    assert!(loaded.retained);
    assert!(loaded.duplicate);
    assert_eq!(loaded.payload_str(), Some("payload"));
}
