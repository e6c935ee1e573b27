// tests/epoch_concurrency.rs
// Epoch assignment must serialize under concurrent appends

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use memory_service::error::CoreError;
use memory_service::model::{Channel, EpochFilter, NewEntry};
use memory_service::store::{AppendEntriesRequest, Datastore, ListEntriesQuery};

use common::{sqlite_store, text_blocks};

fn memory_entry(text: &str) -> NewEntry {
    NewEntry {
        id: None,
        channel: Channel::Memory,
        content: text_blocks(text),
        indexed_content: None,
        attachment_refs: Vec::new(),
    }
}

#[tokio::test]
async fn concurrent_implicit_epochs_never_collide() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    let conversation = store
        .create_root_conversation("alice", None)
        .await
        .unwrap();

    let workers = 8;
    let mut handles = Vec::new();
    for i in 0..workers {
        let store: Arc<dyn Datastore> = store.clone();
        let conversation_id = conversation.id;
        handles.push(tokio::spawn(async move {
            store
                .append_entries(AppendEntriesRequest {
                    conversation_id,
                    entries: vec![memory_entry(&format!("snapshot {i}"))],
                    client_id: Some("agent-1".into()),
                    epoch: None,
                    fork: None,
                })
                .await
        }));
    }

    let mut epochs = BTreeSet::new();
    for handle in handles {
        let entries = handle.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        let epoch = entries[0].epoch.unwrap();
        assert!(epochs.insert(epoch), "duplicate epoch {epoch}");
    }

    // No duplicates, no gaps: exactly 1..=workers.
    let expected: BTreeSet<i64> = (1..=workers as i64).collect();
    assert_eq!(epochs, expected);
}

#[tokio::test]
async fn explicit_epoch_collision_loses_with_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    let conversation = store
        .create_root_conversation("alice", None)
        .await
        .unwrap();

    store
        .append_entries(AppendEntriesRequest {
            conversation_id: conversation.id,
            entries: vec![memory_entry("first")],
            client_id: Some("agent-1".into()),
            epoch: Some(7),
            fork: None,
        })
        .await
        .unwrap();

    let err = store
        .append_entries(AppendEntriesRequest {
            conversation_id: conversation.id,
            entries: vec![memory_entry("second")],
            client_id: Some("agent-1".into()),
            epoch: Some(7),
            fork: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    // A different client may reuse the number: epochs are per (conversation, client).
    store
        .append_entries(AppendEntriesRequest {
            conversation_id: conversation.id,
            entries: vec![memory_entry("other client")],
            client_id: Some("agent-2".into()),
            epoch: Some(7),
            fork: None,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn latest_epoch_read_is_atomic_per_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    let conversation = store
        .create_root_conversation("alice", None)
        .await
        .unwrap();

    // Interleave writers and latest-epoch readers; a reader must never see
    // entries from two different epochs in one result.
    let writer = {
        let store: Arc<dyn Datastore> = store.clone();
        let conversation_id = conversation.id;
        tokio::spawn(async move {
            for i in 0..10 {
                store
                    .append_entries(AppendEntriesRequest {
                        conversation_id,
                        entries: vec![
                            memory_entry(&format!("{i}-a")),
                            memory_entry(&format!("{i}-b")),
                        ],
                        client_id: Some("agent-1".into()),
                        epoch: None,
                        fork: None,
                    })
                    .await
                    .unwrap();
            }
        })
    };

    for _ in 0..20 {
        let entries = store
            .list_entries(ListEntriesQuery {
                conversation_id: conversation.id,
                channel: Some(Channel::Memory),
                client_id: Some("agent-1".into()),
                epoch: Some(EpochFilter::Latest),
                after_entry_id: None,
                up_to_entry_id: None,
                limit: 0,
            })
            .await
            .unwrap();
        let distinct: BTreeSet<Option<i64>> = entries.iter().map(|e| e.epoch).collect();
        assert!(distinct.len() <= 1, "mixed epochs in one read: {distinct:?}");
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
}
