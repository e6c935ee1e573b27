// tests/tasks_processor.rs
// Claim protocol, singleton tasks, backoff, and the built-in handlers

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use memory_service::access::{Principal, Role};
use memory_service::attachments::{AttachmentService, AttachmentStore, FsAttachmentStore, UploadRequest};
use memory_service::config::{AttachmentsConfig, TasksConfig};
use memory_service::conversation::IndexEntryRequest;
use memory_service::crypto::EncryptionService;
use memory_service::model::{Channel, NewEntry, task_types};
use memory_service::store::{AppendEntriesRequest, Datastore, NewTask};
use memory_service::tasks::TaskProcessor;

use common::{FlakyVectorIndex, StubEmbeddings, env_with_vector, sqlite_store, text_blocks};

fn tasks_config() -> TasksConfig {
    TasksConfig {
        interval: Duration::from_secs(1),
        batch_size: 10,
        stale_claim_timeout: Duration::from_secs(300),
        base_backoff: Duration::from_secs(5),
        max_backoff: Duration::from_secs(60),
        task_timeout: Duration::from_secs(10),
        eviction_interval: Duration::from_secs(3600),
    }
}

fn attachments_config(dir: &tempfile::TempDir) -> AttachmentsConfig {
    AttachmentsConfig {
        root: dir.path().join("blobs").to_string_lossy().into_owned(),
        allow_private_source_urls: false,
        orphan_ttl: Duration::from_secs(0),
        tombstone_retention: Duration::from_secs(0),
        url_signing_key: String::new(),
        signed_url_ttl: Duration::from_secs(900),
    }
}

#[tokio::test]
async fn named_task_creation_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;

    let first = store
        .create_task(NewTask {
            task_name: Some("singleton".into()),
            task_type: "test".into(),
            task_body: serde_json::json!({}),
            retry_at: Utc::now(),
        })
        .await
        .unwrap();
    let second = store
        .create_task(NewTask {
            task_name: Some("singleton".into()),
            task_type: "test".into(),
            task_body: serde_json::json!({ "other": true }),
            retry_at: Utc::now(),
        })
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
    let stored = store.find_task_by_name("singleton").await.unwrap().unwrap();
    assert_eq!(stored.task_body, serde_json::json!({}));
}

#[tokio::test]
async fn claims_are_exclusive_until_stale() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    let now = Utc::now();

    store
        .create_task(NewTask {
            task_name: Some("claimed-once".into()),
            task_type: "test".into(),
            task_body: serde_json::json!({}),
            retry_at: now,
        })
        .await
        .unwrap();

    let first = store
        .claim_due_tasks(now, 10, Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    // While the claim is live, nobody else gets it.
    let second = store
        .claim_due_tasks(now, 10, Duration::from_secs(300))
        .await
        .unwrap();
    assert!(second.is_empty());

    // A worker that died releases the task via the stale-claim window.
    let later = now + chrono::Duration::seconds(600);
    let reclaimed = store
        .claim_due_tasks(later, 10, Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, first[0].id);
}

#[tokio::test]
async fn failed_tasks_back_off_and_release_the_claim() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    let blob_dir = tempfile::tempdir().unwrap();

    store
        .create_task(NewTask {
            task_name: Some("broken".into()),
            task_type: "no_such_handler".into(),
            task_body: serde_json::json!({}),
            retry_at: Utc::now(),
        })
        .await
        .unwrap();

    let processor = TaskProcessor::new(
        store.clone(),
        None,
        Arc::new(StubEmbeddings { dims: 4 }),
        Arc::new(FsAttachmentStore::new(
            blob_dir.path(),
            Arc::new(EncryptionService::disabled()),
            None,
            Duration::from_secs(900),
        )),
        tasks_config(),
        attachments_config(&blob_dir),
    );

    assert_eq!(processor.tick().await.unwrap(), 0);

    let stored = store.find_task_by_name("broken").await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 1);
    assert!(stored.processing_at.is_none());
    assert!(stored.last_error.is_some());
    assert!(stored.retry_at > Utc::now());
}

#[tokio::test]
async fn index_retry_task_completes_once_vector_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    let blob_dir = tempfile::tempdir().unwrap();

    let vector = Arc::new(FlakyVectorIndex::new());
    let embedding = Arc::new(StubEmbeddings { dims: 4 });
    let env = env_with_vector(store.clone(), vector.clone(), embedding.clone());

    let alice = Principal::user("alice");
    let conversation = env.engine.create_conversation(&alice, None).await.unwrap();
    let entries = env
        .engine
        .append_entries(
            &alice,
            AppendEntriesRequest {
                conversation_id: conversation.id,
                entries: vec![NewEntry {
                    id: None,
                    channel: Channel::History,
                    content: text_blocks("searchable"),
                    indexed_content: None,
                    attachment_refs: Vec::new(),
                }],
                client_id: None,
                epoch: None,
                fork: None,
            },
        )
        .await
        .unwrap();
    let entry_id = entries[0].id;

    // Indexing writes the projection but the vector upsert fails, which
    // must schedule exactly one singleton retry and still succeed.
    vector.set_failing(true);
    let indexer = Principal::api_key([Role::Indexer]);
    let outcome = env
        .engine
        .index_entries(
            &indexer,
            vec![IndexEntryRequest {
                entry_id,
                indexed_content: "searchable text".into(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(outcome.indexed, 0);
    assert_eq!(outcome.scheduled_retries, 1);

    let task_name = format!("{}:{}", task_types::ENTRY_VECTOR_INDEX_RETRY, entry_id);
    assert!(store.find_task_by_name(&task_name).await.unwrap().is_some());

    let entry = store.get_entry(entry_id).await.unwrap();
    assert_eq!(entry.indexed_content.as_deref(), Some("searchable text"));
    assert!(entry.indexed_at.is_none());

    // Vector store recovers; the next tick indexes and deletes the task.
    vector.set_failing(false);
    let processor = TaskProcessor::new(
        store.clone(),
        Some(vector.clone()),
        embedding,
        Arc::new(FsAttachmentStore::new(
            blob_dir.path(),
            Arc::new(EncryptionService::disabled()),
            None,
            Duration::from_secs(900),
        )),
        tasks_config(),
        attachments_config(&blob_dir),
    );
    assert_eq!(processor.tick().await.unwrap(), 1);

    assert!(store.find_task_by_name(&task_name).await.unwrap().is_none());
    let entry = store.get_entry(entry_id).await.unwrap();
    assert!(entry.indexed_at.is_some());
    assert_eq!(vector.stored_entry_ids(), vec![entry_id]);
}

#[tokio::test]
async fn vector_store_delete_task_clears_the_group() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    let blob_dir = tempfile::tempdir().unwrap();

    let vector = Arc::new(FlakyVectorIndex::new());
    let embedding = Arc::new(StubEmbeddings { dims: 4 });
    let env = env_with_vector(store.clone(), vector.clone(), embedding.clone());

    let alice = Principal::user("alice");
    let conversation = env.engine.create_conversation(&alice, None).await.unwrap();
    let entries = env
        .engine
        .append_entries(
            &alice,
            AppendEntriesRequest {
                conversation_id: conversation.id,
                entries: vec![NewEntry {
                    id: None,
                    channel: Channel::History,
                    content: text_blocks("to be deleted"),
                    indexed_content: Some("to be deleted".into()),
                    attachment_refs: Vec::new(),
                }],
                client_id: None,
                epoch: None,
                fork: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(vector.stored_entry_ids(), vec![entries[0].id]);

    env.engine
        .delete_conversation_group(&alice, conversation.conversation_group_id)
        .await
        .unwrap();

    let processor = TaskProcessor::new(
        store.clone(),
        Some(vector.clone()),
        embedding,
        Arc::new(FsAttachmentStore::new(
            blob_dir.path(),
            Arc::new(EncryptionService::disabled()),
            None,
            Duration::from_secs(900),
        )),
        tasks_config(),
        attachments_config(&blob_dir),
    );
    assert_eq!(processor.tick().await.unwrap(), 1);
    assert!(vector.stored_entry_ids().is_empty());
}

#[tokio::test]
async fn attachment_eviction_hard_deletes_expired_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    let blob_dir = tempfile::tempdir().unwrap();

    let blobs = Arc::new(FsAttachmentStore::new(
        blob_dir.path().join("blobs"),
        Arc::new(EncryptionService::disabled()),
        None,
        Duration::from_secs(900),
    ));
    let env = common::env_over(store.clone());
    let service = AttachmentService::new(
        store.clone(),
        blobs.clone(),
        env.access.clone(),
        attachments_config(&blob_dir),
    );

    let alice = Principal::user("alice");
    // orphan_ttl is zero, so this upload is immediately evictable.
    let attachment = service
        .upload(
            &alice,
            UploadRequest {
                filename: "notes.txt".into(),
                content_type: "text/plain".into(),
            },
            Box::pin(futures::stream::once(async {
                Ok(bytes::Bytes::from_static(b"orphaned"))
            })),
        )
        .await
        .unwrap();

    store
        .create_task(NewTask {
            task_name: Some(task_types::ATTACHMENT_EVICTION.to_string()),
            task_type: task_types::ATTACHMENT_EVICTION.to_string(),
            task_body: serde_json::json!({}),
            retry_at: Utc::now(),
        })
        .await
        .unwrap();

    let processor = TaskProcessor::new(
        store.clone(),
        None,
        Arc::new(StubEmbeddings { dims: 4 }),
        blobs.clone(),
        tasks_config(),
        attachments_config(&blob_dir),
    );
    assert_eq!(processor.tick().await.unwrap(), 1);

    assert!(store.get_attachment(attachment.id).await.is_err());
    assert!(blobs.get(&attachment.storage_key).await.is_err());

    // The recurring singleton re-armed itself for the next sweep.
    let rearmed = store
        .find_task_by_name(task_types::ATTACHMENT_EVICTION)
        .await
        .unwrap()
        .unwrap();
    assert!(rearmed.retry_at > Utc::now());
}
