// tests/conversation_flow.rs
// Conversation engine end-to-end: forks, epochs, sync idempotence, cursors

mod common;

use memory_service::access::Principal;
use memory_service::conversation::ListEntriesParams;
use memory_service::error::CoreError;
use memory_service::model::{Channel, EpochFilter, NewEntry};
use memory_service::store::{AppendEntriesRequest, Datastore, ListEntriesQuery};
use uuid::Uuid;

use common::{env_over, sqlite_store, text_blocks};

fn history(text: &str) -> NewEntry {
    NewEntry {
        id: None,
        channel: Channel::History,
        content: text_blocks(text),
        indexed_content: Some(text.to_string()),
        attachment_refs: Vec::new(),
    }
}

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
async fn fork_visibility_across_branches() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_over(sqlite_store(&dir).await);
    let alice = Principal::user("alice");

    let root = env
        .engine
        .create_conversation(&alice, Some("root".into()))
        .await
        .unwrap();

    let appended = env
        .engine
        .append_entries(
            &alice,
            AppendEntriesRequest {
                conversation_id: root.id,
                entries: vec![history("h1"), history("h2"), history("h3")],
                client_id: None,
                epoch: None,
                fork: None,
            },
        )
        .await
        .unwrap();
    let h2 = appended[1].id;

    // Fork at h2 with a seed entry.
    let fork_id = Uuid::new_v4();
    let fork = env
        .engine
        .fork_conversation_at_entry(&alice, fork_id, root.id, h2, Some(history("u")))
        .await
        .unwrap();
    assert_eq!(fork.conversation_group_id, root.conversation_group_id);
    assert_eq!(fork.forked_at_entry_id, Some(h2));

    // Branch-local view: just the seed.
    let local = env
        .engine
        .list_entries(
            &alice,
            fork_id,
            ListEntriesParams {
                channel: Some(Channel::History),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let texts: Vec<&str> = local
        .iter()
        .map(|e| e.content[0]["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, ["u"]);

    // Fork-aware view: ancestor prefix up to h2, then the seed.
    let merged = env
        .engine
        .list_entries(
            &alice,
            fork_id,
            ListEntriesParams {
                channel: Some(Channel::History),
                all_forks: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let texts: Vec<&str> = merged
        .iter()
        .map(|e| e.content[0]["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, ["h1", "h2", "u"]);

    // The root still sees its own three entries only.
    let root_view = env
        .engine
        .list_entries(
            &alice,
            root.id,
            ListEntriesParams {
                channel: Some(Channel::History),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(root_view.len(), 3);
}

#[tokio::test]
async fn fork_is_idempotent_and_parent_mismatch_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_over(sqlite_store(&dir).await);
    let alice = Principal::user("alice");

    let root = env.engine.create_conversation(&alice, None).await.unwrap();
    let entries = env
        .engine
        .append_entries(
            &alice,
            AppendEntriesRequest {
                conversation_id: root.id,
                entries: vec![history("a"), history("b")],
                client_id: None,
                epoch: None,
                fork: None,
            },
        )
        .await
        .unwrap();

    let fork_id = Uuid::new_v4();
    let first = env
        .engine
        .fork_conversation_at_entry(&alice, fork_id, root.id, entries[0].id, None)
        .await
        .unwrap();

    // Same id, same point: the existing fork comes back.
    let second = env
        .engine
        .fork_conversation_at_entry(&alice, fork_id, root.id, entries[0].id, None)
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    // Same id, different point: conflict.
    let err = env
        .engine
        .fork_conversation_at_entry(&alice, fork_id, root.id, entries[1].id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    // Unknown ancestor entry: not found.
    let err = env
        .engine
        .fork_conversation_at_entry(&alice, Uuid::new_v4(), root.id, Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn memory_epochs_assign_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_over(sqlite_store(&dir).await);
    let alice = Principal::user("alice");

    let conversation = env.engine.create_conversation(&alice, None).await.unwrap();

    for round in 1..=3 {
        let entries = env
            .engine
            .append_entries(
                &alice,
                AppendEntriesRequest {
                    conversation_id: conversation.id,
                    entries: vec![memory_entry(&format!("snapshot {round} a")), memory_entry("b")],
                    client_id: Some("agent-1".into()),
                    epoch: None,
                    fork: None,
                },
            )
            .await
            .unwrap();
        assert!(entries.iter().all(|e| e.epoch == Some(round)));
        assert!(entries.iter().all(|e| e.client_id.as_deref() == Some("agent-1")));
    }

    // Latest-epoch read returns only epoch 3, never a mix.
    let latest = env
        .engine
        .list_entries(
            &alice,
            conversation.id,
            ListEntriesParams {
                channel: Some(Channel::Memory),
                client_id: Some("agent-1".into()),
                epoch: Some(EpochFilter::Latest),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(latest.len(), 2);
    assert!(latest.iter().all(|e| e.epoch == Some(3)));

    let exact = env
        .engine
        .list_entries(
            &alice,
            conversation.id,
            ListEntriesParams {
                channel: Some(Channel::Memory),
                client_id: Some("agent-1".into()),
                epoch: Some(EpochFilter::Exact(2)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(exact.iter().all(|e| e.epoch == Some(2)));

    assert_eq!(
        env.engine
            .latest_memory_epoch(&alice, conversation.id, "agent-1")
            .await
            .unwrap(),
        Some(3)
    );
    // A different client has its own epoch sequence.
    assert_eq!(
        env.engine
            .latest_memory_epoch(&alice, conversation.id, "agent-2")
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn memory_reads_without_client_id_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_over(sqlite_store(&dir).await);
    let alice = Principal::user("alice");
    let conversation = env.engine.create_conversation(&alice, None).await.unwrap();

    let err = env
        .engine
        .list_entries(
            &alice,
            conversation.id,
            ListEntriesParams {
                channel: Some(Channel::Memory),
                client_id: None,
                epoch: Some(EpochFilter::All),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn sync_agent_entry_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_over(sqlite_store(&dir).await);
    let alice = Principal::user("alice").with_client("agent-1");

    let conversation = env.engine.create_conversation(&alice, None).await.unwrap();
    let entry_id = Uuid::new_v4();
    let entry = NewEntry {
        id: Some(entry_id),
        channel: Channel::Summary,
        content: text_blocks("summary of the prefix"),
        indexed_content: None,
        attachment_refs: Vec::new(),
    };

    let first = env
        .engine
        .sync_agent_entry(&alice, conversation.id, entry.clone(), None)
        .await
        .unwrap();
    assert!(!first.already_existed);
    assert_eq!(first.entry.id, entry_id);

    let second = env
        .engine
        .sync_agent_entry(&alice, conversation.id, entry, None)
        .await
        .unwrap();
    assert!(second.already_existed);
    assert_eq!(second.entry.id, entry_id);

    // No duplicate storage.
    let all = env
        .engine
        .list_entries(
            &alice,
            conversation.id,
            ListEntriesParams {
                channel: Some(Channel::Summary),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn foreign_cursor_falls_back_to_start_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_over(sqlite_store(&dir).await);
    let alice = Principal::user("alice");

    let a = env.engine.create_conversation(&alice, None).await.unwrap();
    let b = env.engine.create_conversation(&alice, None).await.unwrap();

    let a_entries = env
        .engine
        .append_entries(
            &alice,
            AppendEntriesRequest {
                conversation_id: a.id,
                entries: vec![history("a1"), history("a2")],
                client_id: None,
                epoch: None,
                fork: None,
            },
        )
        .await
        .unwrap();
    let b_entries = env
        .engine
        .append_entries(
            &alice,
            AppendEntriesRequest {
                conversation_id: b.id,
                entries: vec![history("b1"), history("b2")],
                client_id: None,
                epoch: None,
                fork: None,
            },
        )
        .await
        .unwrap();

    // Cursor from conversation B against conversation A: start of range.
    let listed = env
        .store
        .list_entries(ListEntriesQuery {
            conversation_id: a.id,
            channel: Some(Channel::History),
            client_id: None,
            epoch: None,
            after_entry_id: Some(b_entries[0].id),
            up_to_entry_id: None,
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);

    // A valid cursor resumes strictly after the given entry.
    let listed = env
        .store
        .list_entries(ListEntriesQuery {
            conversation_id: a.id,
            channel: Some(Channel::History),
            client_id: None,
            epoch: None,
            after_entry_id: Some(a_entries[0].id),
            up_to_entry_id: None,
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, a_entries[1].id);
}

#[tokio::test]
async fn group_soft_delete_cascades_and_hides_everything() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_over(sqlite_store(&dir).await);
    let alice = Principal::user("alice");

    let conversation = env.engine.create_conversation(&alice, None).await.unwrap();
    env.engine
        .append_entries(
            &alice,
            AppendEntriesRequest {
                conversation_id: conversation.id,
                entries: vec![history("doomed")],
                client_id: None,
                epoch: None,
                fork: None,
            },
        )
        .await
        .unwrap();

    env.engine
        .delete_conversation_group(&alice, conversation.conversation_group_id)
        .await
        .unwrap();

    // The group, conversation, and entries are gone from every read path.
    assert!(matches!(
        env.engine.get_conversation(&alice, conversation.id).await,
        Err(CoreError::NotFound(_))
    ));
    assert!(matches!(
        env.store.get_group(conversation.conversation_group_id).await,
        Err(CoreError::NotFound(_))
    ));

    // The vector cleanup task was enqueued in the same transaction.
    let task = env
        .store
        .find_task_by_name(&format!(
            "vector_store_delete:{}",
            conversation.conversation_group_id
        ))
        .await
        .unwrap();
    assert!(task.is_some());
    assert_eq!(
        task.unwrap().task_body["conversationGroupId"],
        serde_json::json!(conversation.conversation_group_id)
    );
}

#[tokio::test]
async fn access_is_enforced_and_ambiguous() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_over(sqlite_store(&dir).await);
    let alice = Principal::user("alice");
    let mallory = Principal::user("mallory");

    let conversation = env.engine.create_conversation(&alice, None).await.unwrap();

    // A stranger sees NOT_FOUND, not FORBIDDEN: no existence oracle.
    assert!(matches!(
        env.engine.get_conversation(&mallory, conversation.id).await,
        Err(CoreError::NotFound(_))
    ));

    // A reader can read but not write.
    env.sharing
        .share(
            &alice,
            conversation.conversation_group_id,
            "bob",
            memory_service::model::AccessLevel::Reader,
        )
        .await
        .unwrap();
    let bob = Principal::user("bob");
    assert!(env.engine.get_conversation(&bob, conversation.id).await.is_ok());
    let err = env
        .engine
        .append_entries(
            &bob,
            AppendEntriesRequest {
                conversation_id: conversation.id,
                entries: vec![history("nope")],
                client_id: None,
                epoch: None,
                fork: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));
}
