// tests/search_engine.rs
// Semantic + full-text search with access filtering and grouping

mod common;

use std::sync::Arc;

use memory_service::access::{AccessControl, Principal};
use memory_service::embedding::{DisabledEmbeddings, EmbeddingProvider};
use memory_service::error::CoreError;
use memory_service::model::{Channel, NewEntry};
use memory_service::search::{GroupBy, SearchEngine, SearchRequest, SearchType};
use memory_service::store::{AppendEntriesRequest, Datastore};
use memory_service::vector::{ColocatedVectorIndex, VectorIndex};

use common::{StubEmbeddings, env_over, env_with_vector, sqlite_store, text_blocks};

fn history_indexed(text: &str) -> NewEntry {
    NewEntry {
        id: None,
        channel: Channel::History,
        content: text_blocks(text),
        indexed_content: Some(text.to_string()),
        attachment_refs: Vec::new(),
    }
}

#[tokio::test]
async fn fulltext_search_is_membership_scoped_and_grouped() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    let env = env_over(store.clone());
    let alice = Principal::user("alice");
    let bob = Principal::user("bob");

    // Alice's conversation mentions rust twice; bob's mentions it once.
    let alice_conversation = env.engine.create_conversation(&alice, None).await.unwrap();
    env.engine
        .append_entries(
            &alice,
            AppendEntriesRequest {
                conversation_id: alice_conversation.id,
                entries: vec![
                    history_indexed("rust ownership rules"),
                    history_indexed("more rust borrow checker notes"),
                ],
                client_id: None,
                epoch: None,
                fork: None,
            },
        )
        .await
        .unwrap();

    let bob_conversation = env.engine.create_conversation(&bob, None).await.unwrap();
    env.engine
        .append_entries(
            &bob,
            AppendEntriesRequest {
                conversation_id: bob_conversation.id,
                entries: vec![history_indexed("rust in bobs private notes")],
                client_id: None,
                epoch: None,
                fork: None,
            },
        )
        .await
        .unwrap();

    let engine = SearchEngine::new(
        store.clone(),
        env.access.clone(),
        None,
        Arc::new(DisabledEmbeddings),
        100,
    );

    // Grouped: at most one hit per conversation, and only alice's.
    let hits = engine
        .search(&alice, SearchRequest::auto("rust"))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].conversation_id, alice_conversation.id);

    // Ungrouped: both of alice's entries match.
    let hits = engine
        .search(
            &alice,
            SearchRequest {
                query: "rust".into(),
                search_type: SearchType::Fulltext,
                group_by: GroupBy::None,
                limit: 10,
                offset: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);

    // Bob only ever sees his own conversation.
    let hits = engine
        .search(&bob, SearchRequest::auto("rust"))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].conversation_id, bob_conversation.id);
}

#[tokio::test]
async fn semantic_search_uses_the_colocated_index() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    let embedding: Arc<dyn EmbeddingProvider> = Arc::new(StubEmbeddings { dims: 8 });
    let vector = Arc::new(ColocatedVectorIndex::new(store.pool().clone()));
    vector.ensure_ready(8).await.unwrap();

    let env = env_with_vector(store.clone(), vector.clone(), embedding.clone());
    let alice = Principal::user("alice");

    let conversation = env.engine.create_conversation(&alice, None).await.unwrap();
    // Appending HISTORY entries with projections indexes them inline.
    env.engine
        .append_entries(
            &alice,
            AppendEntriesRequest {
                conversation_id: conversation.id,
                entries: vec![
                    history_indexed("the memory service stores embeddings"),
                    history_indexed("unrelated grocery list"),
                ],
                client_id: None,
                epoch: None,
                fork: None,
            },
        )
        .await
        .unwrap();

    let engine = SearchEngine::new(
        store.clone(),
        env.access.clone(),
        Some(vector.clone()),
        embedding,
        100,
    );

    let hits = engine
        .search(
            &alice,
            SearchRequest {
                query: "memory service embeddings".into(),
                search_type: SearchType::Semantic,
                group_by: GroupBy::None,
                limit: 10,
                offset: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    // A stranger's semantic search sees nothing: the JOIN scopes by membership.
    let mallory = Principal::user("mallory");
    let empty = engine
        .search(
            &mallory,
            SearchRequest {
                query: "memory service embeddings".into(),
                search_type: SearchType::Semantic,
                group_by: GroupBy::None,
                limit: 10,
                offset: 0,
            },
        )
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn explicit_semantic_request_without_backends_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    let access = Arc::new(AccessControl::new(
        store.clone() as Arc<dyn Datastore>
    ));
    let engine = SearchEngine::new(store, access, None, Arc::new(DisabledEmbeddings), 100);

    let err = engine
        .search(
            &Principal::user("alice"),
            SearchRequest {
                query: "anything".into(),
                search_type: SearchType::Semantic,
                group_by: GroupBy::Conversation,
                limit: 10,
                offset: 0,
            },
        )
        .await
        .unwrap_err();
    match err {
        CoreError::SearchTypeUnavailable { available } => {
            assert!(available.contains(&SearchType::Fulltext));
            assert!(!available.contains(&SearchType::Semantic));
        }
        other => panic!("expected SearchTypeUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_query_short_circuits_to_no_results() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    let access = Arc::new(AccessControl::new(store.clone() as Arc<dyn Datastore>));
    let engine = SearchEngine::new(store, access, None, Arc::new(DisabledEmbeddings), 100);

    let hits = engine
        .search(&Principal::user("alice"), SearchRequest::auto("   "))
        .await
        .unwrap();
    assert!(hits.is_empty());
}
