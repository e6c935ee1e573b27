// src/conversation/mod.rs

//! Conversation engine: the append/sync/fork/list/index pipeline.
//!
//! Every operation runs the same explicit stages: access check → datastore
//! operation → post-commit side effects (epoch-cache invalidation, vector
//! indexing or its retry task). Indexing failures never fail the request
//! that triggered them.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::access::{AccessControl, Principal, Role};
use crate::cache::CacheAdapter;
use crate::embedding::EmbeddingProvider;
use crate::error::{CoreError, CoreResult};
use crate::model::{
    AccessLevel, Channel, Conversation, Entry, EpochFilter, ForkPoint, NewEntry, SyncResult,
    task_types,
};
use crate::store::{
    AppendEntriesRequest, Datastore, GroupEntriesQuery, ListEntriesQuery, NewTask,
};
use crate::vector::{EmbeddingPoint, VectorIndex};

/// Guard against pathological fork chains when walking ancestry.
const MAX_FORK_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct ListEntriesParams {
    pub channel: Option<Channel>,
    pub client_id: Option<String>,
    pub epoch: Option<EpochFilter>,
    /// Include the ancestor prefix of each fork up to its fork point.
    pub all_forks: bool,
    pub after_entry_id: Option<Uuid>,
    pub limit: usize,
}

impl Default for ListEntriesParams {
    fn default() -> Self {
        Self {
            channel: None,
            client_id: None,
            epoch: None,
            all_forks: false,
            after_entry_id: None,
            limit: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexEntryRequest {
    pub entry_id: Uuid,
    pub indexed_content: String,
}

#[derive(Debug, Clone, Default)]
pub struct IndexOutcome {
    /// Entries whose vectors were upserted in-line.
    pub indexed: usize,
    /// Entries handed to the retry queue after a vector failure.
    pub scheduled_retries: usize,
}

pub struct ConversationEngine {
    store: Arc<dyn Datastore>,
    access: Arc<AccessControl>,
    cache: Arc<dyn CacheAdapter>,
    vector: Option<Arc<dyn VectorIndex>>,
    embedding: Arc<dyn EmbeddingProvider>,
}

impl ConversationEngine {
    pub fn new(
        store: Arc<dyn Datastore>,
        access: Arc<AccessControl>,
        cache: Arc<dyn CacheAdapter>,
        vector: Option<Arc<dyn VectorIndex>>,
        embedding: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            access,
            cache,
            vector,
            embedding,
        }
    }

    /// New group + root conversation + OWNER membership, atomically.
    pub async fn create_conversation(
        &self,
        principal: &Principal,
        title: Option<String>,
    ) -> CoreResult<Conversation> {
        let owner = principal.require_user()?;
        let conversation = self.store.create_root_conversation(owner, title).await?;
        debug!(
            "created conversation {} in group {}",
            conversation.id, conversation.conversation_group_id
        );
        Ok(conversation)
    }

    pub async fn get_conversation(
        &self,
        principal: &Principal,
        conversation_id: Uuid,
    ) -> CoreResult<Conversation> {
        let conversation = self.store.get_conversation(conversation_id).await?;
        self.access
            .ensure_access(principal, conversation.conversation_group_id, AccessLevel::Reader)
            .await?;
        Ok(conversation)
    }

    pub async fn append_entries(
        &self,
        principal: &Principal,
        req: AppendEntriesRequest,
    ) -> CoreResult<Vec<Entry>> {
        // Access is checked against the target branch's group, or against
        // the ancestor's group when the append will create the fork.
        let group_id = match self.store.get_conversation(req.conversation_id).await {
            Ok(conversation) => conversation.conversation_group_id,
            Err(CoreError::NotFound(_)) => match &req.fork {
                Some(fork) => {
                    self.store
                        .get_conversation(fork.forked_at_conversation_id)
                        .await?
                        .conversation_group_id
                }
                None => {
                    return Err(CoreError::not_found(format!(
                        "conversation {}",
                        req.conversation_id
                    )));
                }
            },
            Err(e) => return Err(e),
        };
        self.access
            .ensure_access(principal, group_id, AccessLevel::Writer)
            .await?;

        let conversation_id = req.conversation_id;
        let client_id = req.client_id.clone();
        let entries = self.store.append_entries(req).await?;

        self.post_append(conversation_id, client_id.as_deref(), &entries)
            .await;
        Ok(entries)
    }

    /// Idempotent agent-entry record, matched by the client-supplied id.
    pub async fn sync_agent_entry(
        &self,
        principal: &Principal,
        conversation_id: Uuid,
        entry: NewEntry,
        client_id: Option<String>,
    ) -> CoreResult<SyncResult> {
        let conversation = self.store.get_conversation(conversation_id).await?;
        self.access
            .ensure_access(principal, conversation.conversation_group_id, AccessLevel::Writer)
            .await?;

        let result = self
            .store
            .sync_agent_entry(conversation_id, entry, client_id.clone())
            .await?;

        if !result.already_existed {
            let entries = std::slice::from_ref(&result.entry);
            self.post_append(conversation_id, client_id.as_deref(), entries)
                .await;
        }
        Ok(result)
    }

    /// Fork at an ancestor entry, optionally seeding the new branch.
    /// Repeating the call with the same new-conversation id returns the
    /// existing fork.
    pub async fn fork_conversation_at_entry(
        &self,
        principal: &Principal,
        new_conversation_id: Uuid,
        ancestor_conversation_id: Uuid,
        ancestor_entry_id: Uuid,
        seed: Option<NewEntry>,
    ) -> CoreResult<Conversation> {
        let ancestor = self
            .store
            .get_conversation(ancestor_conversation_id)
            .await?;
        self.access
            .ensure_access(principal, ancestor.conversation_group_id, AccessLevel::Writer)
            .await?;

        let fork = ForkPoint {
            forked_at_conversation_id: ancestor_conversation_id,
            forked_at_entry_id: ancestor_entry_id,
        };

        if let Ok(existing) = self.store.get_conversation(new_conversation_id).await {
            let parent_matches = existing.forked_at_conversation_id
                == Some(ancestor_conversation_id)
                && existing.forked_at_entry_id == Some(ancestor_entry_id);
            return if parent_matches {
                Ok(existing)
            } else {
                Err(CoreError::conflict(format!(
                    "conversation {new_conversation_id} already exists with a different parent"
                )))
            };
        }

        let entries: Vec<NewEntry> = seed.into_iter().collect();
        let client_id = principal.client_id.clone();
        let is_memory_seed = entries.iter().any(|e| e.channel == Channel::Memory);
        let appended = self
            .store
            .append_entries(AppendEntriesRequest {
                conversation_id: new_conversation_id,
                entries,
                client_id: if is_memory_seed { client_id.clone() } else { None },
                epoch: None,
                fork: Some(fork),
            })
            .await?;

        self.post_append(new_conversation_id, client_id.as_deref(), &appended)
            .await;
        self.store.get_conversation(new_conversation_id).await
    }

    pub async fn list_entries(
        &self,
        principal: &Principal,
        conversation_id: Uuid,
        params: ListEntriesParams,
    ) -> CoreResult<Vec<Entry>> {
        if params.epoch.is_some() && params.channel != Some(Channel::Memory) {
            return Err(CoreError::invalid_argument(
                "epoch filters apply only to the MEMORY channel",
            ));
        }
        if params.channel == Some(Channel::Memory) && params.client_id.is_none() {
            return Err(CoreError::invalid_argument(
                "MEMORY reads require a client id",
            ));
        }

        let conversation = self.store.get_conversation(conversation_id).await?;
        self.access
            .ensure_access(principal, conversation.conversation_group_id, AccessLevel::Reader)
            .await?;

        if params.all_forks {
            self.list_with_ancestry(&conversation, &params).await
        } else {
            self.store
                .list_entries(ListEntriesQuery {
                    conversation_id,
                    channel: params.channel,
                    client_id: params.client_id.clone(),
                    epoch: params.epoch,
                    after_entry_id: params.after_entry_id,
                    up_to_entry_id: None,
                    limit: params.limit,
                })
                .await
        }
    }

    /// Walk the fork chain: this branch unbounded, each ancestor bounded at
    /// (and including) its fork entry; merge ordered by `(created_at, id)`.
    async fn list_with_ancestry(
        &self,
        conversation: &Conversation,
        params: &ListEntriesParams,
    ) -> CoreResult<Vec<Entry>> {
        let mut segments: Vec<(Uuid, Option<Uuid>)> = Vec::new();
        let mut current = conversation.clone();
        let mut bound: Option<Uuid> = None;
        let mut seen: HashSet<Uuid> = HashSet::new();

        loop {
            if !seen.insert(current.id) || segments.len() >= MAX_FORK_DEPTH {
                return Err(CoreError::internal(format!(
                    "fork ancestry of conversation {} does not terminate",
                    conversation.id
                )));
            }
            segments.push((current.id, bound));
            match (current.forked_at_conversation_id, current.forked_at_entry_id) {
                (Some(parent_id), Some(entry_id)) => {
                    bound = Some(entry_id);
                    current = self.store.get_conversation(parent_id).await?;
                }
                _ => break,
            }
        }

        let mut merged: Vec<Entry> = Vec::new();
        for (segment_id, up_to) in segments {
            let mut entries = self
                .store
                .list_entries(ListEntriesQuery {
                    conversation_id: segment_id,
                    channel: params.channel,
                    client_id: params.client_id.clone(),
                    epoch: params.epoch,
                    after_entry_id: None,
                    up_to_entry_id: up_to,
                    limit: 0,
                })
                .await?;
            merged.append(&mut entries);
        }
        merged.sort_by(|a, b| {
            (a.created_at, a.id.to_string()).cmp(&(b.created_at, b.id.to_string()))
        });

        // Cursor and limit apply to the merged view.
        if let Some(after_id) = params.after_entry_id {
            if let Some(position) = merged
                .iter()
                .find(|e| e.id == after_id)
                .map(|e| (e.created_at, e.id.to_string()))
            {
                merged.retain(|e| (e.created_at, e.id.to_string()) > position);
            }
        }
        if params.limit > 0 {
            merged.truncate(params.limit);
        }
        Ok(merged)
    }

    /// Union across every branch of the group, ordered `(created_at, id)`.
    /// An API-key principal with the indexer role bypasses membership for
    /// this read-only path; everyone else needs READER.
    pub async fn list_group_entries(
        &self,
        principal: &Principal,
        group_id: Uuid,
        channel: Option<Channel>,
        after_entry_id: Option<Uuid>,
        limit: usize,
    ) -> CoreResult<Vec<Entry>> {
        if principal.has_role(Role::Indexer) {
            self.store.get_group(group_id).await?;
        } else {
            self.access
                .ensure_access(principal, group_id, AccessLevel::Reader)
                .await?;
        }
        self.store
            .list_by_conversation_group(GroupEntriesQuery {
                conversation_group_id: group_id,
                channel,
                client_id: None,
                after_entry_id,
                limit,
            })
            .await
    }

    /// Latest memory epoch with cache read-through.
    pub async fn latest_memory_epoch(
        &self,
        principal: &Principal,
        conversation_id: Uuid,
        client_id: &str,
    ) -> CoreResult<Option<i64>> {
        let conversation = self.store.get_conversation(conversation_id).await?;
        self.access
            .ensure_access(principal, conversation.conversation_group_id, AccessLevel::Reader)
            .await?;

        if let Some(epoch) = self.cache.epoch_get(conversation_id, client_id).await {
            return Ok(Some(epoch));
        }
        let epoch = self
            .store
            .latest_memory_epoch(conversation_id, client_id)
            .await?;
        if let Some(epoch) = epoch {
            self.cache.epoch_put(conversation_id, client_id, epoch).await;
        }
        Ok(epoch)
    }

    /// Indexer-only: write plain-text projections and upsert vectors.
    /// `indexed_at` is set only by a successful vector upsert; a vector
    /// failure schedules a singleton retry and the call still succeeds.
    pub async fn index_entries(
        &self,
        principal: &Principal,
        requests: Vec<IndexEntryRequest>,
    ) -> CoreResult<IndexOutcome> {
        self.access.ensure_indexer(principal)?;

        let mut outcome = IndexOutcome::default();
        for request in requests {
            self.store
                .set_indexed_content(request.entry_id, &request.indexed_content)
                .await?;

            let entry = self.store.get_entry(request.entry_id).await?;
            match self.index_vector(&entry).await {
                Ok(true) => outcome.indexed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("vector indexing of entry {} failed: {}", entry.id, e);
                    self.enqueue_index_retry(entry.id).await?;
                    outcome.scheduled_retries += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// OWNER-gated cascading soft delete; embeddings follow through the
    /// queued `vector_store_delete` task.
    pub async fn delete_conversation_group(
        &self,
        principal: &Principal,
        group_id: Uuid,
    ) -> CoreResult<()> {
        self.access
            .ensure_access(principal, group_id, AccessLevel::Owner)
            .await?;
        self.store.soft_delete_group(group_id).await
    }

    /// Post-commit side effects of a successful append.
    async fn post_append(
        &self,
        conversation_id: Uuid,
        client_id: Option<&str>,
        entries: &[Entry],
    ) {
        if let Some(client_id) = client_id {
            if entries.iter().any(|e| e.channel == Channel::Memory) {
                self.cache
                    .epoch_invalidate(conversation_id, client_id)
                    .await;
            }
        }

        for entry in entries {
            if entry.channel != Channel::History || entry.indexed_content.is_none() {
                continue;
            }
            match self.index_vector(entry).await {
                Ok(_) => {}
                Err(e) => {
                    warn!("vector indexing of entry {} failed: {}", entry.id, e);
                    if let Err(e) = self.enqueue_index_retry(entry.id).await {
                        warn!("failed to enqueue index retry for {}: {}", entry.id, e);
                    }
                }
            }
        }
    }

    /// Embed and upsert one entry; returns whether a vector was written.
    async fn index_vector(&self, entry: &Entry) -> CoreResult<bool> {
        let Some(vector) = &self.vector else {
            return Ok(false);
        };
        if !self.embedding.enabled() {
            return Ok(false);
        }
        let Some(text) = entry.indexed_content.as_deref() else {
            return Ok(false);
        };

        let embedding = self.embedding.embed(text).await?;
        if embedding.is_empty() {
            return Ok(false);
        }
        vector
            .upsert(EmbeddingPoint {
                entry_id: entry.id,
                conversation_id: entry.conversation_id,
                conversation_group_id: entry.conversation_group_id,
                embedding,
                created_at: entry.created_at,
            })
            .await?;
        self.store.set_indexed_at(entry.id, Utc::now()).await?;
        Ok(true)
    }

    async fn enqueue_index_retry(&self, entry_id: Uuid) -> CoreResult<()> {
        metrics::counter!("memory_service_index_retries_scheduled_total").increment(1);
        self.store
            .create_task(NewTask {
                task_name: Some(format!(
                    "{}:{}",
                    task_types::ENTRY_VECTOR_INDEX_RETRY,
                    entry_id
                )),
                task_type: task_types::ENTRY_VECTOR_INDEX_RETRY.to_string(),
                task_body: serde_json::json!({ "entryId": entry_id }),
                retry_at: Utc::now(),
            })
            .await
            .map(|_| ())
    }
}
