// src/store/mod.rs

//! Datastore trait for the primary store (relational or document).
//! All persistence goes through this—no direct DB calls in the engines.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::model::{
    Attachment, AttachmentStatus, Channel, Conversation, ConversationGroup,
    ConversationMembership, DekRecord, Entry, EpochFilter, ForkPoint, NewEntry, OwnershipTransfer,
    SyncResult, Task,
};

pub mod codec;
pub mod document;
pub mod sqlite;

/// Atomic append of 1..N entries into one conversation, optionally creating
/// the conversation as a fork of an ancestor first.
#[derive(Debug, Clone)]
pub struct AppendEntriesRequest {
    pub conversation_id: Uuid,
    pub entries: Vec<NewEntry>,
    /// Required when the batch is on the MEMORY channel.
    pub client_id: Option<String>,
    /// Explicit epoch for a MEMORY batch; `None` assigns `max + 1`.
    pub epoch: Option<i64>,
    /// Present when `conversation_id` may not exist yet and should be
    /// created branching off the given ancestor point.
    pub fork: Option<ForkPoint>,
}

/// Entry listing scoped to a single branch.
#[derive(Debug, Clone)]
pub struct ListEntriesQuery {
    pub conversation_id: Uuid,
    pub channel: Option<Channel>,
    pub client_id: Option<String>,
    /// Only meaningful for MEMORY reads.
    pub epoch: Option<EpochFilter>,
    /// Cursor: resume strictly after this entry. An id that does not belong
    /// to the target conversation and channel falls back to start-of-range.
    pub after_entry_id: Option<Uuid>,
    /// Inclusive upper bound, identified by an entry of the same
    /// conversation; used for ancestor-prefix reads of forks.
    pub up_to_entry_id: Option<Uuid>,
    pub limit: usize,
}

impl ListEntriesQuery {
    pub fn for_conversation(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            channel: None,
            client_id: None,
            epoch: None,
            after_entry_id: None,
            up_to_entry_id: None,
            limit: 0,
        }
    }
}

/// Entry listing across every branch of a group, ordered `(created_at, id)`.
#[derive(Debug, Clone)]
pub struct GroupEntriesQuery {
    pub conversation_group_id: Uuid,
    pub channel: Option<Channel>,
    pub client_id: Option<String>,
    pub after_entry_id: Option<Uuid>,
    pub limit: usize,
}

/// A lexical match from the datastore's text-search ranker.
#[derive(Debug, Clone)]
pub struct FulltextHit {
    pub entry_id: Uuid,
    pub conversation_id: Uuid,
    pub conversation_group_id: Uuid,
    /// Higher is better.
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    /// Singleton key; creating a second task with the same name is a no-op.
    pub task_name: Option<String>,
    pub task_type: String,
    pub task_body: serde_json::Value,
    pub retry_at: DateTime<Utc>,
}

/// Primary datastore contract. Both the relational and the document adapter
/// satisfy every operation and its transactional guarantees; engines treat
/// them interchangeably.
#[async_trait]
pub trait Datastore: Send + Sync {
    // -- groups & conversations -------------------------------------------

    /// Create a new group, its root conversation, and the OWNER membership
    /// in one atomic step.
    async fn create_root_conversation(
        &self,
        owner_user_id: &str,
        title: Option<String>,
    ) -> CoreResult<Conversation>;

    async fn get_group(&self, group_id: Uuid) -> CoreResult<ConversationGroup>;

    async fn get_conversation(&self, conversation_id: Uuid) -> CoreResult<Conversation>;

    async fn list_conversations_in_group(&self, group_id: Uuid)
        -> CoreResult<Vec<Conversation>>;

    /// Soft-delete the group and cascade to conversations, memberships and
    /// entries; enqueues a `vector_store_delete` task in the same
    /// transaction so embeddings follow.
    async fn soft_delete_group(&self, group_id: Uuid) -> CoreResult<()>;

    // -- memberships -------------------------------------------------------

    async fn get_membership(
        &self,
        group_id: Uuid,
        user_id: &str,
    ) -> CoreResult<Option<ConversationMembership>>;

    async fn upsert_membership(
        &self,
        group_id: Uuid,
        user_id: &str,
        access_level: crate::model::AccessLevel,
    ) -> CoreResult<ConversationMembership>;

    async fn remove_membership(&self, group_id: Uuid, user_id: &str) -> CoreResult<()>;

    async fn list_memberships(&self, group_id: Uuid)
        -> CoreResult<Vec<ConversationMembership>>;

    /// Groups the user has any access to, `O(memberships)`. With
    /// `order_by_recent` the most recently updated groups come first.
    async fn list_group_ids_for_user(
        &self,
        user_id: &str,
        limit: usize,
        order_by_recent: bool,
    ) -> CoreResult<Vec<Uuid>>;

    // -- entries -----------------------------------------------------------

    async fn append_entries(&self, req: AppendEntriesRequest) -> CoreResult<Vec<Entry>>;

    /// Idempotent record of an agent-produced entry, matched by the
    /// client-supplied entry id.
    async fn sync_agent_entry(
        &self,
        conversation_id: Uuid,
        entry: NewEntry,
        client_id: Option<String>,
    ) -> CoreResult<SyncResult>;

    async fn get_entry(&self, entry_id: Uuid) -> CoreResult<Entry>;

    async fn list_entries(&self, query: ListEntriesQuery) -> CoreResult<Vec<Entry>>;

    async fn list_by_conversation_group(
        &self,
        query: GroupEntriesQuery,
    ) -> CoreResult<Vec<Entry>>;

    /// Largest MEMORY epoch for `(conversation, client)`, if any.
    async fn latest_memory_epoch(
        &self,
        conversation_id: Uuid,
        client_id: &str,
    ) -> CoreResult<Option<i64>>;

    /// Write the plain-text projection; set exactly once. Returns false when
    /// the projection was already present (and leaves it unchanged).
    async fn set_indexed_content(&self, entry_id: Uuid, text: &str) -> CoreResult<bool>;

    async fn set_indexed_at(&self, entry_id: Uuid, at: DateTime<Utc>) -> CoreResult<()>;

    /// Lexical search over `indexed_content`, restricted to groups the user
    /// is a member of, ranked by the backend's text ranker.
    async fn fulltext_search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> CoreResult<Vec<FulltextHit>>;

    // -- attachments -------------------------------------------------------

    async fn create_attachment(&self, attachment: &Attachment) -> CoreResult<()>;

    async fn get_attachment(&self, id: Uuid) -> CoreResult<Attachment>;

    /// Record the outcome of an asynchronous body fetch/upload.
    async fn finalize_attachment(
        &self,
        id: Uuid,
        status: AttachmentStatus,
        storage_key: Option<&str>,
        size: Option<i64>,
        sha256: Option<&str>,
    ) -> CoreResult<()>;

    async fn soft_delete_attachment(&self, id: Uuid) -> CoreResult<()>;

    /// Attachments ready for hard deletion: soft-deleted past the retention
    /// grace, or never linked and past their orphan TTL.
    async fn list_evictable_attachments(
        &self,
        now: DateTime<Utc>,
        tombstone_retention: std::time::Duration,
        limit: usize,
    ) -> CoreResult<Vec<Attachment>>;

    async fn hard_delete_attachment(&self, id: Uuid) -> CoreResult<()>;

    // -- ownership transfers ----------------------------------------------

    /// Fails with CONFLICT when the group already has a pending transfer.
    async fn create_transfer(
        &self,
        group_id: Uuid,
        from_user_id: &str,
        to_user_id: &str,
    ) -> CoreResult<OwnershipTransfer>;

    async fn get_transfer(&self, id: Uuid) -> CoreResult<OwnershipTransfer>;

    async fn delete_transfer(&self, id: Uuid) -> CoreResult<()>;

    /// Atomically demote the old owner to MANAGER, promote the recipient to
    /// OWNER, and delete the transfer row.
    async fn accept_transfer(&self, id: Uuid) -> CoreResult<()>;

    // -- background tasks --------------------------------------------------

    /// Returns false when a task with the same name already existed.
    async fn create_task(&self, task: NewTask) -> CoreResult<bool>;

    async fn find_task_by_name(&self, name: &str) -> CoreResult<Option<Task>>;

    /// Claim up to `batch` eligible tasks by stamping `processing_at = now`.
    /// At most one worker observes any given claim as its own.
    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        batch: usize,
        stale_claim_timeout: std::time::Duration,
    ) -> CoreResult<Vec<Task>>;

    async fn complete_task(&self, id: Uuid) -> CoreResult<()>;

    /// Release the claim, record the error, and schedule the retry.
    async fn fail_task(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> CoreResult<()>;

    // -- DEK records -------------------------------------------------------

    async fn get_dek_record(&self, provider: &str) -> CoreResult<Option<DekRecord>>;

    /// Race-safe bootstrap: insert the record unless one already exists, and
    /// return whichever record is now stored.
    async fn insert_dek_record_if_absent(&self, record: &DekRecord) -> CoreResult<DekRecord>;

    /// Single-row optimistic lock: applies the update only when the stored
    /// revision still equals `expected_revision`.
    async fn update_dek_record(
        &self,
        record: &DekRecord,
        expected_revision: i64,
    ) -> CoreResult<bool>;
}

pub(crate) fn validate_append_request(req: &AppendEntriesRequest) -> CoreResult<()> {
    use crate::error::CoreError;

    if req.entries.is_empty() && req.fork.is_none() {
        return Err(CoreError::invalid_argument("append requires at least one entry"));
    }
    let memory_count = req
        .entries
        .iter()
        .filter(|e| e.channel == Channel::Memory)
        .count();
    if memory_count > 0 && memory_count != req.entries.len() {
        return Err(CoreError::invalid_argument(
            "MEMORY entries cannot be batched with other channels",
        ));
    }
    if memory_count > 0 && req.client_id.is_none() {
        return Err(CoreError::invalid_argument(
            "MEMORY entries require a client id",
        ));
    }
    if memory_count == 0 && req.epoch.is_some() {
        return Err(CoreError::invalid_argument(
            "epoch applies only to MEMORY batches",
        ));
    }
    if let Some(epoch) = req.epoch {
        if epoch < 1 {
            return Err(CoreError::invalid_argument("epoch must be positive"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewEntry;

    fn history_req(entries: Vec<NewEntry>) -> AppendEntriesRequest {
        AppendEntriesRequest {
            conversation_id: Uuid::new_v4(),
            entries,
            client_id: None,
            epoch: None,
            fork: None,
        }
    }

    #[test]
    fn mixed_channel_batches_are_rejected() {
        let mut req = history_req(vec![
            NewEntry::history(vec![]),
            NewEntry::memory(vec![]),
        ]);
        req.client_id = Some("client".into());
        assert!(validate_append_request(&req).is_err());
    }

    #[test]
    fn memory_batch_requires_client_id() {
        let req = history_req(vec![NewEntry::memory(vec![])]);
        assert!(validate_append_request(&req).is_err());
    }

    #[test]
    fn epoch_on_history_is_rejected() {
        let mut req = history_req(vec![NewEntry::history(vec![])]);
        req.epoch = Some(1);
        assert!(validate_append_request(&req).is_err());
    }
}
