// src/model.rs

//! Core data model: conversation groups, branches, entries, memberships,
//! attachments, ownership transfers, background tasks, DEK records.
//! All ids are opaque 128-bit UUIDs; all timestamps are UTC instants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// One semi-structured content block. Opaque to the core; the transport and
/// agents agree on the shape.
pub type ContentBlock = serde_json::Value;

/// Logical destination of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    /// User-visible conversation turn.
    History,
    /// Agent working-memory snapshot, scoped to a client and an epoch.
    Memory,
    /// Agent-produced summary of a conversation prefix.
    Summary,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::History => "HISTORY",
            Channel::Memory => "MEMORY",
            Channel::Summary => "SUMMARY",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "HISTORY" => Ok(Channel::History),
            "MEMORY" => Ok(Channel::Memory),
            "SUMMARY" => Ok(Channel::Summary),
            other => Err(CoreError::internal(format!("unknown channel: {other}"))),
        }
    }
}

/// Access levels form a total order; comparisons use the derived `Ord`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessLevel {
    Reader,
    Writer,
    Manager,
    Owner,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Reader => "READER",
            AccessLevel::Writer => "WRITER",
            AccessLevel::Manager => "MANAGER",
            AccessLevel::Owner => "OWNER",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "READER" => Ok(AccessLevel::Reader),
            "WRITER" => Ok(AccessLevel::Writer),
            "MANAGER" => Ok(AccessLevel::Manager),
            "OWNER" => Ok(AccessLevel::Owner),
            other => Err(CoreError::internal(format!("unknown access level: {other}"))),
        }
    }
}

/// Groups a root conversation and all of its forks. Memberships and
/// ownership attach here, never to an individual branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationGroup {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One branch within a group. A fork carries the ancestor point; a root has
/// both fork fields null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub conversation_group_id: Uuid,
    pub owner_user_id: String,
    pub title: Option<String>,
    pub forked_at_conversation_id: Option<Uuid>,
    pub forked_at_entry_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMembership {
    pub conversation_group_id: Uuid,
    pub user_id: String,
    pub access_level: AccessLevel,
    pub created_at: DateTime<Utc>,
}

/// A stored entry on one of the three channels.
///
/// Entries are append-only; only `indexed_content` and `indexed_at` are set
/// after the fact, each exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub conversation_group_id: Uuid,
    pub channel: Channel,
    /// Set iff `channel == Memory`.
    pub client_id: Option<String>,
    /// Set iff `channel == Memory`; strictly positive.
    pub epoch: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub content: Vec<ContentBlock>,
    /// Plain-text projection used for embedding and full-text search.
    pub indexed_content: Option<String>,
    /// Set once the entry's embedding has been upserted successfully.
    pub indexed_at: Option<DateTime<Utc>>,
    pub attachment_refs: Vec<Uuid>,
}

/// Input shape for appending an entry. The id is client-suppliable so that
/// `sync_agent_entry` can be idempotent; when absent the store assigns one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEntry {
    pub id: Option<Uuid>,
    pub channel: Channel,
    pub content: Vec<ContentBlock>,
    pub indexed_content: Option<String>,
    #[serde(default)]
    pub attachment_refs: Vec<Uuid>,
}

impl NewEntry {
    pub fn history(content: Vec<ContentBlock>) -> Self {
        Self {
            id: None,
            channel: Channel::History,
            content,
            indexed_content: None,
            attachment_refs: Vec::new(),
        }
    }

    pub fn memory(content: Vec<ContentBlock>) -> Self {
        Self {
            id: None,
            channel: Channel::Memory,
            content,
            indexed_content: None,
            attachment_refs: Vec::new(),
        }
    }
}

/// Outcome of an idempotent agent-entry sync.
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub entry: Entry,
    /// True when the supplied entry id was already recorded; the stored
    /// entry is returned unchanged and nothing was written.
    pub already_existed: bool,
}

/// Epoch selector for MEMORY-channel reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochFilter {
    Latest,
    All,
    Exact(i64),
}

/// Ancestor point identifying where a fork branches off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkPoint {
    pub forked_at_conversation_id: Uuid,
    pub forked_at_entry_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentStatus {
    Pending,
    Ready,
    Failed,
}

impl AttachmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentStatus::Pending => "PENDING",
            AttachmentStatus::Ready => "READY",
            AttachmentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "PENDING" => Ok(AttachmentStatus::Pending),
            "READY" => Ok(AttachmentStatus::Ready),
            "FAILED" => Ok(AttachmentStatus::Failed),
            other => Err(CoreError::internal(format!(
                "unknown attachment status: {other}"
            ))),
        }
    }
}

/// Binary attachment metadata. The body lives in the attachment store under
/// `storage_key`; entries hold weak references by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub storage_key: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub sha256: String,
    pub user_id: String,
    pub entry_id: Option<Uuid>,
    /// Orphan TTL: unlinked attachments past this instant are evictable.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub status: AttachmentStatus,
    pub source_url: Option<String>,
}

/// Pending ownership transfer. Acceptance or rejection deletes the row, so
/// existence implies PENDING.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipTransfer {
    pub id: Uuid,
    pub conversation_group_id: Uuid,
    pub from_user_id: String,
    pub to_user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable background task row. A task is eligible for claiming when
/// `retry_at <= now` and any previous claim has gone stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Uniqueness key for singleton tasks; creating a duplicate name is a no-op.
    pub task_name: Option<String>,
    pub task_type: String,
    pub task_body: serde_json::Value,
    pub retry_at: DateTime<Utc>,
    pub processing_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
}

pub mod task_types {
    pub const VECTOR_STORE_DELETE: &str = "vector_store_delete";
    pub const ENTRY_VECTOR_INDEX_RETRY: &str = "entry_vector_index_retry";
    pub const ATTACHMENT_EVICTION: &str = "attachment_eviction";
}

/// One wrapped data-encryption key. Index 0 of a record's list is the
/// primary; the rest are legacy, kept for decrypting older ciphertexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedDek {
    pub key_id: i64,
    /// Base64 of the KMS-wrapped key material.
    pub wrapped: String,
}

/// Per-provider DEK record with optimistic locking on `revision`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DekRecord {
    pub provider: String,
    pub wrapped_deks: Vec<WrappedDek>,
    pub revision: i64,
}

pub(crate) fn parse_uuid(s: &str) -> CoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| CoreError::internal(format!("malformed uuid {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_levels_are_totally_ordered() {
        assert!(AccessLevel::Reader < AccessLevel::Writer);
        assert!(AccessLevel::Writer < AccessLevel::Manager);
        assert!(AccessLevel::Manager < AccessLevel::Owner);
    }

    #[test]
    fn channel_round_trips() {
        for channel in [Channel::History, Channel::Memory, Channel::Summary] {
            assert_eq!(Channel::parse(channel.as_str()).unwrap(), channel);
        }
        assert!(Channel::parse("bogus").is_err());
    }
}
