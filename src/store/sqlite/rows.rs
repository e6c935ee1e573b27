// src/store/sqlite/rows.rs
// Row-to-model mapping helpers shared by the relational adapter

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{
    AccessLevel, Attachment, AttachmentStatus, Channel, Conversation, ConversationGroup,
    ConversationMembership, Entry, OwnershipTransfer, Task, parse_uuid,
};
use crate::store::codec::EntryCodec;

pub fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub fn from_micros(raw: i64) -> CoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(raw)
        .ok_or_else(|| CoreError::internal(format!("timestamp out of range: {raw}")))
}

fn opt_uuid(raw: Option<String>) -> CoreResult<Option<Uuid>> {
    raw.map(|s| parse_uuid(&s)).transpose()
}

fn opt_micros(raw: Option<i64>) -> CoreResult<Option<DateTime<Utc>>> {
    raw.map(from_micros).transpose()
}

pub fn map_group(row: &SqliteRow) -> CoreResult<ConversationGroup> {
    Ok(ConversationGroup {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        created_at: from_micros(row.get("created_at"))?,
        deleted_at: opt_micros(row.get("deleted_at"))?,
    })
}

pub fn map_conversation(row: &SqliteRow) -> CoreResult<Conversation> {
    Ok(Conversation {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        conversation_group_id: parse_uuid(&row.get::<String, _>("conversation_group_id"))?,
        owner_user_id: row.get("owner_user_id"),
        title: row.get("title"),
        forked_at_conversation_id: opt_uuid(row.get("forked_at_conversation_id"))?,
        forked_at_entry_id: opt_uuid(row.get("forked_at_entry_id"))?,
        created_at: from_micros(row.get("created_at"))?,
        updated_at: from_micros(row.get("updated_at"))?,
        deleted_at: opt_micros(row.get("deleted_at"))?,
    })
}

pub fn map_membership(row: &SqliteRow) -> CoreResult<ConversationMembership> {
    Ok(ConversationMembership {
        conversation_group_id: parse_uuid(&row.get::<String, _>("conversation_group_id"))?,
        user_id: row.get("user_id"),
        access_level: AccessLevel::parse(&row.get::<String, _>("access_level"))?,
        created_at: from_micros(row.get("created_at"))?,
    })
}

pub fn map_entry(row: &SqliteRow, codec: &EntryCodec) -> CoreResult<Entry> {
    let refs_json: String = row.get("attachment_refs");
    let attachment_refs: Vec<Uuid> = serde_json::from_str(&refs_json)?;
    Ok(Entry {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        conversation_id: parse_uuid(&row.get::<String, _>("conversation_id"))?,
        conversation_group_id: parse_uuid(&row.get::<String, _>("conversation_group_id"))?,
        channel: Channel::parse(&row.get::<String, _>("channel"))?,
        client_id: row.get("client_id"),
        epoch: row.get("epoch"),
        created_at: from_micros(row.get("created_at"))?,
        content: codec.decode_content(&row.get::<String, _>("content"))?,
        indexed_content: row.get("indexed_content"),
        indexed_at: opt_micros(row.get("indexed_at"))?,
        attachment_refs,
    })
}

pub fn map_attachment(row: &SqliteRow) -> CoreResult<Attachment> {
    Ok(Attachment {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        storage_key: row.get("storage_key"),
        filename: row.get("filename"),
        content_type: row.get("content_type"),
        size: row.get("size"),
        sha256: row.get("sha256"),
        user_id: row.get("user_id"),
        entry_id: opt_uuid(row.get("entry_id"))?,
        expires_at: opt_micros(row.get("expires_at"))?,
        created_at: from_micros(row.get("created_at"))?,
        deleted_at: opt_micros(row.get("deleted_at"))?,
        status: AttachmentStatus::parse(&row.get::<String, _>("status"))?,
        source_url: row.get("source_url"),
    })
}

pub fn map_transfer(row: &SqliteRow) -> CoreResult<OwnershipTransfer> {
    Ok(OwnershipTransfer {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        conversation_group_id: parse_uuid(&row.get::<String, _>("conversation_group_id"))?,
        from_user_id: row.get("from_user_id"),
        to_user_id: row.get("to_user_id"),
        created_at: from_micros(row.get("created_at"))?,
        updated_at: from_micros(row.get("updated_at"))?,
    })
}

pub fn map_task(row: &SqliteRow) -> CoreResult<Task> {
    let body_json: String = row.get("task_body");
    Ok(Task {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        task_name: row.get("task_name"),
        task_type: row.get("task_type"),
        task_body: serde_json::from_str(&body_json)?,
        retry_at: from_micros(row.get("retry_at"))?,
        processing_at: opt_micros(row.get("processing_at"))?,
        last_error: row.get("last_error"),
        retry_count: row.get("retry_count"),
        created_at: from_micros(row.get("created_at"))?,
    })
}

/// Map a unique-constraint violation onto CONFLICT; pass everything else on.
pub fn conflict_on_unique(err: sqlx::Error, what: &str) -> CoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.message().contains("UNIQUE constraint failed") {
            return CoreError::conflict(format!("{what} already exists"));
        }
    }
    err.into()
}
