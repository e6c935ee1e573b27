// src/store/sqlite/attachments.rs
// Attachment metadata rows; bodies live in the attachment store

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{Attachment, AttachmentStatus};

use super::rows::{conflict_on_unique, map_attachment, micros};
use super::{SqliteDatastore, now_micros};

pub(super) async fn create(store: &SqliteDatastore, attachment: &Attachment) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO attachments
             (id, storage_key, filename, content_type, size, sha256, user_id,
              entry_id, expires_at, created_at, status, source_url)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(attachment.id.to_string())
    .bind(&attachment.storage_key)
    .bind(&attachment.filename)
    .bind(&attachment.content_type)
    .bind(attachment.size)
    .bind(&attachment.sha256)
    .bind(&attachment.user_id)
    .bind(attachment.entry_id.map(|id| id.to_string()))
    .bind(attachment.expires_at.map(micros))
    .bind(micros(attachment.created_at))
    .bind(attachment.status.as_str())
    .bind(&attachment.source_url)
    .execute(store.pool())
    .await
    .map_err(|e| conflict_on_unique(e, "attachment"))?;

    Ok(())
}

pub(super) async fn get(store: &SqliteDatastore, id: Uuid) -> CoreResult<Attachment> {
    let row = sqlx::query("SELECT * FROM attachments WHERE id = ? AND deleted_at IS NULL")
        .bind(id.to_string())
        .fetch_optional(store.pool())
        .await?
        .ok_or_else(|| CoreError::not_found(format!("attachment {id}")))?;

    map_attachment(&row)
}

pub(super) async fn finalize(
    store: &SqliteDatastore,
    id: Uuid,
    status: AttachmentStatus,
    storage_key: Option<&str>,
    size: Option<i64>,
    sha256: Option<&str>,
) -> CoreResult<()> {
    let updated = sqlx::query(
        "UPDATE attachments SET
             status = ?,
             storage_key = COALESCE(?, storage_key),
             size = COALESCE(?, size),
             sha256 = COALESCE(?, sha256)
         WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(status.as_str())
    .bind(storage_key)
    .bind(size)
    .bind(sha256)
    .bind(id.to_string())
    .execute(store.pool())
    .await?;

    if updated.rows_affected() == 0 {
        return Err(CoreError::not_found(format!("attachment {id}")));
    }
    Ok(())
}

pub(super) async fn soft_delete(store: &SqliteDatastore, id: Uuid) -> CoreResult<()> {
    let deleted = sqlx::query(
        "UPDATE attachments SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(micros(now_micros()?))
    .bind(id.to_string())
    .execute(store.pool())
    .await?;

    if deleted.rows_affected() == 0 {
        return Err(CoreError::not_found(format!("attachment {id}")));
    }
    Ok(())
}

pub(super) async fn list_evictable(
    store: &SqliteDatastore,
    now: DateTime<Utc>,
    tombstone_retention: std::time::Duration,
    limit: usize,
) -> CoreResult<Vec<Attachment>> {
    let retention_cutoff = micros(now) - tombstone_retention.as_micros() as i64;

    let rows = sqlx::query(
        "SELECT * FROM attachments
         WHERE (deleted_at IS NOT NULL AND deleted_at < ?)
            OR (deleted_at IS NULL AND entry_id IS NULL
                AND expires_at IS NOT NULL AND expires_at < ?)
         ORDER BY created_at
         LIMIT ?",
    )
    .bind(retention_cutoff)
    .bind(micros(now))
    .bind(if limit == 0 { -1 } else { limit as i64 })
    .fetch_all(store.pool())
    .await?;

    rows.iter().map(map_attachment).collect()
}

pub(super) async fn hard_delete(store: &SqliteDatastore, id: Uuid) -> CoreResult<()> {
    sqlx::query("DELETE FROM attachments WHERE id = ?")
        .bind(id.to_string())
        .execute(store.pool())
        .await?;
    Ok(())
}
