// src/store/sqlite/conversations.rs
// Group and conversation CRUD plus the cascading soft delete

use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{AccessLevel, Conversation, ConversationGroup, task_types};

use super::rows::{map_conversation, map_group, micros};
use super::{SqliteDatastore, now_micros};

pub(super) async fn create_root(
    store: &SqliteDatastore,
    owner_user_id: &str,
    title: Option<String>,
) -> CoreResult<Conversation> {
    let now = now_micros()?;
    let group_id = Uuid::new_v4();
    let conversation_id = Uuid::new_v4();

    let mut conn = store.begin_immediate().await?;
    let result = async {
        sqlx::query("INSERT INTO conversation_groups (id, created_at) VALUES (?, ?)")
            .bind(group_id.to_string())
            .bind(micros(now))
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            "INSERT INTO conversations
                 (id, conversation_group_id, owner_user_id, title, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(conversation_id.to_string())
        .bind(group_id.to_string())
        .bind(owner_user_id)
        .bind(&title)
        .bind(micros(now))
        .bind(micros(now))
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO conversation_memberships
                 (conversation_group_id, user_id, access_level, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(group_id.to_string())
        .bind(owner_user_id)
        .bind(AccessLevel::Owner.as_str())
        .bind(micros(now))
        .execute(&mut *conn)
        .await?;

        Ok::<_, CoreError>(())
    }
    .await;

    match result {
        Ok(()) => {
            SqliteDatastore::commit(&mut conn).await?;
            Ok(Conversation {
                id: conversation_id,
                conversation_group_id: group_id,
                owner_user_id: owner_user_id.to_string(),
                title,
                forked_at_conversation_id: None,
                forked_at_entry_id: None,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            })
        }
        Err(e) => {
            SqliteDatastore::rollback(&mut conn).await;
            Err(e)
        }
    }
}

pub(super) async fn get_group(
    store: &SqliteDatastore,
    group_id: Uuid,
) -> CoreResult<ConversationGroup> {
    let row = sqlx::query(
        "SELECT id, created_at, deleted_at FROM conversation_groups
         WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(group_id.to_string())
    .fetch_optional(store.pool())
    .await?
    .ok_or_else(|| CoreError::not_found(format!("conversation group {group_id}")))?;

    map_group(&row)
}

pub(super) async fn get_conversation(
    store: &SqliteDatastore,
    conversation_id: Uuid,
) -> CoreResult<Conversation> {
    let row = sqlx::query(
        "SELECT * FROM conversations WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(conversation_id.to_string())
    .fetch_optional(store.pool())
    .await?
    .ok_or_else(|| CoreError::not_found(format!("conversation {conversation_id}")))?;

    map_conversation(&row)
}

/// Transaction-scoped lookup used inside append/fork.
pub(super) async fn get_conversation_tx(
    conn: &mut SqliteConnection,
    conversation_id: Uuid,
) -> CoreResult<Option<Conversation>> {
    let row = sqlx::query(
        "SELECT * FROM conversations WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(conversation_id.to_string())
    .fetch_optional(conn)
    .await?;

    row.map(|row| map_conversation(&row)).transpose()
}

pub(super) async fn list_in_group(
    store: &SqliteDatastore,
    group_id: Uuid,
) -> CoreResult<Vec<Conversation>> {
    let rows = sqlx::query(
        "SELECT * FROM conversations
         WHERE conversation_group_id = ? AND deleted_at IS NULL
         ORDER BY created_at, id",
    )
    .bind(group_id.to_string())
    .fetch_all(store.pool())
    .await?;

    rows.iter().map(map_conversation).collect()
}

/// Soft-delete the group and everything it owns, and enqueue the vector
/// cleanup task in the same transaction so embeddings cannot be orphaned.
pub(super) async fn soft_delete_group(
    store: &SqliteDatastore,
    group_id: Uuid,
) -> CoreResult<()> {
    let now = now_micros()?;
    let group_key = group_id.to_string();

    let mut conn = store.begin_immediate().await?;
    let result = async {
        let updated = sqlx::query(
            "UPDATE conversation_groups SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(micros(now))
        .bind(&group_key)
        .execute(&mut *conn)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("conversation group {group_id}")));
        }

        sqlx::query(
            "UPDATE conversations SET deleted_at = ?
             WHERE conversation_group_id = ? AND deleted_at IS NULL",
        )
        .bind(micros(now))
        .bind(&group_key)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "UPDATE entries SET deleted_at = ?
             WHERE conversation_group_id = ? AND deleted_at IS NULL",
        )
        .bind(micros(now))
        .bind(&group_key)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "UPDATE conversation_memberships SET deleted_at = ?
             WHERE conversation_group_id = ? AND deleted_at IS NULL",
        )
        .bind(micros(now))
        .bind(&group_key)
        .execute(&mut *conn)
        .await?;

        sqlx::query("DELETE FROM entries_fts WHERE conversation_group_id = ?")
            .bind(&group_key)
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            "INSERT INTO tasks (id, task_name, task_type, task_body, retry_at, retry_count, created_at)
             VALUES (?, ?, ?, ?, ?, 0, ?)
             ON CONFLICT(task_name) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(format!("{}:{}", task_types::VECTOR_STORE_DELETE, group_id))
        .bind(task_types::VECTOR_STORE_DELETE)
        .bind(
            serde_json::to_string(&serde_json::json!({ "conversationGroupId": group_id }))?,
        )
        .bind(micros(now))
        .bind(micros(now))
        .execute(&mut *conn)
        .await?;

        Ok::<_, CoreError>(())
    }
    .await;

    match result {
        Ok(()) => SqliteDatastore::commit(&mut conn).await,
        Err(e) => {
            SqliteDatastore::rollback(&mut conn).await;
            Err(e)
        }
    }
}
