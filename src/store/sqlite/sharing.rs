// src/store/sqlite/sharing.rs
// Memberships and the ownership-transfer state machine

use sqlx::Row;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{AccessLevel, ConversationMembership, OwnershipTransfer, parse_uuid};

use super::rows::{conflict_on_unique, map_membership, map_transfer, micros};
use super::{SqliteDatastore, now_micros};

pub(super) async fn get_membership(
    store: &SqliteDatastore,
    group_id: Uuid,
    user_id: &str,
) -> CoreResult<Option<ConversationMembership>> {
    let row = sqlx::query(
        "SELECT * FROM conversation_memberships
         WHERE conversation_group_id = ? AND user_id = ? AND deleted_at IS NULL",
    )
    .bind(group_id.to_string())
    .bind(user_id)
    .fetch_optional(store.pool())
    .await?;

    row.map(|row| map_membership(&row)).transpose()
}

pub(super) async fn upsert_membership(
    store: &SqliteDatastore,
    group_id: Uuid,
    user_id: &str,
    access_level: AccessLevel,
) -> CoreResult<ConversationMembership> {
    let now = now_micros()?;
    sqlx::query(
        "INSERT INTO conversation_memberships
             (conversation_group_id, user_id, access_level, created_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(conversation_group_id, user_id) DO UPDATE SET
             access_level = excluded.access_level,
             deleted_at = NULL",
    )
    .bind(group_id.to_string())
    .bind(user_id)
    .bind(access_level.as_str())
    .bind(micros(now))
    .execute(store.pool())
    .await?;

    get_membership(store, group_id, user_id)
        .await?
        .ok_or_else(|| CoreError::internal("membership vanished after upsert"))
}

pub(super) async fn remove_membership(
    store: &SqliteDatastore,
    group_id: Uuid,
    user_id: &str,
) -> CoreResult<()> {
    let removed = sqlx::query(
        "UPDATE conversation_memberships SET deleted_at = ?
         WHERE conversation_group_id = ? AND user_id = ? AND deleted_at IS NULL",
    )
    .bind(micros(now_micros()?))
    .bind(group_id.to_string())
    .bind(user_id)
    .execute(store.pool())
    .await?;

    if removed.rows_affected() == 0 {
        return Err(CoreError::not_found(format!(
            "membership of {user_id} in group {group_id}"
        )));
    }
    Ok(())
}

pub(super) async fn list_memberships(
    store: &SqliteDatastore,
    group_id: Uuid,
) -> CoreResult<Vec<ConversationMembership>> {
    let rows = sqlx::query(
        "SELECT * FROM conversation_memberships
         WHERE conversation_group_id = ? AND deleted_at IS NULL
         ORDER BY created_at, user_id",
    )
    .bind(group_id.to_string())
    .fetch_all(store.pool())
    .await?;

    rows.iter().map(map_membership).collect()
}

pub(super) async fn list_group_ids_for_user(
    store: &SqliteDatastore,
    user_id: &str,
    limit: usize,
    order_by_recent: bool,
) -> CoreResult<Vec<Uuid>> {
    // O(memberships): the scan walks the user's membership index, never the
    // entry table.
    let sql = if order_by_recent {
        "SELECT m.conversation_group_id
         FROM conversation_memberships m
         JOIN conversation_groups g
           ON g.id = m.conversation_group_id AND g.deleted_at IS NULL
         WHERE m.user_id = ? AND m.deleted_at IS NULL
         ORDER BY (
             SELECT COALESCE(MAX(c.updated_at), g.created_at)
             FROM conversations c
             WHERE c.conversation_group_id = m.conversation_group_id
               AND c.deleted_at IS NULL
         ) DESC
         LIMIT ?"
    } else {
        "SELECT m.conversation_group_id
         FROM conversation_memberships m
         JOIN conversation_groups g
           ON g.id = m.conversation_group_id AND g.deleted_at IS NULL
         WHERE m.user_id = ? AND m.deleted_at IS NULL
         ORDER BY m.created_at
         LIMIT ?"
    };

    let rows = sqlx::query(sql)
        .bind(user_id)
        .bind(if limit == 0 { -1 } else { limit as i64 })
        .fetch_all(store.pool())
        .await?;

    rows.iter()
        .map(|row| parse_uuid(&row.get::<String, _>("conversation_group_id")))
        .collect()
}

pub(super) async fn create_transfer(
    store: &SqliteDatastore,
    group_id: Uuid,
    from_user_id: &str,
    to_user_id: &str,
) -> CoreResult<OwnershipTransfer> {
    let now = now_micros()?;
    let id = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO conversation_ownership_transfers
             (id, conversation_group_id, from_user_id, to_user_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(group_id.to_string())
    .bind(from_user_id)
    .bind(to_user_id)
    .bind(micros(now))
    .bind(micros(now))
    .execute(store.pool())
    .await
    .map_err(|e| conflict_on_unique(e, "pending transfer for group"))?;

    Ok(OwnershipTransfer {
        id,
        conversation_group_id: group_id,
        from_user_id: from_user_id.to_string(),
        to_user_id: to_user_id.to_string(),
        created_at: now,
        updated_at: now,
    })
}

pub(super) async fn get_transfer(
    store: &SqliteDatastore,
    id: Uuid,
) -> CoreResult<OwnershipTransfer> {
    let row = sqlx::query("SELECT * FROM conversation_ownership_transfers WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(store.pool())
        .await?
        .ok_or_else(|| CoreError::not_found(format!("ownership transfer {id}")))?;

    map_transfer(&row)
}

pub(super) async fn delete_transfer(store: &SqliteDatastore, id: Uuid) -> CoreResult<()> {
    let deleted = sqlx::query("DELETE FROM conversation_ownership_transfers WHERE id = ?")
        .bind(id.to_string())
        .execute(store.pool())
        .await?;

    if deleted.rows_affected() == 0 {
        return Err(CoreError::not_found(format!("ownership transfer {id}")));
    }
    Ok(())
}

/// Demote the current OWNER to MANAGER, promote the recipient to OWNER, and
/// delete the transfer, all inside one transaction so the group never has
/// zero or two owners.
pub(super) async fn accept_transfer(store: &SqliteDatastore, id: Uuid) -> CoreResult<()> {
    let mut conn = store.begin_immediate().await?;
    let result = async {
        let row = sqlx::query("SELECT * FROM conversation_ownership_transfers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("ownership transfer {id}")))?;
        let transfer = map_transfer(&row)?;
        let group_key = transfer.conversation_group_id.to_string();
        let now = now_micros()?;

        sqlx::query(
            "UPDATE conversation_memberships SET access_level = ?
             WHERE conversation_group_id = ? AND access_level = ? AND deleted_at IS NULL",
        )
        .bind(AccessLevel::Manager.as_str())
        .bind(&group_key)
        .bind(AccessLevel::Owner.as_str())
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO conversation_memberships
                 (conversation_group_id, user_id, access_level, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(conversation_group_id, user_id) DO UPDATE SET
                 access_level = excluded.access_level,
                 deleted_at = NULL",
        )
        .bind(&group_key)
        .bind(&transfer.to_user_id)
        .bind(AccessLevel::Owner.as_str())
        .bind(micros(now))
        .execute(&mut *conn)
        .await?;

        sqlx::query("DELETE FROM conversation_ownership_transfers WHERE id = ?")
            .bind(id.to_string())
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
