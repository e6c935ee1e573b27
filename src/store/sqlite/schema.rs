// src/store/sqlite/schema.rs
// Table definitions for the relational adapter

use sqlx::SqlitePool;

use crate::error::CoreResult;

pub async fn init(pool: &SqlitePool) -> CoreResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_groups (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            conversation_group_id TEXT NOT NULL,
            owner_user_id TEXT NOT NULL,
            title TEXT,
            forked_at_conversation_id TEXT,
            forked_at_entry_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            deleted_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversations_group
         ON conversations(conversation_group_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_memberships (
            conversation_group_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            access_level TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER,
            PRIMARY KEY (conversation_group_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_memberships_user
         ON conversation_memberships(user_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            conversation_group_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            client_id TEXT,
            epoch INTEGER,
            created_at INTEGER NOT NULL,
            content TEXT NOT NULL,
            indexed_content TEXT,
            indexed_at INTEGER,
            attachment_refs TEXT NOT NULL DEFAULT '[]',
            deleted_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_conversation
         ON entries(conversation_id, channel, created_at, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_group
         ON entries(conversation_group_id, created_at, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_epoch
         ON entries(conversation_id, client_id, epoch)",
    )
    .execute(pool)
    .await?;

    // FTS5 full-text search index over the plain-text projection
    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS entries_fts USING fts5(
            indexed_content,
            entry_id UNINDEXED,
            conversation_id UNINDEXED,
            conversation_group_id UNINDEXED
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS attachments (
            id TEXT PRIMARY KEY,
            storage_key TEXT NOT NULL,
            filename TEXT NOT NULL,
            content_type TEXT NOT NULL,
            size INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            user_id TEXT NOT NULL,
            entry_id TEXT,
            expires_at INTEGER,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER,
            status TEXT NOT NULL,
            source_url TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_attachments_entry ON attachments(entry_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_attachments_eviction
         ON attachments(deleted_at, expires_at)",
    )
    .execute(pool)
    .await?;

    // One pending transfer per group, enforced by the unique constraint
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_ownership_transfers (
            id TEXT PRIMARY KEY,
            conversation_group_id TEXT NOT NULL UNIQUE,
            from_user_id TEXT NOT NULL,
            to_user_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            task_name TEXT UNIQUE,
            task_type TEXT NOT NULL,
            task_body TEXT NOT NULL,
            retry_at INTEGER NOT NULL,
            processing_at INTEGER,
            last_error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_retry ON tasks(retry_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS encryption_deks (
            provider TEXT PRIMARY KEY,
            wrapped_deks TEXT NOT NULL,
            revision INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
