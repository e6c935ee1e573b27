// src/store/sqlite/mod.rs

//! Relational datastore adapter on SQLite.
//!
//! WAL journal mode with a busy timeout; every multi-statement write runs
//! inside `BEGIN IMMEDIATE` so concurrent writers serialize instead of
//! deadlocking on a lock upgrade.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::config::DatastoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::model::{
    AccessLevel, Attachment, AttachmentStatus, Conversation, ConversationGroup,
    ConversationMembership, DekRecord, Entry, NewEntry, OwnershipTransfer, SyncResult, Task,
};
use crate::store::codec::EntryCodec;
use crate::store::{
    AppendEntriesRequest, Datastore, FulltextHit, GroupEntriesQuery, ListEntriesQuery, NewTask,
};

mod attachments;
mod conversations;
mod entries;
mod schema;
mod sharing;
mod tasks;

pub(crate) mod rows;

use rows::{from_micros, micros};

pub struct SqliteDatastore {
    pool: SqlitePool,
    codec: EntryCodec,
}

impl SqliteDatastore {
    pub async fn connect(config: &DatastoreConfig, codec: EntryCodec) -> CoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.url)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        schema::init(&pool).await?;
        Ok(Self { pool, codec })
    }

    /// The underlying pool, shared with the colocated vector index.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn codec(&self) -> &EntryCodec {
        &self.codec
    }

    /// Take a write lock up front; readers proceed, writers queue on the
    /// busy timeout instead of failing a mid-transaction lock upgrade.
    pub(crate) async fn begin_immediate(&self) -> CoreResult<PoolConnection<Sqlite>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(conn)
    }

    pub(crate) async fn commit(conn: &mut SqliteConnection) -> CoreResult<()> {
        sqlx::query("COMMIT").execute(conn).await?;
        Ok(())
    }

    pub(crate) async fn rollback(conn: &mut SqliteConnection) {
        let _ = sqlx::query("ROLLBACK").execute(conn).await;
    }
}

#[async_trait]
impl Datastore for SqliteDatastore {
    async fn create_root_conversation(
        &self,
        owner_user_id: &str,
        title: Option<String>,
    ) -> CoreResult<Conversation> {
        conversations::create_root(self, owner_user_id, title).await
    }

    async fn get_group(&self, group_id: Uuid) -> CoreResult<ConversationGroup> {
        conversations::get_group(self, group_id).await
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> CoreResult<Conversation> {
        conversations::get_conversation(self, conversation_id).await
    }

    async fn list_conversations_in_group(
        &self,
        group_id: Uuid,
    ) -> CoreResult<Vec<Conversation>> {
        conversations::list_in_group(self, group_id).await
    }

    async fn soft_delete_group(&self, group_id: Uuid) -> CoreResult<()> {
        conversations::soft_delete_group(self, group_id).await
    }

    async fn get_membership(
        &self,
        group_id: Uuid,
        user_id: &str,
    ) -> CoreResult<Option<ConversationMembership>> {
        sharing::get_membership(self, group_id, user_id).await
    }

    async fn upsert_membership(
        &self,
        group_id: Uuid,
        user_id: &str,
        access_level: AccessLevel,
    ) -> CoreResult<ConversationMembership> {
        sharing::upsert_membership(self, group_id, user_id, access_level).await
    }

    async fn remove_membership(&self, group_id: Uuid, user_id: &str) -> CoreResult<()> {
        sharing::remove_membership(self, group_id, user_id).await
    }

    async fn list_memberships(
        &self,
        group_id: Uuid,
    ) -> CoreResult<Vec<ConversationMembership>> {
        sharing::list_memberships(self, group_id).await
    }

    async fn list_group_ids_for_user(
        &self,
        user_id: &str,
        limit: usize,
        order_by_recent: bool,
    ) -> CoreResult<Vec<Uuid>> {
        sharing::list_group_ids_for_user(self, user_id, limit, order_by_recent).await
    }

    async fn append_entries(&self, req: AppendEntriesRequest) -> CoreResult<Vec<Entry>> {
        entries::append_entries(self, req).await
    }

    async fn sync_agent_entry(
        &self,
        conversation_id: Uuid,
        entry: NewEntry,
        client_id: Option<String>,
    ) -> CoreResult<SyncResult> {
        entries::sync_agent_entry(self, conversation_id, entry, client_id).await
    }

    async fn get_entry(&self, entry_id: Uuid) -> CoreResult<Entry> {
        entries::get_entry(self, entry_id).await
    }

    async fn list_entries(&self, query: ListEntriesQuery) -> CoreResult<Vec<Entry>> {
        entries::list_entries(self, query).await
    }

    async fn list_by_conversation_group(
        &self,
        query: GroupEntriesQuery,
    ) -> CoreResult<Vec<Entry>> {
        entries::list_by_conversation_group(self, query).await
    }

    async fn latest_memory_epoch(
        &self,
        conversation_id: Uuid,
        client_id: &str,
    ) -> CoreResult<Option<i64>> {
        entries::latest_memory_epoch(self, conversation_id, client_id).await
    }

    async fn set_indexed_content(&self, entry_id: Uuid, text: &str) -> CoreResult<bool> {
        entries::set_indexed_content(self, entry_id, text).await
    }

    async fn set_indexed_at(&self, entry_id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        entries::set_indexed_at(self, entry_id, at).await
    }

    async fn fulltext_search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> CoreResult<Vec<FulltextHit>> {
        entries::fulltext_search(self, user_id, query, limit).await
    }

    async fn create_attachment(&self, attachment: &Attachment) -> CoreResult<()> {
        attachments::create(self, attachment).await
    }

    async fn get_attachment(&self, id: Uuid) -> CoreResult<Attachment> {
        attachments::get(self, id).await
    }

    async fn finalize_attachment(
        &self,
        id: Uuid,
        status: AttachmentStatus,
        storage_key: Option<&str>,
        size: Option<i64>,
        sha256: Option<&str>,
    ) -> CoreResult<()> {
        attachments::finalize(self, id, status, storage_key, size, sha256).await
    }

    async fn soft_delete_attachment(&self, id: Uuid) -> CoreResult<()> {
        attachments::soft_delete(self, id).await
    }

    async fn list_evictable_attachments(
        &self,
        now: DateTime<Utc>,
        tombstone_retention: std::time::Duration,
        limit: usize,
    ) -> CoreResult<Vec<Attachment>> {
        attachments::list_evictable(self, now, tombstone_retention, limit).await
    }

    async fn hard_delete_attachment(&self, id: Uuid) -> CoreResult<()> {
        attachments::hard_delete(self, id).await
    }

    async fn create_transfer(
        &self,
        group_id: Uuid,
        from_user_id: &str,
        to_user_id: &str,
    ) -> CoreResult<OwnershipTransfer> {
        sharing::create_transfer(self, group_id, from_user_id, to_user_id).await
    }

    async fn get_transfer(&self, id: Uuid) -> CoreResult<OwnershipTransfer> {
        sharing::get_transfer(self, id).await
    }

    async fn delete_transfer(&self, id: Uuid) -> CoreResult<()> {
        sharing::delete_transfer(self, id).await
    }

    async fn accept_transfer(&self, id: Uuid) -> CoreResult<()> {
        sharing::accept_transfer(self, id).await
    }

    async fn create_task(&self, task: NewTask) -> CoreResult<bool> {
        tasks::create(self, task).await
    }

    async fn find_task_by_name(&self, name: &str) -> CoreResult<Option<Task>> {
        tasks::find_by_name(self, name).await
    }

    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        batch: usize,
        stale_claim_timeout: std::time::Duration,
    ) -> CoreResult<Vec<Task>> {
        tasks::claim_due(self, now, batch, stale_claim_timeout).await
    }

    async fn complete_task(&self, id: Uuid) -> CoreResult<()> {
        tasks::complete(self, id).await
    }

    async fn fail_task(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        tasks::fail(self, id, error, retry_at).await
    }

    async fn get_dek_record(&self, provider: &str) -> CoreResult<Option<DekRecord>> {
        let row = sqlx::query(
            "SELECT provider, wrapped_deks, revision FROM encryption_deks WHERE provider = ?",
        )
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let wrapped_json: String = row.get("wrapped_deks");
            Ok(DekRecord {
                provider: row.get("provider"),
                wrapped_deks: serde_json::from_str(&wrapped_json)?,
                revision: row.get("revision"),
            })
        })
        .transpose()
    }

    async fn insert_dek_record_if_absent(&self, record: &DekRecord) -> CoreResult<DekRecord> {
        sqlx::query(
            "INSERT INTO encryption_deks (provider, wrapped_deks, revision)
             VALUES (?, ?, ?)
             ON CONFLICT(provider) DO NOTHING",
        )
        .bind(&record.provider)
        .bind(serde_json::to_string(&record.wrapped_deks)?)
        .bind(record.revision)
        .execute(&self.pool)
        .await?;

        self.get_dek_record(&record.provider)
            .await?
            .ok_or_else(|| CoreError::internal("DEK record vanished after insert"))
    }

    async fn update_dek_record(
        &self,
        record: &DekRecord,
        expected_revision: i64,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE encryption_deks SET wrapped_deks = ?, revision = ?
             WHERE provider = ? AND revision = ?",
        )
        .bind(serde_json::to_string(&record.wrapped_deks)?)
        .bind(record.revision)
        .bind(&record.provider)
        .bind(expected_revision)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// Shared helper: current instant truncated to whole microseconds so stored
/// ordering and returned models agree exactly.
pub(crate) fn now_micros() -> CoreResult<DateTime<Utc>> {
    from_micros(micros(Utc::now()))
}
