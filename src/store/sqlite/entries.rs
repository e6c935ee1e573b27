// src/store/sqlite/entries.rs
// Append pipeline, epoch assignment, fork creation, entry reads, full-text

use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{Channel, Conversation, Entry, EpochFilter, NewEntry, SyncResult, parse_uuid};
use crate::store::{
    AppendEntriesRequest, FulltextHit, GroupEntriesQuery, ListEntriesQuery,
    validate_append_request,
};

use super::conversations::get_conversation_tx;
use super::rows::{conflict_on_unique, from_micros, map_entry, micros};
use super::{SqliteDatastore, now_micros};

pub(super) async fn append_entries(
    store: &SqliteDatastore,
    req: AppendEntriesRequest,
) -> CoreResult<Vec<Entry>> {
    validate_append_request(&req)?;

    let mut conn = store.begin_immediate().await?;
    let result = append_tx(&mut conn, store, &req).await;
    match result {
        Ok(entries) => {
            SqliteDatastore::commit(&mut conn).await?;
            Ok(entries)
        }
        Err(e) => {
            SqliteDatastore::rollback(&mut conn).await;
            Err(e)
        }
    }
}

async fn append_tx(
    conn: &mut SqliteConnection,
    store: &SqliteDatastore,
    req: &AppendEntriesRequest,
) -> CoreResult<Vec<Entry>> {
    let conversation = resolve_conversation(conn, req).await?;
    let now = now_micros()?;

    let is_memory = req
        .entries
        .first()
        .map(|e| e.channel == Channel::Memory)
        .unwrap_or(false);
    let epoch = if is_memory {
        let client_id = req
            .client_id
            .as_deref()
            .ok_or_else(|| CoreError::invalid_argument("MEMORY entries require a client id"))?;
        Some(assign_epoch(conn, conversation.id, client_id, req.epoch).await?)
    } else {
        None
    };

    let mut saved = Vec::with_capacity(req.entries.len());
    for (i, new_entry) in req.entries.iter().enumerate() {
        // Spread batch members across consecutive microseconds so the
        // (created_at, id) order matches insertion order.
        let created_at = now + Duration::microseconds(i as i64);
        let entry = insert_entry(
            conn,
            store,
            &conversation,
            new_entry,
            created_at,
            epoch,
            req.client_id.as_deref(),
        )
        .await?;
        saved.push(entry);
    }

    sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
        .bind(micros(now))
        .bind(conversation.id.to_string())
        .execute(&mut *conn)
        .await?;

    Ok(saved)
}

/// Look up the target branch; when it does not exist yet and a fork point
/// is supplied, create it in the ancestor's group.
async fn resolve_conversation(
    conn: &mut SqliteConnection,
    req: &AppendEntriesRequest,
) -> CoreResult<Conversation> {
    if let Some(existing) = get_conversation_tx(conn, req.conversation_id).await? {
        if let Some(fork) = &req.fork {
            let parent_matches = existing.forked_at_conversation_id
                == Some(fork.forked_at_conversation_id)
                && existing.forked_at_entry_id == Some(fork.forked_at_entry_id);
            if !parent_matches {
                return Err(CoreError::conflict(format!(
                    "conversation {} already exists with a different parent",
                    req.conversation_id
                )));
            }
        }
        return Ok(existing);
    }

    let fork = req.fork.as_ref().ok_or_else(|| {
        CoreError::not_found(format!("conversation {}", req.conversation_id))
    })?;

    let ancestor = get_conversation_tx(conn, fork.forked_at_conversation_id)
        .await?
        .ok_or_else(|| {
            CoreError::not_found(format!(
                "ancestor conversation {}",
                fork.forked_at_conversation_id
            ))
        })?;

    let anchor = sqlx::query(
        "SELECT 1 FROM entries WHERE id = ? AND conversation_id = ? AND deleted_at IS NULL",
    )
    .bind(fork.forked_at_entry_id.to_string())
    .bind(ancestor.id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    if anchor.is_none() {
        return Err(CoreError::not_found(format!(
            "fork entry {} in conversation {}",
            fork.forked_at_entry_id, ancestor.id
        )));
    }

    let now = now_micros()?;
    // Branches share the group and therefore all of its memberships.
    sqlx::query(
        "INSERT INTO conversations
             (id, conversation_group_id, owner_user_id, title,
              forked_at_conversation_id, forked_at_entry_id, created_at, updated_at)
         VALUES (?, ?, ?, NULL, ?, ?, ?, ?)",
    )
    .bind(req.conversation_id.to_string())
    .bind(ancestor.conversation_group_id.to_string())
    .bind(&ancestor.owner_user_id)
    .bind(fork.forked_at_conversation_id.to_string())
    .bind(fork.forked_at_entry_id.to_string())
    .bind(micros(now))
    .bind(micros(now))
    .execute(&mut *conn)
    .await
    .map_err(|e| conflict_on_unique(e, "conversation"))?;

    Ok(Conversation {
        id: req.conversation_id,
        conversation_group_id: ancestor.conversation_group_id,
        owner_user_id: ancestor.owner_user_id,
        title: None,
        forked_at_conversation_id: Some(fork.forked_at_conversation_id),
        forked_at_entry_id: Some(fork.forked_at_entry_id),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    })
}

/// Serialize epoch assignment inside the write transaction: implicit epochs
/// get `max + 1`, explicit epochs that collide with recorded ones lose.
async fn assign_epoch(
    conn: &mut SqliteConnection,
    conversation_id: Uuid,
    client_id: &str,
    explicit: Option<i64>,
) -> CoreResult<i64> {
    match explicit {
        Some(epoch) => {
            let taken: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM entries
                 WHERE conversation_id = ? AND channel = 'MEMORY'
                   AND client_id = ? AND epoch = ? AND deleted_at IS NULL
                 LIMIT 1",
            )
            .bind(conversation_id.to_string())
            .bind(client_id)
            .bind(epoch)
            .fetch_optional(&mut *conn)
            .await?;
            if taken.is_some() {
                return Err(CoreError::conflict(format!(
                    "epoch {epoch} already recorded for this conversation and client"
                )));
            }
            Ok(epoch)
        }
        None => {
            let max: Option<i64> = sqlx::query_scalar(
                "SELECT MAX(epoch) FROM entries
                 WHERE conversation_id = ? AND channel = 'MEMORY'
                   AND client_id = ? AND deleted_at IS NULL",
            )
            .bind(conversation_id.to_string())
            .bind(client_id)
            .fetch_one(&mut *conn)
            .await?;
            Ok(max.unwrap_or(0) + 1)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn insert_entry(
    conn: &mut SqliteConnection,
    store: &SqliteDatastore,
    conversation: &Conversation,
    new_entry: &NewEntry,
    created_at: DateTime<Utc>,
    epoch: Option<i64>,
    batch_client_id: Option<&str>,
) -> CoreResult<Entry> {
    let id = new_entry.id.unwrap_or_else(Uuid::new_v4);
    // MEMORY entries carry the batch client id; HISTORY/SUMMARY stay null.
    let client_id = if new_entry.channel == Channel::Memory {
        batch_client_id.map(str::to_string)
    } else {
        None
    };

    let payload = store.codec().encode_content(&new_entry.content)?;
    let refs_json = serde_json::to_string(&new_entry.attachment_refs)?;

    sqlx::query(
        "INSERT INTO entries
             (id, conversation_id, conversation_group_id, channel, client_id, epoch,
              created_at, content, indexed_content, attachment_refs)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(conversation.id.to_string())
    .bind(conversation.conversation_group_id.to_string())
    .bind(new_entry.channel.as_str())
    .bind(&client_id)
    .bind(epoch)
    .bind(micros(created_at))
    .bind(&payload)
    .bind(&new_entry.indexed_content)
    .bind(&refs_json)
    .execute(&mut *conn)
    .await
    .map_err(|e| conflict_on_unique(e, "entry"))?;

    if let Some(text) = &new_entry.indexed_content {
        sqlx::query(
            "INSERT INTO entries_fts (indexed_content, entry_id, conversation_id, conversation_group_id)
             VALUES (?, ?, ?, ?)",
        )
        .bind(text)
        .bind(id.to_string())
        .bind(conversation.id.to_string())
        .bind(conversation.conversation_group_id.to_string())
        .execute(&mut *conn)
        .await?;
    }

    for attachment_id in &new_entry.attachment_refs {
        let linked = sqlx::query(
            "UPDATE attachments SET entry_id = ?, expires_at = NULL
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id.to_string())
        .bind(attachment_id.to_string())
        .execute(&mut *conn)
        .await?;
        if linked.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("attachment {attachment_id}")));
        }
    }

    Ok(Entry {
        id,
        conversation_id: conversation.id,
        conversation_group_id: conversation.conversation_group_id,
        channel: new_entry.channel,
        client_id,
        epoch,
        created_at,
        content: new_entry.content.clone(),
        indexed_content: new_entry.indexed_content.clone(),
        indexed_at: None,
        attachment_refs: new_entry.attachment_refs.clone(),
    })
}

pub(super) async fn sync_agent_entry(
    store: &SqliteDatastore,
    conversation_id: Uuid,
    entry: NewEntry,
    client_id: Option<String>,
) -> CoreResult<SyncResult> {
    let id = entry.id.ok_or_else(|| {
        CoreError::invalid_argument("sync requires a client-supplied entry id")
    })?;

    if let Some(existing) = try_get_entry(store, id).await? {
        if existing.conversation_id != conversation_id {
            return Err(CoreError::conflict(format!(
                "entry {id} belongs to a different conversation"
            )));
        }
        return Ok(SyncResult {
            entry: existing,
            already_existed: true,
        });
    }

    let req = AppendEntriesRequest {
        conversation_id,
        entries: vec![entry],
        client_id,
        epoch: None,
        fork: None,
    };
    match append_entries(store, req).await {
        Ok(mut entries) => Ok(SyncResult {
            entry: entries.remove(0),
            already_existed: false,
        }),
        // Lost the insert race: another writer recorded the same id.
        Err(CoreError::Conflict(_)) => {
            let existing = get_entry(store, id).await?;
            Ok(SyncResult {
                entry: existing,
                already_existed: true,
            })
        }
        Err(e) => Err(e),
    }
}

pub(super) async fn get_entry(store: &SqliteDatastore, entry_id: Uuid) -> CoreResult<Entry> {
    try_get_entry(store, entry_id)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("entry {entry_id}")))
}

async fn try_get_entry(store: &SqliteDatastore, entry_id: Uuid) -> CoreResult<Option<Entry>> {
    let row = sqlx::query("SELECT * FROM entries WHERE id = ? AND deleted_at IS NULL")
        .bind(entry_id.to_string())
        .fetch_optional(store.pool())
        .await?;

    row.map(|row| map_entry(&row, store.codec())).transpose()
}

/// Resolve a cursor entry to its `(created_at, id)` position. An id that
/// does not belong to the expected conversation/channel yields `None` and
/// the caller falls back to start-of-range.
async fn entry_position(
    store: &SqliteDatastore,
    entry_id: Uuid,
    conversation_id: Option<Uuid>,
    group_id: Option<Uuid>,
    channel: Option<Channel>,
) -> CoreResult<Option<(i64, String)>> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT created_at, id FROM entries WHERE deleted_at IS NULL AND id = ");
    qb.push_bind(entry_id.to_string());
    if let Some(conversation_id) = conversation_id {
        qb.push(" AND conversation_id = ");
        qb.push_bind(conversation_id.to_string());
    }
    if let Some(group_id) = group_id {
        qb.push(" AND conversation_group_id = ");
        qb.push_bind(group_id.to_string());
    }
    if let Some(channel) = channel {
        qb.push(" AND channel = ");
        qb.push_bind(channel.as_str());
    }

    let row = qb.build().fetch_optional(store.pool()).await?;
    Ok(row.map(|row| (row.get("created_at"), row.get("id"))))
}

pub(super) async fn list_entries(
    store: &SqliteDatastore,
    query: ListEntriesQuery,
) -> CoreResult<Vec<Entry>> {
    if matches!(query.epoch, Some(EpochFilter::Latest)) && query.client_id.is_none() {
        return Err(CoreError::invalid_argument(
            "latest-epoch reads require a client id",
        ));
    }

    let after = match query.after_entry_id {
        Some(id) => {
            entry_position(store, id, Some(query.conversation_id), None, query.channel).await?
        }
        None => None,
    };
    let up_to = match query.up_to_entry_id {
        Some(id) => entry_position(store, id, Some(query.conversation_id), None, None).await?,
        None => None,
    };

    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT * FROM entries WHERE deleted_at IS NULL AND conversation_id = ");
    qb.push_bind(query.conversation_id.to_string());

    if let Some(channel) = query.channel {
        qb.push(" AND channel = ");
        qb.push_bind(channel.as_str());
    }
    if let Some(client_id) = &query.client_id {
        qb.push(" AND client_id = ");
        qb.push_bind(client_id.clone());
    }
    match query.epoch {
        // Single atomic statement: the max-epoch subquery and the row scan
        // see the same snapshot, so a racing append cannot mix epochs.
        Some(EpochFilter::Latest) => {
            let client_id = query.client_id.clone().unwrap_or_default();
            qb.push(
                " AND epoch = (SELECT MAX(epoch) FROM entries \
                 WHERE conversation_id = ",
            );
            qb.push_bind(query.conversation_id.to_string());
            qb.push(" AND channel = 'MEMORY' AND client_id = ");
            qb.push_bind(client_id);
            qb.push(" AND deleted_at IS NULL)");
        }
        Some(EpochFilter::Exact(epoch)) => {
            qb.push(" AND epoch = ");
            qb.push_bind(epoch);
        }
        Some(EpochFilter::All) | None => {}
    }
    push_range_and_limit(&mut qb, after, up_to, query.limit);

    let rows = qb.build().fetch_all(store.pool()).await?;
    rows.iter().map(|row| map_entry(row, store.codec())).collect()
}

pub(super) async fn list_by_conversation_group(
    store: &SqliteDatastore,
    query: GroupEntriesQuery,
) -> CoreResult<Vec<Entry>> {
    let after = match query.after_entry_id {
        Some(id) => {
            entry_position(store, id, None, Some(query.conversation_group_id), query.channel)
                .await?
        }
        None => None,
    };

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT * FROM entries WHERE deleted_at IS NULL AND conversation_group_id = ",
    );
    qb.push_bind(query.conversation_group_id.to_string());

    if let Some(channel) = query.channel {
        qb.push(" AND channel = ");
        qb.push_bind(channel.as_str());
    }
    if let Some(client_id) = &query.client_id {
        qb.push(" AND client_id = ");
        qb.push_bind(client_id.clone());
    }
    push_range_and_limit(&mut qb, after, None, query.limit);

    let rows = qb.build().fetch_all(store.pool()).await?;
    rows.iter().map(|row| map_entry(row, store.codec())).collect()
}

fn push_range_and_limit(
    qb: &mut QueryBuilder<Sqlite>,
    after: Option<(i64, String)>,
    up_to: Option<(i64, String)>,
    limit: usize,
) {
    if let Some((created_at, id)) = after {
        qb.push(" AND (created_at, id) > (");
        qb.push_bind(created_at);
        qb.push(", ");
        qb.push_bind(id);
        qb.push(")");
    }
    if let Some((created_at, id)) = up_to {
        qb.push(" AND (created_at, id) <= (");
        qb.push_bind(created_at);
        qb.push(", ");
        qb.push_bind(id);
        qb.push(")");
    }
    qb.push(" ORDER BY created_at, id LIMIT ");
    qb.push_bind(if limit == 0 { -1 } else { limit as i64 });
}

pub(super) async fn latest_memory_epoch(
    store: &SqliteDatastore,
    conversation_id: Uuid,
    client_id: &str,
) -> CoreResult<Option<i64>> {
    let max: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(epoch) FROM entries
         WHERE conversation_id = ? AND channel = 'MEMORY'
           AND client_id = ? AND deleted_at IS NULL",
    )
    .bind(conversation_id.to_string())
    .bind(client_id)
    .fetch_one(store.pool())
    .await?;
    Ok(max)
}

pub(super) async fn set_indexed_content(
    store: &SqliteDatastore,
    entry_id: Uuid,
    text: &str,
) -> CoreResult<bool> {
    let mut conn = store.begin_immediate().await?;
    let result = async {
        let updated = sqlx::query(
            "UPDATE entries SET indexed_content = ?
             WHERE id = ? AND indexed_content IS NULL AND deleted_at IS NULL",
        )
        .bind(text)
        .bind(entry_id.to_string())
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() == 0 {
            let existing: Option<Option<String>> = sqlx::query_scalar(
                "SELECT indexed_content FROM entries WHERE id = ? AND deleted_at IS NULL",
            )
            .bind(entry_id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
            return match existing {
                // Already projected; set-once means we leave it alone.
                Some(_) => Ok(false),
                None => Err(CoreError::not_found(format!("entry {entry_id}"))),
            };
        }

        let row = sqlx::query(
            "SELECT conversation_id, conversation_group_id FROM entries WHERE id = ?",
        )
        .bind(entry_id.to_string())
        .fetch_one(&mut *conn)
        .await?;
        let conversation_id: String = row.get("conversation_id");
        let group_id: String = row.get("conversation_group_id");

        sqlx::query(
            "INSERT INTO entries_fts (indexed_content, entry_id, conversation_id, conversation_group_id)
             VALUES (?, ?, ?, ?)",
        )
        .bind(text)
        .bind(entry_id.to_string())
        .bind(conversation_id)
        .bind(group_id)
        .execute(&mut *conn)
        .await?;

        Ok(true)
    }
    .await;

    match result {
        Ok(written) => {
            SqliteDatastore::commit(&mut conn).await?;
            Ok(written)
        }
        Err(e) => {
            SqliteDatastore::rollback(&mut conn).await;
            Err(e)
        }
    }
}

pub(super) async fn set_indexed_at(
    store: &SqliteDatastore,
    entry_id: Uuid,
    at: DateTime<Utc>,
) -> CoreResult<()> {
    let updated = sqlx::query(
        "UPDATE entries SET indexed_at = ? WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(micros(at))
    .bind(entry_id.to_string())
    .execute(store.pool())
    .await?;

    if updated.rows_affected() == 0 {
        return Err(CoreError::not_found(format!("entry {entry_id}")));
    }
    Ok(())
}

/// Escape user input into quoted FTS5 terms; raw syntax never reaches the
/// MATCH parser.
fn fts_match_expression(raw: &str) -> Option<String> {
    let tokens: Vec<String> = raw
        .split_whitespace()
        .map(|t| {
            t.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

pub(super) async fn fulltext_search(
    store: &SqliteDatastore,
    user_id: &str,
    query: &str,
    limit: usize,
) -> CoreResult<Vec<FulltextHit>> {
    let Some(match_expr) = fts_match_expression(query) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query(
        r#"
        SELECT entries_fts.entry_id, entries_fts.conversation_id,
               entries_fts.conversation_group_id,
               bm25(entries_fts) AS rank, e.created_at
        FROM entries_fts
        JOIN entries e
          ON e.id = entries_fts.entry_id AND e.deleted_at IS NULL
        JOIN conversation_memberships m
          ON m.conversation_group_id = entries_fts.conversation_group_id
         AND m.user_id = ? AND m.deleted_at IS NULL
        WHERE entries_fts MATCH ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(&match_expr)
    .bind(if limit == 0 { -1 } else { limit as i64 })
    .fetch_all(store.pool())
    .await?;

    rows.iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            Ok(FulltextHit {
                entry_id: parse_uuid(&row.get::<String, _>("entry_id"))?,
                conversation_id: parse_uuid(&row.get::<String, _>("conversation_id"))?,
                conversation_group_id: parse_uuid(
                    &row.get::<String, _>("conversation_group_id"),
                )?,
                // bm25 ranks lower-is-better; flip so higher is better.
                score: -rank,
                created_at: from_micros(row.get("created_at"))?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_expression_quotes_tokens() {
        assert_eq!(
            fts_match_expression("hello AND world)").as_deref(),
            Some("\"hello\" \"AND\" \"world\"")
        );
        assert_eq!(fts_match_expression("  (){} "), None);
        assert_eq!(fts_match_expression(""), None);
    }
}
