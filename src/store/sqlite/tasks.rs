// src/store/sqlite/tasks.rs
// Durable task rows with claim-based leasing

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::Task;
use crate::store::NewTask;

use super::rows::{map_task, micros};
use super::{SqliteDatastore, now_micros};

pub(super) async fn create(store: &SqliteDatastore, task: NewTask) -> CoreResult<bool> {
    let now = now_micros()?;
    let body = serde_json::to_string(&task.task_body)?;

    let inserted = match &task.task_name {
        // Named task: idempotent create; an existing name is a no-op.
        Some(name) => {
            sqlx::query(
                "INSERT INTO tasks (id, task_name, task_type, task_body, retry_at, retry_count, created_at)
                 VALUES (?, ?, ?, ?, ?, 0, ?)
                 ON CONFLICT(task_name) DO NOTHING",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(name)
            .bind(&task.task_type)
            .bind(&body)
            .bind(micros(task.retry_at))
            .bind(micros(now))
            .execute(store.pool())
            .await?
        }
        None => {
            sqlx::query(
                "INSERT INTO tasks (id, task_name, task_type, task_body, retry_at, retry_count, created_at)
                 VALUES (?, NULL, ?, ?, ?, 0, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&task.task_type)
            .bind(&body)
            .bind(micros(task.retry_at))
            .bind(micros(now))
            .execute(store.pool())
            .await?
        }
    };

    Ok(inserted.rows_affected() == 1)
}

pub(super) async fn find_by_name(
    store: &SqliteDatastore,
    name: &str,
) -> CoreResult<Option<Task>> {
    let row = sqlx::query("SELECT * FROM tasks WHERE task_name = ?")
        .bind(name)
        .fetch_optional(store.pool())
        .await?;

    row.map(|row| map_task(&row)).transpose()
}

/// Claim up to `batch` eligible tasks one at a time. Each claim is a single
/// atomic UPDATE, so two workers can never both observe a task as theirs.
pub(super) async fn claim_due(
    store: &SqliteDatastore,
    now: DateTime<Utc>,
    batch: usize,
    stale_claim_timeout: std::time::Duration,
) -> CoreResult<Vec<Task>> {
    let now_raw = micros(now);
    let stale_cutoff = now_raw - stale_claim_timeout.as_micros() as i64;

    let mut claimed = Vec::new();
    for _ in 0..batch {
        let row = sqlx::query(
            "UPDATE tasks SET processing_at = ?
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE retry_at <= ?
                   AND (processing_at IS NULL OR processing_at < ?)
                 ORDER BY retry_at
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(now_raw)
        .bind(now_raw)
        .bind(stale_cutoff)
        .fetch_optional(store.pool())
        .await?;

        match row {
            Some(row) => claimed.push(map_task(&row)?),
            None => break,
        }
    }
    Ok(claimed)
}

pub(super) async fn complete(store: &SqliteDatastore, id: Uuid) -> CoreResult<()> {
    sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(id.to_string())
        .execute(store.pool())
        .await?;
    Ok(())
}

pub(super) async fn fail(
    store: &SqliteDatastore,
    id: Uuid,
    error: &str,
    retry_at: DateTime<Utc>,
) -> CoreResult<()> {
    let updated = sqlx::query(
        "UPDATE tasks SET
             last_error = ?,
             retry_count = retry_count + 1,
             retry_at = ?,
             processing_at = NULL
         WHERE id = ?",
    )
    .bind(error)
    .bind(micros(retry_at))
    .bind(id.to_string())
    .execute(store.pool())
    .await?;

    if updated.rows_affected() == 0 {
        return Err(CoreError::not_found(format!("task {id}")));
    }
    Ok(())
}
