// src/tasks/mod.rs

//! Background task processor: a single polling worker loop per process,
//! claim-based so multiple replicas share the queue safely. Claims are
//! datastore rows; a crashed worker's claim goes stale and is re-taken.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::attachments::AttachmentStore;
use crate::config::{AttachmentsConfig, TasksConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{CoreError, CoreResult};
use crate::model::{Task, task_types};
use crate::store::{Datastore, NewTask};
use crate::vector::{EmbeddingPoint, VectorIndex};

pub struct TaskProcessor {
    store: Arc<dyn Datastore>,
    vector: Option<Arc<dyn VectorIndex>>,
    embedding: Arc<dyn EmbeddingProvider>,
    blobs: Arc<dyn AttachmentStore>,
    config: TasksConfig,
    attachments: AttachmentsConfig,
}

impl TaskProcessor {
    pub fn new(
        store: Arc<dyn Datastore>,
        vector: Option<Arc<dyn VectorIndex>>,
        embedding: Arc<dyn EmbeddingProvider>,
        blobs: Arc<dyn AttachmentStore>,
        config: TasksConfig,
        attachments: AttachmentsConfig,
    ) -> Self {
        Self {
            store,
            vector,
            embedding,
            blobs,
            config,
            attachments,
        }
    }

    /// Start the worker loop. Also seeds the recurring eviction singleton.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.interval;
        tokio::spawn(async move {
            info!("task processor started (interval: {:?})", interval);

            if let Err(e) = self.seed_eviction_task().await {
                warn!("failed to seed attachment eviction task: {}", e);
            }

            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.tick().await {
                    Ok(0) => {}
                    Ok(processed) => {
                        debug!("processed {} background tasks", processed);
                    }
                    Err(e) => {
                        error!("task processing tick failed: {}", e);
                    }
                }
            }
        })
    }

    /// One poll: claim up to `batch_size` eligible tasks and run them
    /// serially, each under the per-task wall-clock budget.
    pub async fn tick(&self) -> CoreResult<usize> {
        let now = Utc::now();
        let claimed = self
            .store
            .claim_due_tasks(now, self.config.batch_size, self.config.stale_claim_timeout)
            .await?;

        let mut processed = 0;
        for task in claimed {
            let started = std::time::Instant::now();
            let outcome =
                time::timeout(self.config.task_timeout, self.execute(&task)).await;

            match outcome {
                Ok(Ok(())) => {
                    self.store.complete_task(task.id).await?;
                    // Recurring singleton: re-arm only after its row is gone,
                    // otherwise the idempotent create would be a no-op.
                    if task.task_type == task_types::ATTACHMENT_EVICTION {
                        if let Err(e) = self.seed_eviction_task().await {
                            warn!("failed to re-arm attachment eviction: {}", e);
                        }
                    }
                    metrics::counter!(
                        "memory_service_tasks_completed_total",
                        "type" => task.task_type.clone()
                    )
                    .increment(1);
                    debug!(
                        "task {} ({}) completed in {:?}",
                        task.id,
                        task.task_type,
                        started.elapsed()
                    );
                    processed += 1;
                }
                Ok(Err(e)) => {
                    self.handle_failure(&task, &e.to_string()).await?;
                }
                Err(_) => {
                    self.handle_failure(&task, "task timed out").await?;
                }
            }
        }
        Ok(processed)
    }

    async fn handle_failure(&self, task: &Task, error: &str) -> CoreResult<()> {
        let retry_at = Utc::now() + self.backoff(task.retry_count);
        warn!(
            "task {} ({}) failed (retry {}): {}",
            task.id, task.task_type, task.retry_count, error
        );
        metrics::counter!(
            "memory_service_tasks_failed_total",
            "type" => task.task_type.clone()
        )
        .increment(1);
        self.store.fail_task(task.id, error, retry_at).await
    }

    fn backoff(&self, retry_count: i64) -> Duration {
        backoff(&self.config, retry_count)
    }

    async fn execute(&self, task: &Task) -> CoreResult<()> {
        match task.task_type.as_str() {
            task_types::VECTOR_STORE_DELETE => self.run_vector_store_delete(task).await,
            task_types::ENTRY_VECTOR_INDEX_RETRY => self.run_index_retry(task).await,
            task_types::ATTACHMENT_EVICTION => self.run_attachment_eviction().await,
            other => Err(CoreError::internal(format!("unknown task type {other:?}"))),
        }
    }

    /// Idempotent: deleting an already-clean group is a no-op.
    async fn run_vector_store_delete(&self, task: &Task) -> CoreResult<()> {
        let group_id = body_uuid(task, "conversationGroupId")?;
        match &self.vector {
            Some(vector) => vector.delete_by_group(group_id).await,
            None => {
                debug!("no vector store configured; nothing to delete for {}", group_id);
                Ok(())
            }
        }
    }

    /// Re-read the entry's projection and retry the vector upsert.
    async fn run_index_retry(&self, task: &Task) -> CoreResult<()> {
        let entry_id = body_uuid(task, "entryId")?;
        let Some(vector) = &self.vector else {
            debug!("no vector store configured; dropping index retry for {}", entry_id);
            return Ok(());
        };
        if !self.embedding.enabled() {
            debug!("embeddings disabled; dropping index retry for {}", entry_id);
            return Ok(());
        }

        let entry = match self.store.get_entry(entry_id).await {
            Ok(entry) => entry,
            // The group may have been deleted while the retry was queued.
            Err(CoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let Some(text) = entry.indexed_content.as_deref() else {
            return Ok(());
        };

        let embedding = self.embedding.embed(text).await?;
        if embedding.is_empty() {
            return Ok(());
        }
        vector
            .upsert(EmbeddingPoint {
                entry_id: entry.id,
                conversation_id: entry.conversation_id,
                conversation_group_id: entry.conversation_group_id,
                embedding,
                created_at: entry.created_at,
            })
            .await?;
        self.store.set_indexed_at(entry.id, Utc::now()).await
    }

    /// Hard-delete soft-deleted attachments past the retention grace and
    /// never-linked orphans past their TTL, then re-arm the singleton.
    async fn run_attachment_eviction(&self) -> CoreResult<()> {
        let now = Utc::now();
        let evictable = self
            .store
            .list_evictable_attachments(now, self.attachments.tombstone_retention, 100)
            .await?;

        let count = evictable.len();
        for attachment in evictable {
            if !attachment.storage_key.is_empty() {
                self.blobs.delete(&attachment.storage_key).await?;
            }
            self.store.hard_delete_attachment(attachment.id).await?;
        }
        if count > 0 {
            info!("evicted {} attachments", count);
            metrics::counter!("memory_service_attachments_evicted_total")
                .increment(count as u64);
        }
        Ok(())
    }

    async fn seed_eviction_task(&self) -> CoreResult<()> {
        self.store
            .create_task(NewTask {
                task_name: Some(task_types::ATTACHMENT_EVICTION.to_string()),
                task_type: task_types::ATTACHMENT_EVICTION.to_string(),
                task_body: serde_json::json!({}),
                retry_at: Utc::now() + self.config.eviction_interval,
            })
            .await
            .map(|_| ())
    }
}

/// Exponential backoff, capped.
fn backoff(config: &TasksConfig, retry_count: i64) -> Duration {
    let exponent = retry_count.clamp(0, 20) as u32;
    config
        .base_backoff
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(config.max_backoff)
}

fn body_uuid(task: &Task, field: &str) -> CoreResult<Uuid> {
    task.task_body
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| {
            CoreError::internal(format!(
                "task {} body is missing a valid {field}",
                task.id
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = TasksConfig {
            interval: Duration::from_secs(5),
            batch_size: 10,
            stale_claim_timeout: Duration::from_secs(300),
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            task_timeout: Duration::from_secs(60),
            eviction_interval: Duration::from_secs(3600),
        };
        assert_eq!(backoff(&config, 0), Duration::from_secs(5));
        assert_eq!(backoff(&config, 1), Duration::from_secs(10));
        assert_eq!(backoff(&config, 2), Duration::from_secs(20));
        assert_eq!(backoff(&config, 10), Duration::from_secs(60));
        assert_eq!(backoff(&config, 1000), Duration::from_secs(60));
    }
}
