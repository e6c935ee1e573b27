// src/vector/colocated.rs

//! Colocated vector index: embeddings live in the relational store next to
//! memberships, so access filtering is a JOIN and cleanup rides the same
//! database.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::parse_uuid;
use crate::store::sqlite::rows::{from_micros, micros};

use super::{EmbeddingPoint, VectorIndex, VectorMatch, VectorMode, VectorScope, cosine_similarity};

pub struct ColocatedVectorIndex {
    pool: SqlitePool,
}

impl ColocatedVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[async_trait]
impl VectorIndex for ColocatedVectorIndex {
    fn mode(&self) -> VectorMode {
        VectorMode::Colocated
    }

    async fn ensure_ready(&self, dimensions: usize) -> CoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entry_embeddings (
                entry_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                conversation_group_id TEXT NOT NULL,
                embedding BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_embeddings_group
             ON entry_embeddings(conversation_group_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vector_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        // Changing the embedding provider dimension invalidates the index;
        // fail at startup instead of silently mixing vector sizes.
        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM vector_meta WHERE key = 'dimensions'")
                .fetch_optional(&self.pool)
                .await?;
        match stored {
            Some(stored) if stored != dimensions.to_string() => {
                Err(CoreError::invalid_argument(format!(
                    "embedding dimension changed from {stored} to {dimensions}; \
                     rebuild the vector index"
                )))
            }
            Some(_) => Ok(()),
            None => {
                sqlx::query(
                    "INSERT INTO vector_meta (key, value) VALUES ('dimensions', ?)
                     ON CONFLICT(key) DO NOTHING",
                )
                .bind(dimensions.to_string())
                .execute(&self.pool)
                .await?;
                Ok(())
            }
        }
    }

    async fn upsert(&self, point: EmbeddingPoint) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO entry_embeddings
                 (entry_id, conversation_id, conversation_group_id, embedding, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(entry_id) DO UPDATE SET
                 embedding = excluded.embedding,
                 created_at = excluded.created_at",
        )
        .bind(point.entry_id.to_string())
        .bind(point.conversation_id.to_string())
        .bind(point.conversation_group_id.to_string())
        .bind(embedding_to_blob(&point.embedding))
        .bind(micros(point.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_by_group(&self, conversation_group_id: Uuid) -> CoreResult<()> {
        sqlx::query("DELETE FROM entry_embeddings WHERE conversation_group_id = ?")
            .bind(conversation_group_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        scope: VectorScope<'_>,
        limit: usize,
    ) -> CoreResult<Vec<VectorMatch>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT e.entry_id, e.conversation_id, e.conversation_group_id,
                    e.embedding, e.created_at
             FROM entry_embeddings e ",
        );
        match scope {
            VectorScope::Membership(user_id) => {
                qb.push(
                    "JOIN conversation_memberships m
                       ON m.conversation_group_id = e.conversation_group_id
                      AND m.deleted_at IS NULL AND m.user_id = ",
                );
                qb.push_bind(user_id.to_string());
            }
            VectorScope::Groups(groups) => {
                if groups.is_empty() {
                    return Ok(Vec::new());
                }
                qb.push("WHERE e.conversation_group_id IN (");
                let mut separated = qb.separated(", ");
                for group in groups {
                    separated.push_bind(group.to_string());
                }
                qb.push(")");
            }
        }

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut matches: Vec<VectorMatch> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = blob_to_embedding(&blob);
                Ok(VectorMatch {
                    entry_id: parse_uuid(&row.get::<String, _>("entry_id"))?,
                    conversation_id: parse_uuid(&row.get::<String, _>("conversation_id"))?,
                    conversation_group_id: parse_uuid(
                        &row.get::<String, _>("conversation_group_id"),
                    )?,
                    score: cosine_similarity(embedding, &stored),
                    created_at: from_micros(row.get("created_at"))?,
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;

        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        if limit > 0 {
            matches.truncate(limit);
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_blob_round_trips() {
        let embedding = vec![0.5f32, -1.25, 3.0];
        assert_eq!(blob_to_embedding(&embedding_to_blob(&embedding)), embedding);
    }
}
