// src/vector/mod.rs

//! Vector index adapter: per-entry embeddings scoped by conversation group.
//!
//! Two modes. Colocated keeps embeddings beside memberships and filters by
//! JOIN; external keeps them in a separate vector store and filters by an
//! explicit, bounded group-id set supplied by the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreResult;

pub mod colocated;
pub mod qdrant;

pub use colocated::ColocatedVectorIndex;
pub use qdrant::QdrantVectorIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorMode {
    Colocated,
    External,
}

/// Access scope of a vector query. The colocated index resolves membership
/// itself; the external index only understands explicit group ids.
pub enum VectorScope<'a> {
    Membership(&'a str),
    Groups(&'a [Uuid]),
}

#[derive(Debug, Clone)]
pub struct EmbeddingPoint {
    pub entry_id: Uuid,
    pub conversation_id: Uuid,
    pub conversation_group_id: Uuid,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub entry_id: Uuid,
    pub conversation_id: Uuid,
    pub conversation_group_id: Uuid,
    /// Cosine similarity; higher is better.
    pub score: f32,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn mode(&self) -> VectorMode;

    /// Startup check: create the index if missing and fail fast when the
    /// stored dimension disagrees with the embedding provider's.
    async fn ensure_ready(&self, dimensions: usize) -> CoreResult<()>;

    async fn upsert(&self, point: EmbeddingPoint) -> CoreResult<()>;

    /// Idempotent group-wide cleanup, driven by `vector_store_delete` tasks.
    async fn delete_by_group(&self, conversation_group_id: Uuid) -> CoreResult<()>;

    async fn query(
        &self,
        embedding: &[f32],
        scope: VectorScope<'_>,
        limit: usize,
    ) -> CoreResult<Vec<VectorMatch>>;

    async fn health_check(&self) -> CoreResult<bool> {
        Ok(true)
    }
}

/// Cosine similarity with a zero-norm guard.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = [0.5f32, 0.25, -1.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
