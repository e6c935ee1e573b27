// tests/common/mod.rs
// Shared fixtures for the integration suite
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use memory_service::access::AccessControl;
use memory_service::cache::MemoryCache;
use memory_service::config::{CacheConfig, CacheKind, DatastoreConfig, DatastoreKind};
use memory_service::conversation::ConversationEngine;
use memory_service::embedding::{DisabledEmbeddings, EmbeddingProvider};
use memory_service::error::{CoreError, CoreResult};
use memory_service::sharing::SharingService;
use memory_service::store::Datastore;
use memory_service::store::codec::EntryCodec;
use memory_service::store::document::DocumentDatastore;
use memory_service::store::sqlite::SqliteDatastore;
use memory_service::vector::{
    EmbeddingPoint, VectorIndex, VectorMatch, VectorMode, VectorScope, cosine_similarity,
};

pub fn cache_config() -> CacheConfig {
    CacheConfig {
        kind: CacheKind::Memory,
        epoch_ttl: Duration::from_secs(30),
        record_ttl: Duration::from_secs(120),
        record_max_lifetime: Duration::from_secs(3600),
    }
}

pub async fn sqlite_store(dir: &tempfile::TempDir) -> Arc<SqliteDatastore> {
    let config = DatastoreConfig {
        kind: DatastoreKind::Sqlite,
        url: dir
            .path()
            .join("memory-service.db")
            .to_string_lossy()
            .into_owned(),
        max_connections: 8,
        busy_timeout: Duration::from_secs(5),
    };
    Arc::new(
        SqliteDatastore::connect(&config, EntryCodec::plaintext())
            .await
            .expect("sqlite datastore"),
    )
}

pub fn document_store() -> Arc<DocumentDatastore> {
    Arc::new(DocumentDatastore::new(EntryCodec::plaintext()))
}

pub struct Env {
    pub store: Arc<dyn Datastore>,
    pub access: Arc<AccessControl>,
    pub engine: ConversationEngine,
    pub sharing: SharingService,
}

/// Engine wiring with an in-memory cache and no vector/embedding backends.
pub fn env_over(store: Arc<dyn Datastore>) -> Env {
    let access = Arc::new(AccessControl::new(store.clone()));
    let engine = ConversationEngine::new(
        store.clone(),
        access.clone(),
        Arc::new(MemoryCache::new(cache_config())),
        None,
        Arc::new(DisabledEmbeddings),
    );
    let sharing = SharingService::new(store.clone(), access.clone());
    Env {
        store,
        access,
        engine,
        sharing,
    }
}

/// Engine wiring with explicit vector + embedding backends.
pub fn env_with_vector(
    store: Arc<dyn Datastore>,
    vector: Arc<dyn VectorIndex>,
    embedding: Arc<dyn EmbeddingProvider>,
) -> Env {
    let access = Arc::new(AccessControl::new(store.clone()));
    let engine = ConversationEngine::new(
        store.clone(),
        access.clone(),
        Arc::new(MemoryCache::new(cache_config())),
        Some(vector),
        embedding,
    );
    let sharing = SharingService::new(store.clone(), access.clone());
    Env {
        store,
        access,
        engine,
        sharing,
    }
}

/// Deterministic embeddings: a small dense vector derived from the text's
/// bytes, normalized enough for cosine comparisons in tests.
pub struct StubEmbeddings {
    pub dims: usize,
}

#[async_trait]
impl EmbeddingProvider for StubEmbeddings {
    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_id(&self) -> &str {
        "stub-embedding-model"
    }

    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut v = vec![0.0f32; self.dims];
        for (i, b) in text.bytes().enumerate() {
            v[i % self.dims] += b as f32 / 255.0;
        }
        Ok(v)
    }
}

/// In-memory vector index whose upserts can be made to fail, for driving
/// the retry-task path.
#[derive(Default)]
pub struct FlakyVectorIndex {
    pub fail_upserts: AtomicBool,
    pub upsert_attempts: AtomicUsize,
    points: Mutex<Vec<EmbeddingPoint>>,
}

impl FlakyVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_upserts.store(failing, Ordering::SeqCst);
    }

    pub fn stored_entry_ids(&self) -> Vec<Uuid> {
        self.points.lock().iter().map(|p| p.entry_id).collect()
    }
}

#[async_trait]
impl VectorIndex for FlakyVectorIndex {
    fn mode(&self) -> VectorMode {
        VectorMode::Colocated
    }

    async fn ensure_ready(&self, _dimensions: usize) -> CoreResult<()> {
        Ok(())
    }

    async fn upsert(&self, point: EmbeddingPoint) -> CoreResult<()> {
        self.upsert_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(CoreError::unavailable("vector store down"));
        }
        let mut points = self.points.lock();
        points.retain(|p| p.entry_id != point.entry_id);
        points.push(point);
        Ok(())
    }

    async fn delete_by_group(&self, conversation_group_id: Uuid) -> CoreResult<()> {
        self.points
            .lock()
            .retain(|p| p.conversation_group_id != conversation_group_id);
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        _scope: VectorScope<'_>,
        limit: usize,
    ) -> CoreResult<Vec<VectorMatch>> {
        let mut matches: Vec<VectorMatch> = self
            .points
            .lock()
            .iter()
            .map(|p| VectorMatch {
                entry_id: p.entry_id,
                conversation_id: p.conversation_id,
                conversation_group_id: p.conversation_group_id,
                score: cosine_similarity(embedding, &p.embedding),
                created_at: p.created_at,
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        if limit > 0 {
            matches.truncate(limit);
        }
        Ok(matches)
    }
}

pub fn text_blocks(text: &str) -> Vec<serde_json::Value> {
    vec![serde_json::json!({ "type": "text", "text": text })]
}
