// src/vector/qdrant.rs

//! External vector index backed by Qdrant. Queries carry an explicit
//! conversation-group filter; there is no cross-store membership JOIN.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VectorConfig;
use crate::error::{CoreError, CoreResult};
use crate::model::parse_uuid;

use super::{EmbeddingPoint, VectorIndex, VectorMatch, VectorMode, VectorScope};

pub struct QdrantVectorIndex {
    client: Qdrant,
    collection: String,
}

impl QdrantVectorIndex {
    pub fn new(config: &VectorConfig) -> CoreResult<Self> {
        // Skip compatibility check to allow minor version mismatches
        let client = Qdrant::from_url(&config.url)
            .skip_compatibility_check()
            .build()
            .map_err(|e| CoreError::unavailable(format!("failed to connect to Qdrant: {e}")))?;

        Ok(Self {
            client,
            collection: config.collection.clone(),
        })
    }

    fn unavailable(context: &str, err: impl std::fmt::Display) -> CoreError {
        CoreError::unavailable(format!("{context}: {err}"))
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    fn mode(&self) -> VectorMode {
        VectorMode::External
    }

    async fn ensure_ready(&self, dimensions: usize) -> CoreResult<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| Self::unavailable("Qdrant collection check failed", e))?;

        if !exists {
            info!("Creating Qdrant collection: {}", self.collection);
            match self
                .client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection).vectors_config(
                        VectorParamsBuilder::new(dimensions as u64, Distance::Cosine),
                    ),
                )
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => {
                    // A racing replica may have created it between our exists
                    // check and the create call.
                    if e.to_string().contains("already exists") {
                        debug!("collection {} created by another process", self.collection);
                    } else {
                        return Err(Self::unavailable("failed to create Qdrant collection", e));
                    }
                }
            }
        }

        let info = self
            .client
            .collection_info(&self.collection)
            .await
            .map_err(|e| Self::unavailable("Qdrant collection info failed", e))?;

        let stored_size = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .and_then(|c| match c {
                qdrant_client::qdrant::vectors_config::Config::Params(params) => Some(params.size),
                _ => None,
            });

        match stored_size {
            Some(size) if size != dimensions as u64 => Err(CoreError::invalid_argument(format!(
                "Qdrant collection {} has dimension {size}, embedding provider reports {dimensions}; \
                 rebuild the collection",
                self.collection
            ))),
            Some(_) => Ok(()),
            None => {
                warn!(
                    "could not read vector params for collection {}; skipping dimension check",
                    self.collection
                );
                Ok(())
            }
        }
    }

    async fn upsert(&self, point: EmbeddingPoint) -> CoreResult<()> {
        let mut payload: HashMap<String, QdrantValue> = HashMap::new();
        payload.insert(
            "conversation_id".to_string(),
            point.conversation_id.to_string().into(),
        );
        payload.insert(
            "conversation_group_id".to_string(),
            point.conversation_group_id.to_string().into(),
        );
        payload.insert(
            "created_at".to_string(),
            point.created_at.timestamp_micros().into(),
        );

        let qdrant_point =
            PointStruct::new(point.entry_id.to_string(), point.embedding, payload);

        self.client
            .upsert_points(
                UpsertPointsBuilder::new(&self.collection, vec![qdrant_point]).wait(true),
            )
            .await
            .map_err(|e| Self::unavailable("failed to upsert point to Qdrant", e))?;

        debug!("upserted entry {} into {}", point.entry_id, self.collection);
        Ok(())
    }

    async fn delete_by_group(&self, conversation_group_id: Uuid) -> CoreResult<()> {
        let filter = Filter::must([Condition::matches(
            "conversation_group_id",
            conversation_group_id.to_string(),
        )]);

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(filter)
                    .wait(true),
            )
            .await
            .map_err(|e| Self::unavailable("failed to delete points from Qdrant", e))?;

        debug!(
            "deleted embeddings of group {} from {}",
            conversation_group_id, self.collection
        );
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        scope: VectorScope<'_>,
        limit: usize,
    ) -> CoreResult<Vec<VectorMatch>> {
        let groups = match scope {
            VectorScope::Groups(groups) => groups,
            VectorScope::Membership(_) => {
                return Err(CoreError::internal(
                    "external vector store requires an explicit group filter",
                ));
            }
        };
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        let group_keys: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        let filter = Filter::must([Condition::matches("conversation_group_id", group_keys)]);

        let results = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, embedding.to_vec(), limit as u64)
                    .filter(filter)
                    .with_payload(true),
            )
            .await
            .map_err(|e| Self::unavailable("failed to search Qdrant", e))?;

        let mut matches = Vec::with_capacity(results.result.len());
        for point in results.result {
            let entry_id = match point.id.as_ref().and_then(|id| id.point_id_options.as_ref()) {
                Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(raw)) => {
                    parse_uuid(raw)?
                }
                _ => {
                    warn!("skipping Qdrant point with non-uuid id");
                    continue;
                }
            };
            let payload = point.payload;
            let Some(conversation_id) = payload
                .get("conversation_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            let Some(conversation_group_id) = payload
                .get("conversation_group_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            let created_at = payload
                .get("created_at")
                .and_then(|v| v.as_integer())
                .and_then(chrono::DateTime::from_timestamp_micros)
                .unwrap_or_else(Utc::now);

            matches.push(VectorMatch {
                entry_id,
                conversation_id,
                conversation_group_id,
                score: point.score,
                created_at,
            });
        }
        Ok(matches)
    }

    async fn health_check(&self) -> CoreResult<bool> {
        match self.client.collection_exists(&self.collection).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Qdrant health check failed: {}", e);
                Ok(false)
            }
        }
    }
}
