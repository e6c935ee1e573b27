// src/search/mod.rs

//! Search engine: semantic (embedding) and full-text over accessible
//! history, grouped per conversation and ranked by score.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::{AccessControl, Principal};
use crate::embedding::EmbeddingProvider;
use crate::error::{CoreError, CoreResult};
use crate::store::Datastore;
use crate::vector::{VectorIndex, VectorMode, VectorScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Semantic,
    Fulltext,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupBy {
    #[default]
    Conversation,
    None,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub search_type: SearchType,
    pub group_by: GroupBy,
    pub limit: usize,
    /// Rank-offset cursor: skip this many results of the ordered set.
    pub offset: usize,
}

impl SearchRequest {
    pub fn auto(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            search_type: SearchType::Auto,
            group_by: GroupBy::Conversation,
            limit: 20,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub entry_id: Uuid,
    pub conversation_id: Uuid,
    pub conversation_group_id: Uuid,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

pub struct SearchEngine {
    store: Arc<dyn Datastore>,
    access: Arc<AccessControl>,
    vector: Option<Arc<dyn VectorIndex>>,
    embedding: Arc<dyn EmbeddingProvider>,
    /// External vector scope bound: the user's top-N recent groups.
    external_max_groups: usize,
}

impl SearchEngine {
    pub fn new(
        store: Arc<dyn Datastore>,
        access: Arc<AccessControl>,
        vector: Option<Arc<dyn VectorIndex>>,
        embedding: Arc<dyn EmbeddingProvider>,
        external_max_groups: usize,
    ) -> Self {
        Self {
            store,
            access,
            vector,
            embedding,
            external_max_groups,
        }
    }

    fn semantic_available(&self) -> bool {
        self.vector.is_some() && self.embedding.enabled()
    }

    fn available_types(&self) -> Vec<SearchType> {
        let mut available = vec![SearchType::Fulltext, SearchType::Auto];
        if self.semantic_available() {
            available.insert(0, SearchType::Semantic);
        }
        available
    }

    pub async fn search(
        &self,
        principal: &Principal,
        request: SearchRequest,
    ) -> CoreResult<Vec<SearchHit>> {
        let user_id = principal.require_user()?;

        if request.search_type == SearchType::Semantic && !self.semantic_available() {
            return Err(CoreError::SearchTypeUnavailable {
                available: self.available_types(),
            });
        }
        // Empty query: both paths are skipped and the result set is empty.
        if request.query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let limit = if request.limit == 0 { 20 } else { request.limit };
        // Over-fetch for the cursor and when grouping collapses whole
        // conversations down to one hit each.
        let window = limit.saturating_add(request.offset);
        let fetch = match request.group_by {
            GroupBy::Conversation => window.saturating_mul(4),
            GroupBy::None => window,
        };

        let use_semantic = match request.search_type {
            SearchType::Semantic => true,
            SearchType::Fulltext => false,
            SearchType::Auto => self.semantic_available(),
        };

        let mut hits = if use_semantic {
            self.semantic_search(user_id, &request.query, fetch).await?
        } else {
            self.fulltext_search(user_id, &request.query, fetch).await?
        };

        if request.group_by == GroupBy::Conversation {
            hits = best_per_conversation(hits);
        }
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.entry_id.to_string().cmp(&b.entry_id.to_string()))
        });
        Ok(hits
            .into_iter()
            .skip(request.offset)
            .take(limit)
            .collect())
    }

    async fn semantic_search(
        &self,
        user_id: &str,
        query: &str,
        fetch: usize,
    ) -> CoreResult<Vec<SearchHit>> {
        let Some(vector) = &self.vector else {
            return Ok(Vec::new());
        };
        let embedding = self.embedding.embed(query).await?;
        if embedding.is_empty() {
            return Ok(Vec::new());
        }

        let matches = match vector.mode() {
            // Colocated: membership scoping is a JOIN inside the index.
            VectorMode::Colocated => {
                vector
                    .query(&embedding, VectorScope::Membership(user_id), fetch)
                    .await?
            }
            // External: scope to the user's top-N recently updated groups;
            // entries outside that set are not searchable.
            VectorMode::External => {
                let groups = self
                    .access
                    .accessible_group_ids(user_id, self.external_max_groups, true)
                    .await?;
                vector
                    .query(&embedding, VectorScope::Groups(&groups), fetch)
                    .await?
            }
        };

        Ok(matches
            .into_iter()
            .map(|m| SearchHit {
                entry_id: m.entry_id,
                conversation_id: m.conversation_id,
                conversation_group_id: m.conversation_group_id,
                score: m.score as f64,
                created_at: m.created_at,
            })
            .collect())
    }

    async fn fulltext_search(
        &self,
        user_id: &str,
        query: &str,
        fetch: usize,
    ) -> CoreResult<Vec<SearchHit>> {
        let hits = self.store.fulltext_search(user_id, query, fetch).await?;
        Ok(hits
            .into_iter()
            .map(|h| SearchHit {
                entry_id: h.entry_id,
                conversation_id: h.conversation_id,
                conversation_group_id: h.conversation_group_id,
                score: h.score,
                created_at: h.created_at,
            })
            .collect())
    }
}

/// Window-function semantics: keep the highest-scoring entry per
/// conversation.
fn best_per_conversation(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut best: HashMap<Uuid, SearchHit> = HashMap::new();
    for hit in hits {
        match best.get(&hit.conversation_id) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(hit.conversation_id, hit);
            }
        }
    }
    best.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(conversation: Uuid, score: f64) -> SearchHit {
        SearchHit {
            entry_id: Uuid::new_v4(),
            conversation_id: conversation,
            conversation_group_id: Uuid::new_v4(),
            score,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn grouping_keeps_the_best_entry_per_conversation() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let grouped = best_per_conversation(vec![
            hit(a, 0.2),
            hit(a, 0.9),
            hit(b, 0.5),
            hit(a, 0.4),
        ]);
        assert_eq!(grouped.len(), 2);
        let best_a = grouped.iter().find(|h| h.conversation_id == a).unwrap();
        assert_eq!(best_a.score, 0.9);
    }
}
