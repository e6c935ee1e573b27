// src/embedding/hosted.rs

//! Hosted embeddings over an OpenAI-compatible `/embeddings` endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{CoreError, CoreResult};

use super::EmbeddingProvider;

const MAX_RETRIES: usize = 3;
const RETRY_DELAY_MS: u64 = 500;

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct HostedEmbeddings {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl HostedEmbeddings {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimensions: config.dimensions,
        }
    }

    async fn request_embedding(&self, text: &str) -> CoreResult<Vec<f32>> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": [text],
            }))
            .send()
            .await
            .map_err(|e| CoreError::unavailable(format!("embedding request failed: {e}")))?
            .error_for_status()
            .map_err(|e| CoreError::unavailable(format!("embedding API error: {e}")))?;

        let mut parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| CoreError::internal(format!("malformed embedding response: {e}")))?;

        if parsed.data.is_empty() {
            return Err(CoreError::internal("embedding response carried no data"));
        }
        let embedding = parsed.data.remove(0).embedding;
        if embedding.len() != self.dimensions {
            return Err(CoreError::internal(format!(
                "embedding dimension mismatch: got {}, configured {}",
                embedding.len(),
                self.dimensions
            )));
        }
        Ok(embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for HostedEmbeddings {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut attempt = 0;
        loop {
            match self.request_embedding(text).await {
                Ok(embedding) => return Ok(embedding),
                Err(CoreError::Unavailable(detail)) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(
                        "embedding attempt {}/{} failed: {}",
                        attempt, MAX_RETRIES, detail
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        RETRY_DELAY_MS * attempt as u64,
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
