// src/embedding/mod.rs

//! Embedding adapter: text → fixed-dimension float vector.
//! Providers are process-wide singletons built once by the registry.

use async_trait::async_trait;

use crate::error::CoreResult;

pub mod hosted;

pub use hosted::HostedEmbeddings;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn enabled(&self) -> bool {
        true
    }

    fn dimensions(&self) -> usize;

    fn model_id(&self) -> &str;

    /// Empty output on blank input or a disabled provider; callers skip the
    /// vector path when the result is empty.
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>>;
}

/// Disabled variant: semantic search is unavailable and the search engine
/// falls back to full-text only.
pub struct DisabledEmbeddings;

#[async_trait]
impl EmbeddingProvider for DisabledEmbeddings {
    fn enabled(&self) -> bool {
        false
    }

    fn dimensions(&self) -> usize {
        0
    }

    fn model_id(&self) -> &str {
        "disabled"
    }

    async fn embed(&self, _text: &str) -> CoreResult<Vec<f32>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_provider_embeds_to_empty() {
        let provider = DisabledEmbeddings;
        assert!(!provider.enabled());
        assert!(provider.embed("anything").await.unwrap().is_empty());
    }
}
