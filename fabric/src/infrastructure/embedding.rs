// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Embedding providers for semantic recall.
//!
//! The fabric treats the embedding model as an external collaborator; the
//! built-in `hash` provider is a deterministic stand-in so development and
//! tests run without a model service.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{FabricError, Result};

/// External embedding contract: `embed(text) → vector<f32, D>`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;
}

/// Deterministic hash-based embedding (384-dim to match the
/// all-MiniLM-L6-v2 shape used in production).
pub struct HashEmbedding {
    dims: usize,
}

impl HashEmbedding {
    pub fn new() -> Self {
        Self { dims: 384 }
    }
}

impl Default for HashEmbedding {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let hash = hasher.finish();

        let embedding: Vec<f32> = (0..self.dims)
            .map(|i| {
                let bit = (hash >> (i % 64)) & 1;
                bit as f32
            })
            .collect();
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Resolve the configured provider. `none` disables semantic similarity.
pub fn provider_from_config(
    config: &EmbeddingConfig,
) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    match config.provider.as_str() {
        "none" => Ok(None),
        "hash" => Ok(Some(Arc::new(HashEmbedding::new()))),
        other => Err(FabricError::Configuration(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embedding_shape() {
        let provider = HashEmbedding::new();
        let embedding = provider.embed("memory text").await.unwrap();
        assert_eq!(embedding.len(), 384);
    }

    #[tokio::test]
    async fn test_embeddings_deterministic() {
        let provider = HashEmbedding::new();
        let a = provider.embed("same text").await.unwrap();
        let b = provider.embed("same text").await.unwrap();
        assert_eq!(a, b, "same text should produce same embedding");
    }

    #[test]
    fn test_provider_selection() {
        let none = provider_from_config(&EmbeddingConfig { provider: "none".into() }).unwrap();
        assert!(none.is_none());
        let hash = provider_from_config(&EmbeddingConfig { provider: "hash".into() }).unwrap();
        assert!(hash.is_some());
        let bad = provider_from_config(&EmbeddingConfig { provider: "cloud".into() });
        assert!(bad.is_err());
    }
}
