// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Infrastructure layer: graph access, pooling, repositories, embeddings.

#[cfg(feature = "neo4j")]
pub mod bolt;
pub mod embedding;
pub mod graph;
pub mod memory_store;
pub mod pool;
pub mod repository;

use std::sync::Arc;

use crate::config::GraphConfig;
use crate::error::Result;

pub use embedding::{provider_from_config, EmbeddingProvider, HashEmbedding};
pub use graph::{BatchOp, Direction, EdgeSpec, GraphStore, RelationshipFilter, StoredRelationship};
pub use memory_store::MemoryGraphStore;
pub use pool::{GraphLease, GraphPool};
pub use repository::{NodeRepository, RelationshipRepository};

/// Open the backend selected by the configuration's URI scheme.
pub async fn open_store(config: &GraphConfig) -> Result<Arc<dyn GraphStore>> {
    if config.is_embedded() {
        return Ok(Arc::new(MemoryGraphStore::new()));
    }
    #[cfg(feature = "neo4j")]
    {
        Ok(Arc::new(bolt::BoltGraphStore::open(config).await?))
    }
    #[cfg(not(feature = "neo4j"))]
    {
        Err(crate::error::FabricError::Configuration(format!(
            "uri {} requires the `neo4j` feature",
            config.uri
        )))
    }
}
