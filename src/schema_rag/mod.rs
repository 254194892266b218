//! Schema RAG
//!
//! Similarity search over embedded schema entities. `VectorSearch` is the
//! seam to an external vector service; `InMemoryVectorStore` is the embedded
//! implementation used when no service is configured.

pub mod embedder;
pub mod vector_store;

use crate::error::Result;
use crate::metadata::Attributes;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use embedder::SchemaEmbedder;
pub use vector_store::InMemoryVectorStore;

/// Metadata key carrying the owning table of a column hit
pub const TABLE_KEY: &str = "table";

/// One nearest-neighbour result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub entity_name: String,
    /// "table", "column" or "entity"
    pub entity_type: String,
    pub similarity_score: f64,
    pub content: String,
    #[serde(default)]
    pub metadata: Attributes,
}

impl VectorHit {
    /// Owning table for column hits
    pub fn owning_table(&self) -> Option<&str> {
        self.metadata.get(TABLE_KEY).and_then(|v| v.as_str())
    }
}

#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Nearest schema entities for a free-text query, best first
    async fn search(
        &self,
        query: &str,
        entity_type: Option<&str>,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<VectorHit>>;
}
