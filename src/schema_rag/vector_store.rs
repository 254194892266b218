//! In-Memory Vector Store
//!
//! Linear-scan cosine similarity over schema documents. One document per
//! table and per column; column documents carry their owning table.

use crate::error::{NlqError, Result};
use crate::metadata::{Attributes, Primitive, SemanticModel};
use crate::schema_rag::embedder::{Embedding, SchemaEmbedder};
use crate::schema_rag::{VectorHit, VectorSearch, TABLE_KEY};
use async_trait::async_trait;
use tracing::{debug, info};

/// Document in the vector store
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub entity_name: String,
    pub entity_type: String,
    pub text: String,
    pub metadata: Attributes,
    pub embedding: Embedding,
}

pub struct InMemoryVectorStore {
    embedder: SchemaEmbedder,
    documents: Vec<Document>,
}

impl InMemoryVectorStore {
    pub fn new(embedder: SchemaEmbedder) -> Self {
        Self {
            embedder,
            documents: Vec::new(),
        }
    }

    /// Index every table and column of a semantic model
    pub fn from_model(model: &SemanticModel) -> Self {
        let mut store = Self::new(SchemaEmbedder::default());

        for table in &model.tables {
            let mut metadata = Attributes::new();
            if let Some(rows) = table.row_count {
                metadata.insert("row_count".to_string(), Primitive::Int(rows as i64));
            }
            store.documents.push(Document {
                id: format!("table:{}", table.name),
                entity_name: table.name.clone(),
                entity_type: "table".to_string(),
                text: SchemaEmbedder::table_text(table),
                metadata,
                embedding: store.embedder.embed_table(table),
            });
        }

        for column in &model.columns {
            let mut metadata = Attributes::new();
            metadata.insert(TABLE_KEY.to_string(), Primitive::from(column.table.as_str()));
            metadata.insert("type".to_string(), Primitive::from(column.data_type.as_str()));
            store.documents.push(Document {
                id: format!("column:{}:{}", column.table, column.name),
                entity_name: column.name.clone(),
                entity_type: "column".to_string(),
                text: SchemaEmbedder::column_text(column),
                metadata,
                embedding: store.embedder.embed_column(column),
            });
        }

        info!("Indexed {} schema documents", store.documents.len());
        store
    }

    /// Add a document; its embedding must match the store dimension
    pub fn add_document(&mut self, document: Document) -> Result<()> {
        if document.embedding.len() != self.embedder.dimension() {
            return Err(NlqError::VectorSearch(format!(
                "Embedding dimension {} doesn't match store dimension {}",
                document.embedding.len(),
                self.embedder.dimension()
            )));
        }
        self.documents.push(document);
        Ok(())
    }

    pub fn embedder(&self) -> &SchemaEmbedder {
        &self.embedder
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl VectorSearch for InMemoryVectorStore {
    async fn search(
        &self,
        query: &str,
        entity_type: Option<&str>,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<VectorHit>> {
        let query_embedding = self.embedder.embed_text(query);

        let mut hits: Vec<VectorHit> = self
            .documents
            .iter()
            .filter(|doc| entity_type.map_or(true, |t| doc.entity_type.eq_ignore_ascii_case(t)))
            .map(|doc| (doc, cosine_similarity(&query_embedding, &doc.embedding) as f64))
            .filter(|(_, score)| *score >= min_similarity)
            .map(|(doc, score)| VectorHit {
                entity_name: doc.entity_name.clone(),
                entity_type: doc.entity_type.clone(),
                similarity_score: score.min(1.0),
                content: doc.text.clone(),
                metadata: doc.metadata.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        debug!("Vector search '{}' -> {} hits", query, hits.len());
        Ok(hits)
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::fixtures::shop_model;

    #[test]
    fn test_cosine_similarity() {
        assert_eq!(cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_search_respects_type_filter_and_threshold() {
        let store = InMemoryVectorStore::from_model(&shop_model());
        assert_eq!(store.len(), 3 + 12);

        let hits = store.search("customers", Some("table"), 5, 0.3).await.unwrap();
        assert_eq!(hits[0].entity_name, "customers");
        assert!(hits.iter().all(|h| h.entity_type == "table" && h.similarity_score >= 0.3));

        let columns = store.search("country", Some("column"), 5, 0.3).await.unwrap();
        assert_eq!(columns[0].entity_name, "country");
        assert_eq!(columns[0].owning_table(), Some("customers"));
    }

    #[tokio::test]
    async fn test_unrelated_query_finds_nothing() {
        let store = InMemoryVectorStore::from_model(&shop_model());
        let hits = store.search("zzzz qqqq", None, 10, 0.5).await.unwrap();
        assert!(hits.is_empty());
        assert!(store.search("customers", None, 0, 0.0).await.unwrap().is_empty());
    }
}
