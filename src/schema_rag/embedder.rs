//! Schema Embedder
//!
//! Deterministic local embeddings: hashed word and character-trigram features
//! projected into a fixed-size vector. Good enough to rank schema names and
//! comments against a question without calling an embedding service.

use crate::inflection;
use crate::metadata::{ColumnInfo, TableInfo};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub type Embedding = Vec<f32>;

/// Words carrying no signal for schema lookup
const NOISE: &[&str] = &["the", "a", "an", "of", "in", "for", "table", "column", "entity", "database", "me", "show", "list", "all"];

#[derive(Debug, Clone)]
pub struct SchemaEmbedder {
    dimension: usize,
}

impl Default for SchemaEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SchemaEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(16) }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embed_table(&self, table: &TableInfo) -> Embedding {
        self.embed_text(&Self::table_text(table))
    }

    pub fn embed_column(&self, column: &ColumnInfo) -> Embedding {
        self.embed_text(&Self::column_text(column))
    }

    pub fn table_text(table: &TableInfo) -> String {
        match &table.comment {
            Some(comment) => format!("table {} {}", table.name, comment),
            None => format!("table {}", table.name),
        }
    }

    pub fn column_text(column: &ColumnInfo) -> String {
        let mut text = format!("column {} {} of table {}", column.name, column.data_type, column.table);
        if let Some(comment) = &column.comment {
            text.push(' ');
            text.push_str(comment);
        }
        text
    }

    /// Embed free text; the result is L2-normalized (all-zero for empty input)
    pub fn embed_text(&self, text: &str) -> Embedding {
        let mut vector = vec![0f32; self.dimension];
        let lower = text.to_lowercase();
        let words = lower
            .split(|c: char| !c.is_alphanumeric())
            .flat_map(|w| w.split('_'))
            .filter(|w| !w.is_empty() && !NOISE.contains(w));

        for word in words {
            // Whole words weigh most; the singular form folds number away
            let singular = inflection::singular(word);
            self.add(&mut vector, &format!("w:{}", singular), 2.0);

            let chars: Vec<char> = format!("^{}$", singular).chars().collect();
            for gram in chars.windows(3) {
                let gram: String = gram.iter().collect();
                self.add(&mut vector, &format!("g:{}", gram), 0.5);
            }
            // Scripts without spaces: every character is a feature
            if !word.is_ascii() {
                for c in word.chars() {
                    self.add(&mut vector, &format!("c:{}", c), 1.0);
                }
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }

    fn add(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let mut hasher = DefaultHasher::new();
        feature.hash(&mut hasher);
        let hash = hasher.finish();
        let index = (hash % self.dimension as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_rag::vector_store::cosine_similarity;

    #[test]
    fn test_embeddings_are_deterministic_and_normalized() {
        let embedder = SchemaEmbedder::default();
        let a = embedder.embed_text("customer orders");
        let b = embedder.embed_text("customer orders");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!(embedder.embed_text("").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_related_text_scores_higher() {
        let embedder = SchemaEmbedder::default();
        let query = embedder.embed_text("customers");
        let close = embedder.embed_text("table customer registered customers");
        let far = embedder.embed_text("table shipments warehouse");
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }
}
