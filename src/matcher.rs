//! Metadata Matching
//!
//! Binds a question to schema objects. Four independent strategies are
//! dispatched concurrently and pooled:
//! - exact: entity tokens equal to / contained in table names
//! - semantic: per-entity and per-attribute vector search
//! - fuzzy: synonym groups plus Jaro-Winkler on table names
//! - direct query: vector search on the whole question, always run
//!
//! A strategy that errors or times out contributes nothing; the others still count.

use crate::config::MatcherSettings;
use crate::context::QueryContext;
use crate::error::Result;
use crate::inflection;
use crate::metadata::{Attributes, Primitive, SemanticModel};
use crate::schema_rag::{VectorHit, VectorSearch};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strsim::jaro_winkler;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Table,
    Column,
    Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Semantic,
    Fuzzy,
    DirectQuery,
}

/// Scored candidate binding between the question and a schema object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataMatch {
    pub entity_name: String,
    pub entity_type: EntityType,
    pub match_type: MatchType,
    pub similarity_score: f64,
    pub relevant_attributes: Vec<String>,
    pub suggested_joins: Vec<String>,
    pub metadata: Attributes,
}

impl MetadataMatch {
    fn new(entity_name: &str, entity_type: EntityType, match_type: MatchType, score: f64) -> Self {
        Self {
            entity_name: entity_name.to_string(),
            entity_type,
            match_type,
            similarity_score: score.clamp(0.0, 1.0),
            relevant_attributes: Vec::new(),
            suggested_joins: Vec::new(),
            metadata: Attributes::new(),
        }
    }

    fn with_attribute(mut self, attribute: &str) -> Self {
        self.relevant_attributes.push(attribute.to_string());
        self
    }

    fn from_hit(hit: &VectorHit, match_type: MatchType, model: &SemanticModel) -> Self {
        let (name, entity_type, attribute) = match (hit.entity_type.as_str(), hit.owning_table()) {
            ("column", Some(table)) => (table.to_string(), EntityType::Table, Some(hit.entity_name.as_str())),
            ("column", None) => (hit.entity_name.clone(), EntityType::Column, None),
            ("table", _) => (hit.entity_name.clone(), EntityType::Table, None),
            _ => (hit.entity_name.clone(), EntityType::Entity, None),
        };
        let name = model.table(&name).map(|t| t.name.clone()).unwrap_or(name);

        let mut m = Self::new(&name, entity_type, match_type, hit.similarity_score);
        if let Some(attribute) = attribute {
            m.relevant_attributes.push(attribute.to_string());
        }
        m.metadata = hit.metadata.clone();
        m.metadata.insert("content".to_string(), Primitive::from(hit.content.as_str()));
        m
    }

    fn is_table_like(&self) -> bool {
        matches!(self.entity_type, EntityType::Table | EntityType::Entity)
    }
}

pub struct MetadataMatcher {
    vector_search: Arc<dyn VectorSearch>,
    settings: MatcherSettings,
}

impl MetadataMatcher {
    pub fn new(vector_search: Arc<dyn VectorSearch>, settings: MatcherSettings) -> Self {
        Self {
            vector_search,
            settings,
        }
    }

    /// Ranked, deduplicated matches (score >= min similarity, at most `max_matches`).
    /// Never fails.
    pub async fn match_metadata(
        &self,
        question: &str,
        context: &QueryContext,
        model: &SemanticModel,
    ) -> Vec<MetadataMatch> {
        let timeout = Duration::from_millis(self.settings.strategy_timeout_ms);

        let (exact, semantic, fuzzy, direct) = tokio::join!(
            guarded("exact", timeout, async { Ok(self.exact_matches(context, model)) }),
            guarded("semantic", timeout, self.semantic_matches(context, model)),
            guarded("fuzzy", timeout, async { Ok(self.fuzzy_matches(context, model)) }),
            guarded("direct_query", timeout, self.direct_query_matches(question, model)),
        );

        let pooled: Vec<MetadataMatch> = exact.into_iter().chain(semantic).chain(fuzzy).chain(direct).collect();
        let matches = self.finalize(pooled, model);
        info!(
            "Matched {} schema objects (top: {})",
            matches.len(),
            matches.first().map(|m| m.entity_name.as_str()).unwrap_or("-")
        );
        matches
    }

    /// Case-insensitive equality (exact score) or containment (partial score)
    fn exact_matches(&self, context: &QueryContext, model: &SemanticModel) -> Vec<MetadataMatch> {
        let mut matches = Vec::new();

        for token in &context.entities_mentioned {
            for table in &model.tables {
                let name = table.name.to_lowercase();
                let score = if name == *token {
                    self.settings.exact_score
                } else if token.len() >= 3 && (name.contains(token.as_str()) || token.contains(name.as_str())) {
                    self.settings.partial_score
                } else {
                    continue;
                };
                matches.push(MetadataMatch::new(&table.name, EntityType::Table, MatchType::Exact, score));
            }
        }

        for attribute in &context.attributes_mentioned {
            for column in model.columns.iter().filter(|c| c.name.eq_ignore_ascii_case(attribute)) {
                matches.push(
                    MetadataMatch::new(&column.table, EntityType::Table, MatchType::Exact, self.settings.partial_score)
                        .with_attribute(&column.name),
                );
            }
        }

        matches
    }

    async fn semantic_matches(&self, context: &QueryContext, model: &SemanticModel) -> Result<Vec<MetadataMatch>> {
        let mut matches = Vec::new();

        for token in &context.entities_mentioned {
            let query = format!("entity {} table database", token);
            let hits = self
                .vector_search
                .search(&query, Some("table"), self.settings.semantic_top_k, self.settings.min_similarity)
                .await?;
            matches.extend(hits.iter().map(|h| MetadataMatch::from_hit(h, MatchType::Semantic, model)));
        }

        for attribute in &context.attributes_mentioned {
            let query = format!("{} column attribute field", attribute);
            let hits = self
                .vector_search
                .search(&query, Some("column"), self.settings.semantic_top_k, self.settings.min_similarity)
                .await?;
            matches.extend(hits.iter().map(|h| MetadataMatch::from_hit(h, MatchType::Semantic, model)));
        }

        Ok(matches)
    }

    /// Synonym siblings contained in table names, plus typo-tolerant name similarity
    fn fuzzy_matches(&self, context: &QueryContext, model: &SemanticModel) -> Vec<MetadataMatch> {
        let mut matches = Vec::new();

        for token in &context.entities_mentioned {
            let forms = inflection::variants(token);
            let siblings: Vec<&str> = self
                .settings
                .synonyms
                .iter()
                .filter(|group| forms.iter().any(|f| group.contains(f)))
                .flat_map(|group| group.members())
                .filter(|s| s.chars().count() >= 3 || !s.is_ascii())
                .collect();

            for table in &model.tables {
                let name = table.name.to_lowercase();
                let by_synonym = siblings.iter().any(|s| name.contains(&s.to_lowercase()));
                let by_spelling = token.is_ascii() && jaro_winkler(token, &name) >= self.settings.fuzzy_threshold;
                if by_synonym || by_spelling {
                    matches.push(MetadataMatch::new(&table.name, EntityType::Table, MatchType::Fuzzy, self.settings.fuzzy_score));
                }
            }
        }

        matches
    }

    /// Whole-question retrieval; the recall safety net for questions with no usable entities
    async fn direct_query_matches(&self, question: &str, model: &SemanticModel) -> Result<Vec<MetadataMatch>> {
        let hits = self
            .vector_search
            .search(question, None, self.settings.direct_query_limit, self.settings.min_similarity)
            .await?;
        Ok(hits.iter().map(|h| MetadataMatch::from_hit(h, MatchType::DirectQuery, model)).collect())
    }

    /// Dedupe by (name, type) keeping the max score, sort, threshold, cap
    fn finalize(&self, pooled: Vec<MetadataMatch>, model: &SemanticModel) -> Vec<MetadataMatch> {
        let mut best: HashMap<(String, EntityType), MetadataMatch> = HashMap::new();

        for candidate in pooled {
            let key = (candidate.entity_name.to_lowercase(), candidate.entity_type);
            match best.get_mut(&key) {
                Some(existing) => {
                    let mut attributes = std::mem::take(&mut existing.relevant_attributes);
                    attributes.extend(candidate.relevant_attributes.iter().cloned());
                    if candidate.similarity_score > existing.similarity_score {
                        *existing = candidate;
                    }
                    existing.relevant_attributes = attributes.into_iter().unique().collect();
                }
                None => {
                    best.insert(key, candidate);
                }
            }
        }

        let mut matches: Vec<MetadataMatch> = best
            .into_values()
            .filter(|m| m.similarity_score >= self.settings.min_similarity)
            .sorted_by(|a, b| {
                b.similarity_score
                    .partial_cmp(&a.similarity_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.entity_name.cmp(&b.entity_name))
            })
            .take(self.settings.max_matches)
            .collect();

        for m in matches.iter_mut().filter(|m| m.is_table_like()) {
            m.suggested_joins = model
                .relationships_of(&m.entity_name)
                .map(|r| format!("{}.{} = {}.{}", r.from_table, r.from_column, r.to_table, r.to_column))
                .collect();
        }
        matches
    }
}

async fn guarded<F>(strategy: &str, timeout: Duration, fut: F) -> Vec<MetadataMatch>
where
    F: Future<Output = Result<Vec<MetadataMatch>>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(matches)) => {
            debug!("Strategy {} produced {} candidates", strategy, matches.len());
            matches
        }
        Ok(Err(e)) => {
            warn!("Strategy {} failed, skipping: {}", strategy, e);
            Vec::new()
        }
        Err(_) => {
            warn!("Strategy {} timed out after {:?}, skipping", strategy, timeout);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextExtractor;
    use crate::error::NlqError;
    use crate::metadata::fixtures::shop_model;
    use crate::schema_rag::InMemoryVectorStore;
    use async_trait::async_trait;

    struct DownVectorSearch;

    #[async_trait]
    impl VectorSearch for DownVectorSearch {
        async fn search(&self, _: &str, _: Option<&str>, _: usize, _: f64) -> Result<Vec<VectorHit>> {
            Err(NlqError::ServiceUnavailable("vector service down".to_string()))
        }
    }

    fn matcher_with(search: Arc<dyn VectorSearch>) -> MetadataMatcher {
        MetadataMatcher::new(search, MatcherSettings::default())
    }

    fn assert_well_formed(matches: &[MetadataMatch]) {
        let keys: Vec<_> = matches.iter().map(|m| (m.entity_name.to_lowercase(), m.entity_type)).collect();
        assert_eq!(keys.len(), keys.iter().unique().count());
        assert!(matches.windows(2).all(|w| w[0].similarity_score >= w[1].similarity_score));
        assert!(matches.len() <= 10);
    }

    #[tokio::test]
    async fn test_exact_match_ranks_first() {
        let model = shop_model();
        let matcher = matcher_with(Arc::new(InMemoryVectorStore::from_model(&model)));
        let question = "Show customers from China";
        let ctx = ContextExtractor::default().extract(question);

        let matches = matcher.match_metadata(question, &ctx, &model).await;
        assert_well_formed(&matches);
        assert_eq!(matches[0].entity_name, "customers");
        assert_eq!(matches[0].similarity_score, 1.0);
        assert_eq!(matches[0].suggested_joins, vec!["orders.customer_id = customers.id".to_string()]);
    }

    #[tokio::test]
    async fn test_vector_outage_degrades_to_local_strategies() {
        let model = shop_model();
        let matcher = matcher_with(Arc::new(DownVectorSearch));
        let question = "list clients and their orders";
        let ctx = ContextExtractor::default().extract(question);

        let matches = matcher.match_metadata(question, &ctx, &model).await;
        assert_well_formed(&matches);
        let names: Vec<_> = matches.iter().map(|m| m.entity_name.as_str()).collect();
        assert!(names.contains(&"orders"));
        // "clients" reaches customers through the synonym table
        assert!(matches.iter().any(|m| m.entity_name == "customers" && m.match_type == MatchType::Fuzzy));
    }

    #[tokio::test]
    async fn test_attribute_projects_onto_owning_table() {
        let model = shop_model();
        let matcher = matcher_with(Arc::new(DownVectorSearch));
        let question = "orders amount by status";
        let ctx = ContextExtractor::default().extract(question);

        let matches = matcher.match_metadata(question, &ctx, &model).await;
        let orders = matches.iter().find(|m| m.entity_name == "orders").unwrap();
        assert_eq!(orders.similarity_score, 1.0);
        assert!(orders.relevant_attributes.contains(&"amount".to_string()));
        assert!(orders.relevant_attributes.contains(&"status".to_string()));
    }

    #[tokio::test]
    async fn test_chinese_entity_via_synonyms() {
        let model = shop_model();
        let matcher = matcher_with(Arc::new(DownVectorSearch));
        let question = "显示所有客户";
        let ctx = ContextExtractor::default().extract(question);

        let matches = matcher.match_metadata(question, &ctx, &model).await;
        assert_eq!(matches[0].entity_name, "customers");
    }
}
