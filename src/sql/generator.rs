//! SQL Generation
//!
//! Primary path asks the completion service for SQL, prompted with the
//! linearized schema of the matched tables. When the service is missing,
//! down, slow, or answers with something that isn't a read-only SELECT, the
//! statement is assembled from the `QueryPlan` by template instead. Both
//! paths share the same post-processing: whitespace, terminator, LIMIT,
//! business rules, validation and one repair pass.

use crate::config::EngineConfig;
use crate::context::QueryContext;
use crate::error::{NlqError, Result};
use crate::llm::TextCompletion;
use crate::matcher::MetadataMatch;
use crate::metadata::SemanticModel;
use crate::planner::{PlanBuilder, QueryPlan};
use crate::sql::business_rules::apply_rules;
use crate::sql::rewrite::{self, SqlParts};
use crate::sql::validation::{is_read_only, repair_sql, validate_sql};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TEMPLATE_EXPLANATION: &str = "Generated using template matching";

/// Tables described in a prompt when nothing matched
const MAX_PROMPT_TABLES: usize = 20;

lazy_static! {
    static ref FENCED: Regex = Regex::new(r"(?is)```(?:sql)?\s*(.*?)```").unwrap();
    static ref STATEMENT_START: Regex = Regex::new(r"(?i)\b(SELECT|WITH)\b").unwrap();
    static ref JOIN_KEYWORD: Regex = Regex::new(r"(?i)\bJOIN\b").unwrap();
    static ref SUBQUERY: Regex = Regex::new(r"(?i)\(\s*SELECT\b").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Simple,
    Medium,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPath {
    Completion,
    Template,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlGenerationResult {
    /// Exactly one trailing `;`, always carries a LIMIT
    pub sql: String,
    pub explanation: String,
    pub confidence_score: f64,
    pub complexity_level: ComplexityLevel,
    pub estimated_rows: Option<u64>,
    pub estimated_execution_time_ms: u64,
    pub alternative_sqls: Vec<String>,
    pub warnings: Vec<String>,
    pub path: GenerationPath,
    pub plan: QueryPlan,
}

impl SqlGenerationResult {
    /// Wrap caller-supplied SQL (e.g. a hand-written statement) for execution
    pub fn from_sql(sql: &str, plan: QueryPlan) -> Self {
        Self {
            sql: rewrite::ensure_terminated(sql),
            explanation: "Provided by caller".to_string(),
            confidence_score: plan.confidence_score,
            complexity_level: complexity_of(sql),
            estimated_rows: None,
            estimated_execution_time_ms: 0,
            alternative_sqls: Vec::new(),
            warnings: Vec::new(),
            path: GenerationPath::Template,
            plan,
        }
    }
}

/// Assemble a statement from a plan. Only tables reachable through declared
/// joins from the top table are used; conditions on other tables are dropped
/// with them. No plan tables yields the no-match statement.
pub fn render_plan(plan: &QueryPlan, limit: usize) -> String {
    let Some(top) = plan.top_table() else {
        return "SELECT 1 AS no_match LIMIT 1;".to_string();
    };

    let mut joined: Vec<String> = vec![top.to_string()];
    let mut from = top.to_string();
    let mut pending: Vec<_> = plan.required_joins.iter().collect();
    while let Some(pos) = pending.iter().position(|j| {
        let left = joined.iter().any(|t| t.eq_ignore_ascii_case(&j.left_table));
        let right = joined.iter().any(|t| t.eq_ignore_ascii_case(&j.right_table));
        left != right
    }) {
        let join = pending.remove(pos);
        let new_table = if joined.iter().any(|t| t.eq_ignore_ascii_case(&join.left_table)) {
            &join.right_table
        } else {
            &join.left_table
        };
        from.push_str(&format!(
            " {} {} ON {}.{} = {}.{}",
            join.join_type.sql(),
            new_table,
            join.left_table,
            join.left_column,
            join.right_table,
            join.right_column
        ));
        joined.push(new_table.clone());
    }

    let reachable = |expr: &str| {
        let lower = expr.to_lowercase();
        let mentions_other = plan
            .primary_tables
            .iter()
            .filter(|t| !joined.iter().any(|j| j.eq_ignore_ascii_case(t)))
            .any(|t| lower.contains(&format!("{}.", t.to_lowercase())));
        !mentions_other
    };

    let group_by: Vec<&String> = plan.group_by.iter().filter(|g| reachable(g)).collect();
    let select = if !plan.aggregations.is_empty() {
        group_by.iter().map(|g| g.as_str()).chain(plan.aggregations.iter().map(|a| a.as_str())).join(", ")
    } else {
        let columns: Vec<&String> = plan.select_columns.iter().filter(|c| reachable(c)).collect();
        if columns.is_empty() {
            "*".to_string()
        } else {
            columns.iter().join(", ")
        }
    };

    let mut sql = format!("SELECT {} FROM {}", select, from);
    let conditions: Vec<&String> = plan.where_conditions.iter().filter(|c| reachable(c)).collect();
    if !conditions.is_empty() {
        sql.push_str(&format!(" WHERE {}", conditions.iter().join(" AND ")));
    }
    if !plan.aggregations.is_empty() && !group_by.is_empty() {
        sql.push_str(&format!(" GROUP BY {}", group_by.iter().join(", ")));
    }
    let order_by: Vec<&String> = plan.order_by.iter().filter(|o| reachable(o)).collect();
    if !order_by.is_empty() && (plan.aggregations.is_empty() || !group_by.is_empty()) {
        sql.push_str(&format!(" ORDER BY {}", order_by.iter().join(", ")));
    }
    sql.push_str(&format!(" LIMIT {}", limit));
    rewrite::ensure_terminated(&sql)
}

fn complexity_of(sql: &str) -> ComplexityLevel {
    let masked = rewrite::mask_literals(sql);
    let joins = JOIN_KEYWORD.find_iter(&masked).count();
    let nested = SUBQUERY.is_match(&masked) || masked.trim_start().to_uppercase().starts_with("WITH");
    let grouped = SqlParts::parse(&masked).map(|p| p.has_aggregates()).unwrap_or(false);
    if nested || joins >= 2 || (joins == 1 && grouped) {
        ComplexityLevel::Complex
    } else if joins == 1 || grouped {
        ComplexityLevel::Medium
    } else {
        ComplexityLevel::Simple
    }
}

/// Pull a single read-only statement out of completion text
pub fn extract_sql(text: &str) -> Option<String> {
    let candidate = match FENCED.captures(text) {
        Some(cap) => cap[1].to_string(),
        None => {
            let start = STATEMENT_START.find(text)?.start();
            text[start..].to_string()
        }
    };
    // Prose after the statement
    let statement = match candidate.find(';') {
        Some(end) if rewrite::top_level_mask(&candidate).get(end).copied().unwrap_or(false) => &candidate[..=end],
        _ => candidate.as_str(),
    };
    let statement = statement.trim();
    if statement.is_empty() || !is_read_only(statement) {
        return None;
    }
    Some(statement.to_string())
}

pub struct SqlGenerator {
    completion: Option<Arc<dyn TextCompletion>>,
    planner: PlanBuilder,
    config: EngineConfig,
}

impl SqlGenerator {
    pub fn new(completion: Option<Arc<dyn TextCompletion>>, config: EngineConfig) -> Self {
        Self {
            completion,
            planner: PlanBuilder::new(config.confidence.clone()),
            config,
        }
    }

    pub async fn generate(
        &self,
        context: &QueryContext,
        matches: &[MetadataMatch],
        model: &SemanticModel,
        question: &str,
    ) -> SqlGenerationResult {
        let plan = self.planner.build(context, matches, model);
        self.generate_from_plan(plan, context, model, question).await
    }

    /// Generate from an already built plan
    pub async fn generate_from_plan(
        &self,
        plan: QueryPlan,
        context: &QueryContext,
        model: &SemanticModel,
        question: &str,
    ) -> SqlGenerationResult {
        let weights = &self.config.confidence;
        let limit = self.config.execution.default_limit;
        let mut warnings: Vec<String> = plan
            .unbound_filters
            .iter()
            .map(|f| format!("Omitted: {}", f))
            .collect();
        if plan.is_empty() {
            warnings.push("No table matched the question".to_string());
        }

        let (raw_sql, explanation, mut confidence, path) = match self.complete(&plan, context, model, question).await {
            Ok((sql, explanation)) => {
                info!("✅ SQL generated by completion service");
                let confidence = (plan.confidence_score * weights.completion_factor).min(weights.completion_cap);
                (sql, explanation, confidence, GenerationPath::Completion)
            }
            Err(e) => {
                warn!("Completion path unusable ({}), falling back to template", e);
                let confidence = plan.confidence_score.min(weights.template_cap);
                (render_plan(&plan, limit), TEMPLATE_EXPLANATION.to_string(), confidence, GenerationPath::Template)
            }
        };

        let mut sql = rewrite::inject_limit(&rewrite::normalize_whitespace(&raw_sql), limit as u64);
        sql = self.enhance_with_business_rules(&sql, model.domain_label());

        if !model.is_empty() {
            let report = validate_sql(&sql, model);
            if !report.is_valid {
                let repaired = repair_sql(&sql, &report, model)
                    .map(|(candidate, changes)| (validate_sql(&candidate, model), candidate, changes));
                match repaired {
                    Some((recheck, candidate, changes)) if recheck.is_valid => {
                        info!("Repaired generated SQL: {}", changes.join(", "));
                        warnings.extend(changes.into_iter().map(|c| format!("Repaired {}", c)));
                        warnings.extend(recheck.warnings);
                        sql = candidate;
                    }
                    _ => {
                        warn!("Generated SQL failed validation: {:?}", report.errors);
                        confidence *= weights.validation_penalty;
                        warnings.extend(report.errors);
                        warnings.extend(report.warnings);
                    }
                }
            } else {
                warnings.extend(report.warnings);
            }
        }

        let alternative_sqls: Vec<String> = plan
            .alternative_plans
            .iter()
            .map(|alt| render_plan(alt, limit))
            .filter(|alt| *alt != sql)
            .unique()
            .collect();
        let estimated_rows = estimate_rows(&plan, model, limit);
        let complexity_level = complexity_of(&sql);

        SqlGenerationResult {
            estimated_execution_time_ms: estimate_time_ms(estimated_rows, complexity_level),
            sql,
            explanation,
            confidence_score: confidence.clamp(0.0, 1.0),
            complexity_level,
            estimated_rows,
            alternative_sqls,
            warnings,
            path,
            plan,
        }
    }

    /// Append the domain's default predicates; never removes anything
    pub fn enhance_with_business_rules(&self, sql: &str, domain: &str) -> String {
        apply_rules(sql, self.config.rules_for_domain(domain))
    }

    async fn complete(
        &self,
        plan: &QueryPlan,
        context: &QueryContext,
        model: &SemanticModel,
        question: &str,
    ) -> Result<(String, String)> {
        let completion = self
            .completion
            .as_ref()
            .ok_or_else(|| NlqError::ServiceUnavailable("No completion service configured".to_string()))?;
        let settings = &self.config.completion;
        let prompt = build_prompt(plan, context, model, question, self.config.execution.default_limit);
        debug!("Completion prompt: {} chars", prompt.len());

        let response = tokio::time::timeout(
            Duration::from_millis(settings.timeout_ms),
            completion.complete(&prompt, settings.temperature, settings.max_tokens),
        )
        .await
        .map_err(|_| NlqError::ServiceUnavailable(format!("Completion timed out after {} ms", settings.timeout_ms)))??;

        let sql = extract_sql(&response.text).ok_or_else(|| {
            NlqError::GenerationFailed("Completion did not contain a read-only SELECT statement".to_string())
        })?;
        let prose = FENCED.replace_all(&response.text, "").trim().to_string();
        let explanation = if prose.is_empty() || prose.contains(sql.trim_end_matches(';')) {
            "Generated from the question by the language model".to_string()
        } else {
            prose
        };
        Ok((sql, explanation))
    }
}

fn build_prompt(plan: &QueryPlan, context: &QueryContext, model: &SemanticModel, question: &str, limit: usize) -> String {
    let tables: Vec<&str> = if plan.is_empty() {
        model.tables.iter().take(MAX_PROMPT_TABLES).map(|t| t.name.as_str()).collect()
    } else {
        plan.primary_tables.iter().map(|t| t.as_str()).collect()
    };
    let table_set: BTreeSet<String> = tables.iter().map(|t| t.to_lowercase()).collect();

    let schema = tables
        .iter()
        .map(|name| {
            let columns = model.columns_of(name).map(|c| format!("{} {}", c.name, c.data_type)).join(", ");
            match model.table(name).and_then(|t| t.comment.as_deref()) {
                Some(comment) => format!("- {} ({}): {}", name, comment, columns),
                None => format!("- {}: {}", name, columns),
            }
        })
        .join("\n");
    let relationships = model
        .relationships
        .iter()
        .filter(|r| table_set.contains(&r.from_table.to_lowercase()) && table_set.contains(&r.to_table.to_lowercase()))
        .map(|r| format!("- {}.{} -> {}.{}", r.from_table, r.from_column, r.to_table, r.to_column))
        .join("\n");
    let filters = context
        .filters
        .iter()
        .map(|f| format!("{} {} {}", f.field.as_deref().unwrap_or("?"), f.operator, f.value))
        .join("; ");

    format!(
        r#"You write SQL for a {domain} database. The question is written in {language}; identifiers must match the schema exactly.

Schema:
{schema}

Relationships:
{relationships}

Extracted context:
- entities: {entities}
- attributes: {attributes}
- filters: {filters}
- aggregations: {aggregations:?}
- intent: {intent:?}

Draft query:
{draft}

Question: "{question}"

Return one read-only SELECT statement in a ```sql block, with LIMIT {limit} unless the question asks for fewer rows."#,
        domain = model.domain_label(),
        language = context.language.code(),
        schema = if schema.is_empty() { "(unknown)".to_string() } else { schema },
        relationships = if relationships.is_empty() { "(none declared)".to_string() } else { relationships },
        entities = context.entities_mentioned.iter().join(", "),
        attributes = context.attributes_mentioned.iter().join(", "),
        filters = filters,
        aggregations = context.aggregations,
        intent = context.business_intent,
        draft = render_plan(plan, limit),
        question = question,
        limit = limit,
    )
}

fn estimate_rows(plan: &QueryPlan, model: &SemanticModel, limit: usize) -> Option<u64> {
    let top = plan.top_table()?;
    if !plan.aggregations.is_empty() && plan.group_by.is_empty() {
        return Some(1);
    }
    let rows = model.table(top)?.row_count?;
    let filtered = plan
        .where_conditions
        .iter()
        .fold(rows, |acc, _| (acc / 10).max(1));
    Some(filtered.min(limit as u64))
}

fn estimate_time_ms(rows: Option<u64>, complexity: ComplexityLevel) -> u64 {
    let base = match complexity {
        ComplexityLevel::Simple => 10,
        ComplexityLevel::Medium => 50,
        ComplexityLevel::Complex => 200,
    };
    base + rows.unwrap_or(0) / 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextExtractor;
    use crate::llm::Completion;
    use crate::matcher::{EntityType, MatchType};
    use crate::metadata::fixtures::shop_model;
    use crate::metadata::Attributes;
    use async_trait::async_trait;

    struct Canned(&'static str);

    #[async_trait]
    impl TextCompletion for Canned {
        async fn complete(&self, _prompt: &str, _temperature: f32, _max_tokens: u32) -> Result<Completion> {
            Ok(Completion { text: self.0.to_string(), usage: None })
        }
    }

    struct Down;

    #[async_trait]
    impl TextCompletion for Down {
        async fn complete(&self, _prompt: &str, _temperature: f32, _max_tokens: u32) -> Result<Completion> {
            Err(NlqError::ServiceUnavailable("connection refused".to_string()))
        }
    }

    fn table_match(name: &str) -> MetadataMatch {
        MetadataMatch {
            entity_name: name.to_string(),
            entity_type: EntityType::Table,
            match_type: MatchType::Exact,
            similarity_score: 1.0,
            relevant_attributes: Vec::new(),
            suggested_joins: Vec::new(),
            metadata: Attributes::new(),
        }
    }

    #[test]
    fn test_extract_sql() {
        assert_eq!(
            extract_sql("Here you go:\n```sql\nSELECT * FROM customers;\n```\nThis lists customers.").as_deref(),
            Some("SELECT * FROM customers;")
        );
        assert_eq!(
            extract_sql("The answer is SELECT name FROM customers LIMIT 3; hope it helps").as_deref(),
            Some("SELECT name FROM customers LIMIT 3;")
        );
        assert!(extract_sql("```sql\nDELETE FROM customers;\n```").is_none());
        assert!(extract_sql("I cannot answer that").is_none());
    }

    #[test]
    fn test_render_plan_with_join_and_aggregation() {
        let ctx = ContextExtractor::default().extract("total amount of orders by status for customers");
        let mut orders = table_match("orders");
        orders.relevant_attributes = vec!["amount".to_string(), "status".to_string()];
        let plan = PlanBuilder::default().build(&ctx, &[orders, table_match("customers")], &shop_model());
        assert_eq!(
            render_plan(&plan, 100),
            "SELECT orders.status, SUM(orders.amount) FROM orders INNER JOIN customers \
             ON orders.customer_id = customers.id GROUP BY orders.status LIMIT 100;"
        );
    }

    #[test]
    fn test_render_plan_drops_unreachable_tables() {
        let plan = QueryPlan {
            primary_tables: vec!["orders".to_string(), "products".to_string()],
            select_columns: vec!["orders.id".to_string(), "products.name".to_string()],
            where_conditions: vec!["products.price > 5".to_string()],
            ..QueryPlan::default()
        };
        assert_eq!(render_plan(&plan, 10), "SELECT orders.id FROM orders LIMIT 10;");
        assert_eq!(render_plan(&QueryPlan::default(), 10), "SELECT 1 AS no_match LIMIT 1;");
    }

    #[tokio::test]
    async fn test_completion_path() {
        let completion: Arc<dyn TextCompletion> = Arc::new(Canned("```sql\nSELECT name FROM customers WHERE country = 'China'\n```"));
        let generator = SqlGenerator::new(Some(completion), EngineConfig::default());
        let model = shop_model();
        let ctx = ContextExtractor::default().extract("Show customers from China");
        let result = generator.generate(&ctx, &[table_match("customers")], &model, &ctx.question).await;

        assert_eq!(result.path, GenerationPath::Completion);
        assert_eq!(result.sql, "SELECT name FROM customers WHERE country = 'China' LIMIT 100;");
        assert!(result.confidence_score <= 0.95);
        assert_eq!(result.complexity_level, ComplexityLevel::Simple);
    }

    #[tokio::test]
    async fn test_template_fallback_when_service_down() {
        let generator = SqlGenerator::new(Some(Arc::new(Down)), EngineConfig::default());
        let model = shop_model();
        let ctx = ContextExtractor::default().extract("Show customers from China");
        let result = generator.generate(&ctx, &[table_match("customers")], &model, &ctx.question).await;

        assert_eq!(result.path, GenerationPath::Template);
        assert_eq!(result.explanation, TEMPLATE_EXPLANATION);
        assert!(result.confidence_score <= 0.7);
        assert!(result.sql.ends_with(';') && !result.sql.ends_with(";;"));
        assert!(result.sql.contains("LIMIT"));
        assert!(result.sql.contains("customers.country = 'China'"));
    }

    #[tokio::test]
    async fn test_unusable_completion_falls_back() {
        let generator = SqlGenerator::new(Some(Arc::new(Canned("DROP TABLE customers;"))), EngineConfig::default());
        let ctx = ContextExtractor::default().extract("list products");
        let result = generator.generate(&ctx, &[table_match("products")], &shop_model(), &ctx.question).await;
        assert_eq!(result.path, GenerationPath::Template);
        assert_eq!(result.sql, "SELECT products.id, products.name FROM products LIMIT 100;");
    }

    #[tokio::test]
    async fn test_repair_of_completion_output() {
        let generator = SqlGenerator::new(Some(Arc::new(Canned("SELECT name FROM customer LIMIT 5;"))), EngineConfig::default());
        let ctx = ContextExtractor::default().extract("Show customers");
        let result = generator.generate(&ctx, &[table_match("customers")], &shop_model(), &ctx.question).await;
        assert_eq!(result.sql, "SELECT name FROM customers LIMIT 5;");
        assert!(result.warnings.iter().any(|w| w.starts_with("Repaired table customer")));
    }

    #[tokio::test]
    async fn test_business_rules_applied() {
        let mut config = EngineConfig::default();
        config.business_rules.insert(
            "ecommerce".to_string(),
            vec![crate::config::BusinessRule { table: Some("orders".to_string()), predicate: "orders.status <> 'cancelled'".to_string() }],
        );
        let generator = SqlGenerator::new(None, config);
        let ctx = ContextExtractor::default().extract("list orders");
        let result = generator.generate(&ctx, &[table_match("orders")], &shop_model(), &ctx.question).await;
        assert!(result.sql.contains("WHERE orders.status <> 'cancelled'"), "{}", result.sql);
    }
}
