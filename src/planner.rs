//! Query Planning
//!
//! Turns matches and context into a `QueryPlan`: tables, declared joins,
//! projection, bound filter conditions, aggregations, ordering and a
//! confidence score. Filters and aggregations that cannot be bound to a real
//! column are left out and reported in `unbound_filters`.

use crate::config::ConfidenceWeights;
use crate::context::{AggregationKind, FilterKind, Operation, QueryContext};
use crate::inflection;
use crate::matcher::{EntityType, MetadataMatch};
use crate::metadata::SemanticModel;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::debug;

const MAX_PRIMARY_TABLES: usize = 3;
const MAX_SELECT_COLUMNS: usize = 10;
const DEFAULT_COLUMNS: [&str; 4] = ["id", "name", "created_at", "updated_at"];
const LOCATION_COLUMNS: [&str; 7] = ["country", "city", "region", "state", "location", "nation", "country_code"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    Left,
}

impl JoinType {
    pub fn sql(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub join_type: JoinType,
    pub left_table: String,
    pub right_table: String,
    pub left_column: String,
    pub right_column: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryPlan {
    pub primary_tables: Vec<String>,
    pub required_joins: Vec<JoinSpec>,
    pub select_columns: Vec<String>,
    pub where_conditions: Vec<String>,
    pub aggregations: Vec<String>,
    pub group_by: Vec<String>,
    pub order_by: Vec<String>,
    pub confidence_score: f64,
    /// Diagnostic only, never executed automatically by the primary path
    pub alternative_plans: Vec<QueryPlan>,
    /// Conditions or aggregations omitted because no concrete column was bound
    pub unbound_filters: Vec<String>,
}

impl QueryPlan {
    pub fn top_table(&self) -> Option<&str> {
        self.primary_tables.first().map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.primary_tables.is_empty()
    }
}

pub struct PlanBuilder {
    weights: ConfidenceWeights,
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new(ConfidenceWeights::default())
    }
}

impl PlanBuilder {
    pub fn new(weights: ConfidenceWeights) -> Self {
        Self { weights }
    }

    pub fn build(&self, context: &QueryContext, matches: &[MetadataMatch], model: &SemanticModel) -> QueryPlan {
        let candidates: Vec<String> = matches
            .iter()
            .filter(|m| matches!(m.entity_type, EntityType::Table | EntityType::Entity))
            .filter(|m| model.is_empty() || model.has_table(&m.entity_name))
            .map(|m| m.entity_name.clone())
            .unique_by(|name| name.to_lowercase())
            .collect();

        let primary: Vec<String> = candidates.iter().take(MAX_PRIMARY_TABLES).cloned().collect();
        let mut plan = self.assemble(context, primary, matches, model);
        if plan.is_empty() {
            debug!("No table bound, returning zero-confidence plan");
            return plan;
        }

        // Secondary single-table variants
        let factor = self.weights.alternative_factor;
        for table in candidates.iter().skip(1) {
            let mut alternative = self.assemble(context, vec![table.clone()], matches, model);
            alternative.confidence_score *= factor;
            plan.alternative_plans.push(alternative);
        }
        if plan.aggregations.is_empty() {
            let mut counted = plan.clone();
            counted.aggregations = vec!["COUNT(*)".to_string()];
            counted.group_by.clear();
            counted.order_by.clear();
            counted.confidence_score *= factor;
            plan.alternative_plans.push(counted);
        }

        debug!(
            "Built plan over {:?} with {} joins, {} conditions, confidence {:.2}",
            plan.primary_tables,
            plan.required_joins.len(),
            plan.where_conditions.len(),
            plan.confidence_score
        );
        plan
    }

    fn assemble(
        &self,
        context: &QueryContext,
        tables: Vec<String>,
        matches: &[MetadataMatch],
        model: &SemanticModel,
    ) -> QueryPlan {
        let mut plan = QueryPlan {
            primary_tables: tables,
            ..QueryPlan::default()
        };
        let Some(top) = plan.top_table().map(|t| t.to_string()) else {
            return plan;
        };

        // Declared relationships only
        for (a, b) in plan.primary_tables.iter().tuple_combinations() {
            if let Some(rel) = model.relationship_between(a, b) {
                plan.required_joins.push(JoinSpec {
                    join_type: JoinType::Inner,
                    left_table: rel.from_table.clone(),
                    right_table: rel.to_table.clone(),
                    left_column: rel.from_column.clone(),
                    right_column: rel.to_column.clone(),
                    confidence: 0.9,
                });
            }
        }

        // Projection
        let in_plan = |table: &str| plan.primary_tables.iter().any(|t| t.eq_ignore_ascii_case(table));
        let mut columns: Vec<String> = matches
            .iter()
            .filter(|m| in_plan(&m.entity_name))
            .flat_map(|m| {
                m.relevant_attributes
                    .iter()
                    .filter(|attr| model.is_empty() || model.column(&m.entity_name, attr).is_some())
                    .map(move |attr| format!("{}.{}", m.entity_name, attr))
            })
            .unique()
            .collect();
        let defaulted = columns.is_empty();
        if defaulted {
            columns = DEFAULT_COLUMNS
                .iter()
                .filter(|c| model.is_empty() || model.column(&top, c).is_some())
                .map(|c| format!("{}.{}", top, c))
                .collect();
        }
        columns.truncate(MAX_SELECT_COLUMNS);
        plan.select_columns = columns;

        // Conditions
        for filter in &context.filters {
            let column = match (&filter.field, filter.kind) {
                (Some(field), _) => bind_column(model, &plan.primary_tables, field),
                (None, FilterKind::Date) => first_column(model, &plan.primary_tables, |c| c.is_temporal()),
                (None, FilterKind::Numeric) => {
                    first_column(model, &plan.primary_tables, |c| c.is_numeric() && !c.is_key())
                }
                (None, FilterKind::Text) => first_column(model, &plan.primary_tables, |c| {
                    LOCATION_COLUMNS.contains(&c.name.to_lowercase().as_str())
                }),
            };
            let Some(column) = column else {
                plan.unbound_filters.push(format!(
                    "{:?} filter {} {} has no column to bind to",
                    filter.kind, filter.operator, filter.value
                ));
                continue;
            };
            let condition = match filter.kind {
                FilterKind::Date => format!("{} {} '{}'", column, filter.operator, escape(&filter.value)),
                FilterKind::Numeric => match filter.value.parse::<f64>() {
                    Ok(_) => format!("{} {} {}", column, numeric_operator(&filter.operator), filter.value),
                    Err(_) => format!("{} {} '{}'", column, numeric_operator(&filter.operator), escape(&filter.value)),
                },
                FilterKind::Text => format!("{} = '{}'", column, escape(&filter.value)),
            };
            plan.where_conditions.push(condition);
        }

        // Aggregations
        let measure = context
            .attributes_mentioned
            .iter()
            .filter_map(|a| bind_column(model, &plan.primary_tables, a))
            .find(|qualified| is_numeric_column(model, qualified))
            .or_else(|| first_column(model, &plan.primary_tables, |c| c.is_numeric() && !c.is_key()));
        let mut measured = Vec::new();
        for kind in &context.aggregations {
            match (kind, &measure) {
                (AggregationKind::Count, _) => plan.aggregations.push("COUNT(*)".to_string()),
                (_, Some(column)) => {
                    plan.aggregations.push(format!("{}({})", kind.sql_function(), column));
                    measured.push(column.clone());
                }
                (_, None) => plan
                    .unbound_filters
                    .push(format!("{} has no numeric column to aggregate", kind.sql_function())),
            }
        }
        if !plan.aggregations.is_empty() && context.operations.contains(&Operation::Group) && !defaulted {
            plan.group_by = plan
                .select_columns
                .iter()
                .filter(|c| !measured.contains(c))
                .cloned()
                .collect();
        }

        // Ordering
        if context.operations.contains(&Operation::Sort) {
            let order_column = model
                .column(&top, "created_at")
                .or_else(|| model.date_columns(&top).next())
                .map(|c| format!("{}.{}", top, c.name));
            if let Some(column) = order_column {
                plan.order_by.push(format!("{} DESC", column));
            }
        }

        plan.confidence_score = self.score(matches, &plan);
        plan
    }

    fn score(&self, matches: &[MetadataMatch], plan: &QueryPlan) -> f64 {
        if plan.primary_tables.is_empty() {
            return 0.0;
        }
        let w = &self.weights;
        let avg = if matches.is_empty() {
            0.0
        } else {
            matches.iter().map(|m| m.similarity_score).sum::<f64>() / matches.len() as f64
        };
        let columns = if plan.select_columns.is_empty() { 0.0 } else { 1.0 };
        let score = w.plan_base + w.plan_match * avg + w.plan_tables + w.plan_columns * columns;
        score.min(1.0)
    }
}

/// Bind a field name to `table.column` among the given tables
fn bind_column(model: &SemanticModel, tables: &[String], field: &str) -> Option<String> {
    if let Some((table, column)) = field.split_once('.') {
        return model.column(table, column).map(|c| format!("{}.{}", c.table, c.name));
    }
    if model.is_empty() {
        return tables.first().map(|t| format!("{}.{}", t, field));
    }
    let forms = inflection::variants(field);
    for table in tables {
        if let Some(c) = model.columns_of(table).find(|c| forms.iter().any(|f| c.name.eq_ignore_ascii_case(f))) {
            return Some(format!("{}.{}", table, c.name));
        }
    }
    tables
        .iter()
        .flat_map(|t| model.columns_of(t))
        .map(|c| (c, jaro_winkler(&c.name.to_lowercase(), &field.to_lowercase())))
        .filter(|(_, score)| *score >= 0.88)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(c, _)| format!("{}.{}", c.table, c.name))
}

fn first_column(
    model: &SemanticModel,
    tables: &[String],
    predicate: impl Fn(&crate::metadata::ColumnInfo) -> bool,
) -> Option<String> {
    tables
        .iter()
        .flat_map(|t| model.columns_of(t))
        .find(|c| predicate(*c))
        .map(|c| format!("{}.{}", c.table, c.name))
}

fn is_numeric_column(model: &SemanticModel, qualified: &str) -> bool {
    qualified
        .split_once('.')
        .and_then(|(t, c)| model.column(t, c))
        .map(|c| c.is_numeric() && !c.is_key())
        .unwrap_or(false)
}

/// Comparison word -> SQL operator
pub fn numeric_operator(word: &str) -> &'static str {
    let word = word.to_lowercase();
    if word.contains("at least") {
        ">="
    } else if word.contains("at most") {
        "<="
    } else if ["greater", "more", "above", "over", "higher", "exceed"].iter().any(|k| word.contains(k)) {
        ">"
    } else if ["less", "fewer", "below", "under", "lower"].iter().any(|k| word.contains(k)) {
        "<"
    } else {
        "="
    }
}

pub fn escape(value: &str) -> String {
    value.replace('\'', "''")
}
