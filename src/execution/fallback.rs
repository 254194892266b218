//! Fallback Cascade
//!
//! The ordered strategies the executor walks after a failed primary attempt.
//! The order lives in configuration as a list of `CascadeStep`s; this module
//! only knows how each strategy rewrites a statement. A rewrite returns None
//! when the strategy does not apply, and the executor then moves on without
//! recording an attempt.

use crate::config::ExecutionSettings;
use crate::error::{NlqError, Result};
use crate::execution::error_classifier::SqlErrorClass;
use crate::metadata::{strip_schema, SemanticModel};
use crate::planner::QueryPlan;
use crate::sql::generator::render_plan;
use crate::sql::rewrite::{self, SqlParts};
use crate::sql::validation::{closest_column, closest_table, repair_sql, validate_sql};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    Primary,
    Simplify,
    RemoveJoins,
    AdjustLimit,
    AlternativeTables,
    AlternativeColumns,
    SyntaxCorrection,
    BasicSelect,
}

impl FallbackStrategy {
    /// Cascade order used when configuration doesn't override it
    pub fn default_cascade() -> Vec<FallbackStrategy> {
        vec![
            FallbackStrategy::Simplify,
            FallbackStrategy::RemoveJoins,
            FallbackStrategy::AdjustLimit,
            FallbackStrategy::AlternativeTables,
            FallbackStrategy::AlternativeColumns,
            FallbackStrategy::SyntaxCorrection,
            FallbackStrategy::BasicSelect,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            FallbackStrategy::Primary => "primary",
            FallbackStrategy::Simplify => "simplify",
            FallbackStrategy::RemoveJoins => "remove_joins",
            FallbackStrategy::AdjustLimit => "adjust_limit",
            FallbackStrategy::AlternativeTables => "alternative_tables",
            FallbackStrategy::AlternativeColumns => "alternative_columns",
            FallbackStrategy::SyntaxCorrection => "syntax_correction",
            FallbackStrategy::BasicSelect => "basic_select",
        }
    }
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One configured cascade entry: the strategy and an optional regex the
/// previous error text must match for the step to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeStep {
    pub strategy: FallbackStrategy,
    #[serde(default)]
    pub when: Option<String>,
}

impl CascadeStep {
    pub fn always(strategy: FallbackStrategy) -> Self {
        Self { strategy, when: None }
    }

    pub fn when(strategy: FallbackStrategy, pattern: &str) -> Self {
        Self {
            strategy,
            when: Some(pattern.to_string()),
        }
    }

    pub fn compiled_pattern(&self) -> Result<Option<Regex>> {
        self.when
            .as_deref()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    NlqError::Config(format!("Invalid cascade pattern for {}: {}", self.strategy, e))
                })
            })
            .transpose()
    }
}

/// Everything a rewrite may draw on
pub struct FallbackContext<'a> {
    /// Statement as generated, before any fallback
    pub original_sql: &'a str,
    pub last_error: &'a str,
    pub error_class: &'a SqlErrorClass,
    pub plan: &'a QueryPlan,
    pub model: Option<&'a SemanticModel>,
    pub settings: &'a ExecutionSettings,
}

impl<'a> FallbackContext<'a> {
    fn table_exists(&self, table: &str) -> bool {
        self.model.map_or(true, |m| m.is_empty() || m.has_table(table))
    }

    fn failing_table(&self) -> Option<&str> {
        match self.error_class {
            SqlErrorClass::TableNotFound(name) => Some(strip_schema(name)),
            _ => None,
        }
    }

    /// Best table to fall back on: the plan's top table, then alternative
    /// plans, then the first table of the original statement.
    pub fn best_table(&self) -> Option<String> {
        let failing = self.failing_table();
        let usable = |t: &str| self.table_exists(t) && failing.map_or(true, |f| !f.eq_ignore_ascii_case(t));

        self.plan
            .primary_tables
            .iter()
            .chain(self.plan.alternative_plans.iter().flat_map(|p| p.primary_tables.iter()))
            .find(|t| usable(t))
            .cloned()
            .or_else(|| {
                SqlParts::parse(self.original_sql)
                    .and_then(|parts| parts.tables().into_iter().map(|t| t.name).find(|t| usable(t)))
            })
    }
}

/// Rewrite for one strategy, or None when it doesn't apply
pub fn rewrite(strategy: FallbackStrategy, ctx: &FallbackContext<'_>) -> Option<String> {
    let sql = match strategy {
        FallbackStrategy::Primary => Some(ctx.original_sql.to_string()),
        FallbackStrategy::Simplify => rewrite::simplify(ctx.original_sql),
        FallbackStrategy::RemoveJoins => rewrite::strip_joins(ctx.original_sql),
        FallbackStrategy::AdjustLimit => Some(rewrite::cap_limit(ctx.original_sql, ctx.settings.fallback_limit as u64)),
        FallbackStrategy::AlternativeTables => alternative_tables(ctx),
        FallbackStrategy::AlternativeColumns => alternative_columns(ctx),
        FallbackStrategy::SyntaxCorrection => syntax_correction(ctx),
        FallbackStrategy::BasicSelect => ctx
            .best_table()
            .map(|table| format!("SELECT * FROM {} LIMIT {}", table, ctx.settings.default_limit)),
    };
    let sql = sql.map(|s| rewrite::ensure_terminated(&rewrite::normalize_whitespace(&s)));
    debug!("Fallback {} -> {:?}", strategy, sql);
    sql
}

fn alternative_tables(ctx: &FallbackContext<'_>) -> Option<String> {
    let failing = ctx
        .failing_table()
        .map(|t| t.to_string())
        .or_else(|| ctx.plan.top_table().map(|t| t.to_string()));
    let alternative = ctx.plan.alternative_plans.iter().find(|alt| {
        alt.top_table().map_or(false, |t| {
            ctx.table_exists(t) && failing.as_deref().map_or(true, |f| !f.eq_ignore_ascii_case(t))
        })
    })?;
    Some(render_plan(alternative, ctx.settings.default_limit))
}

fn alternative_columns(ctx: &FallbackContext<'_>) -> Option<String> {
    let table = ctx.best_table()?;
    let prefix = format!("{}.", table.to_lowercase());
    let dropped_column = match ctx.error_class {
        SqlErrorClass::ColumnNotFound(name) => name.rsplit('.').next().map(|c| c.to_lowercase()),
        _ => None,
    };
    let conditions: Vec<&str> = ctx
        .plan
        .where_conditions
        .iter()
        .map(|c| c.as_str())
        .filter(|c| c.to_lowercase().starts_with(&prefix))
        .filter(|c| dropped_column.as_deref().map_or(true, |d| !c.to_lowercase().contains(d)))
        .collect();
    let mut sql = format!("SELECT * FROM {}", table);
    if !conditions.is_empty() {
        sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
    }
    sql.push_str(&format!(" LIMIT {}", ctx.settings.default_limit));
    Some(sql)
}

/// Common keyword misspellings seen in completion output
const TYPOS: &[(&str, &str)] = &[
    ("SELCT", "SELECT"),
    ("SLECT", "SELECT"),
    ("FORM", "FROM"),
    ("FRMO", "FROM"),
    ("WHRE", "WHERE"),
    ("WEHRE", "WHERE"),
    ("GROPU", "GROUP"),
    ("ODER", "ORDER"),
    ("LIMT", "LIMIT"),
];

fn syntax_correction(ctx: &FallbackContext<'_>) -> Option<String> {
    let sql = ctx.original_sql;
    let targeted = match ctx.error_class {
        SqlErrorClass::TableNotFound(name) => {
            let bare = strip_schema(name);
            let fixed = match ctx.model {
                Some(model) => closest_table(model, bare).map(|t| t.to_string()),
                None => ctx.plan.primary_tables.iter().find(|t| crate::inflection::same_noun(t, bare)).cloned(),
            };
            fixed
                .filter(|f| !f.eq_ignore_ascii_case(bare))
                .map(|f| rewrite::replace_identifier(sql, bare, &f))
        }
        SqlErrorClass::ColumnNotFound(name) => {
            let model = ctx.model?;
            let (qualifier, column) = match name.rsplit_once('.') {
                Some((q, c)) => (Some(q), c),
                None => (None, name.as_str()),
            };
            let table = qualifier.and_then(|q| {
                SqlParts::parse(sql)?
                    .tables()
                    .into_iter()
                    .find(|t| t.qualifier().eq_ignore_ascii_case(q))
                    .map(|t| t.name)
            });
            let fixed = closest_column(model, table.as_deref(), column)?;
            let (old, new) = match qualifier {
                Some(q) => (format!("{}.{}", q, column), format!("{}.{}", q, fixed)),
                None => (column.to_string(), fixed.to_string()),
            };
            Some(rewrite::replace_identifier(sql, &old, &new))
        }
        SqlErrorClass::AmbiguousColumn(name) => {
            let parts = SqlParts::parse(sql)?;
            let first = parts.tables().into_iter().next()?;
            let bare = Regex::new(&format!(r"(?i)(^|[^.\w]){}\b", regex::escape(name))).ok()?;
            let masked = rewrite::mask_literals(sql);
            let mut out = String::with_capacity(sql.len() + 16);
            let mut last = 0;
            for cap in bare.captures_iter(&masked) {
                let (Some(whole), Some(lead)) = (cap.get(0), cap.get(1)) else {
                    continue;
                };
                out.push_str(&sql[last..lead.end()]);
                out.push_str(&format!("{}.{}", first.qualifier(), name));
                last = whole.end();
            }
            out.push_str(&sql[last..]);
            Some(out)
        }
        SqlErrorClass::InvalidAggregation => {
            let mut parts = SqlParts::parse(sql)?;
            if parts.group_by.is_some() {
                return None;
            }
            let keys: Vec<String> = rewrite::split_top_level(&parts.select, ',')
                .into_iter()
                .filter(|item| !item.to_uppercase().contains('(') && item != "*")
                .map(|item| item.split_whitespace().next().unwrap_or_default().to_string())
                .filter(|item| !item.is_empty())
                .collect();
            if keys.is_empty() {
                return None;
            }
            parts.group_by = Some(keys.join(", "));
            Some(parts.to_sql())
        }
        SqlErrorClass::SyntaxError(_) => fix_syntax(sql),
        SqlErrorClass::Timeout | SqlErrorClass::Other(_) => None,
    };

    let candidate = targeted.filter(|s| s != sql);
    candidate.or_else(|| {
        // Schema-driven repair when the error text gave nothing to act on
        let model = ctx.model?;
        let report = validate_sql(sql, model);
        repair_sql(sql, &report, model).map(|(repaired, _)| repaired)
    })
}

fn fix_syntax(sql: &str) -> Option<String> {
    let mut fixed = sql.to_string();
    for (typo, keyword) in TYPOS {
        fixed = rewrite::replace_identifier(&fixed, typo, keyword);
    }
    // Dangling commas before a clause keyword
    if let Ok(re) = Regex::new(r"(?i),\s*(FROM|WHERE|GROUP\s+BY|ORDER\s+BY|LIMIT)\b") {
        fixed = re.replace_all(&fixed, " $1").to_string();
    }
    let open = fixed.matches('(').count();
    let close = fixed.matches(')').count();
    if open > close {
        let body = rewrite::strip_terminator(&fixed).to_string();
        fixed = format!("{}{}", body, ")".repeat(open - close));
    }
    (fixed != sql).then_some(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::error_classifier::ErrorClassifier;
    use crate::metadata::fixtures::shop_model;

    fn plan_over(tables: &[&str]) -> QueryPlan {
        QueryPlan {
            primary_tables: tables.iter().map(|t| t.to_string()).collect(),
            confidence_score: 0.8,
            ..QueryPlan::default()
        }
    }

    fn context<'a>(
        sql: &'a str,
        error: &'a str,
        class: &'a SqlErrorClass,
        plan: &'a QueryPlan,
        model: &'a SemanticModel,
        settings: &'a ExecutionSettings,
    ) -> FallbackContext<'a> {
        FallbackContext {
            original_sql: sql,
            last_error: error,
            error_class: class,
            plan,
            model: Some(model),
            settings,
        }
    }

    #[test]
    fn test_cascade_step_patterns() {
        assert!(CascadeStep::always(FallbackStrategy::Simplify).compiled_pattern().unwrap().is_none());
        let step = CascadeStep::when(FallbackStrategy::SyntaxCorrection, "(?i)syntax|no such");
        assert!(step.compiled_pattern().unwrap().unwrap().is_match("no such table: x"));
        assert!(CascadeStep::when(FallbackStrategy::Simplify, "(").compiled_pattern().is_err());
    }

    #[test]
    fn test_alternative_tables_skip_failing_table() {
        let model = shop_model();
        let settings = ExecutionSettings::default();
        let mut plan = plan_over(&["customers_v2"]);
        plan.alternative_plans = vec![plan_over(&["customers_v2"]), plan_over(&["customers"])];
        let error = "no such table: customers_v2";
        let class = ErrorClassifier::new().classify(error);
        let ctx = context("SELECT * FROM customers_v2 LIMIT 1000;", error, &class, &plan, &model, &settings);

        assert_eq!(rewrite(FallbackStrategy::AlternativeTables, &ctx).unwrap(), "SELECT * FROM customers LIMIT 100;");
        assert_eq!(rewrite(FallbackStrategy::AdjustLimit, &ctx).unwrap(), "SELECT * FROM customers_v2 LIMIT 10;");
        assert!(rewrite(FallbackStrategy::Simplify, &ctx).is_none());
        assert!(rewrite(FallbackStrategy::RemoveJoins, &ctx).is_none());
        assert_eq!(rewrite(FallbackStrategy::BasicSelect, &ctx).unwrap(), "SELECT * FROM customers LIMIT 100;");
    }

    #[test]
    fn test_syntax_correction_fixes_names() {
        let model = shop_model();
        let settings = ExecutionSettings::default();
        let plan = plan_over(&["customers"]);

        let error = "no such table: customer";
        let class = ErrorClassifier::new().classify(error);
        let ctx = context("SELECT name FROM customer LIMIT 5;", error, &class, &plan, &model, &settings);
        assert_eq!(
            rewrite(FallbackStrategy::SyntaxCorrection, &ctx).unwrap(),
            "SELECT name FROM customers LIMIT 5;"
        );

        let error = "no such column: c.nme";
        let class = ErrorClassifier::new().classify(error);
        let ctx = context("SELECT c.nme FROM customers c LIMIT 5;", error, &class, &plan, &model, &settings);
        assert_eq!(
            rewrite(FallbackStrategy::SyntaxCorrection, &ctx).unwrap(),
            "SELECT c.name FROM customers c LIMIT 5;"
        );

        let error = "near \"FORM\": syntax error";
        let class = ErrorClassifier::new().classify(error);
        let ctx = context("SELECT name, FORM customers LIMIT 5;", error, &class, &plan, &model, &settings);
        assert_eq!(
            rewrite(FallbackStrategy::SyntaxCorrection, &ctx).unwrap(),
            "SELECT name FROM customers LIMIT 5;"
        );
    }

    #[test]
    fn test_ambiguous_column_gets_qualified() {
        let model = shop_model();
        let settings = ExecutionSettings::default();
        let plan = plan_over(&["orders"]);
        let error = "ambiguous column name: id";
        let class = ErrorClassifier::new().classify(error);
        let sql = "SELECT id, c.name FROM orders o JOIN customers c ON o.customer_id = c.id LIMIT 5;";
        let ctx = context(sql, error, &class, &plan, &model, &settings);
        assert_eq!(
            rewrite(FallbackStrategy::SyntaxCorrection, &ctx).unwrap(),
            "SELECT o.id, c.name FROM orders o JOIN customers c ON o.customer_id = c.id LIMIT 5;"
        );
    }

    #[test]
    fn test_alternative_columns_keeps_bound_conditions() {
        let model = shop_model();
        let settings = ExecutionSettings::default();
        let mut plan = plan_over(&["customers"]);
        plan.where_conditions = vec!["customers.country = 'China'".to_string()];
        let error = "no such column: customers.nme";
        let class = ErrorClassifier::new().classify(error);
        let ctx = context("SELECT customers.nme FROM customers;", error, &class, &plan, &model, &settings);
        assert_eq!(
            rewrite(FallbackStrategy::AlternativeColumns, &ctx).unwrap(),
            "SELECT * FROM customers WHERE customers.country = 'China' LIMIT 100;"
        );
    }
}
