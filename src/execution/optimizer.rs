//! Query Optimization Hints
//!
//! Rule-based, not cost-based: a bounded LIMIT is injected and the statement
//! is checked for unbounded projections, full scans and columns worth
//! indexing. Only the LIMIT is rewritten; everything else is advice.

use crate::metadata::{strip_schema, SemanticModel};
use crate::sql::rewrite::{self, SqlParts};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

lazy_static! {
    static ref EQUALITY: Regex = Regex::new(
        r"(?i)\b([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?)\s*(?:=|\bIN\s*\()\s*(?:'[^']*'|-?\d+(?:\.\d+)?|\?|:\w+)"
    ).unwrap();
    static ref SELECT_STAR: Regex = Regex::new(r"(?i)^\s*(?:DISTINCT\s+)?\*\s*$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCandidate {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub original_sql: String,
    pub optimized_sql: String,
    /// Rewrites applied to `optimized_sql`
    pub applied: Vec<String>,
    pub suggestions: Vec<String>,
    pub index_candidates: Vec<IndexCandidate>,
}

pub fn optimize_sql(sql: &str, model: &SemanticModel, default_limit: u64) -> OptimizationResult {
    let normalized = rewrite::normalize_whitespace(sql);
    let mut result = OptimizationResult {
        original_sql: sql.to_string(),
        optimized_sql: rewrite::ensure_terminated(&normalized),
        applied: Vec::new(),
        suggestions: Vec::new(),
        index_candidates: Vec::new(),
    };

    if rewrite::find_limit(&normalized).is_none() {
        result.optimized_sql = rewrite::inject_limit(&normalized, default_limit);
        result.applied.push(format!("Added LIMIT {}", default_limit));
    }

    let Some(parts) = SqlParts::parse(&rewrite::mask_literals(&normalized)) else {
        result
            .suggestions
            .push("Statement is not a single SELECT; only the row limit was checked".to_string());
        return result;
    };
    let tables = parts.tables();

    if SELECT_STAR.is_match(&parts.select) {
        let listed = match tables.as_slice() {
            [only] => {
                let columns: Vec<&str> = model.columns_of(strip_schema(&only.name)).map(|c| c.name.as_str()).collect();
                (!columns.is_empty()).then(|| format!(" ({})", columns.join(", ")))
            }
            _ => None,
        };
        result.suggestions.push(format!(
            "Select only the needed columns instead of SELECT *{}",
            listed.unwrap_or_default()
        ));
    }

    match &parts.where_clause {
        None if parts.group_by.is_none() => {
            let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
            result
                .suggestions
                .push(format!("No WHERE clause; every row of {} is scanned", names.join(", ")));
        }
        None => {}
        Some(where_clause) => {
            for cap in EQUALITY.captures_iter(where_clause) {
                let reference = &cap[1];
                let (qualifier, column) = match reference.split_once('.') {
                    Some((q, c)) => (Some(q), c),
                    None => (None, reference),
                };
                let table = match qualifier {
                    Some(q) => tables
                        .iter()
                        .find(|t| t.qualifier().eq_ignore_ascii_case(q))
                        .map(|t| strip_schema(&t.name).to_string()),
                    None if tables.len() == 1 => Some(strip_schema(&tables[0].name).to_string()),
                    None => model
                        .tables_with_column(column)
                        .into_iter()
                        .find(|owner| tables.iter().any(|t| strip_schema(&t.name).eq_ignore_ascii_case(owner)))
                        .map(|owner| owner.to_string()),
                };
                let Some(table) = table else { continue };
                let known = model.is_empty() || model.column(&table, column).is_some();
                let is_key = model.column(&table, column).map_or(false, |c| c.name.eq_ignore_ascii_case("id"));
                let candidate = IndexCandidate {
                    table,
                    column: column.to_string(),
                };
                if known && !is_key && !result.index_candidates.contains(&candidate) {
                    result.suggestions.push(format!(
                        "Consider an index on {}({}) for the equality filter",
                        candidate.table, candidate.column
                    ));
                    result.index_candidates.push(candidate);
                }
            }
        }
    }

    debug!(
        "Optimization: {} applied, {} suggestions",
        result.applied.len(),
        result.suggestions.len()
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::fixtures::shop_model;

    #[test]
    fn test_limit_injected_and_star_flagged() {
        let result = optimize_sql("SELECT * FROM customers", &shop_model(), 100);
        assert_eq!(result.optimized_sql, "SELECT * FROM customers LIMIT 100;");
        assert_eq!(result.applied, vec!["Added LIMIT 100"]);
        assert!(result.suggestions[0].contains("(id, name, country, created_at)"));
        assert!(result.suggestions.iter().any(|s| s.starts_with("No WHERE clause")));
    }

    #[test]
    fn test_index_candidates_for_equality_filters() {
        let sql = "SELECT o.id FROM orders o JOIN customers c ON o.customer_id = c.id \
                   WHERE c.country = 'China' AND o.status = 'paid' AND o.amount > 10 AND o.id = 3 LIMIT 5;";
        let result = optimize_sql(sql, &shop_model(), 100);
        assert!(result.applied.is_empty());
        assert_eq!(
            result.index_candidates,
            vec![
                IndexCandidate { table: "customers".to_string(), column: "country".to_string() },
                IndexCandidate { table: "orders".to_string(), column: "status".to_string() },
            ]
        );
    }
}
