//! Domain business rules: default predicates appended to generated SQL.
//! Purely additive; existing predicates are never touched.

use crate::config::BusinessRule;
use crate::sql::rewrite::{self, SqlParts};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

lazy_static! {
    static ref OR: Regex = Regex::new(r"(?i)\bOR\b").unwrap();
    static ref AND: Regex = Regex::new(r"(?i)\bAND\b").unwrap();
}

/// AND each applicable rule predicate into the WHERE clause. A rule scoped to
/// a table applies only when that table is in the FROM clause. Statements the
/// clause splitter can't handle come back unchanged.
pub fn apply_rules(sql: &str, rules: &[BusinessRule]) -> String {
    if rules.is_empty() {
        return sql.to_string();
    }
    let Some(mut parts) = SqlParts::parse(sql) else {
        return sql.to_string();
    };
    let tables = parts.tables();

    let mut added = Vec::new();
    for rule in rules {
        let in_scope = rule
            .table
            .as_deref()
            .map_or(true, |t| tables.iter().any(|r| r.name.eq_ignore_ascii_case(t)));
        let predicate = rule.predicate.trim();
        if !in_scope || predicate.is_empty() {
            continue;
        }
        let existing = parts.where_clause.as_deref().map(conjuncts).unwrap_or_default();
        if conjuncts(predicate).iter().all(|c| existing.contains(c)) {
            continue;
        }
        parts.where_clause = Some(match parts.where_clause.take() {
            Some(current) if !rewrite::top_level(&OR, &current).is_empty() => {
                format!("({}) AND {}", current, predicate)
            }
            Some(current) => format!("{} AND {}", current, predicate),
            None => predicate.to_string(),
        });
        added.push(predicate.to_string());
    }

    if added.is_empty() {
        return sql.to_string();
    }
    debug!("Applied business rules: {:?}", added);
    rewrite::ensure_terminated(&parts.to_sql())
}

/// Top-level AND terms, whitespace-collapsed, lowercased and unwrapped
fn conjuncts(condition: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut last = 0;
    for m in rewrite::top_level(&AND, condition) {
        terms.push(&condition[last..m.start()]);
        last = m.end();
    }
    terms.push(&condition[last..]);
    terms
        .into_iter()
        .map(|term| unwrap_parens(&rewrite::normalize_whitespace(term).to_lowercase()))
        .filter(|term| !term.is_empty())
        .collect()
}

fn unwrap_parens(term: &str) -> String {
    let mut term = term.trim();
    while term.len() >= 2 && term.starts_with('(') && term.ends_with(')') {
        let mask = rewrite::top_level_mask(term);
        if mask[1..term.len() - 1].iter().any(|top| *top) {
            break;
        }
        term = term[1..term.len() - 1].trim();
    }
    term.to_string()
}
