//! SQL Validation
//!
//! Pure checks of a statement against the semantic model: read-only guard,
//! balanced syntax, table and column existence, plus advisory warnings.
//! `repair_sql` fixes near-miss identifiers in a single pass.

use crate::inflection;
use crate::metadata::{strip_schema, SemanticModel};
use crate::sql::rewrite::{self, from_tables, mask_literals, top_level_mask, SqlParts};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strsim::jaro_winkler;

pub const READ_ONLY_MESSAGE: &str = "only read-only SELECT statements are allowed";

/// Minimum similarity for an identifier repair
const REPAIR_THRESHOLD: f64 = 0.85;

lazy_static! {
    static ref FIRST_WORD: Regex = Regex::new(r"^\s*\(*\s*([A-Za-z]+)").unwrap();
    static ref WRITE_KEYWORD: Regex = Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|TRUNCATE|REPLACE\s+INTO|MERGE|GRANT|REVOKE|ATTACH|DETACH|PRAGMA|VACUUM)\b"
    ).unwrap();
    static ref FROM_KEYWORD: Regex = Regex::new(r"(?i)\b(?:FROM|JOIN)\b").unwrap();
    static ref FROM_END: Regex = Regex::new(
        r"(?i)\b(?:WHERE|GROUP\s+BY|ORDER\s+BY|LIMIT|HAVING|UNION|INTERSECT|EXCEPT|WINDOW)\b|;"
    ).unwrap();
    static ref CTE_NAME: Regex = Regex::new(r"(?i)(?:\bWITH\b(?:\s+RECURSIVE)?|,)\s*([A-Za-z_]\w*)\s+AS\s*\(").unwrap();
    static ref DERIVED_ALIAS: Regex = Regex::new(r"(?i)\)\s+(?:AS\s+)?([A-Za-z_]\w*)").unwrap();
    static ref QUALIFIED: Regex = Regex::new(r"\b([A-Za-z_]\w*)\.([A-Za-z_]\w*)\b").unwrap();
    static ref SELECT_ALIAS: Regex = Regex::new(r"(?i)\bAS\s+([A-Za-z_]\w*)").unwrap();
    static ref BARE_IDENT: Regex = Regex::new(r"^[A-Za-z_]\w*$").unwrap();
    static ref WORD: Regex = Regex::new(r"[A-Za-z_][\w.]*").unwrap();
    static ref LEADING_WILDCARD: Regex = Regex::new(r"(?i)\bLIKE\s+'%").unwrap();
    static ref SELECT_STAR: Regex = Regex::new(r"(?i)\bSELECT\s+(?:DISTINCT\s+)?\*").unwrap();
    static ref HAS_LIMIT: Regex = Regex::new(r"(?i)\bLIMIT\s+\d+").unwrap();
}

/// Words that follow a derived table's `)` without being an alias
const NOT_ALIASES: &[&str] = &[
    "as", "on", "and", "or", "join", "inner", "left", "right", "full", "cross", "where", "group", "order",
    "limit", "having", "union", "from", "select", "then", "else", "end", "when", "desc", "asc", "is", "not",
    "in", "over", "filter", "between", "like",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownColumn {
    /// Qualifier as written in the statement, if any
    pub qualifier: Option<String>,
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub unknown_tables: Vec<String>,
    pub unknown_columns: Vec<UnknownColumn>,
}

/// Whether the statement is a single read-only SELECT/WITH query
pub fn is_read_only(sql: &str) -> bool {
    let masked = mask_literals(sql);
    let body = rewrite::strip_terminator(&masked);
    if body.contains(';') {
        return false;
    }
    let starts_ok = FIRST_WORD
        .captures(body)
        .map(|c| matches!(c[1].to_uppercase().as_str(), "SELECT" | "WITH"))
        .unwrap_or(false);
    starts_ok && !WRITE_KEYWORD.is_match(body)
}

/// Validate a statement against the model. Schema checks are skipped for an
/// empty model.
pub fn validate_sql(sql: &str, model: &SemanticModel) -> ValidationReport {
    let mut report = ValidationReport::default();
    if sql.trim().is_empty() {
        report.errors.push("SQL is empty".to_string());
        return report;
    }
    if !is_read_only(sql) {
        report.errors.push(READ_ONLY_MESSAGE.to_string());
        return report;
    }
    check_balance(sql, &mut report);

    let masked = mask_literals(sql);
    if model.is_empty() {
        report.warnings.push("No semantic model loaded, schema checks skipped".to_string());
    } else {
        check_schema(&masked, model, &mut report);
    }

    if SELECT_STAR.is_match(&masked) {
        report.warnings.push("SELECT * may return unnecessary columns".to_string());
    }
    if !HAS_LIMIT.is_match(&masked) {
        report.warnings.push("No LIMIT clause; large result sets are possible".to_string());
    }
    if LEADING_WILDCARD.is_match(sql) {
        report.warnings.push("LIKE with a leading wildcard cannot use an index".to_string());
    }
    if let Some(parts) = SqlParts::parse(&masked) {
        if rewrite::split_top_level(&parts.from, ',').len() > 1 && parts.where_clause.is_none() {
            report.warnings.push("Comma join without WHERE produces a cartesian product".to_string());
        }
    }

    report.is_valid = report.errors.is_empty();
    report
}

fn check_balance(sql: &str, report: &mut ValidationReport) {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth < 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    if quote.is_some() {
        report.errors.push("Syntax error: unterminated quoted literal".to_string());
    }
    if depth != 0 {
        report.errors.push("Syntax error: unbalanced parentheses".to_string());
    }
}

/// Every table reference in FROM/JOIN positions, nested queries included
fn table_references(masked: &str) -> Vec<rewrite::TableRef> {
    let mut refs = Vec::new();
    for m in FROM_KEYWORD.find_iter(masked) {
        let rest = &masked[m.end()..];
        let mask = top_level_mask(rest);
        let close = rest.char_indices().find(|(i, c)| *c == ')' && mask[*i]).map(|(i, _)| i);
        let keyword = FROM_END
            .find_iter(rest)
            .find(|k| mask.get(k.start()).copied().unwrap_or(false))
            .map(|k| k.start());
        let end = [close, keyword].into_iter().flatten().min().unwrap_or(rest.len());
        let list = &rest[..end];
        // JOIN matches are covered by the preceding FROM's list
        if m.as_str().eq_ignore_ascii_case("join") {
            continue;
        }
        refs.extend(from_tables(list));
    }
    refs
}

fn check_schema(masked: &str, model: &SemanticModel, report: &mut ValidationReport) {
    let ctes: BTreeSet<String> = CTE_NAME.captures_iter(masked).map(|c| c[1].to_lowercase()).collect();
    let derived: BTreeSet<String> = DERIVED_ALIAS
        .captures_iter(masked)
        .map(|c| c[1].to_lowercase())
        .filter(|a| !NOT_ALIASES.contains(&a.as_str()))
        .collect();
    let refs = table_references(masked);

    // qualifier -> real table (None for CTEs and derived tables)
    let mut qualifiers: Vec<(String, Option<String>)> = Vec::new();
    let mut schemas: BTreeSet<String> = BTreeSet::new();
    for table_ref in &refs {
        let name = strip_schema(&table_ref.name).to_string();
        if let Some((schema, _)) = table_ref.name.rsplit_once('.') {
            schemas.insert(schema.to_lowercase());
        }
        let real = if ctes.contains(&name.to_lowercase()) {
            None
        } else if let Some(table) = model.table(&name) {
            Some(table.name.clone())
        } else {
            if !report.unknown_tables.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
                report.errors.push(format!("Table '{}' does not exist", name));
                report.unknown_tables.push(name.clone());
            }
            None
        };
        qualifiers.push((name.to_lowercase(), real.clone()));
        if let Some(alias) = &table_ref.alias {
            qualifiers.push((alias.to_lowercase(), real));
        }
    }

    for cap in QUALIFIED.captures_iter(masked) {
        let qualifier = cap[1].to_lowercase();
        let column = &cap[2];
        if schemas.contains(&qualifier) || derived.contains(&qualifier) || ctes.contains(&qualifier) {
            continue;
        }
        let Some((_, target)) = qualifiers.iter().find(|(q, _)| *q == qualifier) else {
            // A model table used as qualifier without being in FROM is still checkable
            if let Some(table) = model.table(&qualifier) {
                push_unknown_column(report, model, Some(&cap[1]), &table.name, column);
            }
            continue;
        };
        if let Some(table) = target {
            push_unknown_column(report, model, Some(&cap[1]), table, column);
        }
    }

    // Bare projection columns of a simple single-table query
    if let Some(parts) = SqlParts::parse(masked) {
        let tables = parts.tables();
        if tables.len() == 1 && !parts.has_joins() {
            if let Some(table) = model.table(&tables[0].name) {
                let aliases: BTreeSet<String> =
                    SELECT_ALIAS.captures_iter(&parts.select).map(|c| c[1].to_lowercase()).collect();
                let mut bare: Vec<String> = rewrite::split_top_level(&parts.select, ',')
                    .into_iter()
                    .map(|item| SELECT_ALIAS.replace(&item, "").trim().to_string())
                    .collect();
                if let Some(where_clause) = &parts.where_clause {
                    bare.extend(where_columns(where_clause));
                }
                let table_name = table.name.clone();
                for item in bare.iter().filter(|i| BARE_IDENT.is_match(i)) {
                    if is_sql_word(item) || aliases.contains(&item.to_lowercase()) {
                        continue;
                    }
                    push_unknown_column(report, model, None, &table_name, item);
                }
            }
        }
    }
}

/// Words of a WHERE clause that can only be column names: top-level, not
/// qualified and not called. Sub-selects and function arguments are skipped.
fn where_columns(where_clause: &str) -> Vec<String> {
    let mask = top_level_mask(where_clause);
    WORD.find_iter(where_clause)
        .filter(|m| mask.get(m.start()).copied().unwrap_or(false))
        .filter(|m| !where_clause[m.end()..].trim_start().starts_with('('))
        .map(|m| m.as_str().to_string())
        .collect()
}

fn push_unknown_column(report: &mut ValidationReport, model: &SemanticModel, qualifier: Option<&str>, table: &str, column: &str) {
    if model.column(table, column).is_some() {
        return;
    }
    let unknown = UnknownColumn {
        qualifier: qualifier.map(|q| q.to_string()),
        table: table.to_string(),
        column: column.to_string(),
    };
    if !report.unknown_columns.contains(&unknown) {
        report.errors.push(format!("Column '{}' does not exist in table '{}'", column, table));
        report.unknown_columns.push(unknown);
    }
}

/// Keywords and literals that can appear as bare words in a projection or WHERE
fn is_sql_word(word: &str) -> bool {
    const WORDS: &[&str] = &[
        "and", "or", "not", "null", "is", "in", "like", "between", "true", "false", "distinct", "case", "when",
        "then", "else", "end", "exists", "as", "asc", "desc", "date", "current_date", "current_timestamp",
        "interval", "escape", "glob", "collate", "nocase", "any", "all", "some",
    ];
    let lower = word.to_lowercase();
    WORDS.contains(&lower.as_str()) || word.chars().all(|c| c.is_ascii_digit())
}

/// Closest model table for a misspelled or mis-numbered name
pub fn closest_table<'a>(model: &'a SemanticModel, name: &str) -> Option<&'a str> {
    let names: Vec<&'a str> = model.tables.iter().map(|t| t.name.as_str()).collect();
    closest(&names, strip_schema(name))
}

/// Closest column of `table`, or of any table when `table` is None
pub fn closest_column<'a>(model: &'a SemanticModel, table: Option<&str>, name: &str) -> Option<&'a str> {
    let names: Vec<&'a str> = model
        .columns
        .iter()
        .filter(|c| table.map_or(true, |t| c.table.eq_ignore_ascii_case(strip_schema(t))))
        .map(|c| c.name.as_str())
        .collect();
    closest(&names, name)
}

fn closest<'a>(candidates: &[&'a str], name: &str) -> Option<&'a str> {
    let lower = name.to_lowercase();
    if let Some(found) = candidates.iter().find(|c| inflection::same_noun(c, &lower)) {
        return Some(*found);
    }
    candidates
        .iter()
        .map(|c| (*c, jaro_winkler(&c.to_lowercase(), &lower)))
        .filter(|(_, score)| *score >= REPAIR_THRESHOLD)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(c, _)| c)
}

/// One repair pass over unknown identifiers. Returns the rewritten statement
/// and a description of each substitution, or None when nothing changed.
pub fn repair_sql(sql: &str, report: &ValidationReport, model: &SemanticModel) -> Option<(String, Vec<String>)> {
    let mut repaired = sql.to_string();
    let mut changes = Vec::new();

    for table in &report.unknown_tables {
        if let Some(fixed) = closest_table(model, table) {
            repaired = rewrite::replace_identifier(&repaired, table, fixed);
            changes.push(format!("table {} -> {}", table, fixed));
        }
    }
    for unknown in &report.unknown_columns {
        let Some(fixed) = closest_column(model, Some(&unknown.table), &unknown.column) else {
            continue;
        };
        match &unknown.qualifier {
            Some(q) => {
                repaired = rewrite::replace_identifier(
                    &repaired,
                    &format!("{}.{}", q, unknown.column),
                    &format!("{}.{}", q, fixed),
                );
            }
            None => repaired = rewrite::replace_identifier(&repaired, &unknown.column, fixed),
        }
        changes.push(format!("column {}.{} -> {}", unknown.table, unknown.column, fixed));
    }

    (repaired != sql).then_some((repaired, changes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::fixtures::shop_model;

    #[test]
    fn test_valid_join_query() {
        let sql = "SELECT c.name, SUM(o.amount) AS total FROM orders o INNER JOIN customers c \
                   ON o.customer_id = c.id WHERE c.country = 'China' GROUP BY c.name LIMIT 10;";
        let report = validate_sql(sql, &shop_model());
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn test_rejects_writes() {
        let model = shop_model();
        for sql in ["DELETE FROM customers", "SELECT 1; DROP TABLE customers;", "UPDATE orders SET amount = 0"] {
            let report = validate_sql(sql, &model);
            assert!(!report.is_valid);
            assert_eq!(report.errors, vec![READ_ONLY_MESSAGE.to_string()]);
        }
        assert!(is_read_only("SELECT 'drop table x' FROM customers;"));
    }

    #[test]
    fn test_unknown_identifiers() {
        let report = validate_sql("SELECT c.nme FROM customer c LIMIT 5;", &shop_model());
        assert!(!report.is_valid);
        assert_eq!(report.unknown_tables, vec!["customer"]);

        let report = validate_sql("SELECT o.amout FROM orders o LIMIT 5;", &shop_model());
        assert_eq!(report.unknown_columns.len(), 1);
        assert_eq!(report.unknown_columns[0].column, "amout");
    }

    #[test]
    fn test_functions_and_subselects_in_where_are_valid() {
        let model = shop_model();
        let report = validate_sql("SELECT name FROM customers WHERE LOWER(country) = 'china' LIMIT 5;", &model);
        assert!(report.is_valid, "{:?}", report.errors);

        let report = validate_sql("SELECT name FROM customers WHERE id IN (SELECT customer_id FROM orders) LIMIT 5;", &model);
        assert!(report.is_valid, "{:?}", report.errors);
        assert!(report.unknown_columns.is_empty());

        let report = validate_sql("SELECT name FROM customers WHERE UPPER(country) = 'CN' AND tier > 1 LIMIT 5;", &model);
        assert!(!report.is_valid);
        let unknown: Vec<_> = report.unknown_columns.iter().map(|c| c.column.as_str()).collect();
        assert_eq!(unknown, vec!["tier"]);
    }

    #[test]
    fn test_ctes_and_derived_tables_are_not_schema_errors() {
        let sql = "WITH big AS (SELECT * FROM orders WHERE amount > 100) \
                   SELECT b.status, t.n FROM big b, (SELECT COUNT(*) AS n FROM customers) t LIMIT 5;";
        let report = validate_sql(sql, &shop_model());
        assert!(report.unknown_tables.is_empty(), "{:?}", report.errors);
    }

    #[test]
    fn test_warnings_and_syntax() {
        let report = validate_sql("SELECT * FROM customers WHERE name LIKE '%an'", &shop_model());
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 3);

        let report = validate_sql("SELECT COUNT(* FROM customers;", &shop_model());
        assert!(report.errors.iter().any(|e| e.contains("parentheses")));
    }

    #[test]
    fn test_repair_plural_and_typo() {
        let model = shop_model();
        let sql = "SELECT name FROM customer LIMIT 5;";
        let report = validate_sql(sql, &model);
        let (repaired, changes) = repair_sql(sql, &report, &model).unwrap();
        assert_eq!(repaired, "SELECT name FROM customers LIMIT 5;");
        assert_eq!(changes, vec!["table customer -> customers".to_string()]);
        assert!(validate_sql(&repaired, &model).is_valid);

        let sql = "SELECT o.amout FROM orders o LIMIT 5;";
        let report = validate_sql(sql, &model);
        let (repaired, _) = repair_sql(sql, &report, &model).unwrap();
        assert_eq!(repaired, "SELECT o.amount FROM orders o LIMIT 5;");
        assert!(repair_sql("SELECT o.zzz FROM orders o;", &validate_sql("SELECT o.zzz FROM orders o;", &model), &model).is_none());
    }
}
