//! SQL Rewriting
//!
//! Quote- and parenthesis-aware splitting of a single SELECT statement into
//! its top-level clauses, plus the small rewrites the generator and the
//! fallback cascade need (limits, joins, projections, terminators).

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref CLAUSE: Regex = Regex::new(
        r"(?i)\b(SELECT|FROM|WHERE|GROUP\s+BY|HAVING|ORDER\s+BY|LIMIT|UNION|INTERSECT|EXCEPT)\b"
    ).unwrap();
    static ref JOIN: Regex = Regex::new(
        r"(?i)\b(?:NATURAL\s+)?(?:(?:LEFT|RIGHT|FULL)(?:\s+OUTER)?\s+|INNER\s+|CROSS\s+)?JOIN\b"
    ).unwrap();
    static ref AND: Regex = Regex::new(r"(?i)\bAND\b").unwrap();
    static ref ON_OR_USING: Regex = Regex::new(r"(?i)\b(?:ON|USING)\b").unwrap();
    static ref TABLE_REF: Regex = Regex::new(
        r#"^\s*([A-Za-z_][\w.]*|"[^"]+"|`[^`]+`)(?:\s+(?:(?i:AS)\s+)?([A-Za-z_]\w*))?"#
    ).unwrap();
    static ref TRAILING_LIMIT: Regex = Regex::new(r"(?i)\bLIMIT\s+(\d+)(\s+OFFSET\s+\d+)?\s*;?\s*$").unwrap();
    static ref OR: Regex = Regex::new(r"(?i)\bOR\b").unwrap();
    static ref DERIVED_ALIAS: Regex = Regex::new(r"^(?i:AS\s+)?([A-Za-z_]\w*)?$").unwrap();
    static ref PLAIN_COLUMN: Regex = Regex::new(r"^[A-Za-z_][\w.]*$").unwrap();
    static ref AGGREGATE: Regex = Regex::new(r"(?i)\b(?:COUNT|SUM|AVG|MIN|MAX)\s*\(").unwrap();
}

const NOT_ALIASES: &[&str] = &[
    "on", "using", "join", "inner", "left", "right", "full", "cross", "outer", "natural", "where", "group",
    "order", "limit", "having", "union",
];

/// Top-level clauses of one SELECT statement; `select` excludes the keyword
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlParts {
    pub select: String,
    pub from: String,
    pub where_clause: Option<String>,
    pub group_by: Option<String>,
    pub having: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    /// Name the rest of the statement uses to qualify columns
    pub fn qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Per-byte flag: true where the byte sits outside quotes and parentheses
pub(crate) fn top_level_mask(sql: &str) -> Vec<bool> {
    let mut mask = vec![false; sql.len()];
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in sql.char_indices() {
        let top = quote.is_none() && depth == 0;
        for slot in mask.iter_mut().skip(i).take(c.len_utf8()) {
            *slot = top;
        }
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            _ => {}
        }
    }
    mask
}

/// Regex matches that start at the top level
pub(crate) fn top_level<'a>(re: &Regex, sql: &'a str) -> Vec<regex::Match<'a>> {
    let mask = top_level_mask(sql);
    re.find_iter(sql).filter(|m| mask.get(m.start()).copied().unwrap_or(false)).collect()
}

/// Split on a top-level separator character
pub fn split_top_level(sql: &str, separator: char) -> Vec<String> {
    let mask = top_level_mask(sql);
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, c) in sql.char_indices() {
        if c == separator && mask[i] {
            parts.push(sql[start..i].trim().to_string());
            start = i + c.len_utf8();
        }
    }
    parts.push(sql[start..].trim().to_string());
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

pub fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Exactly one trailing `;`
pub fn ensure_terminated(sql: &str) -> String {
    format!("{};", strip_terminator(sql))
}

/// Collapse whitespace runs outside quoted literals
pub fn normalize_whitespace(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;
    for c in sql.trim().chars() {
        if quote.is_none() && c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (None, '\'' | '"' | '`') => quote = Some(c),
            _ => {}
        }
        out.push(c);
    }
    out
}

impl SqlParts {
    /// None for anything other than a single, non-compound SELECT
    pub fn parse(sql: &str) -> Option<Self> {
        let body = strip_terminator(sql);
        let clauses = top_level(&CLAUSE, body);
        let first = clauses.first()?;
        if first.start() != 0 || !first.as_str().eq_ignore_ascii_case("select") {
            return None;
        }

        let mut parts = SqlParts::default();
        let mut seen: Vec<String> = Vec::new();
        let mut found_from = false;
        for (idx, clause) in clauses.iter().enumerate() {
            let keyword = clause.as_str().to_uppercase().split_whitespace().collect::<Vec<_>>().join(" ");
            if matches!(keyword.as_str(), "UNION" | "INTERSECT" | "EXCEPT") || (idx > 0 && keyword == "SELECT") {
                return None;
            }
            if seen.contains(&keyword) {
                return None;
            }
            let end = clauses.get(idx + 1).map(|m| m.start()).unwrap_or(body.len());
            let text = body[clause.end()..end].trim().to_string();
            match keyword.as_str() {
                "SELECT" => parts.select = text,
                "FROM" => {
                    parts.from = text;
                    found_from = true;
                }
                "WHERE" => parts.where_clause = Some(text),
                "GROUP BY" => parts.group_by = Some(text),
                "HAVING" => parts.having = Some(text),
                "ORDER BY" => parts.order_by = Some(text),
                "LIMIT" => parts.limit = Some(text),
                _ => return None,
            }
            seen.push(keyword);
        }
        if parts.select.is_empty() || !found_from || parts.from.is_empty() {
            return None;
        }
        Some(parts)
    }

    /// Render without a terminator
    pub fn to_sql(&self) -> String {
        let mut sql = format!("SELECT {} FROM {}", self.select, self.from);
        for (keyword, clause) in [
            ("WHERE", &self.where_clause),
            ("GROUP BY", &self.group_by),
            ("HAVING", &self.having),
            ("ORDER BY", &self.order_by),
            ("LIMIT", &self.limit),
        ] {
            if let Some(text) = clause.as_ref().filter(|t| !t.is_empty()) {
                sql.push_str(&format!(" {} {}", keyword, text));
            }
        }
        sql
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit.as_ref()?.split_whitespace().next()?.parse().ok()
    }

    pub fn tables(&self) -> Vec<TableRef> {
        from_tables(&self.from)
    }

    pub fn has_joins(&self) -> bool {
        !top_level(&JOIN, &self.from).is_empty() || split_top_level(&self.from, ',').len() > 1
    }

    pub fn has_aggregates(&self) -> bool {
        AGGREGATE.is_match(&self.select) || self.group_by.is_some() || self.having.is_some()
    }
}

/// Tables named in a FROM clause, derived tables excluded
pub fn from_tables(from: &str) -> Vec<TableRef> {
    let mut segments = Vec::new();
    for chunk in split_top_level(from, ',') {
        let mut last = 0;
        for m in top_level(&JOIN, &chunk) {
            segments.push(chunk[last..m.start()].to_string());
            last = m.end();
        }
        segments.push(chunk[last..].to_string());
    }

    segments
        .iter()
        .filter_map(|segment| {
            let head = match top_level(&ON_OR_USING, segment).first() {
                Some(m) => &segment[..m.start()],
                None => segment.as_str(),
            };
            let cap = TABLE_REF.captures(head)?;
            let name = cap[1].trim_matches(|c| c == '"' || c == '`').to_string();
            let alias = cap
                .get(2)
                .map(|m| m.as_str().to_string())
                .filter(|a| !NOT_ALIASES.contains(&a.to_lowercase().as_str()));
            Some(TableRef { name, alias })
        })
        .collect()
}

/// Blank out the contents of single-quoted literals, keeping byte offsets
pub fn mask_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    for c in sql.chars() {
        if c == '\'' {
            in_literal = !in_literal;
            out.push(c);
        } else if in_literal {
            out.extend(std::iter::repeat(' ').take(c.len_utf8()));
        } else {
            out.push(c);
        }
    }
    out
}

/// Replace a whole-word identifier everywhere outside string literals
pub fn replace_identifier(sql: &str, old: &str, new: &str) -> String {
    let Ok(re) = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(old))) else {
        return sql.to_string();
    };
    let masked = mask_literals(sql);
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for m in re.find_iter(&masked) {
        out.push_str(&sql[last..m.start()]);
        out.push_str(new);
        last = m.end();
    }
    out.push_str(&sql[last..]);
    out
}

/// Numeric LIMIT of a statement, if any
pub fn find_limit(sql: &str) -> Option<u64> {
    match SqlParts::parse(sql) {
        Some(parts) => parts.limit_value(),
        None => TRAILING_LIMIT.captures(strip_terminator(sql)).and_then(|c| c[1].parse().ok()),
    }
}

/// Append a LIMIT when the statement has none
pub fn inject_limit(sql: &str, limit: u64) -> String {
    match SqlParts::parse(sql) {
        Some(mut parts) if parts.limit.is_none() => {
            parts.limit = Some(limit.to_string());
            ensure_terminated(&parts.to_sql())
        }
        Some(_) => ensure_terminated(sql),
        None if TRAILING_LIMIT.is_match(strip_terminator(sql)) => ensure_terminated(sql),
        None => ensure_terminated(&format!("{} LIMIT {}", strip_terminator(sql), limit)),
    }
}

/// Force the LIMIT to at most `cap`, adding one when absent. An OFFSET is kept.
pub fn cap_limit(sql: &str, cap: u64) -> String {
    match SqlParts::parse(sql) {
        Some(mut parts) => {
            let current = parts.limit_value();
            if current.map_or(true, |n| n > cap) {
                let offset = parts
                    .limit
                    .as_deref()
                    .filter(|_| current.is_some())
                    .and_then(|l| l.trim().split_once(char::is_whitespace))
                    .map(|(_, rest)| rest.trim().to_string());
                parts.limit = Some(match offset {
                    Some(offset) => format!("{} {}", cap, offset),
                    None => cap.to_string(),
                });
            }
            ensure_terminated(&parts.to_sql())
        }
        None => {
            let body = strip_terminator(sql);
            match TRAILING_LIMIT.captures(body) {
                Some(cap_match) => {
                    let current: u64 = cap_match[1].parse().unwrap_or(u64::MAX);
                    if current <= cap {
                        return ensure_terminated(body);
                    }
                    let start = cap_match.get(0).map(|m| m.start()).unwrap_or(body.len());
                    let offset = cap_match.get(2).map_or("", |m| m.as_str());
                    ensure_terminated(&format!("{}LIMIT {}{}", &body[..start], cap, offset))
                }
                None => ensure_terminated(&format!("{} LIMIT {}", body, cap)),
            }
        }
    }
}

/// Flatten nested sub-selects: unwrap derived tables that only wrap or filter
/// another SELECT, including those inside WHERE sub-selects. Projection,
/// grouping and ordering of the outer statement are kept. None when nothing
/// is nested or nothing can be flattened safely.
pub fn simplify(sql: &str) -> Option<String> {
    flatten(SqlParts::parse(sql)?).map(|parts| ensure_terminated(&parts.to_sql()))
}

fn flatten(mut parts: SqlParts) -> Option<SqlParts> {
    let mut changed = false;
    while let Some(unwrapped) = unwrap_derived(&parts) {
        parts = unwrapped;
        changed = true;
    }
    if let Some(flat) = parts.where_clause.as_deref().and_then(flatten_subselects) {
        parts.where_clause = Some(flat);
        changed = true;
    }
    changed.then_some(parts)
}

/// Rewrite every parenthesised sub-select of `text` that flattens
fn flatten_subselects(text: &str) -> Option<String> {
    let mask = top_level_mask(text);
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (i, c) in text.char_indices() {
        if c != '(' || !mask[i] {
            continue;
        }
        let Some(close) = matching_paren(text, i) else {
            break;
        };
        if let Some(flat) = SqlParts::parse(&text[i + 1..close]).and_then(flatten) {
            out.push_str(&text[last..=i]);
            out.push_str(&flat.to_sql());
            last = close;
        }
    }
    if last == 0 {
        return None;
    }
    out.push_str(&text[last..]);
    Some(out)
}

/// Byte offset of the `)` closing the `(` at `open`
fn matching_paren(sql: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in sql[open..].char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// One level of `FROM (SELECT ...) alias`, merged into the outer statement
fn unwrap_derived(outer: &SqlParts) -> Option<SqlParts> {
    let from = outer.from.trim();
    if !from.starts_with('(') {
        return None;
    }
    let close = matching_paren(from, 0)?;
    let outer_alias = DERIVED_ALIAS.captures(from[close + 1..].trim())?.get(1).map(|m| m.as_str().to_string());
    let mut inner = SqlParts::parse(&from[1..close])?;

    // Bare wrapper: the inner statement is the whole answer
    let wraps_only = outer.select.trim() == "*"
        && outer.where_clause.is_none()
        && outer.group_by.is_none()
        && outer.having.is_none()
        && outer.order_by.is_none();
    if wraps_only && (outer.limit.is_none() || inner.limit.is_none()) {
        inner.limit = inner.limit.or_else(|| outer.limit.clone());
        return Some(inner);
    }

    // Filtering inner select over one table with plain columns
    let plain_projection = inner.select.trim() == "*"
        || split_top_level(&inner.select, ',').iter().all(|item| PLAIN_COLUMN.is_match(item));
    if !plain_projection
        || inner.has_aggregates()
        || inner.has_joins()
        || inner.order_by.is_some()
        || inner.limit.is_some()
    {
        return None;
    }
    let tables = inner.tables();
    let [table] = tables.as_slice() else {
        return None;
    };
    let from = match (&outer_alias, &table.alias) {
        (Some(alias), None) => {
            let qualified = format!("{}.", table.name.to_lowercase());
            if inner.to_sql().to_lowercase().contains(&qualified) {
                return None;
            }
            format!("{} {}", table.name, alias)
        }
        (Some(alias), Some(own)) if !alias.eq_ignore_ascii_case(own) => return None,
        _ => inner.from.clone(),
    };

    let mut merged = outer.clone();
    merged.from = from;
    if merged.select.trim() == "*" {
        merged.select = inner.select.clone();
    }
    merged.where_clause = match (inner.where_clause.as_deref(), outer.where_clause.as_deref()) {
        (Some(a), Some(b)) => Some(format!("{} AND {}", grouped(a), grouped(b))),
        (Some(a), None) => Some(a.to_string()),
        (None, b) => b.map(|b| b.to_string()),
    };
    Some(merged)
}

/// Parenthesise a condition with a top-level OR before joining it with AND
fn grouped(condition: &str) -> String {
    if top_level(&OR, condition).is_empty() {
        condition.to_string()
    } else {
        format!("({})", condition)
    }
}

/// Keep only the first table of the FROM clause. Conditions, groupings and
/// projections that reference dropped tables go with them.
pub fn strip_joins(sql: &str) -> Option<String> {
    let mut parts = SqlParts::parse(sql)?;
    if !parts.has_joins() {
        return None;
    }
    let tables = parts.tables();
    let kept = tables.first()?.clone();
    let dropped: Vec<String> = tables
        .iter()
        .skip(1)
        .map(|t| format!("{}.", t.qualifier().to_lowercase()))
        .collect();
    let mentions_dropped = |text: &str| {
        let lower = text.to_lowercase();
        dropped.iter().any(|q| lower.contains(q.as_str()))
    };

    parts.from = match &kept.alias {
        Some(alias) => format!("{} {}", kept.name, alias),
        None => kept.name.clone(),
    };
    if let Some(where_clause) = &parts.where_clause {
        let mut last = 0;
        let mut conjuncts = Vec::new();
        for m in top_level(&AND, where_clause) {
            conjuncts.push(where_clause[last..m.start()].trim().to_string());
            last = m.end();
        }
        conjuncts.push(where_clause[last..].trim().to_string());
        let kept_conjuncts: Vec<String> = conjuncts.into_iter().filter(|c| !mentions_dropped(c)).collect();
        parts.where_clause = (!kept_conjuncts.is_empty()).then(|| kept_conjuncts.join(" AND "));
    }
    if mentions_dropped(&parts.select) {
        parts.select = "*".to_string();
        parts.group_by = None;
        parts.having = None;
    }
    if parts.group_by.as_deref().map_or(false, |g| mentions_dropped(g)) {
        parts.group_by = None;
        parts.having = None;
        if parts.has_aggregates() {
            parts.select = "*".to_string();
        }
    }
    if parts.order_by.as_deref().map_or(false, |o| mentions_dropped(o)) {
        parts.order_by = None;
    }
    Some(ensure_terminated(&parts.to_sql()))
}
