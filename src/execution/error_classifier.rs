//! Error Classifier
//!
//! Classifies engine error messages into a taxonomy the fallback cascade can
//! act on. Understands SQLite, PostgreSQL and MySQL phrasings.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL error classification taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlErrorClass {
    TableNotFound(String),
    ColumnNotFound(String),
    AmbiguousColumn(String),
    /// Token the parser choked on, when reported
    SyntaxError(Option<String>),
    InvalidAggregation,
    Timeout,
    Other(String),
}

impl fmt::Display for SqlErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlErrorClass::TableNotFound(name) => write!(f, "TableNotFound({})", name),
            SqlErrorClass::ColumnNotFound(name) => write!(f, "ColumnNotFound({})", name),
            SqlErrorClass::AmbiguousColumn(name) => write!(f, "AmbiguousColumn({})", name),
            SqlErrorClass::SyntaxError(Some(near)) => write!(f, "SyntaxError(near {})", near),
            SqlErrorClass::SyntaxError(None) => write!(f, "SyntaxError"),
            SqlErrorClass::InvalidAggregation => write!(f, "InvalidAggregation"),
            SqlErrorClass::Timeout => write!(f, "Timeout"),
            SqlErrorClass::Other(msg) => write!(f, "Other({})", msg),
        }
    }
}

impl SqlErrorClass {
    /// Identifier-level problems a name correction can fix
    pub fn is_identifier_error(&self) -> bool {
        matches!(
            self,
            SqlErrorClass::TableNotFound(_) | SqlErrorClass::ColumnNotFound(_) | SqlErrorClass::AmbiguousColumn(_)
        )
    }
}

lazy_static! {
    static ref TABLE_NOT_FOUND: Vec<Regex> = vec![
        Regex::new(r"(?i)no such table:\s*([\w.]+)").unwrap(),
        Regex::new(r#"(?i)relation "([^"]+)" does not exist"#).unwrap(),
        Regex::new(r"(?i)table '([^']+)' doesn't exist").unwrap(),
        Regex::new(r"(?i)table '?([\w.]+)'? (?:not found|does not exist)").unwrap(),
    ];
    static ref COLUMN_NOT_FOUND: Vec<Regex> = vec![
        Regex::new(r"(?i)no such column:\s*([\w.]+)").unwrap(),
        Regex::new(r#"(?i)column "([^"]+)" does not exist"#).unwrap(),
        Regex::new(r"(?i)column ([\w.]+) does not exist").unwrap(),
        Regex::new(r"(?i)unknown column '([^']+)'").unwrap(),
        Regex::new(r"(?i)column '?([\w.]+)'? not found").unwrap(),
    ];
    static ref AMBIGUOUS: Vec<Regex> = vec![
        Regex::new(r"(?i)ambiguous column name:\s*([\w.]+)").unwrap(),
        Regex::new(r#"(?i)column reference "([^"]+)" is ambiguous"#).unwrap(),
        Regex::new(r"(?i)column '([^']+)' in [\w ]+ is ambiguous").unwrap(),
    ];
    static ref SYNTAX_NEAR: Vec<Regex> = vec![
        Regex::new(r#"(?i)near "([^"]*)": syntax error"#).unwrap(),
        Regex::new(r#"(?i)syntax error at or near "([^"]*)""#).unwrap(),
        Regex::new(r"(?i)syntax to use near '([^']*)'").unwrap(),
    ];
}

/// Error classifier
#[derive(Debug, Default, Clone)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an error message into the taxonomy
    pub fn classify(&self, message: &str) -> SqlErrorClass {
        let lower = message.to_lowercase();

        if lower.contains("timed out") || lower.contains("timeout") || lower.contains("interrupted")
            || lower.contains("canceling statement")
        {
            return SqlErrorClass::Timeout;
        }
        if let Some(name) = first_capture(&AMBIGUOUS, message) {
            return SqlErrorClass::AmbiguousColumn(name);
        }
        if let Some(name) = first_capture(&TABLE_NOT_FOUND, message) {
            return SqlErrorClass::TableNotFound(name);
        }
        if let Some(name) = first_capture(&COLUMN_NOT_FOUND, message) {
            return SqlErrorClass::ColumnNotFound(name);
        }
        if lower.contains("misuse of aggregate")
            || lower.contains("must appear in the group by clause")
            || lower.contains("invalid use of group function")
            || lower.contains("aggregate functions are not allowed")
        {
            return SqlErrorClass::InvalidAggregation;
        }
        if let Some(near) = first_capture(&SYNTAX_NEAR, message) {
            return SqlErrorClass::SyntaxError(Some(near));
        }
        if lower.contains("syntax error") || lower.contains("error in your sql syntax") || lower.contains("incomplete input") {
            return SqlErrorClass::SyntaxError(None);
        }
        SqlErrorClass::Other(message.to_string())
    }
}

fn first_capture(patterns: &[Regex], message: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.captures(message))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_messages() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("no such table: customers_v2"),
            SqlErrorClass::TableNotFound("customers_v2".to_string())
        );
        assert_eq!(classifier.classify("no such column: c.nme"), SqlErrorClass::ColumnNotFound("c.nme".to_string()));
        assert_eq!(
            classifier.classify("ambiguous column name: id"),
            SqlErrorClass::AmbiguousColumn("id".to_string())
        );
        assert_eq!(
            classifier.classify("near \"FORM\": syntax error"),
            SqlErrorClass::SyntaxError(Some("FORM".to_string()))
        );
        assert_eq!(classifier.classify("misuse of aggregate: COUNT()"), SqlErrorClass::InvalidAggregation);
        assert_eq!(classifier.classify("interrupted"), SqlErrorClass::Timeout);
    }

    #[test]
    fn test_postgres_and_mysql_messages() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("ERROR: relation \"public.client\" does not exist"),
            SqlErrorClass::TableNotFound("public.client".to_string())
        );
        assert_eq!(
            classifier.classify("Unknown column 'nme' in 'field list'"),
            SqlErrorClass::ColumnNotFound("nme".to_string())
        );
        assert_eq!(
            classifier.classify("Table 'shop.client' doesn't exist"),
            SqlErrorClass::TableNotFound("shop.client".to_string())
        );
        assert!(matches!(classifier.classify("disk I/O error"), SqlErrorClass::Other(_)));
    }
}
