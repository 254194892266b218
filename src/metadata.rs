//! Semantic Model
//!
//! Read-only description of the relational schema produced by the upstream
//! metadata pipeline: tables, columns, declared relationships and a domain label.

use crate::error::{NlqError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Primitive value for open-ended, string-keyed metadata maps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Primitive {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Primitive {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Primitive::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for Primitive {
    fn from(s: &str) -> Self {
        Primitive::Text(s.to_string())
    }
}

impl From<String> for Primitive {
    fn from(s: String) -> Self {
        Primitive::Text(s)
    }
}

impl From<f64> for Primitive {
    fn from(v: f64) -> Self {
        Primitive::Float(v)
    }
}

/// Declared string-keyed map of primitives
pub type Attributes = BTreeMap<String, Primitive>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableInfo {
    pub name: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub table: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub comment: Option<String>,
}

impl ColumnInfo {
    pub fn is_numeric(&self) -> bool {
        let t = self.data_type.to_lowercase();
        ["int", "real", "float", "double", "decimal", "numeric", "number", "money"]
            .iter()
            .any(|k| t.contains(k))
    }

    pub fn is_temporal(&self) -> bool {
        let t = self.data_type.to_lowercase();
        let n = self.name.to_lowercase();
        t.contains("date") || t.contains("time") || n.ends_with("_at") || n.ends_with("_date") || n == "date"
    }

    /// Surrogate or foreign key columns are never picked as measures
    pub fn is_key(&self) -> bool {
        let n = self.name.to_lowercase();
        n == "id" || n.ends_with("_id")
    }
}

/// Declared foreign-key relationship
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SemanticModel {
    #[serde(default)]
    pub tables: Vec<TableInfo>,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub domain: Option<String>,
}

impl SemanticModel {
    /// Load a semantic model from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| NlqError::Metadata(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| NlqError::Metadata(format!("Failed to parse semantic model JSON: {}", e)))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        let name = strip_schema(name);
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn columns_of<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ColumnInfo> + 'a {
        let table = strip_schema(table);
        self.columns.iter().filter(move |c| c.table.eq_ignore_ascii_case(table))
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnInfo> {
        let table = strip_schema(table);
        self.columns
            .iter()
            .find(|c| c.table.eq_ignore_ascii_case(table) && c.name.eq_ignore_ascii_case(column))
    }

    /// Tables owning a column with this name
    pub fn tables_with_column(&self, column: &str) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.name.eq_ignore_ascii_case(column))
            .map(|c| c.table.as_str())
            .collect()
    }

    /// Declared relationship between two tables, in either direction
    pub fn relationship_between(&self, a: &str, b: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| {
            (r.from_table.eq_ignore_ascii_case(a) && r.to_table.eq_ignore_ascii_case(b))
                || (r.from_table.eq_ignore_ascii_case(b) && r.to_table.eq_ignore_ascii_case(a))
        })
    }

    /// Relationships touching a table
    pub fn relationships_of<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Relationship> + 'a {
        self.relationships.iter().filter(move |r| {
            r.from_table.eq_ignore_ascii_case(table) || r.to_table.eq_ignore_ascii_case(table)
        })
    }

    pub fn date_columns<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ColumnInfo> + 'a {
        self.columns_of(table).filter(|c| c.is_temporal())
    }

    pub fn numeric_columns<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ColumnInfo> + 'a {
        self.columns_of(table).filter(|c| c.is_numeric() && !c.is_key())
    }

    pub fn domain_label(&self) -> &str {
        self.domain.as_deref().unwrap_or("general")
    }
}

/// `schema.table` -> `table`
pub fn strip_schema(name: &str) -> &str {
    let name = name.trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']');
    name.rsplit('.').next().unwrap_or(name)
}
