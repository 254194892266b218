//! Relational Engine Trait
//!
//! Minimal contract for the database the executor runs statements against.
//! Implementations must be safe to share across tasks.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One result row keyed by column name, in column order
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Rows returned by an engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    /// Column names in statement order
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// More rows were available than the cap allowed
    pub truncated: bool,
}

#[async_trait]
pub trait RelationalEngine: Send + Sync {
    /// Engine name (e.g., "sqlite")
    fn name(&self) -> &'static str;

    /// Run one statement. Must give up with `NlqError::Timeout` once `timeout`
    /// elapses and return at most `row_cap` rows.
    async fn execute(&self, sql: &str, timeout: Duration, row_cap: usize) -> Result<RowSet>;

    /// Engine query plan for a statement, human readable
    async fn explain(&self, sql: &str) -> Result<String>;
}
