//! Execution Result - outcome of running one statement, and the record of
//! each fallback attempt made on the way.

use crate::execution::engine::{Row, RowSet};
use crate::execution::fallback::FallbackStrategy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub data: Vec<Row>,
    pub column_names: Vec<String>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub sql_executed: String,
    pub error_message: Option<String>,
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    /// Create a successful result
    pub fn success(rows: RowSet, sql: &str, execution_time_ms: u64) -> Self {
        let mut warnings = Vec::new();
        if rows.truncated {
            warnings.push(format!("Result truncated to {} rows", rows.rows.len()));
        }
        Self {
            success: true,
            row_count: rows.rows.len(),
            data: rows.rows,
            column_names: rows.columns,
            execution_time_ms,
            sql_executed: sql.to_string(),
            error_message: None,
            warnings,
        }
    }

    /// Create an error result
    pub fn failure(sql: &str, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            data: Vec::new(),
            column_names: Vec::new(),
            row_count: 0,
            execution_time_ms,
            sql_executed: sql.to_string(),
            error_message: Some(error.into()),
            warnings: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }
}

/// One step of the fallback cascade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackAttempt {
    /// 1-based, the primary attempt included
    pub attempt_number: usize,
    pub strategy: FallbackStrategy,
    pub sql_attempted: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
}

impl FallbackAttempt {
    pub fn from_result(attempt_number: usize, strategy: FallbackStrategy, result: &ExecutionResult) -> Self {
        Self {
            attempt_number,
            strategy,
            sql_attempted: result.sql_executed.clone(),
            success: result.success,
            error_message: result.error_message.clone(),
            execution_time_ms: result.execution_time_ms,
        }
    }
}
