//! Execution
//!
//! Relational engine seam, the embedded SQLite engine, the executor with its
//! fallback cascade, and query optimization hints.

pub mod engine;
pub mod error_classifier;
pub mod executor;
pub mod fallback;
pub mod optimizer;
pub mod result;
pub mod sqlite_engine;

pub use engine::{RelationalEngine, Row, RowSet};
pub use executor::SqlExecutor;
pub use fallback::{CascadeStep, FallbackStrategy};
pub use result::{ExecutionResult, FallbackAttempt};
pub use sqlite_engine::SqliteEngine;
