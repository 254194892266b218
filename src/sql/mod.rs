//! SQL
//!
//! Generation from plans or completions, clause-level rewrites, validation
//! against the semantic model, and domain business rules.

pub mod business_rules;
pub mod generator;
pub mod rewrite;
pub mod validation;

pub use generator::{SqlGenerationResult, SqlGenerator};
pub use validation::{validate_sql, ValidationReport};
