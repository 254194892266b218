//! SQL Executor
//!
//! Runs a generated statement against the relational engine, walking the
//! configured fallback cascade after a failed primary attempt:
//!
//! START -> PRIMARY -> (SUCCESS | FALLBACK_1 -> ... -> FALLBACK_N -> EXHAUSTED)
//!
//! Strategies run strictly one after another. Every attempt is timed and
//! recorded; the call always ends in a structured `ExecutionResult`.

use crate::config::ExecutionSettings;
use crate::error::{NlqError, Result};
use crate::execution::engine::RelationalEngine;
use crate::execution::error_classifier::ErrorClassifier;
use crate::execution::fallback::{self, FallbackContext, FallbackStrategy};
use crate::execution::optimizer::{optimize_sql, OptimizationResult};
use crate::execution::result::{ExecutionResult, FallbackAttempt};
use crate::history::{ExecutionHistory, ExecutionHistoryRecord, ExecutionInsights};
use crate::metadata::SemanticModel;
use crate::sql::generator::SqlGenerationResult;
use crate::sql::rewrite;
use crate::sql::validation::{is_read_only, validate_sql, ValidationReport, READ_ONLY_MESSAGE};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Error text used when an empty result set is treated as a soft failure
const EMPTY_RESULT: &str = "query returned no rows";

pub struct SqlExecutor {
    engine: Arc<dyn RelationalEngine>,
    settings: ExecutionSettings,
    steps: Vec<(FallbackStrategy, Option<Regex>)>,
    classifier: ErrorClassifier,
    history: Arc<ExecutionHistory>,
}

impl SqlExecutor {
    /// Fails only on an invalid cascade pattern
    pub fn new(
        engine: Arc<dyn RelationalEngine>,
        settings: ExecutionSettings,
        history: Arc<ExecutionHistory>,
    ) -> Result<Self> {
        let steps = settings
            .cascade
            .iter()
            .map(|step| -> Result<(FallbackStrategy, Option<Regex>)> { Ok((step.strategy, step.compiled_pattern()?)) })
            .collect::<Result<Vec<_>>>()?;
        info!(
            "SQL executor on {} with cascade [{}]",
            engine.name(),
            steps.iter().map(|(s, _)| s.name()).collect::<Vec<_>>().join(", ")
        );
        Ok(Self {
            engine,
            settings,
            steps,
            classifier: ErrorClassifier::new(),
            history,
        })
    }

    pub fn history(&self) -> &Arc<ExecutionHistory> {
        &self.history
    }

    fn accepted(&self, result: &ExecutionResult) -> bool {
        result.success && !(self.settings.continue_on_empty && result.is_empty())
    }

    /// One timed attempt, never an error
    async fn attempt(&self, sql: &str) -> ExecutionResult {
        let started = Instant::now();
        let outcome = self
            .engine
            .execute(sql, self.settings.timeout(), self.settings.max_rows)
            .await;
        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(rows) => ExecutionResult::success(rows, sql, elapsed),
            Err(e) => ExecutionResult::failure(sql, engine_message(&e), elapsed),
        }
    }

    /// Primary attempt plus the fallback cascade. Attempts are numbered from 1;
    /// strategies that don't apply or would repeat an earlier statement are
    /// skipped without a record.
    pub async fn execute_with_fallbacks(
        &self,
        generation: &SqlGenerationResult,
        question: &str,
        model: Option<&SemanticModel>,
    ) -> (ExecutionResult, Vec<FallbackAttempt>) {
        let started = Instant::now();
        let primary_sql = rewrite::ensure_terminated(&generation.sql);
        let mut attempts: Vec<FallbackAttempt> = Vec::new();

        if !is_read_only(&primary_sql) {
            warn!("Refusing to execute a non read-only statement");
            let result = ExecutionResult::failure(&primary_sql, READ_ONLY_MESSAGE, 0);
            attempts.push(FallbackAttempt::from_result(1, FallbackStrategy::Primary, &result));
            self.record(question, generation.confidence_score, &result);
            return (result, attempts);
        }

        let primary = self.attempt(&primary_sql).await;
        attempts.push(FallbackAttempt::from_result(1, FallbackStrategy::Primary, &primary));
        if self.accepted(&primary) {
            info!("✅ Primary attempt succeeded with {} rows", primary.row_count);
            let result = finish(primary, started);
            self.record(question, generation.confidence_score, &result);
            return (result, attempts);
        }

        let primary_error = primary.error_message.clone().unwrap_or_else(|| EMPTY_RESULT.to_string());
        warn!("Primary attempt failed: {}", primary_error);
        let error_class = self.classifier.classify(&primary_error);
        debug!("Primary error classified as {}", error_class);

        let mut tried: HashSet<String> = HashSet::from([statement_key(&primary_sql)]);
        let mut first_empty = primary.success.then(|| primary.clone());
        let mut last = primary;
        let mut last_error = primary_error.clone();

        for (strategy, pattern) in &self.steps {
            if let Some(pattern) = pattern {
                if !pattern.is_match(&last_error) {
                    debug!("Skipping {}: pattern does not match last error", strategy);
                    continue;
                }
            }
            let ctx = FallbackContext {
                original_sql: &primary_sql,
                last_error: &last_error,
                error_class: &error_class,
                plan: &generation.plan,
                model,
                settings: &self.settings,
            };
            let Some(candidate) = fallback::rewrite(*strategy, &ctx) else {
                debug!("Skipping {}: not applicable", strategy);
                continue;
            };
            if !is_read_only(&candidate) || !tried.insert(statement_key(&candidate)) {
                debug!("Skipping {}: statement already attempted", strategy);
                continue;
            }

            let result = self.attempt(&candidate).await;
            let attempt_number = attempts.len() + 1;
            attempts.push(FallbackAttempt::from_result(attempt_number, *strategy, &result));

            if self.accepted(&result) {
                info!("✅ Fallback {} succeeded on attempt {}", strategy, attempt_number);
                let mut result = finish(result, started);
                result.warnings.push(format!(
                    "Primary SQL failed ({}); recovered with fallback strategy {}",
                    primary_error, strategy
                ));
                self.record(question, generation.confidence_score, &result);
                return (result, attempts);
            }

            match &result.error_message {
                Some(error) => {
                    warn!("Fallback {} failed: {}", strategy, error);
                    last_error = error.clone();
                }
                None => {
                    debug!("Fallback {} returned no rows", strategy);
                    if first_empty.is_none() {
                        first_empty = Some(result.clone());
                    }
                    last_error = EMPTY_RESULT.to_string();
                }
            }
            last = result;
        }

        let result = match first_empty {
            Some(empty) => {
                info!("Cascade exhausted, returning the first empty result");
                let mut result = finish(empty, started);
                result.warnings.push("No strategy returned rows".to_string());
                result
            }
            None => {
                warn!("All {} attempts failed, last error: {}", attempts.len(), last_error);
                let mut result = finish(ExecutionResult::failure(&last.sql_executed, last_error, 0), started);
                result.warnings.push(format!("All {} attempts failed", attempts.len()));
                result
            }
        };
        self.record(question, generation.confidence_score, &result);
        (result, attempts)
    }

    /// Run pre-validated SQL once, without the cascade
    pub async fn execute_directly(&self, sql: &str) -> ExecutionResult {
        let sql = rewrite::ensure_terminated(sql);
        if !is_read_only(&sql) {
            return ExecutionResult::failure(&sql, READ_ONLY_MESSAGE, 0);
        }
        self.attempt(&sql).await
    }

    pub fn validate(&self, sql: &str, model: &SemanticModel) -> ValidationReport {
        validate_sql(sql, model)
    }

    pub fn optimize(&self, sql: &str, model: &SemanticModel) -> OptimizationResult {
        optimize_sql(sql, model, self.settings.default_limit as u64)
    }

    /// Engine's native plan, verbatim
    pub async fn explain(&self, sql: &str) -> Result<String> {
        if !is_read_only(sql) {
            return Err(NlqError::Validation(READ_ONLY_MESSAGE.to_string()));
        }
        self.engine.explain(sql).await
    }

    pub fn record_feedback(
        &self,
        question: &str,
        sql: &str,
        confidence: f64,
        success: bool,
        execution_time_ms: u64,
        error: Option<String>,
    ) {
        self.history.append(ExecutionHistoryRecord::new(
            question,
            sql,
            confidence,
            success,
            execution_time_ms,
            error,
        ));
    }

    pub fn get_insights(&self) -> ExecutionInsights {
        self.history.insights()
    }

    fn record(&self, question: &str, confidence: f64, result: &ExecutionResult) {
        self.record_feedback(
            question,
            &result.sql_executed,
            confidence,
            result.success,
            result.execution_time_ms,
            result.error_message.clone(),
        );
    }
}

/// Engine error text without the crate's error prefix
fn engine_message(error: &NlqError) -> String {
    match error {
        NlqError::Execution(message) | NlqError::Timeout(message) => message.clone(),
        other => other.to_string(),
    }
}

fn statement_key(sql: &str) -> String {
    rewrite::strip_terminator(&rewrite::normalize_whitespace(sql)).to_lowercase()
}

/// Report the whole call's wall time
fn finish(mut result: ExecutionResult, started: Instant) -> ExecutionResult {
    result.execution_time_ms = started.elapsed().as_millis() as u64;
    result
}
