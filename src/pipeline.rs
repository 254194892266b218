//! NL -> SQL Pipeline
//!
//! One pipeline per database/session, built from explicitly injected
//! collaborators (relational engine, vector search, optional completion
//! service). Stages run strictly in order for one question:
//! context -> match -> plan -> generate -> execute.
//! Each stage is also callable on its own for partial results.

use crate::config::EngineConfig;
use crate::context::{ContextExtractor, QueryContext};
use crate::error::Result;
use crate::execution::engine::RelationalEngine;
use crate::execution::executor::SqlExecutor;
use crate::execution::optimizer::OptimizationResult;
use crate::execution::result::{ExecutionResult, FallbackAttempt};
use crate::history::{ExecutionHistory, ExecutionInsights};
use crate::llm::TextCompletion;
use crate::matcher::{MetadataMatch, MetadataMatcher};
use crate::metadata::SemanticModel;
use crate::planner::{PlanBuilder, QueryPlan};
use crate::schema_rag::VectorSearch;
use crate::sql::generator::{SqlGenerationResult, SqlGenerator};
use crate::sql::validation::{validate_sql, ValidationReport};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Everything produced while answering one question
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub context: QueryContext,
    pub matches: Vec<MetadataMatch>,
    pub generation: SqlGenerationResult,
    pub result: ExecutionResult,
    pub attempts: Vec<FallbackAttempt>,
}

pub struct NlqPipeline {
    config: EngineConfig,
    extractor: ContextExtractor,
    matcher: MetadataMatcher,
    planner: PlanBuilder,
    generator: SqlGenerator,
    executor: SqlExecutor,
}

impl NlqPipeline {
    /// Without a completion service every statement comes from templates
    pub fn new(
        config: EngineConfig,
        engine: Arc<dyn RelationalEngine>,
        vector_search: Arc<dyn VectorSearch>,
        completion: Option<Arc<dyn TextCompletion>>,
    ) -> Result<Self> {
        let history = Arc::new(ExecutionHistory::new(config.history_capacity));
        Self::with_history(config, engine, vector_search, completion, history)
    }

    /// Share one history between pipelines
    pub fn with_history(
        config: EngineConfig,
        engine: Arc<dyn RelationalEngine>,
        vector_search: Arc<dyn VectorSearch>,
        completion: Option<Arc<dyn TextCompletion>>,
        history: Arc<ExecutionHistory>,
    ) -> Result<Self> {
        if completion.is_none() {
            info!("No completion service configured, using template generation only");
        }
        Ok(Self {
            extractor: ContextExtractor::new(config.confidence.clone()),
            matcher: MetadataMatcher::new(vector_search, config.matcher.clone()),
            planner: PlanBuilder::new(config.confidence.clone()),
            generator: SqlGenerator::new(completion, config.clone()),
            executor: SqlExecutor::new(engine, config.execution.clone(), history)?,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn history(&self) -> &Arc<ExecutionHistory> {
        self.executor.history()
    }

    pub fn extract_context(&self, question: &str) -> QueryContext {
        self.extractor.extract(question)
    }

    pub async fn match_metadata(
        &self,
        question: &str,
        context: &QueryContext,
        model: &SemanticModel,
    ) -> Vec<MetadataMatch> {
        self.matcher.match_metadata(question, context, model).await
    }

    pub fn build_plan(&self, context: &QueryContext, matches: &[MetadataMatch], model: &SemanticModel) -> QueryPlan {
        self.planner.build(context, matches, model)
    }

    pub async fn generate_sql(
        &self,
        context: &QueryContext,
        matches: &[MetadataMatch],
        model: &SemanticModel,
        question: &str,
    ) -> SqlGenerationResult {
        self.generator.generate(context, matches, model, question).await
    }

    pub async fn execute_with_fallbacks(
        &self,
        generation: &SqlGenerationResult,
        question: &str,
        model: &SemanticModel,
    ) -> (ExecutionResult, Vec<FallbackAttempt>) {
        self.executor.execute_with_fallbacks(generation, question, Some(model)).await
    }

    pub fn validate_sql(&self, sql: &str, model: &SemanticModel) -> ValidationReport {
        validate_sql(sql, model)
    }

    pub fn optimize_query(&self, sql: &str, model: &SemanticModel) -> OptimizationResult {
        self.executor.optimize(sql, model)
    }

    pub async fn explain_query(&self, sql: &str) -> Result<String> {
        self.executor.explain(sql).await
    }

    pub fn enhance_with_business_rules(&self, sql: &str, domain: &str) -> String {
        self.generator.enhance_with_business_rules(sql, domain)
    }

    pub fn get_insights(&self) -> ExecutionInsights {
        self.executor.get_insights()
    }

    /// Run every stage and keep the intermediate results
    pub async fn answer_detailed(&self, question: &str, model: &SemanticModel) -> PipelineOutcome {
        let context = self.extract_context(question);
        if context.is_degraded() {
            info!("Low-confidence context ({:.2}) for: {}", context.confidence, question);
        }
        let matches = self.match_metadata(question, &context, model).await;
        let plan = self.build_plan(&context, &matches, model);
        let generation = self.generator.generate_from_plan(plan, &context, model, question).await;
        info!(
            "Generated SQL via {:?} (confidence {:.2}): {}",
            generation.path, generation.confidence_score, generation.sql
        );
        let (result, attempts) = self.execute_with_fallbacks(&generation, question, model).await;
        PipelineOutcome {
            context,
            matches,
            generation,
            result,
            attempts,
        }
    }

    pub async fn answer(&self, question: &str, model: &SemanticModel) -> ExecutionResult {
        self.answer_detailed(question, model).await.result
    }

    /// Answer independent questions concurrently, results in input order
    pub async fn answer_batch(self: Arc<Self>, questions: Vec<String>, model: Arc<SemanticModel>) -> Vec<ExecutionResult> {
        let never = Arc::new(AtomicBool::new(false));
        self.answer_batch_with_cancel(questions, model, never)
            .await
            .into_iter()
            .map(|r| r.unwrap_or_else(|| ExecutionResult::failure("", "question was not scheduled", 0)))
            .collect()
    }

    /// Like `answer_batch`; once `cancel` is set no further questions are
    /// scheduled and their slots stay `None`. Running questions finish.
    pub async fn answer_batch_with_cancel(
        self: Arc<Self>,
        questions: Vec<String>,
        model: Arc<SemanticModel>,
        cancel: Arc<AtomicBool>,
    ) -> Vec<Option<ExecutionResult>> {
        let total = questions.len();
        let semaphore = Arc::new(Semaphore::new(self.config.batch_concurrency.max(1)));
        let mut handles = Vec::with_capacity(total);

        for (idx, question) in questions.into_iter().enumerate() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if cancel.load(Ordering::SeqCst) {
                info!("Batch cancelled after scheduling {} of {} questions", idx, total);
                break;
            }
            let pipeline = Arc::clone(&self);
            let model = Arc::clone(&model);
            handles.push((
                idx,
                tokio::spawn(async move {
                    let _permit = permit;
                    pipeline.answer(&question, &model).await
                }),
            ));
        }

        let mut results: Vec<Option<ExecutionResult>> = vec![None; total];
        for (idx, handle) in handles {
            results[idx] = Some(match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Batch question {} panicked: {}", idx, e);
                    ExecutionResult::failure("", format!("question task failed: {}", e), 0)
                }
            });
        }
        results
    }
}
