use async_trait::async_trait;
use nlq_engine::config::EngineConfig;
use nlq_engine::error::{NlqError, Result};
use nlq_engine::execution::{FallbackStrategy, RelationalEngine, SqliteEngine};
use nlq_engine::llm::{Completion, TextCompletion};
use nlq_engine::matcher::MatchType;
use nlq_engine::metadata::SemanticModel;
use nlq_engine::pipeline::NlqPipeline;
use nlq_engine::planner::QueryPlan;
use nlq_engine::schema_rag::{InMemoryVectorStore, VectorHit, VectorSearch};
use nlq_engine::sql::generator::{GenerationPath, SqlGenerationResult, TEMPLATE_EXPLANATION};
use nlq_engine::sql::validation::validate_sql;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const CUSTOMERS: &str = "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT, country TEXT);
    INSERT INTO customers (name, country) VALUES ('Li', 'China'), ('Ana', 'Spain'), ('Wei', 'China');";

fn customers_db() -> (Arc<SqliteEngine>, SemanticModel) {
    let engine = SqliteEngine::open_in_memory().unwrap();
    engine.execute_batch(CUSTOMERS).unwrap();
    let model = engine.introspect(Some("ecommerce".to_string())).unwrap();
    (Arc::new(engine), model)
}

fn pipeline_with(
    engine: Arc<SqliteEngine>,
    model: &SemanticModel,
    completion: Option<Arc<dyn TextCompletion>>,
) -> NlqPipeline {
    let vector_store = Arc::new(InMemoryVectorStore::from_model(model));
    NlqPipeline::new(EngineConfig::default(), engine, vector_store, completion).unwrap()
}

/// Completion service that is always down
struct AlwaysFailing {
    calls: AtomicUsize,
}

#[async_trait]
impl TextCompletion for AlwaysFailing {
    async fn complete(&self, _prompt: &str, _temperature: f32, _max_tokens: u32) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(NlqError::ServiceUnavailable("completion backend unreachable".to_string()))
    }
}

/// Vector service that only recognises the whole question
struct WholeQuestionOnly {
    question: &'static str,
}

#[async_trait]
impl VectorSearch for WholeQuestionOnly {
    async fn search(&self, query: &str, _entity_type: Option<&str>, _limit: usize, min_similarity: f64) -> Result<Vec<VectorHit>> {
        if query != self.question {
            return Ok(Vec::new());
        }
        let hit = VectorHit {
            entity_name: "customers".to_string(),
            entity_type: "table".to_string(),
            similarity_score: 0.45,
            content: "table customers".to_string(),
            metadata: Default::default(),
        };
        Ok(if hit.similarity_score >= min_similarity { vec![hit] } else { Vec::new() })
    }
}

#[tokio::test]
async fn test_scenario_a_customers_from_china() {
    let (engine, model) = customers_db();
    let pipeline = pipeline_with(engine, &model, None);

    let outcome = pipeline.answer_detailed("Show customers from China", &model).await;
    let plan = &outcome.generation.plan;
    assert_eq!(plan.primary_tables, vec!["customers"]);
    assert!(plan.where_conditions.contains(&"customers.country = 'China'".to_string()));
    assert!(plan.confidence_score > 0.0);

    assert!(outcome.result.success, "{:?}", outcome.result.error_message);
    assert_eq!(outcome.result.row_count, 2);
    assert_eq!(outcome.attempts.len(), 1);
    assert!(outcome.generation.sql.ends_with("LIMIT 100;"));
}

#[tokio::test]
async fn test_scenario_b_vague_question_uses_direct_query() {
    let (engine, model) = customers_db();
    let question = "show me stuff";
    let pipeline = NlqPipeline::new(
        EngineConfig::default(),
        engine,
        Arc::new(WholeQuestionOnly { question }),
        None,
    )
    .unwrap();

    let context = pipeline.extract_context(question);
    assert!(context.entities_mentioned.is_empty());
    assert!(context.confidence < 0.5);

    let matches = pipeline.match_metadata(question, &context, &model).await;
    assert!(!matches.is_empty());
    assert!(matches.iter().any(|m| m.match_type == MatchType::DirectQuery && m.entity_name == "customers"));
}

#[tokio::test]
async fn test_scenario_c_missing_table_recovers_with_alternative() {
    let (engine, model) = customers_db();
    let pipeline = pipeline_with(engine, &model, None);

    let plan = QueryPlan {
        primary_tables: vec!["customers_v2".to_string()],
        confidence_score: 0.8,
        alternative_plans: vec![QueryPlan {
            primary_tables: vec!["customers".to_string()],
            confidence_score: 0.64,
            ..QueryPlan::default()
        }],
        ..QueryPlan::default()
    };
    let generation = SqlGenerationResult::from_sql("SELECT * FROM customers_v2 LIMIT 1000;", plan);

    let (result, attempts) = pipeline.execute_with_fallbacks(&generation, "show customers", &model).await;
    assert!(result.success);
    assert_eq!(result.row_count, 3);
    assert!(attempts.len() >= 2);
    assert!(!attempts[0].success);
    assert!(attempts[0].error_message.as_deref().unwrap_or_default().contains("no such table"));
    assert_eq!(attempts.last().map(|a| a.strategy), Some(FallbackStrategy::AlternativeTables));
    let numbers: Vec<usize> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, (1..=attempts.len()).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_scenario_d_completion_down_uses_templates() {
    let (engine, model) = customers_db();
    let completion = Arc::new(AlwaysFailing { calls: AtomicUsize::new(0) });
    let pipeline = pipeline_with(engine, &model, Some(completion.clone()));

    let question = "Show customers from China";
    let context = pipeline.extract_context(question);
    let matches = pipeline.match_metadata(question, &context, &model).await;
    let generation = pipeline.generate_sql(&context, &matches, &model, question).await;

    assert!(completion.calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(generation.path, GenerationPath::Template);
    assert_eq!(generation.explanation, TEMPLATE_EXPLANATION);
    assert!(generation.confidence_score <= 0.7);
    assert!(generation.sql.ends_with(';') && !generation.sql.ends_with(";;"));
    assert!(generation.sql.contains("LIMIT"));
    assert!(validate_sql(&generation.sql, &model).is_valid);

    let result = pipeline.answer(question, &model).await;
    assert!(result.success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_e_concurrent_history_appends() {
    let (engine, model) = customers_db();
    let pipeline = Arc::new(pipeline_with(engine, &model, None));
    let model = Arc::new(model);

    let first = {
        let pipeline = Arc::clone(&pipeline);
        let model = Arc::clone(&model);
        tokio::spawn(async move {
            for _ in 0..5 {
                pipeline.answer("Show customers from China", &model).await;
            }
        })
    };
    let second = {
        let pipeline = Arc::clone(&pipeline);
        let model = Arc::clone(&model);
        tokio::spawn(async move {
            for _ in 0..7 {
                pipeline.answer("count customers", &model).await;
            }
        })
    };
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(pipeline.history().len(), 12);
    assert_eq!(pipeline.get_insights().total_executions, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_keeps_input_order() {
    let (engine, model) = customers_db();
    let pipeline = Arc::new(pipeline_with(engine, &model, None));
    let questions = vec![
        "Show customers from China".to_string(),
        "show me stuff".to_string(),
        "list customers".to_string(),
    ];

    let results = Arc::clone(&pipeline).answer_batch(questions, Arc::new(model)).await;
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].row_count, 2);
    assert!(results.iter().all(|r| r.success));
    assert_eq!(pipeline.history().len(), 3);
}

#[tokio::test]
async fn test_cancelled_batch_schedules_nothing() {
    let (engine, model) = customers_db();
    let pipeline = Arc::new(pipeline_with(engine, &model, None));
    let cancel = Arc::new(AtomicBool::new(true));

    let results = Arc::clone(&pipeline)
        .answer_batch_with_cancel(vec!["list customers".to_string(); 3], Arc::new(model), cancel)
        .await;
    assert_eq!(results, vec![None, None, None]);
    assert!(pipeline.history().is_empty());
}

#[tokio::test]
async fn test_diagnostic_stages() {
    let (engine, model) = customers_db();
    let pipeline = pipeline_with(engine.clone(), &model, None);

    let report = pipeline.validate_sql("SELECT nme FROM customer", &model);
    assert!(!report.is_valid);
    assert_eq!(report.unknown_tables, vec!["customer"]);

    let optimized = pipeline.optimize_query("SELECT * FROM customers WHERE country = 'China'", &model);
    assert_eq!(optimized.optimized_sql, "SELECT * FROM customers WHERE country = 'China' LIMIT 100;");
    assert_eq!(optimized.index_candidates.len(), 1);

    let plan = pipeline.explain_query("SELECT * FROM customers WHERE id = 2").await.unwrap();
    assert_eq!(plan, engine.explain("SELECT * FROM customers WHERE id = 2").await.unwrap());
}
