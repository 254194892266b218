use nlq_engine::config::ExecutionSettings;
use nlq_engine::execution::{CascadeStep, FallbackStrategy, SqlExecutor, SqliteEngine};
use nlq_engine::history::ExecutionHistory;
use nlq_engine::metadata::SemanticModel;
use nlq_engine::planner::QueryPlan;
use nlq_engine::sql::generator::SqlGenerationResult;
use std::sync::Arc;

const SHOP: &str = "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT, country TEXT);
    CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER REFERENCES customers(id), amount REAL, status TEXT);
    INSERT INTO customers (name, country) VALUES ('Li', 'China'), ('Ana', 'Spain'), ('Wei', 'China');
    INSERT INTO orders (customer_id, amount, status) VALUES (1, 10.5, 'paid'), (3, 99.0, 'open'), (2, 5.0, 'paid');";

fn shop(settings: ExecutionSettings) -> (SqlExecutor, SemanticModel) {
    let engine = SqliteEngine::open_in_memory().unwrap();
    engine.execute_batch(SHOP).unwrap();
    let model = engine.introspect(None).unwrap();
    let executor = SqlExecutor::new(Arc::new(engine), settings, Arc::new(ExecutionHistory::new(50))).unwrap();
    (executor, model)
}

fn only(strategies: &[FallbackStrategy]) -> ExecutionSettings {
    ExecutionSettings {
        cascade: strategies.iter().copied().map(CascadeStep::always).collect(),
        ..ExecutionSettings::default()
    }
}

fn generation(sql: &str) -> SqlGenerationResult {
    SqlGenerationResult::from_sql(sql, QueryPlan::default())
}

#[tokio::test]
async fn test_broken_join_falls_back_to_primary_table() {
    let (executor, model) = shop(ExecutionSettings::default());
    let sql = "SELECT c.name, o.amount FROM customers c JOIN orderz o ON o.customer_id = c.id \
               WHERE c.country = 'China' LIMIT 100;";

    let (result, attempts) = executor.execute_with_fallbacks(&generation(sql), "china orders", Some(&model)).await;
    assert!(result.success);
    assert_eq!(result.row_count, 2);
    assert_eq!(result.sql_executed, "SELECT * FROM customers c WHERE c.country = 'China' LIMIT 100;");
    let strategies: Vec<FallbackStrategy> = attempts.iter().map(|a| a.strategy).collect();
    assert_eq!(
        strategies,
        vec![FallbackStrategy::Primary, FallbackStrategy::RemoveJoins]
    );
}

#[tokio::test]
async fn test_simplify_never_turns_aggregate_into_row_dump() {
    let (executor, model) = shop(only(&[FallbackStrategy::Simplify]));

    let (result, attempts) = executor
        .execute_with_fallbacks(
            &generation("SELECT status, COUNT(*) FROM orderz GROUP BY status LIMIT 100;"),
            "orders per status",
            Some(&model),
        )
        .await;
    assert!(!result.success);
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].strategy, FallbackStrategy::Primary);
}

#[tokio::test]
async fn test_column_typo_corrected_from_engine_error() {
    let (executor, model) = shop(only(&[FallbackStrategy::SyntaxCorrection]));

    let (result, attempts) = executor
        .execute_with_fallbacks(&generation("SELECT nme FROM customers LIMIT 5;"), "names", Some(&model))
        .await;
    assert!(result.success);
    assert_eq!(result.sql_executed, "SELECT name FROM customers LIMIT 5;");
    assert_eq!(result.column_names, vec!["name"]);
    assert_eq!(attempts.len(), 2);
}

#[tokio::test]
async fn test_keyword_typo_corrected() {
    let (executor, model) = shop(only(&[FallbackStrategy::SyntaxCorrection]));

    let (result, _) = executor
        .execute_with_fallbacks(&generation("SELECT name FORM customers LIMIT 5;"), "names", Some(&model))
        .await;
    assert!(result.success);
    assert_eq!(result.sql_executed, "SELECT name FROM customers LIMIT 5;");
    assert_eq!(result.row_count, 3);
}

#[tokio::test]
async fn test_empty_result_is_success_by_default() {
    let (executor, model) = shop(ExecutionSettings::default());

    let (result, attempts) = executor
        .execute_with_fallbacks(
            &generation("SELECT * FROM customers WHERE country = 'Mars' LIMIT 100;"),
            "martians",
            Some(&model),
        )
        .await;
    assert!(result.success);
    assert!(result.is_empty());
    assert_eq!(attempts.len(), 1);
}

#[tokio::test]
async fn test_exhausted_cascade_keeps_full_trail() {
    let (executor, model) = shop(ExecutionSettings::default());

    let (result, attempts) = executor
        .execute_with_fallbacks(&generation("SELECT * FROM invoices LIMIT 1000;"), "invoices", Some(&model))
        .await;
    assert!(!result.success);
    assert!(result.error_message.as_deref().unwrap_or_default().contains("no such table: invoices"));
    assert!(attempts.iter().all(|a| !a.success));
    assert_eq!(attempts[0].strategy, FallbackStrategy::Primary);
    assert_eq!(executor.get_insights().total_executions, 1);
}
