//! SQLite Engine
//!
//! Embedded `RelationalEngine` over a single rusqlite connection. Statements
//! run on the blocking pool; a timeout interrupts the running statement.

use crate::error::{NlqError, Result};
use crate::execution::engine::{RelationalEngine, Row, RowSet};
use crate::metadata::{ColumnInfo, Relationship, SemanticModel, TableInfo};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct SqliteEngine {
    db: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteEngine {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| NlqError::Execution(format!("Failed to open database {}: {}", path.display(), e)))?;
        info!("Opened SQLite database {}", path.display());
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| NlqError::Execution(format!("Failed to open in-memory database: {}", e)))?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            db: Arc::new(Mutex::new(conn)),
            interrupt,
        }
    }

    fn lock(db: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
        db.lock()
            .map_err(|_| NlqError::Execution("SQLite connection lock poisoned".to_string()))
    }

    /// Run setup statements (schema, fixtures). Not subject to the read-only guard.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let db = Self::lock(&self.db)?;
        db.execute_batch(sql)
            .map_err(|e| NlqError::Execution(format!("Failed to execute batch: {}", e)))
    }

    /// Build a semantic model from the catalog: tables, columns, declared
    /// foreign keys and row counts.
    pub fn introspect(&self, domain: Option<String>) -> Result<SemanticModel> {
        let db = Self::lock(&self.db)?;
        let mut model = SemanticModel {
            domain,
            ..SemanticModel::default()
        };

        let names: Vec<String> = {
            let mut stmt = db.prepare(
                "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        for name in names {
            let quoted = name.replace('"', "\"\"");
            let row_count = db
                .query_row(&format!("SELECT COUNT(*) FROM \"{}\"", quoted), [], |row| row.get::<_, i64>(0))
                .ok()
                .map(|n| n.max(0) as u64);
            model.tables.push(TableInfo {
                name: name.clone(),
                comment: None,
                row_count,
            });

            let mut stmt = db.prepare(&format!("PRAGMA table_info(\"{}\")", quoted))?;
            let columns = stmt.query_map([], |row| {
                Ok(ColumnInfo {
                    table: name.clone(),
                    name: row.get(1)?,
                    data_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    comment: None,
                })
            })?;
            for column in columns {
                model.columns.push(column?);
            }

            let mut stmt = db.prepare(&format!("PRAGMA foreign_key_list(\"{}\")", quoted))?;
            let relationships = stmt.query_map([], |row| {
                Ok(Relationship {
                    from_table: name.clone(),
                    from_column: row.get(3)?,
                    to_table: row.get(2)?,
                    to_column: row.get::<_, Option<String>>(4)?.unwrap_or_else(|| "id".to_string()),
                })
            })?;
            for relationship in relationships {
                model.relationships.push(relationship?);
            }
        }

        info!(
            "Introspected {} tables, {} columns, {} relationships",
            model.tables.len(),
            model.columns.len(),
            model.relationships.len()
        );
        Ok(model)
    }
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}

fn run_query(db: &Connection, sql: &str, row_cap: usize) -> Result<RowSet> {
    let mut stmt = db
        .prepare(sql)
        .map_err(|e| NlqError::Execution(e.to_string()))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query([]).map_err(|e| NlqError::Execution(e.to_string()))?;

    let mut out = RowSet {
        columns: columns.clone(),
        ..RowSet::default()
    };
    while let Some(row) = rows.next().map_err(|e| NlqError::Execution(e.to_string()))? {
        if out.rows.len() >= row_cap {
            out.truncated = true;
            break;
        }
        let mut record = Row::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            let value = row.get_ref(idx).map_err(|e| NlqError::Execution(e.to_string()))?;
            record.insert(column.clone(), to_json(value));
        }
        out.rows.push(record);
    }
    Ok(out)
}

#[async_trait]
impl RelationalEngine for SqliteEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn execute(&self, sql: &str, timeout: Duration, row_cap: usize) -> Result<RowSet> {
        let db = Arc::clone(&self.db);
        let statement = sql.to_string();
        let task = tokio::task::spawn_blocking(move || {
            let conn = Self::lock(&db)?;
            run_query(&conn, &statement, row_cap)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => {
                let rows = joined.map_err(|e| NlqError::Execution(format!("Query task failed: {}", e)))??;
                debug!("sqlite returned {} rows (truncated: {})", rows.rows.len(), rows.truncated);
                Ok(rows)
            }
            Err(_) => {
                warn!("Query exceeded {} ms, interrupting", timeout.as_millis());
                self.interrupt.interrupt();
                Err(NlqError::Timeout(format!(
                    "Query exceeded the {} ms execution limit",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn explain(&self, sql: &str) -> Result<String> {
        let db = Arc::clone(&self.db);
        let statement = format!("EXPLAIN QUERY PLAN {}", crate::sql::rewrite::strip_terminator(sql));
        let plan = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = Self::lock(&db)?;
            let mut stmt = conn
                .prepare(&statement)
                .map_err(|e| NlqError::Execution(e.to_string()))?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(3))?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
        .map_err(|e| NlqError::Execution(format!("Explain task failed: {}", e)))??;
        Ok(plan.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SqliteEngine {
        let engine = SqliteEngine::open_in_memory().unwrap();
        engine
            .execute_batch(
                "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT, country TEXT);
                 CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER REFERENCES customers(id), amount REAL);
                 INSERT INTO customers (name, country) VALUES ('Li', 'China'), ('Ana', 'Spain'), ('Wei', 'China');
                 INSERT INTO orders (customer_id, amount) VALUES (1, 10.5), (3, 99.0);",
            )
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_execute_and_cap_rows() {
        let engine = engine();
        let rows = engine
            .execute("SELECT name FROM customers WHERE country = 'China' ORDER BY id", Duration::from_secs(5), 100)
            .await
            .unwrap();
        assert_eq!(rows.columns, vec!["name"]);
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(rows.rows[0]["name"], serde_json::json!("Li"));
        assert!(!rows.truncated);

        let capped = engine.execute("SELECT * FROM customers", Duration::from_secs(5), 1).await.unwrap();
        assert_eq!(capped.rows.len(), 1);
        assert!(capped.truncated);
    }

    #[tokio::test]
    async fn test_missing_table_error_message() {
        let err = engine()
            .execute("SELECT * FROM customers_v2", Duration::from_secs(5), 10)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no such table: customers_v2"));
    }

    #[tokio::test]
    async fn test_timeout_interrupts() {
        let sql = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT COUNT(*) FROM n";
        let err = engine().execute(sql, Duration::from_millis(50), 10).await.unwrap_err();
        assert!(matches!(err, NlqError::Timeout(_)));
    }

    #[test]
    fn test_introspect() {
        let model = engine().introspect(Some("shop".to_string())).unwrap();
        assert_eq!(model.tables.len(), 2);
        assert_eq!(model.table("customers").and_then(|t| t.row_count), Some(3));
        assert!(model.column("orders", "amount").map(|c| c.is_numeric()).unwrap_or(false));
        let rel = model.relationship_between("orders", "customers").unwrap();
        assert_eq!((rel.from_column.as_str(), rel.to_column.as_str()), ("customer_id", "id"));
    }

    #[tokio::test]
    async fn test_explain() {
        let plan = engine().explain("SELECT * FROM customers WHERE id = 1;").await.unwrap();
        assert!(plan.to_uppercase().contains("CUSTOMERS"));
    }
}
