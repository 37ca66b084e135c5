use serde_json::{json, Value};
use sqlsift::dispatch::{DataSource, QueryDispatcher, QueryExecutor, QueryRequest};
use sqlsift::error::{QueryError, Result};
use sqlsift::filter_injection::{date_range_filter_meta, equality_filter_meta, FilterValues};
use sqlsift::table_store::{Row, TableStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Test double for the real-database collaborator: records every call and
/// returns a canned row.
struct RecordingExecutor {
    calls: Mutex<Vec<(String, Vec<Value>)>>,
}

impl RecordingExecutor {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    fn last_call(&self) -> (String, Vec<Value>) {
        self.calls.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait::async_trait]
impl QueryExecutor for RecordingExecutor {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.calls
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
        Ok(vec![HashMap::from([("ok".to_string(), json!(true))])])
    }
}

/// Enable log output for debugging with RUST_LOG=debug; safe to call from
/// every test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn sales_store() -> Arc<TableStore> {
    let store = Arc::new(TableStore::new());
    store.add_table(
        "sales",
        vec![
            row(&[
                ("category", json!("A")),
                ("amount", json!(10)),
                ("sale_date", json!("2024-01-05")),
            ]),
            row(&[
                ("category", json!("A")),
                ("amount", json!(5)),
                ("sale_date", json!("2023-11-20")),
            ]),
            row(&[
                ("category", json!("B")),
                ("amount", json!(7)),
                ("sale_date", json!("2024-02-10")),
            ]),
        ],
    );
    store
}

#[tokio::test]
async fn test_in_memory_dashboard_flow() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    println!("\n🧪 In-memory dashboard flow\n");

    let store = sales_store();
    let dispatcher = QueryDispatcher::new(DataSource::InMemory(Arc::clone(&store)));

    // The agent emits an aggregate query; the dashboard applies a date-from
    // filter without touching the SQL itself.
    let request = QueryRequest {
        sql: "SELECT category, SUM(amount) AS total FROM sales GROUP BY category".to_string(),
        filter_meta: Some(date_range_filter_meta("sale_date", None)),
        filter_values: FilterValues::from([("date_from".to_string(), json!("2024-01-01"))]),
        legacy_filters: HashMap::new(),
    };
    let rows = dispatcher.run(&request).await?;

    assert_eq!(rows.len(), 2);
    let group_a = rows.iter().find(|r| r["category"] == json!("A")).unwrap();
    assert_eq!(group_a["total"], json!(10), "pre-2024 sale must be filtered");
    let group_b = rows.iter().find(|r| r["category"] == json!("B")).unwrap();
    assert_eq!(group_b["total"], json!(7));

    println!("✅ filtered aggregate: {:?}", rows);
    Ok(())
}

#[tokio::test]
async fn test_external_dispatch_keeps_values_out_of_sql(
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let executor = Arc::new(RecordingExecutor::new());
    let dispatcher = QueryDispatcher::new(DataSource::External(executor.clone()));

    let hostile = "West'; DROP TABLE orders; --";
    let request = QueryRequest {
        sql: "SELECT * FROM orders WHERE status = 'active'".to_string(),
        filter_meta: Some(vec![equality_filter_meta("region", "region", None, None)]),
        filter_values: FilterValues::from([("region".to_string(), json!(hostile))]),
        legacy_filters: HashMap::new(),
    };
    dispatcher.run(&request).await?;

    let (sql, params) = executor.last_call();
    assert!(sql.contains("WHERE status = 'active' AND region = $1"));
    assert!(!sql.contains("West"), "raw value leaked into SQL: {}", sql);
    assert_eq!(params, vec![json!(hostile)]);
    Ok(())
}

#[tokio::test]
async fn test_legacy_placeholder_flow() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let store = sales_store();
    let dispatcher = QueryDispatcher::new(DataSource::InMemory(store));

    // One placeholder resolved, one left dangling by an unset control.
    let request = QueryRequest {
        sql: "SELECT * FROM sales WHERE category = '{{category}}' AND amount > {{min_amount}}"
            .to_string(),
        filter_meta: None,
        filter_values: FilterValues::new(),
        legacy_filters: HashMap::from([("category".to_string(), "A".to_string())]),
    };
    let rows = dispatcher.run(&request).await?;

    assert_eq!(rows.len(), 2, "unresolved condition must drop, not filter");
    assert!(rows.iter().all(|r| r["category"] == json!("A")));
    Ok(())
}

#[tokio::test]
async fn test_validator_gates_after_rewrite() {
    let store = Arc::new(TableStore::new());
    let dispatcher = QueryDispatcher::new(DataSource::InMemory(store));

    let request = QueryRequest {
        sql: "DROP TABLE sales".to_string(),
        ..Default::default()
    };
    let err = dispatcher.run(&request).await.unwrap_err();
    assert!(matches!(err, QueryError::DisallowedOperation(_)));

    let request = QueryRequest {
        sql: "SELECT * FROM sales; DROP TABLE sales".to_string(),
        ..Default::default()
    };
    let err = dispatcher.run(&request).await.unwrap_err();
    assert!(matches!(err, QueryError::DisallowedOperation(_)));
}

#[tokio::test]
async fn test_invalid_metadata_reports_every_violation() {
    let dispatcher = QueryDispatcher::new(DataSource::InMemory(Arc::new(TableStore::new())));
    let request = QueryRequest {
        sql: "SELECT * FROM sales".to_string(),
        filter_meta: Some(vec![
            equality_filter_meta("dup", "category", None, None),
            equality_filter_meta("dup", "category", None, None),
            equality_filter_meta("bad", "not a column!", None, None),
        ]),
        ..Default::default()
    };
    let err = dispatcher.run(&request).await.unwrap_err();
    match err {
        QueryError::InvalidFilterMetadata(violations) => {
            assert_eq!(violations.len(), 2);
        }
        other => panic!("expected InvalidFilterMetadata, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_table_roundtrip() {
    let dispatcher = QueryDispatcher::new(DataSource::InMemory(Arc::new(TableStore::new())));
    let request = QueryRequest {
        sql: "SELECT * FROM missing".to_string(),
        ..Default::default()
    };
    let err = dispatcher.run(&request).await.unwrap_err();
    match err {
        QueryError::TableNotFound(message) => {
            assert!(message.contains("missing"));
            assert!(message.contains("none"));
        }
        other => panic!("expected TableNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_skipped_filters_leave_query_untouched(
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let executor = Arc::new(RecordingExecutor::new());
    let dispatcher = QueryDispatcher::new(DataSource::External(executor.clone()));

    let request = QueryRequest {
        sql: "SELECT * FROM orders;".to_string(),
        filter_meta: Some(date_range_filter_meta("order_date", None)),
        filter_values: FilterValues::from([
            ("date_from".to_string(), json!("")),
            ("date_to".to_string(), Value::Null),
        ]),
        legacy_filters: HashMap::new(),
    };
    dispatcher.run(&request).await?;

    let (sql, params) = executor.last_call();
    assert_eq!(sql, "SELECT * FROM orders");
    assert!(params.is_empty());
    Ok(())
}
