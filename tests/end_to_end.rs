use serde_json::{json, Value};
use std::sync::Arc;
use target_clickhouse::schema::ColumnType;
use target_clickhouse::sql::Statement;
use target_clickhouse::test_utils::MemoryTransport;
use target_clickhouse::{ClickhouseLikeDestination, RunSummary, Target, TargetConfig, TargetError};

type Outcome = (target_clickhouse::Result<RunSummary>, Arc<MemoryTransport>, String);

async fn run_with(config: Value, lines: &[Value]) -> Outcome {
    let config = TargetConfig::from_value(config).unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let destination = ClickhouseLikeDestination::new(config.clone(), transport.clone()).unwrap();
    let mut target = Target::new(config, Arc::new(destination)).unwrap();

    let input = lines.iter().map(Value::to_string).collect::<Vec<_>>().join("\n");
    let mut output = Vec::new();
    let result = target.run(input.as_bytes(), &mut output).await;
    (result, transport, String::from_utf8(output).unwrap())
}

fn schema_message(stream: &str, properties: Value, keys: &[&str]) -> Value {
    json!({
        "type": "SCHEMA",
        "stream": stream,
        "schema": {"properties": properties},
        "key_properties": keys
    })
}

fn record(stream: &str, record: Value) -> Value {
    json!({"type": "RECORD", "stream": stream, "record": record})
}

fn users_schema() -> Value {
    schema_message(
        "users",
        json!({"id": {"type": "integer"}, "created": {"type": "string", "format": "date"}}),
        &["id"],
    )
}

fn user(id: Value, created: &str) -> Value {
    record("users", json!({"id": id, "created": created}))
}

#[tokio::test]
async fn test_dated_records_land_in_a_date_column() {
    let (result, transport, _) = run_with(
        json!({}),
        &[users_schema(), user(json!(1), "2024-03-15"), user(json!(2), "2024-03-16")],
    )
    .await;

    let summary = result.unwrap();
    assert_eq!(summary.records_written, 2);

    let table = transport.table("users").unwrap();
    assert_eq!(table.order_by, vec!["id".to_string()]);
    assert_eq!(table.rows.len(), 2);
    assert_eq!(table.rows[0]["id"], json!(1));
    assert_eq!(table.rows[1]["created"], json!("2024-03-16"));
    assert_eq!(transport.column_type("users", "created"), Some(ColumnType::Date));
    assert_eq!(transport.column_type("users", "id"), Some(ColumnType::Int64));

    let ddl = &transport.executed_sql()[0];
    assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS `users`"), "{}", ddl);
    assert!(ddl.contains("`created` Date"), "{}", ddl);
    assert!(ddl.ends_with("ENGINE = MergeTree ORDER BY (`id`)"), "{}", ddl);
}

#[tokio::test]
async fn test_schema_evolution_adds_and_widens_columns() {
    let id = json!({"type": "integer"});
    let (result, transport, _) = run_with(
        json!({}),
        &[
            schema_message("orders", json!({"id": id}), &["id"]),
            record("orders", json!({"id": 1})),
            schema_message(
                "orders",
                json!({"id": id, "qty": {"type": ["null", "integer"]}}),
                &["id"],
            ),
            record("orders", json!({"id": 2, "qty": 3})),
            schema_message(
                "orders",
                json!({"id": id, "qty": {"type": ["null", "number"]}}),
                &["id"],
            ),
            record("orders", json!({"id": 3, "qty": 1.5})),
        ],
    )
    .await;

    assert_eq!(result.unwrap().records_written, 3);
    assert_eq!(transport.rows("orders").len(), 3);
    assert_eq!(
        transport.column_type("orders", "qty"),
        Some(ColumnType::Float64.nullable())
    );

    let statements = transport.statements();
    assert!(statements
        .iter()
        .any(|s| matches!(s, Statement::AddColumn { column, .. } if column == "qty")));
    assert!(statements
        .iter()
        .any(|s| matches!(s, Statement::ModifyColumn { column, .. } if column == "qty")));
    let creates = statements
        .iter()
        .filter(|s| matches!(s, Statement::CreateTable(_)))
        .count();
    assert_eq!(creates, 1);
}

#[tokio::test]
async fn test_nested_values_and_decimals_are_normalized() {
    let lines = [
        schema_message(
            "shop-orders",
            json!({
                "id": {"type": "integer"},
                "price": {"type": "number"},
                "address": {
                    "type": ["null", "object"],
                    "properties": {"street": {"type": "string"}, "city": {"type": "string"}}
                }
            }),
            &["id"],
        ),
        serde_json::from_str(
            r#"{"type": "RECORD", "stream": "shop-orders",
                "record": {"id": 1, "price": 19.99, "address": {"street": 123, "city": "X"}}}"#,
        )
        .unwrap(),
    ];
    let (result, transport, _) = run_with(json!({}), &lines).await;
    result.unwrap();

    let rows = transport.rows("orders");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["price"].as_f64(), Some(19.99));

    let address: Value = serde_json::from_str(rows[0]["address"].as_str().unwrap()).unwrap();
    assert_eq!(address, json!({"street": "123", "city": "X"}));
    assert_eq!(
        transport.column_type("orders", "address"),
        Some(ColumnType::String.nullable())
    );
}

#[tokio::test]
async fn test_invalid_records_are_dropped_not_fatal() {
    let (result, transport, _) = run_with(
        json!({}),
        &[
            users_schema(),
            user(json!(1), "2024-03-15"),
            user(json!(2), "someday"),
            user(json!(3), "2024-03-17T08:00:00Z"),
            user(json!("4"), "2024-03-18"),
        ],
    )
    .await;

    let summary = result.unwrap();
    assert_eq!(summary.records_received, 4);
    assert_eq!(summary.records_dropped, 1);
    assert_eq!(summary.records_written, 3);

    let rows = transport.rows("users");
    assert_eq!(rows[1]["created"], json!("2024-03-17"));
    assert_eq!(rows[2]["id"], json!(4));
}

#[tokio::test]
async fn test_values_that_do_not_fit_their_column_are_dropped_from_the_batch() {
    let lines = [
        schema_message(
            "metrics",
            json!({"id": {"type": "integer"}, "n": {"type": ["integer", "string"]}}),
            &["id"],
        ),
        serde_json::from_str(
            r#"{"type": "RECORD", "stream": "metrics", "record": {"id": 30.0, "n": 1}}"#,
        )
        .unwrap(),
        record("metrics", json!({"id": 2, "n": "abc"})),
        record("metrics", json!({"id": 3, "n": "7"})),
    ];
    let (result, transport, _) = run_with(json!({}), &lines).await;

    let summary = result.unwrap();
    assert_eq!(summary.records_dropped, 1);
    assert_eq!(summary.records_written, 2);
    assert_eq!(transport.column_type("metrics", "n"), Some(ColumnType::Int64));

    let rows = transport.rows("metrics");
    assert!(rows[0]["id"].is_i64());
    assert_eq!(rows[0]["id"], json!(30));
    assert_eq!(rows[1]["n"], json!(7));
}

#[tokio::test]
async fn test_batches_flush_at_configured_size() {
    let (result, transport, _) = run_with(
        json!({"batch_size_rows": 2, "optimize_after": true, "table_name": "people"}),
        &[
            users_schema(),
            user(json!(1), "2024-03-15"),
            user(json!(2), "2024-03-15"),
            user(json!(3), "2024-03-15"),
        ],
    )
    .await;

    assert_eq!(result.unwrap().records_written, 3);
    assert_eq!(
        transport.inserts(),
        vec![("people".to_string(), 2), ("people".to_string(), 1)]
    );
    let optimizes = transport
        .statements()
        .into_iter()
        .filter(|s| matches!(s, Statement::Optimize { .. }))
        .count();
    assert_eq!(optimizes, 2);
}

#[tokio::test]
async fn test_latest_state_is_written_once_at_the_end() {
    let (result, _, output) = run_with(
        json!({}),
        &[
            users_schema(),
            json!({"type": "STATE", "value": {"bookmarks": {"users": 1}}}),
            user(json!(1), "2024-03-15"),
            json!({"type": "STATE", "value": {"bookmarks": {"users": 2}}}),
        ],
    )
    .await;

    assert_eq!(result.unwrap().states_emitted, 1);
    assert_eq!(output, "{\"bookmarks\":{\"users\":2}}\n");
}

#[tokio::test]
async fn test_unknown_message_type_is_fatal() {
    let (result, _, _) = run_with(json!({}), &[json!({"type": "PING"})]).await;
    assert!(matches!(result, Err(TargetError::Schema(_))));
}

#[test]
fn test_replicated_engine_requires_replica_name_before_any_ddl() {
    let config = TargetConfig::from_value(json!({
        "engine_type": "ReplicatedMergeTree",
        "table_path": "/clickhouse/tables/{table_name}"
    }))
    .unwrap();
    let transport = Arc::new(MemoryTransport::new());

    let err = ClickhouseLikeDestination::new(config, transport.clone()).err().unwrap();
    assert!(matches!(err, TargetError::Configuration(_)));
    assert!(err.to_string().contains("replica_name"));
    assert!(transport.statements().is_empty());
}

#[tokio::test]
async fn test_replicated_table_path_is_templated() {
    let (result, transport, _) = run_with(
        json!({
            "engine_type": "ReplicatedReplacingMergeTree",
            "table_path": "/clickhouse/tables/{table_name}",
            "replica_name": "r1",
            "cluster_name": "main"
        }),
        &[users_schema(), user(json!(1), "2024-03-15")],
    )
    .await;
    result.unwrap();

    let ddl = &transport.executed_sql()[0];
    assert!(ddl.contains("ON CLUSTER `main`"), "{}", ddl);
    assert!(
        ddl.contains("ENGINE = ReplicatedReplacingMergeTree('/clickhouse/tables/users', 'r1')"),
        "{}",
        ddl
    );
}
