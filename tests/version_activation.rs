use serde_json::{json, Value};
use std::sync::Arc;
use target_clickhouse::schema::{ColumnType, Row};
use target_clickhouse::sql::Statement;
use target_clickhouse::test_utils::MemoryTransport;
use target_clickhouse::version::{ActivationOutcome, DELETED_AT_COLUMN, VERSION_COLUMN};
use target_clickhouse::{ClickhouseLikeDestination, Destination, Target, TargetConfig};

fn versioned_rows(versions: &[u64]) -> Vec<Row> {
    versions
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let mut row = Row::new();
            row.insert("id".to_string(), json!(i as u64 + 1));
            row.insert(VERSION_COLUMN.to_string(), json!(v));
            row
        })
        .collect()
}

fn seeded(versions: &[u64]) -> Arc<MemoryTransport> {
    let transport = Arc::new(MemoryTransport::new());
    transport.seed_table(
        "events",
        &[("id", ColumnType::Int64), (VERSION_COLUMN, ColumnType::Int64.nullable())],
        versioned_rows(versions),
    );
    transport
}

fn destination_for(config: Value, transport: &Arc<MemoryTransport>) -> ClickhouseLikeDestination {
    let config = TargetConfig::from_value(config).unwrap();
    ClickhouseLikeDestination::new(config, transport.clone()).unwrap()
}

fn versions(transport: &MemoryTransport) -> Vec<u64> {
    transport
        .rows("events")
        .iter()
        .filter_map(|row| row[VERSION_COLUMN].as_u64())
        .collect()
}

#[tokio::test]
async fn test_hard_delete_removes_superseded_versions() {
    let transport = seeded(&[1, 2, 3, 4]);
    let destination = destination_for(json!({}), &transport);

    let outcome = destination.activate_version("events", 2).await.unwrap();
    assert_eq!(outcome, ActivationOutcome::HardDeleted);
    assert_eq!(versions(&transport), vec![3, 4]);

    let sql = transport.executed_sql();
    assert_eq!(sql.last().unwrap(), "ALTER TABLE `events` DELETE WHERE `_sdc_table_version` <= 2");

    // same watermark again: nothing left to match
    let before = transport.rows("events");
    destination.activate_version("events", 2).await.unwrap();
    assert_eq!(transport.rows("events"), before);
}

#[tokio::test]
async fn test_soft_delete_stamps_older_rows_only() {
    let transport = seeded(&[1, 2, 3]);
    let destination = destination_for(json!({"hard_delete": false}), &transport);

    let outcome = destination.activate_version("events", 2).await.unwrap();
    assert_eq!(outcome, ActivationOutcome::SoftDeleted);

    assert_eq!(
        transport.column_type("events", DELETED_AT_COLUMN),
        Some(ColumnType::DateTime64.nullable())
    );
    let rows = transport.rows("events");
    assert_eq!(rows.len(), 3);
    assert!(rows[0][DELETED_AT_COLUMN].is_string());
    assert!(rows[1].get(DELETED_AT_COLUMN).map_or(true, Value::is_null));
    assert!(rows[2].get(DELETED_AT_COLUMN).map_or(true, Value::is_null));

    // stamped rows are excluded by the predicate, so a rerun keeps the first timestamp
    let before = transport.rows("events");
    destination.activate_version("events", 2).await.unwrap();
    assert_eq!(transport.rows("events"), before);

    let adds = transport
        .statements()
        .into_iter()
        .filter(|s| matches!(s, Statement::AddColumn { .. }))
        .count();
    assert_eq!(adds, 1);
}

#[tokio::test]
async fn test_cutoffs_are_configurable() {
    let transport = seeded(&[1, 2, 3]);
    let destination = destination_for(json!({"hard_delete_cutoff": "exclusive"}), &transport);
    destination.activate_version("events", 2).await.unwrap();
    assert_eq!(versions(&transport), vec![2, 3]);

    let transport = seeded(&[1, 2, 3]);
    let destination = destination_for(
        json!({"hard_delete": false, "soft_delete_cutoff": "inclusive"}),
        &transport,
    );
    destination.activate_version("events", 2).await.unwrap();
    let stamped = transport
        .rows("events")
        .iter()
        .filter(|row| row.get(DELETED_AT_COLUMN).map_or(false, Value::is_string))
        .count();
    assert_eq!(stamped, 2);
}

#[tokio::test]
async fn test_missing_table_is_a_no_op() {
    let transport = Arc::new(MemoryTransport::new());
    let destination = destination_for(json!({}), &transport);

    let outcome = destination.activate_version("events", 5).await.unwrap();
    assert_eq!(outcome, ActivationOutcome::NoTable);
    assert!(transport.statements().is_empty());
}

#[tokio::test]
async fn test_activate_version_messages_drive_full_table_syncs() {
    let transport = Arc::new(MemoryTransport::new());
    let config = TargetConfig::from_value(json!({"hard_delete": false})).unwrap();
    let destination = ClickhouseLikeDestination::new(config.clone(), transport.clone()).unwrap();
    let mut target = Target::new(config, Arc::new(destination)).unwrap();

    let input = [
        json!({
            "type": "SCHEMA",
            "stream": "events",
            "schema": {"properties": {"id": {"type": "integer"}}},
            "key_properties": ["id"]
        }),
        json!({"type": "ACTIVATE_VERSION", "stream": "events", "version": 1}),
        json!({"type": "RECORD", "stream": "events", "record": {"id": 1}, "version": 1}),
        json!({"type": "RECORD", "stream": "events", "record": {"id": 2}, "version": 1}),
        json!({"type": "ACTIVATE_VERSION", "stream": "events", "version": 1}),
        json!({"type": "ACTIVATE_VERSION", "stream": "events", "version": 2}),
        json!({"type": "RECORD", "stream": "events", "record": {"id": 1}, "version": 2}),
        json!({"type": "ACTIVATE_VERSION", "stream": "events", "version": 2}),
    ]
    .iter()
    .map(Value::to_string)
    .collect::<Vec<_>>()
    .join("\n");

    let mut output = Vec::new();
    let summary = target.run(input.as_bytes(), &mut output).await.unwrap();
    assert_eq!(summary.versions_activated, 4);
    assert_eq!(summary.records_written, 3);

    let rows = transport.rows("events");
    assert_eq!(rows.len(), 3);
    for row in &rows {
        let version = row[VERSION_COLUMN].as_u64().unwrap();
        let deleted = row.get(DELETED_AT_COLUMN).map_or(false, Value::is_string);
        assert_eq!(deleted, version < 2, "row {:?}", row);
    }
    assert_eq!(target.sink("events").unwrap().version(), Some(2));
}
