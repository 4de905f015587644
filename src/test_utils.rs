//! In-memory transport for tests
//!
//! Interprets the typed statements against a tiny catalog so the loading engine can be driven
//! end to end without a database. Mutations apply immediately.

use crate::error::{Result, TargetError};
use crate::schema::{ColumnType, Row};
use crate::sql::{CatalogQuery, Statement};
use crate::transport::Transport;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const UNKNOWN_TABLE: u32 = 60;
const NO_SUCH_COLUMN_IN_TABLE: u32 = 16;
const ALTER_OF_COLUMN_IS_FORBIDDEN: u32 = 524;
const CANNOT_PARSE_INPUT_ASSERTION_FAILED: u32 = 27;

#[derive(Clone, Debug, PartialEq)]
pub struct MemoryColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub is_key: bool,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryTable {
    pub engine: String,
    pub columns: Vec<MemoryColumn>,
    pub order_by: Vec<String>,
    pub rows: Vec<Row>,
}

impl MemoryTable {
    fn column_mut(&mut self, name: &str) -> Option<&mut MemoryColumn> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    fn column(&self, name: &str) -> Option<&MemoryColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

#[derive(Default)]
pub struct MemoryTransport {
    tables: Mutex<BTreeMap<String, MemoryTable>>,
    statements: Mutex<Vec<Statement>>,
    inserts: Mutex<Vec<(String, usize)>>,
    reject_alterations: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every MODIFY COLUMN fail like an unsupported type transition
    pub fn reject_alterations(&self, reject: bool) {
        self.reject_alterations.store(reject, Ordering::SeqCst);
    }

    /// Create a table directly, bypassing DDL
    pub fn seed_table(&self, name: &str, columns: &[(&str, ColumnType)], rows: Vec<Row>) {
        let table = MemoryTable {
            engine: "MergeTree".to_string(),
            columns: columns
                .iter()
                .map(|(name, column_type)| MemoryColumn {
                    name: name.to_string(),
                    column_type: column_type.clone(),
                    is_key: false,
                })
                .collect(),
            order_by: Vec::new(),
            rows,
        };
        self.lock_tables().insert(name.to_string(), table);
    }

    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.lock_tables().get(name).cloned()
    }

    pub fn rows(&self, name: &str) -> Vec<Row> {
        self.table(name).map(|t| t.rows).unwrap_or_default()
    }

    pub fn column_type(&self, table: &str, column: &str) -> Option<ColumnType> {
        self.table(table)?
            .columns
            .into_iter()
            .find(|c| c.name == column)
            .map(|c| c.column_type)
    }

    /// Every statement executed so far, including rejected ones
    pub fn statements(&self) -> Vec<Statement> {
        self.statements.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.statements().iter().map(Statement::to_sql).collect()
    }

    /// `(table, row count)` per insert call
    pub fn inserts(&self) -> Vec<(String, usize)> {
        self.inserts.lock().map(|i| i.clone()).unwrap_or_default()
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, MemoryTable>> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn apply(&self, statement: &Statement) -> Result<()> {
        let mut tables = self.lock_tables();

        if let Statement::CreateTable(descriptor) = statement {
            tables.entry(descriptor.name.clone()).or_insert_with(|| MemoryTable {
                engine: descriptor.engine.family.to_string(),
                columns: descriptor
                    .columns
                    .iter()
                    .map(|c| MemoryColumn {
                        name: c.name.clone(),
                        column_type: c.column_type.clone(),
                        is_key: descriptor.engine.order_by.contains(&c.name),
                    })
                    .collect(),
                order_by: descriptor.engine.order_by.clone(),
                rows: Vec::new(),
            });
            return Ok(());
        }

        let name = statement.table();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| server(UNKNOWN_TABLE, format!("Table {} does not exist", name)))?;

        match statement {
            Statement::CreateTable(_) => Ok(()),
            Statement::AddColumn { column, column_type, .. } => {
                if !table.has_column(column) {
                    table.columns.push(MemoryColumn {
                        name: column.clone(),
                        column_type: column_type.clone(),
                        is_key: false,
                    });
                }
                Ok(())
            }
            Statement::ModifyColumn { column, column_type, .. } => {
                let rejecting = self.reject_alterations.load(Ordering::SeqCst);
                let existing = table.column_mut(column).ok_or_else(|| {
                    server(NO_SUCH_COLUMN_IN_TABLE, format!("There is no column {}", column))
                })?;
                if rejecting || existing.is_key {
                    return Err(server(
                        ALTER_OF_COLUMN_IS_FORBIDDEN,
                        format!("ALTER of column {} is forbidden", column),
                    ));
                }
                existing.column_type = column_type.clone();
                Ok(())
            }
            Statement::Optimize { .. } => Ok(()),
            Statement::DeleteVersions { version_column, cutoff, version, .. } => {
                require_column(table, version_column)?;
                table.rows.retain(|row| {
                    !row_version(row, version_column).map_or(false, |v| cutoff.matches(v, *version))
                });
                Ok(())
            }
            Statement::SoftDeleteVersions {
                version_column,
                deleted_at_column,
                cutoff,
                version,
                deleted_at,
                ..
            } => {
                require_column(table, version_column)?;
                require_column(table, deleted_at_column)?;
                let stamp = Value::String(deleted_at.format("%Y-%m-%d %H:%M:%S%.6f").to_string());
                for row in table.rows.iter_mut() {
                    let superseded = row_version(row, version_column)
                        .map_or(false, |v| cutoff.matches(v, *version));
                    let live = row.get(deleted_at_column).map_or(true, Value::is_null);
                    if superseded && live {
                        row.insert(deleted_at_column.clone(), stamp.clone());
                    }
                }
                Ok(())
            }
        }
    }
}

fn server(code: u32, message: String) -> TargetError {
    TargetError::Server { code, message }
}

fn require_column(table: &MemoryTable, column: &str) -> Result<()> {
    if table.has_column(column) {
        Ok(())
    } else {
        Err(server(NO_SUCH_COLUMN_IN_TABLE, format!("Missing column {}", column)))
    }
}

/// JSONEachRow values a column parses without a cast. Nulls fall back to the column default.
fn accepts(column_type: &ColumnType, value: &Value) -> bool {
    match (column_type.base(), value) {
        (_, Value::Null) | (ColumnType::Other(_), _) => true,
        (ColumnType::Int64, Value::Number(n)) => n.is_i64() || n.is_u64(),
        (ColumnType::Float64, Value::Number(_)) => true,
        (ColumnType::Bool, Value::Bool(_)) => true,
        (ColumnType::Date | ColumnType::DateTime64, Value::String(_)) => true,
        (ColumnType::String, Value::String(_) | Value::Number(_) | Value::Bool(_)) => true,
        _ => false,
    }
}

fn row_version(row: &Row, column: &str) -> Option<u64> {
    row.get(column).and_then(Value::as_u64)
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn execute(&self, statement: &Statement) -> Result<()> {
        if let Ok(mut log) = self.statements.lock() {
            log.push(statement.clone());
        }
        self.apply(statement)
    }

    async fn query(&self, query: &CatalogQuery) -> Result<Vec<Row>> {
        let tables = self.lock_tables();
        let rows = match query {
            CatalogQuery::TableExists { table } => tables
                .get(table)
                .map(|_| vec![json!({ "name": table })])
                .unwrap_or_default(),
            CatalogQuery::TableEngine { table } => tables
                .get(table)
                .map(|t| vec![json!({ "engine": t.engine })])
                .unwrap_or_default(),
            CatalogQuery::Columns { table } => tables
                .get(table)
                .map(|t| {
                    t.columns
                        .iter()
                        .map(|c| {
                            json!({
                                "name": c.name,
                                "type": c.column_type.to_string(),
                                "is_in_sorting_key": u8::from(c.is_key),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
        };

        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(object) => Some(object),
                _ => None,
            })
            .collect())
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<Option<u64>> {
        let mut tables = self.lock_tables();
        let target = tables
            .get_mut(table)
            .ok_or_else(|| server(UNKNOWN_TABLE, format!("Table {} does not exist", table)))?;

        for (key, value) in rows.iter().flatten() {
            let Some(column) = target.column(key) else {
                return Err(server(
                    NO_SUCH_COLUMN_IN_TABLE,
                    format!("No such column {} in table {}", key, table),
                ));
            };
            if !accepts(&column.column_type, value) {
                return Err(server(
                    CANNOT_PARSE_INPUT_ASSERTION_FAILED,
                    format!("Cannot parse {} as {} for column {}", value, column.column_type, key),
                ));
            }
        }

        target.rows.extend(rows.iter().cloned());
        if let Ok(mut inserts) = self.inserts.lock() {
            inserts.push((table.to_string(), rows.len()));
        }
        Ok(Some(rows.len() as u64))
    }
}
