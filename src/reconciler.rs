//! Schema Reconciler - keeps destination tables compatible with incoming record schemas
//!
//! Tables are created lazily on the first flush of a stream. Afterwards the column set only
//! grows: missing columns are added, existing ones are widened when the database allows it, and
//! nothing is ever dropped. Ordering-key columns are fixed at creation.

use crate::engine::EngineSelector;
use crate::error::{Result, TargetError};
use crate::schema::{ColumnDescriptor, ColumnType, StreamSchema};
use crate::sql::{CatalogQuery, Statement, TableDescriptor};
use crate::transport::Transport;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A column as reported by the database catalog
#[derive(Clone, Debug, PartialEq)]
pub struct ExistingColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub is_key: bool,
}

/// Plan for one requested column against the current table
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnChange {
    NoChange,
    Add(ColumnType),
    Widen { from: ColumnType, to: ColumnType },
    /// Requested base type is narrower than the current one; the column keeps its type
    Narrow { current: ColumnType, requested: ColumnType },
    /// Key column or foreign type, left as is
    Skip(String),
}

pub struct SchemaReconciler {
    transport: Arc<dyn Transport>,
    engines: EngineSelector,
    cluster_name: Option<String>,
}

impl SchemaReconciler {
    pub fn new(
        transport: Arc<dyn Transport>,
        engines: EngineSelector,
        cluster_name: Option<String>,
    ) -> Self {
        Self {
            transport,
            engines,
            cluster_name,
        }
    }

    /// Databases are the schema equivalent, so there is nothing to prepare
    pub fn prepare_schema(&self, schema_name: &str) -> Result<()> {
        debug!(schema = schema_name, "Schema preparation is a no-op");
        Ok(())
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let rows = self
            .transport
            .query(&CatalogQuery::TableExists { table: table.to_string() })
            .await?;
        Ok(!rows.is_empty())
    }

    pub async fn table_engine(&self, table: &str) -> Result<Option<String>> {
        let rows = self
            .transport
            .query(&CatalogQuery::TableEngine { table: table.to_string() })
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("engine"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    pub async fn columns(&self, table: &str) -> Result<Vec<ExistingColumn>> {
        let rows = self
            .transport
            .query(&CatalogQuery::Columns { table: table.to_string() })
            .await?;

        rows.iter()
            .map(|row| {
                let name = row.get("name").and_then(Value::as_str).ok_or_else(|| {
                    TargetError::Schema(format!("Catalog row for {} has no column name", table))
                })?;
                let raw_type = row.get("type").and_then(Value::as_str).unwrap_or_default();
                let is_key = match row.get("is_in_sorting_key") {
                    Some(Value::Number(n)) => n.as_u64().unwrap_or(0) != 0,
                    Some(Value::Bool(b)) => *b,
                    _ => false,
                };
                Ok(ExistingColumn {
                    name: name.to_string(),
                    column_type: raw_type.parse().unwrap_or_else(|e| match e {}),
                    is_key,
                })
            })
            .collect()
    }

    pub async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        Ok(self.columns(table).await?.iter().any(|c| c.name == column))
    }

    /// Build the full descriptor of a new table: columns in schema order, key columns flagged
    pub fn describe_table(
        &self,
        table: &str,
        schema: &StreamSchema,
        primary_keys: &[String],
    ) -> Result<TableDescriptor> {
        if schema.is_empty() {
            return Err(TargetError::Schema(format!(
                "Schema for '{}' declares no fields, cannot create table",
                table
            )));
        }

        if let Some(missing) = primary_keys.iter().find(|key| !schema.contains(key)) {
            return Err(TargetError::Schema(format!(
                "Key property '{}' is not declared in the schema of '{}'",
                missing, table
            )));
        }

        let columns = schema
            .fields()
            .iter()
            .map(|field| ColumnDescriptor::from_field(field, primary_keys.contains(&field.name)))
            .collect();

        Ok(TableDescriptor {
            name: table.to_string(),
            columns,
            engine: self.engines.descriptor(table, primary_keys),
            cluster: self.cluster_name.clone(),
        })
    }

    pub async fn create_empty_table(
        &self,
        table: &str,
        schema: &StreamSchema,
        primary_keys: &[String],
        as_temp_table: bool,
    ) -> Result<TableDescriptor> {
        if as_temp_table {
            return Err(TargetError::Unsupported("Temporary tables are not supported.".to_string()));
        }

        let descriptor = self.describe_table(table, schema, primary_keys)?;
        self.transport.execute(&Statement::CreateTable(descriptor.clone())).await?;
        info!(
            table,
            engine = %descriptor.engine.family,
            columns = descriptor.columns.len(),
            "Created table"
        );
        Ok(descriptor)
    }

    /// Create the table if absent, otherwise bring every schema field's column up to date
    pub async fn ensure_table(
        &self,
        table: &str,
        schema: &StreamSchema,
        primary_keys: &[String],
    ) -> Result<()> {
        if !self.table_exists(table).await? {
            self.create_empty_table(table, schema, primary_keys, false).await?;
            return Ok(());
        }

        let mut existing = self.columns(table).await?;
        for field in schema.fields() {
            let column_type = ColumnType::from_field(field);
            let added = self
                .reconcile_column(table, &existing, &field.name, &column_type)
                .await?;
            if let Some(added) = added {
                existing.push(added);
            }
        }
        Ok(())
    }

    /// Add the column if missing, widen it if possible. Idempotent.
    pub async fn ensure_column(
        &self,
        table: &str,
        column: &str,
        column_type: &ColumnType,
    ) -> Result<()> {
        let existing = self.columns(table).await?;
        self.reconcile_column(table, &existing, column, column_type).await?;
        Ok(())
    }

    pub fn plan_column(
        existing: &[ExistingColumn],
        column: &str,
        requested: &ColumnType,
    ) -> ColumnChange {
        let Some(current) = existing.iter().find(|c| c.name == column) else {
            return ColumnChange::Add(requested.clone());
        };

        if current.is_key {
            return if current.column_type.base() == requested.base() {
                ColumnChange::NoChange
            } else {
                ColumnChange::Skip("ordering key columns are never altered".to_string())
            };
        }

        match current.column_type.widen(requested) {
            None => ColumnChange::Skip(format!("cannot reason about type {}", current.column_type)),
            Some(target) if target == current.column_type => {
                if current.column_type.base() == requested.base() {
                    ColumnChange::NoChange
                } else {
                    ColumnChange::Narrow {
                        current: current.column_type.clone(),
                        requested: requested.clone(),
                    }
                }
            }
            Some(target) => ColumnChange::Widen {
                from: current.column_type.clone(),
                to: target,
            },
        }
    }

    /// Returns the column when it was added
    async fn reconcile_column(
        &self,
        table: &str,
        existing: &[ExistingColumn],
        column: &str,
        requested: &ColumnType,
    ) -> Result<Option<ExistingColumn>> {
        match Self::plan_column(existing, column, requested) {
            ColumnChange::NoChange => Ok(None),
            ColumnChange::Skip(reason) => {
                debug!(
                    table,
                    column,
                    requested = %requested,
                    "Leaving column unchanged: {}",
                    reason
                );
                Ok(None)
            }
            ColumnChange::Narrow { current, requested } => {
                warn!(
                    table,
                    column,
                    current = %current,
                    requested = %requested,
                    "Requested type is narrower than the existing column, keeping its type"
                );
                Ok(None)
            }
            ColumnChange::Add(column_type) => {
                self.transport
                    .execute(&Statement::AddColumn {
                        table: table.to_string(),
                        column: column.to_string(),
                        column_type: column_type.clone(),
                    })
                    .await?;
                info!(table, column, column_type = %column_type, "Added column");
                Ok(Some(ExistingColumn {
                    name: column.to_string(),
                    column_type,
                    is_key: false,
                }))
            }
            ColumnChange::Widen { from, to } => {
                let statement = Statement::ModifyColumn {
                    table: table.to_string(),
                    column: column.to_string(),
                    column_type: to.clone(),
                    cluster: self.cluster_name.clone(),
                };
                match self.transport.execute(&statement).await {
                    Ok(()) => {
                        info!(table, column, from = %from, to = %to, "Altered column type");
                    }
                    Err(e) if e.is_unsupported_alteration() => {
                        debug!(
                            table,
                            column,
                            from = %from,
                            to = %to,
                            "Column type change not supported: {}",
                            e
                        );
                    }
                    Err(e @ TargetError::Server { .. }) => {
                        warn!(
                            table,
                            column,
                            from = %from,
                            to = %to,
                            "Could not alter column type: {}",
                            e
                        );
                    }
                    Err(e) => return Err(e),
                }
                Ok(None)
            }
        }
    }
}
