//! Batch Writer
//!
//! Records are buffered per stream and written with one bulk insert per batch. A failed insert
//! fails the whole batch; retrying is up to the caller.

use crate::error::Result;
use crate::schema::{Row, StreamSchema};
use crate::sql::Statement;
use crate::transport::Transport;
use serde_json::Map;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_MAX_BATCH_ROWS: usize = 10_000;

/// Bounded in-memory buffer of normalized records
#[derive(Debug)]
pub struct RecordBatch {
    rows: Vec<Row>,
    max_rows: usize,
}

impl RecordBatch {
    pub fn new(max_rows: usize) -> Self {
        Self {
            rows: Vec::new(),
            max_rows: max_rows.max(1),
        }
    }

    /// Append a record. Returns true once the batch is full and should be flushed.
    pub fn push(&mut self, row: Row) -> bool {
        self.rows.push(row);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.max_rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows_mut(&mut self) -> &mut [Row] {
        &mut self.rows
    }

    /// Hand the buffered records over, leaving the batch empty
    pub fn take(&mut self) -> Vec<Row> {
        std::mem::take(&mut self.rows)
    }
}

pub struct BatchWriter {
    transport: Arc<dyn Transport>,
    optimize_after: bool,
    cluster_name: Option<String>,
}

impl BatchWriter {
    pub fn new(
        transport: Arc<dyn Transport>,
        optimize_after: bool,
        cluster_name: Option<String>,
    ) -> Self {
        Self {
            transport,
            optimize_after,
            cluster_name,
        }
    }

    /// Insert the whole batch in one statement, then compact if configured.
    ///
    /// Only keys declared by the schema are sent. Returns the inserted count when the database
    /// reports one.
    pub async fn flush(
        &self,
        table: &str,
        schema: &StreamSchema,
        records: &[Row],
    ) -> Result<Option<u64>> {
        if records.is_empty() {
            debug!(table, "Nothing to flush");
            return Ok(Some(0));
        }

        let started = Instant::now();
        let rows: Vec<Row> = records.iter().map(|record| project(record, schema)).collect();
        let inserted = self.transport.insert(table, &rows).await?;

        info!(
            table,
            rows = rows.len(),
            inserted = ?inserted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flushed batch"
        );

        if self.optimize_after {
            self.transport
                .execute(&Statement::Optimize {
                    table: table.to_string(),
                    cluster: self.cluster_name.clone(),
                })
                .await?;
            debug!(table, "Optimized table after flush");
        }

        Ok(inserted)
    }
}

fn project(record: &Row, schema: &StreamSchema) -> Row {
    let mut row = Map::with_capacity(schema.len());
    for field in schema.fields() {
        if let Some(value) = record.get(&field.name) {
            row.insert(field.name.clone(), value.clone());
        }
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_batch_signals_full_at_bound() {
        let mut batch = RecordBatch::new(2);
        assert!(!batch.push(Map::new()));
        assert!(batch.push(Map::new()));
        assert_eq!(batch.take().len(), 2);
        assert!(batch.is_empty());
        assert!(!batch.is_full());
    }

    #[test]
    fn test_project_keeps_declared_keys_only() {
        let schema =
            StreamSchema::from_json(&json!({"properties": {"id": {"type": "integer"}}})).unwrap();
        let record = json!({"id": 1, "extra": "x"}).as_object().cloned().unwrap();
        let row = project(&record, &schema);
        assert_eq!(row.len(), 1);
        assert_eq!(row["id"], json!(1));
    }
}
