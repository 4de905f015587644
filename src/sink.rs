//! Per-stream sink
//!
//! A sink owns one stream's schema and record buffer. Records are conformed to the schema,
//! stamped with metadata, normalized and buffered; draining reconciles the table and writes the
//! buffer in one bulk insert.

use crate::config::TargetConfig;
use crate::destination::Destination;
use crate::error::Result;
use crate::normalizer::RecordNormalizer;
use crate::schema::{FieldSchema, JsonType, Row, StreamSchema, StringFormat};
use crate::version::{ActivationOutcome, DELETED_AT_COLUMN, VERSION_COLUMN};
use crate::writer::RecordBatch;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, info};

const EXTRACTED_AT: &str = "_sdc_extracted_at";
const RECEIVED_AT: &str = "_sdc_received_at";
const BATCHED_AT: &str = "_sdc_batched_at";
const SEQUENCE: &str = "_sdc_sequence";

/// Destination table of a stream: the configured override, else the last `-` segment
pub fn table_name(stream: &str, table_override: Option<&str>) -> String {
    match table_override.filter(|name| !name.trim().is_empty()) {
        Some(name) => name.to_string(),
        None => stream.rsplit('-').next().unwrap_or(stream).to_string(),
    }
}

fn timestamp_field(name: &str) -> FieldSchema {
    FieldSchema::new(name, &[JsonType::Null, JsonType::String]).with_format(StringFormat::DateTime)
}

fn now() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Counters of one sink
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub received: u64,
    pub dropped: u64,
    pub written: u64,
    pub flushes: u64,
}

pub struct Sink {
    stream: String,
    table: String,
    schema: StreamSchema,
    key_properties: Vec<String>,
    batch: RecordBatch,
    normalizer: RecordNormalizer,
    add_record_metadata: bool,
    version: Option<u64>,
    sequence: u64,
    stats: SinkStats,
}

impl Sink {
    pub fn new(
        stream: &str,
        schema: &Value,
        key_properties: Vec<String>,
        config: &TargetConfig,
    ) -> Result<Self> {
        let mut sink = Self {
            stream: stream.to_string(),
            table: table_name(stream, config.table_name.as_deref()),
            schema: StreamSchema::from_json(schema)?,
            key_properties,
            batch: RecordBatch::new(config.batch_size_rows),
            normalizer: RecordNormalizer::new(),
            add_record_metadata: config.add_record_metadata,
            version: None,
            sequence: 0,
            stats: SinkStats::default(),
        };

        if sink.add_record_metadata {
            for name in [EXTRACTED_AT, RECEIVED_AT, BATCHED_AT, DELETED_AT_COLUMN] {
                sink.schema.ensure_field(timestamp_field(name));
            }
            sink.schema
                .ensure_field(FieldSchema::new(SEQUENCE, &[JsonType::Null, JsonType::Integer]));
            sink.ensure_version_field();
        }

        debug!(stream, table = %sink.table, fields = sink.schema.len(), "Registered sink");
        Ok(sink)
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> &StreamSchema {
        &self.schema
    }

    pub fn key_properties(&self) -> &[String] {
        &self.key_properties
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// True when a new SCHEMA message for the stream needs a fresh sink
    pub fn is_same_definition(&self, schema: &Value, key_properties: &[String]) -> bool {
        let Ok(incoming) = StreamSchema::from_json(schema) else {
            return false;
        };
        key_properties == self.key_properties.as_slice()
            && incoming.fields().iter().all(|field| self.schema.field(&field.name) == Some(field))
            && self.schema.len() == incoming.len() + self.added_field_count()
    }

    fn added_field_count(&self) -> usize {
        [EXTRACTED_AT, RECEIVED_AT, BATCHED_AT, DELETED_AT_COLUMN, SEQUENCE, VERSION_COLUMN]
            .iter()
            .filter(|name| self.schema.contains(name))
            .count()
    }

    fn ensure_version_field(&mut self) {
        let field = FieldSchema::new(VERSION_COLUMN, &[JsonType::Null, JsonType::Integer]);
        if self.schema.ensure_field(field) {
            debug!(stream = %self.stream, "Added table version column to schema");
        }
    }

    /// Track the stream's version; from now on every record carries it
    pub fn set_version(&mut self, version: u64) {
        self.version = Some(version);
        self.ensure_version_field();
    }

    /// Conform, stamp and normalize one record, then buffer it.
    /// Returns true when the buffer is full and should be drained.
    pub fn process_record(
        &mut self,
        mut record: Row,
        version: Option<u64>,
        time_extracted: Option<&str>,
    ) -> bool {
        self.stats.received += 1;

        if let Some(version) = version {
            if self.version != Some(version) {
                self.set_version(version);
            }
        }

        record.retain(|key, _| self.schema.contains(key));

        if self.add_record_metadata {
            self.sequence += 1;
            record.insert(
                EXTRACTED_AT.to_string(),
                time_extracted.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null),
            );
            record.insert(RECEIVED_AT.to_string(), now());
            record.insert(SEQUENCE.to_string(), Value::from(self.sequence));
            record.entry(DELETED_AT_COLUMN).or_insert(Value::Null);
        }
        if let Some(version) = self.version {
            record.insert(VERSION_COLUMN.to_string(), Value::from(version));
        }

        match self.normalizer.prepare(record, &self.schema) {
            Some(row) => self.batch.push(row),
            None => {
                self.stats.dropped += 1;
                false
            }
        }
    }

    /// Reconcile the table and write everything buffered
    pub async fn drain(&mut self, destination: &dyn Destination) -> Result<Option<u64>> {
        if self.batch.is_empty() {
            return Ok(Some(0));
        }

        if self.add_record_metadata {
            let batched_at = now();
            for row in self.batch.rows_mut() {
                row.insert(BATCHED_AT.to_string(), batched_at.clone());
            }
        }

        destination
            .ensure_table(&self.table, &self.schema, &self.key_properties)
            .await?;

        let records = self.batch.take();
        let count = records.len() as u64;
        let inserted = destination.bulk_insert(&self.table, &self.schema, &records).await?;

        self.stats.flushes += 1;
        self.stats.written += inserted.unwrap_or(count);
        debug!(stream = %self.stream, table = %self.table, rows = count, "Drained sink");
        Ok(inserted)
    }

    /// Drain pending records, then retire rows of older versions
    pub async fn activate_version(
        &mut self,
        destination: &dyn Destination,
        new_version: u64,
    ) -> Result<ActivationOutcome> {
        self.drain(destination).await?;
        let outcome = destination.activate_version(&self.table, new_version).await?;
        self.set_version(new_version);
        info!(
            stream = %self.stream,
            table = %self.table,
            version = new_version,
            outcome = ?outcome,
            "Activated version"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users_schema() -> Value {
        json!({"properties": {"id": {"type": "integer"}, "name": {"type": ["null", "string"]}}})
    }

    #[test]
    fn test_table_naming() {
        assert_eq!(table_name("public-users", None), "users");
        assert_eq!(table_name("users", None), "users");
        assert_eq!(table_name("public-users", Some("people")), "people");
        assert_eq!(table_name("public-users", Some("")), "users");
    }

    #[test]
    fn test_unknown_keys_are_dropped() {
        let config = TargetConfig::default();
        let mut sink = Sink::new("users", &users_schema(), vec!["id".into()], &config).unwrap();
        let record = json!({"id": 1, "extra": true}).as_object().cloned().unwrap();
        sink.process_record(record, None, None);
        assert_eq!(sink.pending(), 1);
        assert_eq!(sink.batch.rows_mut()[0].get("extra"), None);
    }

    #[test]
    fn test_metadata_columns() {
        let config = TargetConfig::from_value(json!({"add_record_metadata": true})).unwrap();
        let mut sink = Sink::new("users", &users_schema(), vec!["id".into()], &config).unwrap();
        let columns = [
            EXTRACTED_AT,
            RECEIVED_AT,
            BATCHED_AT,
            DELETED_AT_COLUMN,
            SEQUENCE,
            VERSION_COLUMN,
        ];
        for name in columns {
            assert!(sink.schema().contains(name), "missing {}", name);
        }

        sink.process_record(
            json!({"id": 1}).as_object().cloned().unwrap(),
            None,
            Some("2024-03-15T10:00:00Z"),
        );
        let row = &sink.batch.rows_mut()[0];
        assert_eq!(row[EXTRACTED_AT], json!("2024-03-15T10:00:00Z"));
        assert_eq!(row[SEQUENCE], json!(1));
        assert!(row[RECEIVED_AT].is_string());
        assert!(sink.is_same_definition(&users_schema(), &["id".to_string()]));
    }

    #[test]
    fn test_record_version_is_stamped() {
        let config = TargetConfig::default();
        let mut sink = Sink::new("users", &users_schema(), vec![], &config).unwrap();
        assert!(!sink.schema().contains(VERSION_COLUMN));

        sink.process_record(json!({"id": 1}).as_object().cloned().unwrap(), Some(7), None);
        assert!(sink.schema().contains(VERSION_COLUMN));
        assert_eq!(sink.batch.rows_mut()[0][VERSION_COLUMN], json!(7));
    }

    #[test]
    fn test_invalid_records_are_counted_as_dropped() {
        let config = TargetConfig::default();
        let mut sink = Sink::new("users", &users_schema(), vec![], &config).unwrap();
        sink.process_record(json!({"id": "abc"}).as_object().cloned().unwrap(), None, None);
        assert_eq!(sink.pending(), 0);
        assert_eq!(sink.stats().dropped, 1);
    }

    #[test]
    fn test_changed_schema_is_detected() {
        let config = TargetConfig::default();
        let sink = Sink::new("users", &users_schema(), vec!["id".into()], &config).unwrap();
        assert!(sink.is_same_definition(&users_schema(), &["id".to_string()]));
        assert!(!sink.is_same_definition(&users_schema(), &[]));
        let wider = json!({"properties": {
            "id": {"type": "integer"},
            "name": {"type": ["null", "string"]},
            "age": {"type": "integer"}
        }});
        assert!(!sink.is_same_definition(&wider, &["id".to_string()]));
    }
}
