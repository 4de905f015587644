//! Destination capability set
//!
//! The message runner and sinks only see the `Destination` trait. `ClickhouseLikeDestination`
//! wires the reconciler, batch writer and version activator to one transport.

use crate::config::TargetConfig;
use crate::error::Result;
use crate::reconciler::SchemaReconciler;
use crate::schema::{ColumnType, Row, StreamSchema};
use crate::sql::TableDescriptor;
use crate::transport::{HttpTransport, Transport};
use crate::version::{ActivationOutcome, DeleteMode, VersionActivator};
use crate::writer::BatchWriter;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait Destination: Send + Sync {
    /// Driver connection URL for the configured destination
    fn connection_url(&self) -> Result<String>;

    fn prepare_schema(&self, schema_name: &str) -> Result<()>;

    async fn table_exists(&self, table: &str) -> Result<bool>;

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool>;

    async fn table_engine(&self, table: &str) -> Result<Option<String>>;

    async fn create_empty_table(
        &self,
        table: &str,
        schema: &StreamSchema,
        primary_keys: &[String],
        as_temp_table: bool,
    ) -> Result<TableDescriptor>;

    async fn ensure_table(
        &self,
        table: &str,
        schema: &StreamSchema,
        primary_keys: &[String],
    ) -> Result<()>;

    async fn ensure_column(
        &self,
        table: &str,
        column: &str,
        column_type: &ColumnType,
    ) -> Result<()>;

    async fn bulk_insert(
        &self,
        table: &str,
        schema: &StreamSchema,
        records: &[Row],
    ) -> Result<Option<u64>>;

    async fn activate_version(&self, table: &str, new_version: u64) -> Result<ActivationOutcome>;
}

pub struct ClickhouseLikeDestination {
    config: TargetConfig,
    reconciler: Arc<SchemaReconciler>,
    writer: BatchWriter,
    activator: VersionActivator,
}

impl ClickhouseLikeDestination {
    /// Validates the configuration before anything touches the database
    pub fn new(config: TargetConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let reconciler = Arc::new(SchemaReconciler::new(
            transport.clone(),
            config.engine_selector()?,
            config.cluster_name.clone(),
        ));
        let writer = BatchWriter::new(
            transport.clone(),
            config.optimize_after,
            config.cluster_name.clone(),
        );
        let mode = if config.hard_delete {
            DeleteMode::Hard(config.hard_delete_cutoff)
        } else {
            DeleteMode::Soft(config.soft_delete_cutoff)
        };
        let activator = VersionActivator::new(transport, reconciler.clone(), mode);

        Ok(Self {
            config,
            reconciler,
            writer,
            activator,
        })
    }

    /// Connect over the HTTP interface
    pub fn connect(config: TargetConfig) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::from_config(&config)?;
        info!(
            host = %config.host,
            database = %config.database,
            engine = config.engine_type.as_deref().unwrap_or("MergeTree"),
            "Connecting to ClickHouse"
        );
        Self::new(config, Arc::new(transport))
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }
}

#[async_trait]
impl Destination for ClickhouseLikeDestination {
    fn connection_url(&self) -> Result<String> {
        self.config.connection_url()
    }

    fn prepare_schema(&self, schema_name: &str) -> Result<()> {
        self.reconciler.prepare_schema(schema_name)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        self.reconciler.table_exists(table).await
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        self.reconciler.column_exists(table, column).await
    }

    async fn table_engine(&self, table: &str) -> Result<Option<String>> {
        self.reconciler.table_engine(table).await
    }

    async fn create_empty_table(
        &self,
        table: &str,
        schema: &StreamSchema,
        primary_keys: &[String],
        as_temp_table: bool,
    ) -> Result<TableDescriptor> {
        self.reconciler
            .create_empty_table(table, schema, primary_keys, as_temp_table)
            .await
    }

    async fn ensure_table(
        &self,
        table: &str,
        schema: &StreamSchema,
        primary_keys: &[String],
    ) -> Result<()> {
        self.reconciler.ensure_table(table, schema, primary_keys).await
    }

    async fn ensure_column(
        &self,
        table: &str,
        column: &str,
        column_type: &ColumnType,
    ) -> Result<()> {
        self.reconciler.ensure_column(table, column, column_type).await
    }

    async fn bulk_insert(
        &self,
        table: &str,
        schema: &StreamSchema,
        records: &[Row],
    ) -> Result<Option<u64>> {
        self.writer.flush(table, schema, records).await
    }

    async fn activate_version(&self, table: &str, new_version: u64) -> Result<ActivationOutcome> {
        self.activator.activate(table, new_version).await
    }
}
