//! Version activation (logical delete of superseded table versions)
//!
//! After a full sync the source announces the version it just wrote. Rows from older versions
//! are then either deleted outright or stamped with `_sdc_deleted_at`. Both paths are
//! asynchronous mutations on the database side; they are submitted here and not awaited.

use crate::error::Result;
use crate::reconciler::SchemaReconciler;
use crate::schema::ColumnType;
use crate::sql::Statement;
use crate::transport::Transport;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub const VERSION_COLUMN: &str = "_sdc_table_version";
pub const DELETED_AT_COLUMN: &str = "_sdc_deleted_at";

/// Whether rows carrying exactly the watermark version are affected
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionCutoff {
    /// `version <= watermark`
    Inclusive,
    /// `version < watermark`
    Exclusive,
}

impl VersionCutoff {
    pub fn operator(&self) -> &'static str {
        match self {
            VersionCutoff::Inclusive => "<=",
            VersionCutoff::Exclusive => "<",
        }
    }

    pub fn matches(&self, row_version: u64, watermark: u64) -> bool {
        match self {
            VersionCutoff::Inclusive => row_version <= watermark,
            VersionCutoff::Exclusive => row_version < watermark,
        }
    }
}

impl fmt::Display for VersionCutoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionCutoff::Inclusive => write!(f, "inclusive"),
            VersionCutoff::Exclusive => write!(f, "exclusive"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteMode {
    Hard(VersionCutoff),
    Soft(VersionCutoff),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// Nothing was ever written for the stream
    NoTable,
    HardDeleted,
    SoftDeleted,
}

pub struct VersionActivator {
    transport: Arc<dyn Transport>,
    reconciler: Arc<SchemaReconciler>,
    mode: DeleteMode,
}

impl VersionActivator {
    pub fn new(
        transport: Arc<dyn Transport>,
        reconciler: Arc<SchemaReconciler>,
        mode: DeleteMode,
    ) -> Self {
        Self {
            transport,
            reconciler,
            mode,
        }
    }

    pub fn mode(&self) -> DeleteMode {
        self.mode
    }

    /// Retire every row older than `new_version`. Re-running with the same version changes
    /// nothing: deleted rows are gone and stamped rows no longer match `deleted_at IS NULL`.
    pub async fn activate(&self, table: &str, new_version: u64) -> Result<ActivationOutcome> {
        if !self.reconciler.table_exists(table).await? {
            debug!(table, version = new_version, "Table does not exist yet, nothing to activate");
            return Ok(ActivationOutcome::NoTable);
        }

        self.reconciler
            .ensure_column(table, VERSION_COLUMN, &ColumnType::Int64.nullable())
            .await?;

        match self.mode {
            DeleteMode::Hard(cutoff) => {
                self.transport
                    .execute(&Statement::DeleteVersions {
                        table: table.to_string(),
                        version_column: VERSION_COLUMN.to_string(),
                        cutoff,
                        version: new_version,
                    })
                    .await?;
                info!(
                    table,
                    version = new_version,
                    cutoff = %cutoff,
                    "Submitted delete of superseded versions"
                );
                Ok(ActivationOutcome::HardDeleted)
            }
            DeleteMode::Soft(cutoff) => {
                self.reconciler
                    .ensure_column(table, DELETED_AT_COLUMN, &ColumnType::DateTime64.nullable())
                    .await?;
                self.transport
                    .execute(&Statement::SoftDeleteVersions {
                        table: table.to_string(),
                        version_column: VERSION_COLUMN.to_string(),
                        deleted_at_column: DELETED_AT_COLUMN.to_string(),
                        cutoff,
                        version: new_version,
                        deleted_at: Utc::now(),
                    })
                    .await?;
                info!(
                    table,
                    version = new_version,
                    cutoff = %cutoff,
                    "Submitted soft delete of superseded versions"
                );
                Ok(ActivationOutcome::SoftDeleted)
            }
        }
    }
}
