//! Statement builder
//!
//! All SQL sent to the database is rendered here. Identifiers are always backtick-quoted and
//! string literals single-quoted with escaping, since table and column names come straight from
//! configuration and upstream schemas.

use crate::engine::EngineDescriptor;
use crate::schema::{ColumnDescriptor, ColumnType};
use crate::version::VersionCutoff;
use chrono::{DateTime, Utc};
use itertools::Itertools;

pub fn quote_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('`');
    for c in name.chars() {
        match c {
            '`' => out.push_str("\\`"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('`');
    out
}

pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn on_cluster(cluster: Option<&str>) -> String {
    cluster
        .map(|c| format!(" ON CLUSTER {}", quote_identifier(c)))
        .unwrap_or_default()
}

/// Everything needed to create one destination table
#[derive(Clone, Debug, PartialEq)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub engine: EngineDescriptor,
    pub cluster: Option<String>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Statements that change the destination
#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    CreateTable(TableDescriptor),
    AddColumn {
        table: String,
        column: String,
        column_type: ColumnType,
    },
    ModifyColumn {
        table: String,
        column: String,
        column_type: ColumnType,
        cluster: Option<String>,
    },
    Optimize {
        table: String,
        cluster: Option<String>,
    },
    /// Delete mutation removing rows of superseded versions
    DeleteVersions {
        table: String,
        version_column: String,
        cutoff: VersionCutoff,
        version: u64,
    },
    /// Update mutation stamping rows of superseded versions as deleted
    SoftDeleteVersions {
        table: String,
        version_column: String,
        deleted_at_column: String,
        cutoff: VersionCutoff,
        version: u64,
        deleted_at: DateTime<Utc>,
    },
}

impl Statement {
    pub fn table(&self) -> &str {
        match self {
            Statement::CreateTable(descriptor) => &descriptor.name,
            Statement::AddColumn { table, .. }
            | Statement::ModifyColumn { table, .. }
            | Statement::Optimize { table, .. }
            | Statement::DeleteVersions { table, .. }
            | Statement::SoftDeleteVersions { table, .. } => table,
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            Statement::CreateTable(descriptor) => render_create_table(descriptor),
            Statement::AddColumn { table, column, column_type } => format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                quote_identifier(table),
                quote_identifier(column),
                column_type
            ),
            Statement::ModifyColumn { table, column, column_type, cluster } => format!(
                "ALTER TABLE {}{} MODIFY COLUMN {} {}",
                quote_identifier(table),
                on_cluster(cluster.as_deref()),
                quote_identifier(column),
                column_type
            ),
            Statement::Optimize { table, cluster } => format!(
                "OPTIMIZE TABLE {}{} FINAL",
                quote_identifier(table),
                on_cluster(cluster.as_deref())
            ),
            Statement::DeleteVersions { table, version_column, cutoff, version } => format!(
                "ALTER TABLE {} DELETE WHERE {} {} {}",
                quote_identifier(table),
                quote_identifier(version_column),
                cutoff.operator(),
                version
            ),
            Statement::SoftDeleteVersions {
                table,
                version_column,
                deleted_at_column,
                cutoff,
                version,
                deleted_at,
            } => format!(
                "ALTER TABLE {table} UPDATE {deleted} = toDateTime64({ts}, 6, 'UTC') \
                 WHERE {version_col} {op} {version} AND {deleted} IS NULL",
                table = quote_identifier(table),
                deleted = quote_identifier(deleted_at_column),
                ts = quote_literal(&deleted_at.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
                version_col = quote_identifier(version_column),
                op = cutoff.operator(),
                version = version,
            ),
        }
    }
}

fn render_create_table(descriptor: &TableDescriptor) -> String {
    let columns = descriptor
        .columns
        .iter()
        .map(|c| format!("    {} {}", quote_identifier(&c.name), c.column_type))
        .join(",\n");

    let engine = &descriptor.engine;
    let engine_args = match &engine.replication {
        Some(replication) => format!(
            "({}, {})",
            quote_literal(&replication.path),
            quote_literal(&replication.replica)
        ),
        None => String::new(),
    };

    let order_by = if engine.order_by.is_empty() {
        "tuple()".to_string()
    } else {
        format!("({})", engine.order_by.iter().map(|c| quote_identifier(c)).join(", "))
    };

    format!(
        "CREATE TABLE IF NOT EXISTS {}{} (\n{}\n) ENGINE = {}{} ORDER BY {}",
        quote_identifier(&descriptor.name),
        on_cluster(descriptor.cluster.as_deref()),
        columns,
        engine.family,
        engine_args,
        order_by
    )
}

/// Read-only catalog lookups
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatalogQuery {
    /// Returns one row (`name`) if the table exists
    TableExists { table: String },
    /// Returns `name`, `type`, `is_in_sorting_key` per column, in position order
    Columns { table: String },
    /// Returns one row (`engine`) if the table exists
    TableEngine { table: String },
}

impl CatalogQuery {
    pub fn to_sql(&self) -> String {
        match self {
            CatalogQuery::TableExists { table } => format!(
                "SELECT name FROM system.tables WHERE database = currentDatabase() AND name = {}",
                quote_literal(table)
            ),
            CatalogQuery::Columns { table } => format!(
                "SELECT name, type, is_in_sorting_key FROM system.columns \
                 WHERE database = currentDatabase() AND table = {} ORDER BY position",
                quote_literal(table)
            ),
            CatalogQuery::TableEngine { table } => format!(
                "SELECT engine FROM system.tables WHERE database = currentDatabase() AND name = {}",
                quote_literal(table)
            ),
        }
    }
}

pub fn insert_json_rows(table: &str) -> String {
    format!("INSERT INTO {} FORMAT JSONEachRow", quote_identifier(table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineFamily, Replication};
    use chrono::TimeZone;

    fn column(name: &str, column_type: ColumnType, is_key: bool) -> ColumnDescriptor {
        ColumnDescriptor { name: name.into(), column_type, is_key }
    }

    #[test]
    fn test_identifier_escaping() {
        assert_eq!(quote_identifier("users"), "`users`");
        assert_eq!(quote_identifier("we`ird"), "`we\\`ird`");
        assert_eq!(quote_literal("o'brien"), "'o\\'brien'");
        assert_eq!(quote_literal("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn test_create_table_with_ordering_key() {
        let descriptor = TableDescriptor {
            name: "date_type".into(),
            columns: vec![
                column("id", ColumnType::Int64, true),
                column("created", ColumnType::Date.nullable(), false),
            ],
            engine: EngineDescriptor {
                family: EngineFamily::MergeTree,
                order_by: vec!["id".into()],
                replication: None,
            },
            cluster: None,
        };
        assert_eq!(
            Statement::CreateTable(descriptor).to_sql(),
            "CREATE TABLE IF NOT EXISTS `date_type` (\n    `id` Int64,\n    \
             `created` Nullable(Date)\n) ENGINE = MergeTree ORDER BY (`id`)"
        );
    }

    #[test]
    fn test_create_replicated_table_on_cluster_without_keys() {
        let descriptor = TableDescriptor {
            name: "events".into(),
            columns: vec![column("payload", ColumnType::String, false)],
            engine: EngineDescriptor {
                family: EngineFamily::ReplicatedMergeTree,
                order_by: vec![],
                replication: Some(Replication { path: "/ch/events".into(), replica: "r1".into() }),
            },
            cluster: Some("main".into()),
        };
        let sql = Statement::CreateTable(descriptor).to_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `events` ON CLUSTER `main` ("));
        assert!(sql.ends_with("ENGINE = ReplicatedMergeTree('/ch/events', 'r1') ORDER BY tuple()"));
    }

    #[test]
    fn test_alter_statements() {
        let add = Statement::AddColumn {
            table: "t".into(),
            column: "c".into(),
            column_type: ColumnType::Int64.nullable(),
        };
        assert_eq!(add.to_sql(), "ALTER TABLE `t` ADD COLUMN IF NOT EXISTS `c` Nullable(Int64)");

        let modify = Statement::ModifyColumn {
            table: "t".into(),
            column: "c".into(),
            column_type: ColumnType::Float64,
            cluster: Some("main".into()),
        };
        assert_eq!(modify.to_sql(), "ALTER TABLE `t` ON CLUSTER `main` MODIFY COLUMN `c` Float64");
    }

    #[test]
    fn test_version_mutations() {
        let delete = Statement::DeleteVersions {
            table: "t".into(),
            version_column: "_sdc_table_version".into(),
            cutoff: VersionCutoff::Inclusive,
            version: 2,
        };
        assert_eq!(delete.to_sql(), "ALTER TABLE `t` DELETE WHERE `_sdc_table_version` <= 2");

        let soft = Statement::SoftDeleteVersions {
            table: "t".into(),
            version_column: "_sdc_table_version".into(),
            deleted_at_column: "_sdc_deleted_at".into(),
            cutoff: VersionCutoff::Exclusive,
            version: 2,
            deleted_at: Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap(),
        };
        assert_eq!(
            soft.to_sql(),
            "ALTER TABLE `t` UPDATE `_sdc_deleted_at` = \
             toDateTime64('2024-03-15 10:00:00.000000', 6, 'UTC') \
             WHERE `_sdc_table_version` < 2 AND `_sdc_deleted_at` IS NULL"
        );
    }

    #[test]
    fn test_catalog_queries_quote_table_literal() {
        let sql = CatalogQuery::Columns { table: "x'; DROP".into() }.to_sql();
        assert!(sql.contains("table = 'x\\'; DROP'"));
    }
}
