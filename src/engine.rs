//! Table engine selection
//!
//! Every table is created with a MergeTree-family engine. The family comes from configuration,
//! the ordering key from the stream's key properties, and replicated families additionally need a
//! coordination path and replica name.

use crate::error::{Result, TargetError};
use itertools::Itertools;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Placeholders substituted with the table name in a replication path template
const TABLE_NAME_PLACEHOLDERS: [&str; 2] = ["{table_name}", "$table_name"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum EngineFamily {
    MergeTree,
    ReplacingMergeTree,
    SummingMergeTree,
    AggregatingMergeTree,
    ReplicatedMergeTree,
    ReplicatedReplacingMergeTree,
    ReplicatedSummingMergeTree,
    ReplicatedAggregatingMergeTree,
}

impl EngineFamily {
    pub const ALL: [EngineFamily; 8] = [
        EngineFamily::MergeTree,
        EngineFamily::ReplacingMergeTree,
        EngineFamily::SummingMergeTree,
        EngineFamily::AggregatingMergeTree,
        EngineFamily::ReplicatedMergeTree,
        EngineFamily::ReplicatedReplacingMergeTree,
        EngineFamily::ReplicatedSummingMergeTree,
        EngineFamily::ReplicatedAggregatingMergeTree,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineFamily::MergeTree => "MergeTree",
            EngineFamily::ReplacingMergeTree => "ReplacingMergeTree",
            EngineFamily::SummingMergeTree => "SummingMergeTree",
            EngineFamily::AggregatingMergeTree => "AggregatingMergeTree",
            EngineFamily::ReplicatedMergeTree => "ReplicatedMergeTree",
            EngineFamily::ReplicatedReplacingMergeTree => "ReplicatedReplacingMergeTree",
            EngineFamily::ReplicatedSummingMergeTree => "ReplicatedSummingMergeTree",
            EngineFamily::ReplicatedAggregatingMergeTree => "ReplicatedAggregatingMergeTree",
        }
    }

    pub fn is_replicated(&self) -> bool {
        match self {
            EngineFamily::MergeTree
            | EngineFamily::ReplacingMergeTree
            | EngineFamily::SummingMergeTree
            | EngineFamily::AggregatingMergeTree => false,
            EngineFamily::ReplicatedMergeTree
            | EngineFamily::ReplicatedReplacingMergeTree
            | EngineFamily::ReplicatedSummingMergeTree
            | EngineFamily::ReplicatedAggregatingMergeTree => true,
        }
    }
}

impl Default for EngineFamily {
    fn default() -> Self {
        EngineFamily::MergeTree
    }
}

impl fmt::Display for EngineFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineFamily {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self> {
        EngineFamily::ALL
            .iter()
            .copied()
            .find(|family| family.as_str() == s)
            .ok_or_else(|| {
                TargetError::Configuration(format!(
                    "Engine type {} is not supported. Supported engines: {}",
                    s,
                    EngineFamily::ALL.iter().map(EngineFamily::as_str).join(", ")
                ))
            })
    }
}

/// Coordination parameters of a replicated table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Replication {
    pub path: String,
    pub replica: String,
}

/// Fully resolved engine clause of one table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineDescriptor {
    pub family: EngineFamily,
    /// Ordering key columns; empty means `ORDER BY tuple()`
    pub order_by: Vec<String>,
    pub replication: Option<Replication>,
}

/// Builds engine descriptors for new tables from validated configuration
#[derive(Clone, Debug)]
pub struct EngineSelector {
    family: EngineFamily,
    table_path: Option<String>,
    replica_name: Option<String>,
}

impl EngineSelector {
    /// Validate the engine configuration. Replicated families fail here, before any DDL, when
    /// the path template or replica name is missing.
    pub fn new(
        engine_type: Option<&str>,
        table_path: Option<&str>,
        replica_name: Option<&str>,
    ) -> Result<Self> {
        let family = match engine_type {
            Some(tag) => tag.parse()?,
            None => EngineFamily::default(),
        };

        let non_empty =
            |value: Option<&str>| value.filter(|v| !v.trim().is_empty()).map(str::to_string);
        let table_path = non_empty(table_path);
        let replica_name = non_empty(replica_name);

        if family.is_replicated() {
            if table_path.is_none() {
                return Err(TargetError::Configuration(format!(
                    "Engine type {} requires `table_path`",
                    family
                )));
            }
            if replica_name.is_none() {
                return Err(TargetError::Configuration(format!(
                    "Engine type {} requires `replica_name`",
                    family
                )));
            }
        }

        Ok(Self {
            family,
            table_path,
            replica_name,
        })
    }

    pub fn family(&self) -> EngineFamily {
        self.family
    }

    pub fn descriptor(&self, table_name: &str, primary_keys: &[String]) -> EngineDescriptor {
        let replication = match (
            self.family.is_replicated(),
            &self.table_path,
            &self.replica_name,
        ) {
            (true, Some(path), Some(replica)) => Some(Replication {
                path: TABLE_NAME_PLACEHOLDERS
                    .iter()
                    .fold(path.clone(), |acc, placeholder| acc.replace(placeholder, table_name)),
                replica: replica.clone(),
            }),
            _ => None,
        };

        EngineDescriptor {
            family: self.family,
            order_by: primary_keys.to_vec(),
            replication,
        }
    }
}
