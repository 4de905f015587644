//! Database transport - the seam between the loading engine and the wire
//!
//! Implementations:
//! - HttpTransport: ClickHouse HTTP interface
//! - MemoryTransport: in-memory double for tests (feature `test-utils`)

pub mod http;

pub use http::HttpTransport;

use crate::error::Result;
use crate::schema::Row;
use crate::sql::{CatalogQuery, Statement};
use async_trait::async_trait;

/// Every call acquires its own connection from the underlying client and releases it when the
/// call returns, on success or failure. Nothing is retried here.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run a DDL statement or mutation
    async fn execute(&self, statement: &Statement) -> Result<()>;

    /// Run a catalog lookup and return its rows
    async fn query(&self, query: &CatalogQuery) -> Result<Vec<Row>>;

    /// Insert all rows in one statement. Returns the number of rows written when the
    /// database reports it.
    async fn insert(&self, table: &str, rows: &[Row]) -> Result<Option<u64>>;
}
