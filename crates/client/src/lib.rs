//! Remote table client boundary.
//!
//! Everything above this crate talks to the row store through the narrow
//! [`TableClient`] capability: per-table query/insert/update/delete over
//! schema-less [`Row`]s, with the table name as a runtime value. The full
//! remote surface never leaks past this trait.

use async_trait::async_trait;
use serde_json::Value;

pub mod error;
pub mod memory;
pub mod spec;

pub use error::ClientError;
pub use memory::MemoryTableClient;
pub use spec::{OrderBy, QueryKey, QuerySpec, Row};

/// Capability interface over a row-oriented remote table service.
///
/// Implementations resolve every call to either rows or a typed failure;
/// they never retry on their own.
#[async_trait]
pub trait TableClient: Send + Sync {
    /// Fetch rows matching `spec`: AND-combined equality filter, optional
    /// single-column sort, `limit` truncation after ordering, then the
    /// projection.
    async fn query(&self, table: &str, spec: &QuerySpec) -> Result<Vec<Row>, ClientError>;

    /// Insert one row. The service assigns an `id` when the caller did not
    /// supply one; the stored row is returned.
    async fn insert(&self, table: &str, row: Row) -> Result<Row, ClientError>;

    /// Apply `patch` to the row whose `id` column equals `id`. Callers that
    /// failed to provide an id pass [`Value::Null`], which the service
    /// rejects like any other unmatched filter.
    async fn update(&self, table: &str, id: &Value, patch: Row) -> Result<Row, ClientError>;

    /// Delete the row whose `id` column equals `id`. Same id semantics as
    /// [`TableClient::update`].
    async fn delete(&self, table: &str, id: &Value) -> Result<(), ClientError>;
}
