use thiserror::Error;

/// Typed failures surfaced by a table service.
///
/// `Clone + PartialEq` so a failure can be broadcast to every subscriber of
/// a cached read and asserted on in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("row not found in {table}: id {id}")]
    RowNotFound { table: String, id: String },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serde(String),
}
