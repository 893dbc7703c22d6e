pub mod confetti;
pub mod csv;
pub mod export;
pub mod query_cache;

pub use confetti::{ConfettiScheduler, Stage};
pub use export::{Column, ExportOutcome};
pub use query_cache::{Operation, QueryCache, QueryState, QuerySubscription};
