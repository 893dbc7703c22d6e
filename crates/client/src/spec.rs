//! Query specification: the full description of one read, and therefore
//! the identity of one cache entry.

use std::{collections::BTreeMap, fmt::Write as _};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One schema-less record returned by the table service.
pub type Row = serde_json::Map<String, Value>;

/// Single-column remote sort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

/// Describes a read: projection, equality filter, order, limit.
///
/// Two specs are cache-equivalent only when every field compares equal by
/// value; the whole structure, not just the table name, feeds the cache
/// key. The filter is a `BTreeMap` so the key derivation is deterministic.
///
/// Filters are AND-combined equality pairs only. Richer predicates (ranges,
/// negation, OR) would be a tagged filter-expression variant, not a wider
/// map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub select: Option<String>,
    pub filter: BTreeMap<String, Value>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the returned columns to a comma-separated projection.
    pub fn select(mut self, projection: impl Into<String>) -> Self {
        self.select = Some(projection.into());
        self
    }

    /// Add an equality constraint. Multiple constraints are AND-combined.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order_by = Some(OrderBy {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Derive the cache key for this spec against `table`.
    ///
    /// Structurally equal `(table, spec)` pairs always produce equal keys:
    /// every field is serialised into the key in a fixed order.
    pub fn cache_key(&self, table: &str) -> QueryKey {
        let mut key = format!("{table}|{}|", self.select.as_deref().unwrap_or("*"));
        for (field, value) in &self.filter {
            let _ = write!(key, "{field}={value};");
        }
        key.push('|');
        if let Some(order) = &self.order_by {
            let _ = write!(
                key,
                "{}:{}",
                order.column,
                if order.ascending { "asc" } else { "desc" }
            );
        }
        key.push('|');
        if let Some(limit) = self.limit {
            let _ = write!(key, "{limit}");
        }
        QueryKey(key)
    }

    /// Whether `row` satisfies every equality constraint in the filter.
    pub fn matches(&self, row: &Row) -> bool {
        self.filter
            .iter()
            .all(|(field, expected)| row.get(field) == Some(expected))
    }
}

/// Opaque cache identity of one `(table, spec)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(String);

impl QueryKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
