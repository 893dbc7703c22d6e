//! In-memory [`TableClient`] used by tests and local development.
//!
//! Behaves like the hosted service at the interface boundary: tables are
//! declared up front (seeding fixtures or [`MemoryTableClient::create_table`]),
//! ids are server-assigned on insert, and unknown tables or unmatched id
//! filters come back as typed failures. The introspection accessors exist so
//! the coordinator's de-duplication and invalidation guarantees can be
//! asserted against real call traffic.

use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::Mutex,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::{ClientError, QuerySpec, Row, TableClient};

#[derive(Default)]
pub struct MemoryTableClient {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    fail_next: Mutex<Option<ClientError>>,
    query_calls: Mutex<HashMap<String, usize>>,
    last_update: Mutex<Option<(Value, Row)>>,
    last_delete: Mutex<Option<Value>>,
}

impl MemoryTableClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an empty table.
    pub async fn create_table(&self, table: impl Into<String>) {
        self.tables.write().await.entry(table.into()).or_default();
    }

    /// Replace the contents of `table` with `rows`.
    pub async fn seed(&self, table: impl Into<String>, rows: Vec<Row>) {
        self.tables.write().await.insert(table.into(), rows);
    }

    /// Make the next call (of any kind) fail with `error`.
    pub fn fail_next(&self, error: ClientError) {
        *self.fail_next.lock().expect("fail_next lock") = Some(error);
    }

    /// How many `query` calls reached this table so far.
    pub fn query_calls(&self, table: &str) -> usize {
        self.query_calls
            .lock()
            .expect("query_calls lock")
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    /// The `(id, patch)` pair of the most recent update call.
    pub fn last_update(&self) -> Option<(Value, Row)> {
        self.last_update.lock().expect("last_update lock").clone()
    }

    /// The id filter of the most recent delete call.
    pub fn last_delete(&self) -> Option<Value> {
        self.last_delete.lock().expect("last_delete lock").clone()
    }

    fn take_failure(&self) -> Option<ClientError> {
        self.fail_next.lock().expect("fail_next lock").take()
    }
}

#[async_trait]
impl TableClient for MemoryTableClient {
    async fn query(&self, table: &str, spec: &QuerySpec) -> Result<Vec<Row>, ClientError> {
        *self
            .query_calls
            .lock()
            .expect("query_calls lock")
            .entry(table.to_string())
            .or_insert(0) += 1;
        if let Some(error) = self.take_failure() {
            return Err(error);
        }

        let tables = self.tables.read().await;
        let rows = tables
            .get(table)
            .ok_or_else(|| ClientError::TableNotFound(table.to_string()))?;

        let mut matched: Vec<Row> = rows.iter().filter(|r| spec.matches(r)).cloned().collect();

        if let Some(order) = &spec.order_by {
            matched.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                );
                if order.ascending { ord } else { ord.reverse() }
            });
        }
        if let Some(limit) = spec.limit {
            matched.truncate(limit);
        }
        if let Some(projection) = spec.select.as_deref().filter(|p| p.trim() != "*") {
            let keep: Vec<&str> = projection.split(',').map(str::trim).collect();
            matched = matched
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .filter(|(field, _)| keep.contains(&field.as_str()))
                        .collect()
                })
                .collect();
        }

        debug!(table, rows = matched.len(), "memory query");
        Ok(matched)
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, ClientError> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }

        let mut tables = self.tables.write().await;
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| ClientError::TableNotFound(table.to_string()))?;

        if !row.contains_key("id") {
            row.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        }
        rows.push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: &str, id: &Value, patch: Row) -> Result<Row, ClientError> {
        *self.last_update.lock().expect("last_update lock") = Some((id.clone(), patch.clone()));
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        if id.is_null() {
            return Err(ClientError::BadRequest(
                "update requires an id filter".into(),
            ));
        }

        let mut tables = self.tables.write().await;
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| ClientError::TableNotFound(table.to_string()))?;

        let row = rows
            .iter_mut()
            .find(|r| r.get("id") == Some(id))
            .ok_or_else(|| ClientError::RowNotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;
        for (field, value) in patch {
            row.insert(field, value);
        }
        Ok(row.clone())
    }

    async fn delete(&self, table: &str, id: &Value) -> Result<(), ClientError> {
        *self.last_delete.lock().expect("last_delete lock") = Some(id.clone());
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        if id.is_null() {
            return Err(ClientError::BadRequest(
                "delete requires an id filter".into(),
            ));
        }

        let mut tables = self.tables.write().await;
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| ClientError::TableNotFound(table.to_string()))?;

        let before = rows.len();
        rows.retain(|r| r.get("id") != Some(id));
        if rows.len() == before {
            return Err(ClientError::RowNotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

/// Sort order over heterogeneous JSON scalars: nulls first, numbers and
/// strings by their natural order, anything else by its serialised form.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .total_cmp(&y.as_f64().unwrap_or(0.0)),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}
