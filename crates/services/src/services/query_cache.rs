//! Query cache and fetch coordinator.
//!
//! Owns the process-wide cache of table reads. A read is identified by the
//! full `(table, spec)` structure; all subscribers to the same identity
//! share one cache entry and at most one outstanding remote call. A
//! successful mutation on a table marks every cached read for that table
//! stale and schedules a single refetch of the ones with live subscribers.
//!
//! The cache is an explicitly owned service: construct it once per process
//! and hand clones to consumers. Nothing outside this module mutates
//! entries.

use std::{sync::Arc, time::Duration};

use client::{ClientError, QueryKey, QuerySpec, Row, TableClient};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};
use tokio::{sync::watch, time::interval};
use tracing::{debug, warn};

/// Lifecycle of one cached read, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState {
    Idle,
    Loading,
    Ready(Arc<Vec<Row>>),
    Failed(ClientError),
}

impl QueryState {
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            QueryState::Ready(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ClientError> {
        match self {
            QueryState::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, QueryState::Loading)
    }
}

/// Write operations the coordinator dispatches. Closed set: an unsupported
/// operation is unrepresentable rather than a runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

struct CacheEntry {
    table: String,
    spec: QuerySpec,
    tx: watch::Sender<QueryState>,
    stale: bool,
    in_flight: bool,
}

struct Inner {
    client: Arc<dyn TableClient>,
    entries: DashMap<QueryKey, CacheEntry>,
}

impl Inner {
    /// Launch the single fetch for a loading entry. The caller must have
    /// already set `in_flight` and published `Loading` under the entry
    /// lock; this only performs the remote call and publishes the result.
    fn spawn_fetch(self: &Arc<Self>, key: QueryKey) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let (table, spec) = match inner.entries.get(&key) {
                Some(entry) => (entry.table.clone(), entry.spec.clone()),
                None => return,
            };
            let result = inner.client.query(&table, &spec).await;

            let relaunch = {
                let Some(mut entry) = inner.entries.get_mut(&key) else {
                    return;
                };
                entry.in_flight = false;
                match result {
                    Ok(rows) => {
                        debug!(table = %entry.table, rows = rows.len(), "query resolved");
                        entry.tx.send_replace(QueryState::Ready(Arc::new(rows)));
                    }
                    Err(error) => {
                        warn!(table = %entry.table, %error, "query failed");
                        entry.tx.send_replace(QueryState::Failed(error));
                    }
                }
                // The entry was invalidated while this fetch was in the
                // air: the published result is already stale, so go one
                // more round for the remaining subscribers.
                if entry.stale && entry.tx.receiver_count() > 0 {
                    entry.stale = false;
                    entry.in_flight = true;
                    entry.tx.send_replace(QueryState::Loading);
                    true
                } else {
                    false
                }
            };
            if relaunch {
                inner.spawn_fetch(key);
            }
        });
    }
}

/// Handle to one cached read. Dropping it drops subscriber interest only;
/// an in-flight remote call still completes and populates the cache.
pub struct QuerySubscription {
    key: QueryKey,
    rx: watch::Receiver<QueryState>,
}

impl QuerySubscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Current state, available synchronously.
    pub fn current(&self) -> QueryState {
        self.rx.borrow().clone()
    }

    /// Wait for the next state transition and return it.
    pub async fn changed(&mut self) -> QueryState {
        let _ = self.rx.changed().await;
        self.current()
    }

    /// Wait until the read settles, returning rows or the remote failure.
    pub async fn wait_ready(&mut self) -> Result<Arc<Vec<Row>>, ClientError> {
        loop {
            match self.rx.borrow_and_update().clone() {
                QueryState::Ready(rows) => return Ok(rows),
                QueryState::Failed(error) => return Err(error),
                QueryState::Idle | QueryState::Loading => {}
            }
            if self.rx.changed().await.is_err() {
                return Err(ClientError::Unavailable("cached read evicted".into()));
            }
        }
    }
}

/// The coordinator. Cheap to clone; all clones share one cache.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    pub fn new(client: Arc<dyn TableClient>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                entries: DashMap::new(),
            }),
        }
    }

    /// Subscribe to a cached read of `table` under `spec`.
    ///
    /// A fresh or stale entry transitions to `Loading` and issues exactly
    /// one remote call for the whole loading phase: the in-flight marker is
    /// set under the entry lock before the call is spawned, so concurrent
    /// subscribers to the same key always share it. An entry that is
    /// already settled is a synchronous cache hit.
    pub fn read(&self, table: &str, spec: QuerySpec) -> QuerySubscription {
        let key = spec.cache_key(table);
        let mut launch = false;
        let rx = {
            let mut entry = self
                .inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry {
                    table: table.to_string(),
                    spec,
                    tx: watch::channel(QueryState::Idle).0,
                    stale: false,
                    in_flight: false,
                });
            let needs_fetch = entry.stale || matches!(*entry.tx.borrow(), QueryState::Idle);
            if needs_fetch && !entry.in_flight {
                entry.stale = false;
                entry.in_flight = true;
                entry.tx.send_replace(QueryState::Loading);
                launch = true;
            }
            entry.tx.subscribe()
        };
        if launch {
            self.inner.spawn_fetch(key.clone());
        }
        QuerySubscription { key, rx }
    }

    /// Perform a guarded write and invalidate the table's cached reads.
    ///
    /// `Update` takes the `id` out of the payload and sends the rest as the
    /// patch; `Delete` uses only the `id`. A payload without an id is
    /// passed through as `Null` for the remote service to reject; the
    /// coordinator does no required-field validation of its own. On
    /// failure the cache is untouched and the error is returned verbatim,
    /// never retried.
    ///
    /// Returns the written row for `Insert`/`Update`, `None` for `Delete`.
    pub async fn mutate(
        &self,
        table: &str,
        operation: Operation,
        mut payload: Row,
    ) -> Result<Option<Row>, ClientError> {
        let outcome = match operation {
            Operation::Insert => self.inner.client.insert(table, payload).await.map(Some),
            Operation::Update => {
                let id = payload.remove("id").unwrap_or(Value::Null);
                self.inner.client.update(table, &id, payload).await.map(Some)
            }
            Operation::Delete => {
                let id = payload.get("id").cloned().unwrap_or(Value::Null);
                self.inner.client.delete(table, &id).await.map(|()| None)
            }
        };

        match outcome {
            Ok(row) => {
                debug!(table, op = %operation, "mutation acknowledged");
                self.invalidate_table(table);
                Ok(row)
            }
            Err(error) => {
                warn!(table, op = %operation, %error, "mutation failed, cache untouched");
                Err(error)
            }
        }
    }

    /// Mark every cached read for `table` stale and schedule one refetch
    /// of each entry that still has subscribers. Entries without
    /// subscribers stay stale until the next read. Other tables are never
    /// touched.
    pub fn invalidate_table(&self, table: &str) {
        let mut refetch = Vec::new();
        for mut entry in self.inner.entries.iter_mut() {
            if entry.table != table {
                continue;
            }
            entry.stale = true;
            if entry.tx.receiver_count() > 0 && !entry.in_flight {
                entry.stale = false;
                entry.in_flight = true;
                entry.tx.send_replace(QueryState::Loading);
                refetch.push(entry.key().clone());
            }
        }
        if !refetch.is_empty() {
            debug!(table, reads = refetch.len(), "invalidated cached reads");
        }
        for key in refetch {
            self.inner.spawn_fetch(key);
        }
    }

    /// Drop entries with no subscribers and no in-flight fetch. Returns
    /// how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let before = self.inner.entries.len();
        self.inner
            .entries
            .retain(|_, entry| entry.tx.receiver_count() > 0 || entry.in_flight);
        before - self.inner.entries.len()
    }

    /// Background eviction loop. Eviction has no deadline guarantee; this
    /// just bounds "eventually".
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticks = interval(every);
            loop {
                ticks.tick().await;
                let evicted = cache.evict_idle();
                if evicted > 0 {
                    debug!(evicted, "evicted idle cache entries");
                }
            }
        })
    }

    /// Number of live cache entries (for tests and diagnostics).
    pub fn cached_entries(&self) -> usize {
        self.inner.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use client::MemoryTableClient;
    use serde_json::json;

    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn seeded_client() -> Arc<MemoryTableClient> {
        let client = MemoryTableClient::new();
        client
            .seed(
                "invoices",
                vec![
                    row(&[
                        ("id", json!("1")),
                        ("status", json!("paid")),
                        ("region", json!("north")),
                    ]),
                    row(&[
                        ("id", json!("2")),
                        ("status", json!("draft")),
                        ("region", json!("south")),
                    ]),
                ],
            )
            .await;
        client
            .seed("sales", vec![row(&[("id", json!("s1")), ("amount", json!(9))])])
            .await;
        Arc::new(client)
    }

    #[tokio::test]
    async fn concurrent_subscribers_share_one_remote_call() {
        let client = seeded_client().await;
        let cache = QueryCache::new(client.clone());
        let spec = QuerySpec::new().eq("status", "paid");

        let mut a = cache.read("invoices", spec.clone());
        let mut b = cache.read("invoices", spec.clone());
        let c = cache.read("invoices", spec);

        assert!(a.current().is_loading());
        assert!(c.current().is_loading());

        let rows = a.wait_ready().await.unwrap();
        assert_eq!(rows.len(), 1);
        b.wait_ready().await.unwrap();

        assert_eq!(client.query_calls("invoices"), 1);
        assert_eq!(cache.cached_entries(), 1);
    }

    #[tokio::test]
    async fn structural_equality_defines_the_entry() {
        let client = seeded_client().await;
        let cache = QueryCache::new(client.clone());

        // Same constraints, different insertion order: one entry.
        let mut a = cache.read(
            "invoices",
            QuerySpec::new().eq("status", "paid").eq("region", "north"),
        );
        let mut b = cache.read(
            "invoices",
            QuerySpec::new().eq("region", "north").eq("status", "paid"),
        );
        a.wait_ready().await.unwrap();
        b.wait_ready().await.unwrap();
        assert_eq!(client.query_calls("invoices"), 1);

        // Any field differing means a distinct entry.
        let mut c = cache.read(
            "invoices",
            QuerySpec::new().eq("status", "paid").eq("region", "north").limit(5),
        );
        c.wait_ready().await.unwrap();
        assert_eq!(client.query_calls("invoices"), 2);
        assert_eq!(cache.cached_entries(), 2);
    }

    #[tokio::test]
    async fn settled_entry_is_a_synchronous_hit() {
        let client = seeded_client().await;
        let cache = QueryCache::new(client.clone());
        let spec = QuerySpec::new();

        let mut first = cache.read("invoices", spec.clone());
        first.wait_ready().await.unwrap();

        let second = cache.read("invoices", spec);
        assert!(second.current().rows().is_some());
        assert_eq!(client.query_calls("invoices"), 1);
    }

    #[tokio::test]
    async fn mutation_invalidates_every_read_of_that_table_only() {
        let client = seeded_client().await;
        let cache = QueryCache::new(client.clone());

        let mut all = cache.read("invoices", QuerySpec::new());
        let mut paid = cache.read("invoices", QuerySpec::new().eq("status", "paid"));
        let mut sales = cache.read("sales", QuerySpec::new());
        all.wait_ready().await.unwrap();
        paid.wait_ready().await.unwrap();
        sales.wait_ready().await.unwrap();
        assert_eq!(client.query_calls("invoices"), 2);
        assert_eq!(client.query_calls("sales"), 1);

        let inserted = cache
            .mutate(
                "invoices",
                Operation::Insert,
                row(&[("status", json!("paid")), ("region", json!("east"))]),
            )
            .await
            .unwrap()
            .expect("insert returns the stored row");
        assert!(inserted.get("id").is_some());

        let rows = all.wait_ready().await.unwrap();
        assert_eq!(rows.len(), 3);
        let rows = paid.wait_ready().await.unwrap();
        assert_eq!(rows.len(), 2);

        assert_eq!(client.query_calls("invoices"), 4);
        // Other tables are untouched.
        assert_eq!(client.query_calls("sales"), 1);
        assert!(sales.current().rows().is_some());
    }

    #[tokio::test]
    async fn update_sends_patch_without_id_delete_sends_id_only() {
        let client = seeded_client().await;
        let cache = QueryCache::new(client.clone());

        cache
            .mutate(
                "invoices",
                Operation::Update,
                row(&[("id", json!("2")), ("status", json!("paid"))]),
            )
            .await
            .unwrap();
        let (id, patch) = client.last_update().unwrap();
        assert_eq!(id, json!("2"));
        assert_eq!(patch, row(&[("status", json!("paid"))]));

        cache
            .mutate(
                "invoices",
                Operation::Delete,
                row(&[("id", json!("1")), ("reason", json!("duplicate"))]),
            )
            .await
            .unwrap();
        assert_eq!(client.last_delete(), Some(json!("1")));
    }

    #[tokio::test]
    async fn missing_id_is_passed_through_and_rejected_remotely() {
        let client = seeded_client().await;
        let cache = QueryCache::new(client.clone());

        let err = cache
            .mutate(
                "invoices",
                Operation::Update,
                row(&[("status", json!("paid"))]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::BadRequest(_)));
        assert_eq!(client.last_update().unwrap().0, Value::Null);
    }

    #[tokio::test]
    async fn failed_mutation_leaves_the_cache_untouched() {
        let client = seeded_client().await;
        let cache = QueryCache::new(client.clone());

        let mut sub = cache.read("invoices", QuerySpec::new());
        let rows = sub.wait_ready().await.unwrap();
        assert_eq!(client.query_calls("invoices"), 1);

        client.fail_next(ClientError::Unavailable("maintenance".into()));
        let err = cache
            .mutate("invoices", Operation::Insert, Row::new())
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Unavailable("maintenance".into()));

        // No invalidation, no refetch, same data.
        assert_eq!(client.query_calls("invoices"), 1);
        assert_eq!(sub.current().rows(), Some(rows.as_slice()));
    }

    #[tokio::test]
    async fn remote_failure_is_broadcast_verbatim() {
        let client = seeded_client().await;
        let cache = QueryCache::new(client.clone());

        client.fail_next(ClientError::Unavailable("maintenance".into()));
        let mut sub = cache.read("invoices", QuerySpec::new());
        let err = sub.wait_ready().await.unwrap_err();
        assert_eq!(err, ClientError::Unavailable("maintenance".into()));
        assert_eq!(sub.current().error(), Some(&err));
    }

    #[tokio::test]
    async fn stale_entry_without_subscribers_waits_for_the_next_read() {
        let client = seeded_client().await;
        let cache = QueryCache::new(client.clone());

        let mut sub = cache.read("invoices", QuerySpec::new());
        sub.wait_ready().await.unwrap();
        drop(sub);

        cache
            .mutate(
                "invoices",
                Operation::Delete,
                row(&[("id", json!("1"))]),
            )
            .await
            .unwrap();
        // No live subscribers: marked stale, not refetched.
        assert_eq!(client.query_calls("invoices"), 1);

        let mut sub = cache.read("invoices", QuerySpec::new());
        let rows = sub.wait_ready().await.unwrap();
        assert_eq!(client.query_calls("invoices"), 2);
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn dropping_a_subscription_does_not_cancel_the_fetch() {
        let client = seeded_client().await;
        let cache = QueryCache::new(client.clone());

        let sub = cache.read("invoices", QuerySpec::new());
        drop(sub);

        // The in-flight call completes and populates the entry for the
        // next subscriber without a second remote call.
        let mut sub = cache.read("invoices", QuerySpec::new());
        sub.wait_ready().await.unwrap();
        assert_eq!(client.query_calls("invoices"), 1);
    }

    #[tokio::test]
    async fn idle_entries_are_evicted_eventually() {
        let client = seeded_client().await;
        let cache = QueryCache::new(client.clone());

        let mut a = cache.read("invoices", QuerySpec::new());
        let mut b = cache.read("sales", QuerySpec::new());
        a.wait_ready().await.unwrap();
        b.wait_ready().await.unwrap();
        assert_eq!(cache.cached_entries(), 2);

        // Nothing to evict while subscribers are alive.
        assert_eq!(cache.evict_idle(), 0);

        drop(a);
        drop(b);
        assert_eq!(cache.evict_idle(), 2);
        assert_eq!(cache.cached_entries(), 0);
    }
}
