//! In-process relational store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use sync_core::{ChangeKind, Record, RecordChange, RecordId};

use crate::feed::{ChangeFeed, FeedSender};
use crate::{RelationalStore, RowFilter};

const FEED_CAPACITY: usize = 64;

/// One call to [`RelationalStore::upsert`], as recorded by
/// [`MemoryRelationalStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertCall {
    pub collection: String,
    pub ids: Vec<RecordId>,
}

struct Subscriber {
    kinds: Vec<ChangeKind>,
    sender: FeedSender,
}

type Tables = HashMap<String, BTreeMap<RecordId, Record>>;

/// Relational store holding tables in memory.
///
/// Like the PostgreSQL store, upserts are not echoed on change feeds. Changes
/// made by other writers are simulated with [`Self::apply_external_change`].
#[derive(Default)]
pub struct MemoryRelationalStore {
    tables: Mutex<Tables>,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    failing: Mutex<HashSet<String>>,
    upserts: Mutex<Vec<UpsertCall>>,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a row in place directly, without notifying subscribers.
    pub fn insert(&self, collection: &str, record: Record) -> Result<()> {
        let id = record.id()?;
        lock(&self.tables)
            .entry(collection.to_string())
            .or_default()
            .insert(id, record);
        Ok(())
    }

    pub fn get(&self, collection: &str, id: &RecordId) -> Option<Record> {
        lock(&self.tables)
            .get(collection)
            .and_then(|t| t.get(id))
            .cloned()
    }

    /// All rows of a table, ordered by id.
    pub fn rows(&self, collection: &str) -> Vec<Record> {
        lock(&self.tables)
            .get(collection)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every upsert made so far, in call order.
    pub fn upsert_calls(&self) -> Vec<UpsertCall> {
        lock(&self.upserts).clone()
    }

    /// Number of open change feeds on a table.
    pub fn subscriber_count(&self, collection: &str) -> usize {
        lock(&self.subscribers)
            .get(collection)
            .map_or(0, |subs| subs.iter().filter(|s| !s.sender.is_closed()).count())
    }

    /// Make every operation on `collection` fail until [`Self::heal`].
    pub fn fail_collection(&self, collection: &str) {
        lock(&self.failing).insert(collection.to_string());
    }

    pub fn heal(&self, collection: &str) {
        lock(&self.failing).remove(collection);
    }

    /// Apply a change as another writer would, notifying subscribers.
    pub async fn apply_external_change(&self, collection: &str, change: RecordChange) -> Result<()> {
        {
            let mut tables = lock(&self.tables);
            let table = tables.entry(collection.to_string()).or_default();
            match &change {
                RecordChange::Insert { record } | RecordChange::Update { record } => {
                    table.insert(record.id()?, record.clone());
                }
                RecordChange::Delete { id } => {
                    table.remove(id);
                }
            }
        }

        let senders: Vec<FeedSender> = {
            let mut subscribers = lock(&self.subscribers);
            let subs = subscribers.entry(collection.to_string()).or_default();
            subs.retain(|s| !s.sender.is_closed());
            subs.iter()
                .filter(|s| s.kinds.contains(&change.kind()))
                .map(|s| s.sender.clone())
                .collect()
        };
        for sender in senders {
            sender.send(change.clone()).await;
        }
        Ok(())
    }

    fn check(&self, collection: &str) -> Result<()> {
        if lock(&self.failing).contains(collection) {
            anyhow::bail!("Table '{collection}' is unavailable");
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn upsert(&self, collection: &str, records: &[Record], conflict_key: &str) -> Result<u64> {
        self.check(collection)?;

        let mut keyed = Vec::with_capacity(records.len());
        for record in records {
            let key = record
                .get(conflict_key)
                .and_then(RecordId::from_value)
                .with_context(|| format!("Record has no usable '{conflict_key}' field"))?;
            keyed.push((key, record));
        }

        let mut tables = lock(&self.tables);
        let table = tables.entry(collection.to_string()).or_default();
        for (key, record) in &keyed {
            let row = table.entry(key.clone()).or_default();
            for (field, value) in record.fields() {
                row.insert(field.clone(), value.clone());
            }
        }
        drop(tables);

        lock(&self.upserts).push(UpsertCall {
            collection: collection.to_string(),
            ids: keyed.into_iter().map(|(key, _)| key).collect(),
        });
        Ok(records.len() as u64)
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        self.check(collection)?;
        Ok(lock(&self.tables).get(collection).map_or(0, |t| t.len() as u64))
    }

    async fn select(&self, collection: &str, columns: &[&str], filter: &RowFilter) -> Result<Vec<Record>> {
        self.check(collection)?;

        let tables = lock(&self.tables);
        let Some(table) = tables.get(collection) else {
            return Ok(Vec::new());
        };
        let rows: Vec<&Record> = match filter {
            RowFilter::All => table.values().collect(),
            RowFilter::Ids(ids) => ids.iter().filter_map(|id| table.get(id)).collect(),
        };

        Ok(rows
            .into_iter()
            .map(|row| {
                if columns.is_empty() {
                    return row.clone();
                }
                Record::from_map(
                    row.fields()
                        .filter(|(k, _)| columns.contains(&k.as_str()))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                )
            })
            .collect())
    }

    async fn subscribe(&self, collection: &str, kinds: &[ChangeKind]) -> Result<ChangeFeed> {
        self.check(collection)?;

        let (sender, feed) = ChangeFeed::channel(collection, FEED_CAPACITY);
        lock(&self.subscribers)
            .entry(collection.to_string())
            .or_default()
            .push(Subscriber {
                kinds: kinds.to_vec(),
                sender,
            });
        Ok(feed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        Record::try_from(value).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryRelationalStore::new();
        let batch = vec![
            record(json!({"id": "a", "name": "Cut"})),
            record(json!({"id": "b", "name": "Color"})),
        ];

        store.upsert("services", &batch, "id").await.unwrap();
        store.upsert("services", &batch, "id").await.unwrap();

        assert_eq!(store.count("services").await.unwrap(), 2);
        assert_eq!(store.upsert_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_replaces_fields() {
        let store = MemoryRelationalStore::new();
        store
            .upsert("services", &[record(json!({"id": "a", "name": "Cut", "price": 10}))], "id")
            .await
            .unwrap();
        store
            .upsert("services", &[record(json!({"id": "a", "name": "Trim"}))], "id")
            .await
            .unwrap();

        let row = store.get("services", &RecordId::from("a")).unwrap();
        assert_eq!(row.get("name"), Some(&json!("Trim")));
        assert_eq!(row.get("price"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn test_select_by_ids_and_columns() {
        let store = MemoryRelationalStore::new();
        for id in ["a", "b", "c"] {
            store
                .insert("pages", record(json!({"id": id, "title": id, "body": "..."})))
                .unwrap();
        }

        let rows = store
            .select(
                "pages",
                &["id", "title"],
                &RowFilter::Ids(vec![RecordId::from("c"), RecordId::from("a"), RecordId::from("z")]),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], record(json!({"id": "c", "title": "c"})));
    }

    #[tokio::test]
    async fn test_external_changes_reach_matching_subscribers() {
        let store = MemoryRelationalStore::new();
        let mut all = store.subscribe("users", &ChangeKind::ALL).await.unwrap();
        let mut deletes = store
            .subscribe("users", &[ChangeKind::Delete])
            .await
            .unwrap();

        store
            .apply_external_change(
                "users",
                RecordChange::Insert {
                    record: record(json!({"id": "u1"})),
                },
            )
            .await
            .unwrap();
        store
            .apply_external_change("users", RecordChange::Delete { id: RecordId::from("u1") })
            .await
            .unwrap();

        assert_eq!(all.recv().await.unwrap().kind(), ChangeKind::Insert);
        assert_eq!(all.recv().await.unwrap().kind(), ChangeKind::Delete);
        assert_eq!(deletes.recv().await.unwrap().kind(), ChangeKind::Delete);
        assert!(store.get("users", &RecordId::from("u1")).is_none());
    }

    #[tokio::test]
    async fn test_upserts_are_not_echoed() {
        let store = MemoryRelationalStore::new();
        let mut feed = store.subscribe("users", &ChangeKind::ALL).await.unwrap();

        store
            .upsert("users", &[record(json!({"id": "u1"}))], "id")
            .await
            .unwrap();
        assert!(feed.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_feeds_are_not_counted() {
        let store = MemoryRelationalStore::new();
        let feed = store.subscribe("users", &ChangeKind::ALL).await.unwrap();
        assert_eq!(store.subscriber_count("users"), 1);

        drop(feed);
        assert_eq!(store.subscriber_count("users"), 0);
    }

    #[tokio::test]
    async fn test_failing_table() {
        let store = MemoryRelationalStore::new();
        store.fail_collection("users");
        assert!(store
            .upsert("users", &[record(json!({"id": "u1"}))], "id")
            .await
            .is_err());
        assert!(store.upsert_calls().is_empty());

        store.heal("users");
        assert_eq!(
            store
                .upsert("users", &[record(json!({"id": "u1"}))], "id")
                .await
                .unwrap(),
            1
        );
    }
}
