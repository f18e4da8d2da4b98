//! In-process content store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use sync_core::{Record, RecordId};

use crate::{ContentStore, ContentStoreError, FindQuery, Result, SortOrder};

type Collections = HashMap<String, BTreeMap<RecordId, Record>>;

/// Content store holding collections in memory.
///
/// Collections can be switched into a failing mode, in which every operation
/// on them returns a backend error.
pub struct MemoryContentStore {
    collections: Mutex<Collections>,
    failing: Mutex<HashSet<String>>,
    updated_field: String,
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::with_updated_field("updatedAt")
    }

    pub fn with_updated_field(updated_field: impl Into<String>) -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            updated_field: updated_field.into(),
        }
    }

    /// Put a record in place directly, replacing any record with its id.
    pub fn insert(&self, collection: &str, record: Record) -> std::result::Result<(), sync_core::RecordError> {
        let id = record.id()?;
        self.lock()
            .entry(collection.to_string())
            .or_default()
            .insert(id, record);
        Ok(())
    }

    pub fn get(&self, collection: &str, id: &RecordId) -> Option<Record> {
        self.lock().get(collection).and_then(|c| c.get(id)).cloned()
    }

    /// All records of a collection, ordered by id.
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.lock()
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every operation on `collection` fail until [`Self::heal`].
    pub fn fail_collection(&self, collection: &str) {
        lock(&self.failing).insert(collection.to_string());
    }

    pub fn heal(&self, collection: &str) {
        lock(&self.failing).remove(collection);
    }

    fn check(&self, collection: &str) -> Result<()> {
        if lock(&self.failing).contains(collection) {
            return Err(anyhow::anyhow!("Collection '{collection}' is unavailable").into());
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        lock(&self.collections)
    }

    fn updated_at(&self, record: &Record) -> Option<DateTime<Utc>> {
        record.timestamp(&self.updated_field)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Record>> {
        self.check(collection)?;

        let guard = self.lock();
        let Some(records) = guard.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<(Option<DateTime<Utc>>, &RecordId, &Record)> = records
            .iter()
            .map(|(id, record)| (self.updated_at(record), id, record))
            .filter(|(updated, _, _)| match (query.updated_after, updated) {
                (Some(after), Some(at)) => *at > after,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .filter(|(updated, id, _)| match (query.updated_until, updated) {
                (Some(until), Some(at)) => match &query.before_id {
                    Some(before) => *at < until || (*at == until && *id < before),
                    None => *at <= until,
                },
                _ => true,
            })
            .collect();

        matched.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        if query.sort == SortOrder::NewestFirst {
            matched.reverse();
        }

        Ok(matched
            .into_iter()
            .take(query.limit)
            .map(|(_, _, record)| record.clone())
            .collect())
    }

    async fn find_by_id(&self, collection: &str, id: &RecordId) -> Result<Option<Record>> {
        self.check(collection)?;
        Ok(self.get(collection, id))
    }

    async fn create(&self, collection: &str, record: Record) -> Result<Record> {
        self.check(collection)?;
        let id = record.id().map_err(anyhow::Error::from)?;

        let mut guard = self.lock();
        let records = guard.entry(collection.to_string()).or_default();
        if records.contains_key(&id) {
            return Err(ContentStoreError::AlreadyExists {
                collection: collection.to_string(),
                id,
            });
        }
        records.insert(id, record.clone());
        Ok(record)
    }

    async fn update(&self, collection: &str, id: &RecordId, record: Record) -> Result<Record> {
        self.check(collection)?;

        let mut guard = self.lock();
        let Some(existing) = guard.get_mut(collection).and_then(|c| c.get_mut(id)) else {
            return Err(ContentStoreError::NotFound {
                collection: collection.to_string(),
                id: id.clone(),
            });
        };

        for (key, value) in record.into_map() {
            if key != Record::ID_FIELD {
                existing.insert(key, value);
            }
        }
        Ok(existing.clone())
    }

    async fn delete(&self, collection: &str, id: &RecordId) -> Result<bool> {
        self.check(collection)?;
        Ok(self
            .lock()
            .get_mut(collection)
            .and_then(|c| c.remove(id))
            .is_some())
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        self.check(collection)?;
        Ok(self.lock().get(collection).map_or(0, |c| c.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, updated: &str) -> Record {
        Record::try_from(json!({"id": id, "name": id, "updatedAt": updated})).unwrap()
    }

    fn store() -> MemoryContentStore {
        let store = MemoryContentStore::new();
        store.insert("services", record("a", "2024-01-01T10:00:00Z")).unwrap();
        store.insert("services", record("b", "2024-01-01T11:00:00Z")).unwrap();
        store.insert("services", record("c", "2024-01-01T12:00:00Z")).unwrap();
        store
    }

    fn ids(records: &[Record]) -> Vec<String> {
        records.iter().map(|r| r.id().unwrap().to_string()).collect()
    }

    #[tokio::test]
    async fn test_find_newest_first_with_limit() {
        let store = store();
        let found = store.find("services", &FindQuery::new(2)).await.unwrap();
        assert_eq!(ids(&found), vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_find_by_window() {
        let store = store();
        let after = "2024-01-01T10:00:00Z".parse().unwrap();
        let until = "2024-01-01T11:00:00Z".parse().unwrap();

        let query = FindQuery::new(10)
            .updated_after(Some(after))
            .updated_until(Some(until))
            .sort(SortOrder::OldestFirst);
        let found = store.find("services", &query).await.unwrap();
        assert_eq!(ids(&found), vec!["b"]);
    }

    #[tokio::test]
    async fn test_find_before_key_pages_through_ties() {
        let store = MemoryContentStore::new();
        for id in ["p", "q", "r"] {
            store.insert("pages", record(id, "2024-01-01T10:00:00Z")).unwrap();
        }
        store.insert("pages", record("o", "2024-01-01T09:00:00Z")).unwrap();
        let until = "2024-01-01T10:00:00Z".parse().unwrap();

        let first = store.find("pages", &FindQuery::new(2)).await.unwrap();
        assert_eq!(ids(&first), vec!["r", "q"]);

        let rest = FindQuery::new(10).before(until, RecordId::from("q"));
        let found = store.find("pages", &rest).await.unwrap();
        assert_eq!(ids(&found), vec!["p", "o"]);
    }

    #[tokio::test]
    async fn test_find_unknown_collection_is_empty() {
        let store = store();
        assert!(store.find("pages", &FindQuery::new(10)).await.unwrap().is_empty());
        assert_eq!(store.count("pages").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let store = MemoryContentStore::new();
        let id = RecordId::from("x");

        store
            .create("pages", record("x", "2024-01-01T10:00:00Z"))
            .await
            .unwrap();
        let err = store
            .create("pages", record("x", "2024-01-01T10:00:00Z"))
            .await
            .unwrap_err();
        assert!(matches!(err, ContentStoreError::AlreadyExists { .. }));

        let patch = Record::try_from(json!({"id": "x", "name": "renamed"})).unwrap();
        let updated = store.update("pages", &id, patch).await.unwrap();
        assert_eq!(updated.get("name"), Some(&json!("renamed")));
        assert_eq!(updated.get("updatedAt"), Some(&json!("2024-01-01T10:00:00Z")));

        assert!(store.delete("pages", &id).await.unwrap());
        assert!(!store.delete("pages", &id).await.unwrap());

        let err = store
            .update("pages", &id, record("x", "2024-01-01T10:00:00Z"))
            .await
            .unwrap_err();
        assert!(matches!(err, ContentStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_failing_collection() {
        let store = store();
        store.fail_collection("services");
        assert!(matches!(
            store.count("services").await,
            Err(ContentStoreError::Backend(_))
        ));

        store.heal("services");
        assert_eq!(store.count("services").await.unwrap(), 3);
    }
}
