//! Content store client for store-sync
//!
//! The content store is the authoritative, document-oriented store of
//! business entities. This crate defines the [`ContentStore`] trait the sync
//! engine is written against, plus two implementations:
//!
//! - [`MongoContentStore`] - MongoDB-backed documents
//! - [`MemoryContentStore`] - in-process collections, with failure injection

mod convert;
mod memory;
mod mongo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use sync_core::{Record, RecordId};

pub use convert::{bson_to_json, document_to_record, id_candidates, json_to_bson, record_to_document};
pub use memory::MemoryContentStore;
pub use mongo::{MongoContentStore, MongoOpts};

/// Errors returned by content store operations.
///
/// `NotFound` and `AlreadyExists` are separate so callers can implement
/// create-or-update and tolerant deletes without string matching.
#[derive(Debug, thiserror::Error)]
pub enum ContentStoreError {
    #[error("Record '{id}' not found in collection '{collection}'")]
    NotFound { collection: String, id: RecordId },

    #[error("Record '{id}' already exists in collection '{collection}'")]
    AlreadyExists { collection: String, id: RecordId },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ContentStoreError>;

/// Sort order of a [`FindQuery`], by update timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Query for records by update timestamp.
///
/// Matches records with `updated_after < updated_at <= updated_until`; an
/// absent bound is open. With `before_id` set, records updated exactly at
/// `updated_until` only match when their id sorts before it, so the upper
/// bound is the `(updated_until, before_id)` key, exclusive.
///
/// Results are ordered by `(updated_at, id)`, which makes that key a stable
/// cursor across records sharing one timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_until: Option<DateTime<Utc>>,
    pub before_id: Option<RecordId>,
    pub limit: usize,
    pub sort: SortOrder,
}

impl FindQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            updated_after: None,
            updated_until: None,
            before_id: None,
            limit,
            sort: SortOrder::NewestFirst,
        }
    }

    pub fn updated_after(mut self, after: Option<DateTime<Utc>>) -> Self {
        self.updated_after = after;
        self
    }

    pub fn updated_until(mut self, until: Option<DateTime<Utc>>) -> Self {
        self.updated_until = until;
        self
    }

    /// Only records sorting strictly before `(until, id)`.
    pub fn before(mut self, until: DateTime<Utc>, id: RecordId) -> Self {
        self.updated_until = Some(until);
        self.before_id = Some(id);
        self
    }

    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }
}

/// Client of the authoritative document store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Records matching `query`, in the query's sort order, at most `limit`.
    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Record>>;

    async fn find_by_id(&self, collection: &str, id: &RecordId) -> Result<Option<Record>>;

    /// Create a record. Fails with `AlreadyExists` if the identity is taken.
    async fn create(&self, collection: &str, record: Record) -> Result<Record>;

    /// Replace the fields of an existing record. Fails with `NotFound` if
    /// there is no record with this identity.
    async fn update(&self, collection: &str, id: &RecordId, record: Record) -> Result<Record>;

    /// Delete a record. Returns whether a record was removed.
    async fn delete(&self, collection: &str, id: &RecordId) -> Result<bool>;

    async fn count(&self, collection: &str) -> Result<u64>;
}

#[async_trait]
impl<T: ContentStore + ?Sized> ContentStore for Arc<T> {
    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Record>> {
        (**self).find(collection, query).await
    }

    async fn find_by_id(&self, collection: &str, id: &RecordId) -> Result<Option<Record>> {
        (**self).find_by_id(collection, id).await
    }

    async fn create(&self, collection: &str, record: Record) -> Result<Record> {
        (**self).create(collection, record).await
    }

    async fn update(&self, collection: &str, id: &RecordId, record: Record) -> Result<Record> {
        (**self).update(collection, id, record).await
    }

    async fn delete(&self, collection: &str, id: &RecordId) -> Result<bool> {
        (**self).delete(collection, id).await
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        (**self).count(collection).await
    }
}
