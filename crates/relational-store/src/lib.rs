//! Relational store client for store-sync
//!
//! The relational store is the table-oriented replica kept consistent with the
//! content store. This crate provides:
//!
//! - [`RelationalStore`] - the trait the sync engine is written against
//! - [`ChangeFeed`] - a live subscription to a table's change events
//! - [`PostgresRelationalStore`] - PostgreSQL tables with trigger-based change capture
//! - [`PostgresWatermarkStore`] - watermarks in a `sync_metadata` table
//! - [`MemoryRelationalStore`] - in-process tables, with failure injection

mod capture;
mod client;
mod feed;
mod memory;
mod postgres;
mod sql;
mod watermark;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use sync_core::{ChangeKind, Record, RecordId};

pub use capture::{change_from_audit_row, AUDIT_TABLE, REPLICATING_SETTING};
pub use client::new_postgresql_client;
pub use feed::{ChangeFeed, FeedSender};
pub use memory::{MemoryRelationalStore, UpsertCall};
pub use postgres::{PostgresOpts, PostgresRelationalStore};
pub use sql::quote_ident;
pub use watermark::PostgresWatermarkStore;

/// Row selection for [`RelationalStore::select`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    All,
    /// Rows whose `id` is one of these.
    Ids(Vec<RecordId>),
}

/// Client of the replica store.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Insert-or-replace `records` keyed by `conflict_key`.
    ///
    /// The batch is written atomically. Writes made here are not echoed on
    /// change feeds. Returns the number of rows written.
    async fn upsert(&self, collection: &str, records: &[Record], conflict_key: &str) -> Result<u64>;

    async fn count(&self, collection: &str) -> Result<u64>;

    /// Rows matching `filter`, restricted to `columns` (all columns when empty).
    async fn select(&self, collection: &str, columns: &[&str], filter: &RowFilter) -> Result<Vec<Record>>;

    /// Subscribe to changes of `kinds` made to `collection` by other writers.
    async fn subscribe(&self, collection: &str, kinds: &[ChangeKind]) -> Result<ChangeFeed>;
}

#[async_trait]
impl<T: RelationalStore + ?Sized> RelationalStore for Arc<T> {
    async fn upsert(&self, collection: &str, records: &[Record], conflict_key: &str) -> Result<u64> {
        (**self).upsert(collection, records, conflict_key).await
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        (**self).count(collection).await
    }

    async fn select(&self, collection: &str, columns: &[&str], filter: &RowFilter) -> Result<Vec<Record>> {
        (**self).select(collection, columns, filter).await
    }

    async fn subscribe(&self, collection: &str, kinds: &[ChangeKind]) -> Result<ChangeFeed> {
        (**self).subscribe(collection, kinds).await
    }
}
