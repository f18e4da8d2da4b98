//! Watermark storage trait

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::Watermark;

/// Trait for watermark storage operations.
///
/// This trait abstracts the storage backend for watermarks, allowing the
/// same sync logic to work with:
/// - Filesystem storage (`FilesystemStore`)
/// - In-process storage (`MemoryStore`)
/// - PostgreSQL (`PostgresWatermarkStore` in store-sync-relational-store)
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Persist the watermark, replacing the previous one for its collection.
    async fn store_watermark(&self, watermark: &Watermark) -> Result<()>;

    /// Read the watermark of a collection.
    ///
    /// Returns None if the collection has never been synced.
    async fn read_watermark(&self, collection: &str) -> Result<Option<Watermark>>;

    /// Forget the watermark of a collection.
    async fn clear_watermark(&self, collection: &str) -> Result<()>;
}

#[async_trait]
impl<T: WatermarkStore + ?Sized> WatermarkStore for Arc<T> {
    async fn store_watermark(&self, watermark: &Watermark) -> Result<()> {
        (**self).store_watermark(watermark).await
    }

    async fn read_watermark(&self, collection: &str) -> Result<Option<Watermark>> {
        (**self).read_watermark(collection).await
    }

    async fn clear_watermark(&self, collection: &str) -> Result<()> {
        (**self).clear_watermark(collection).await
    }
}
