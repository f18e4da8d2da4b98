//! Generic watermark manager.

use chrono::{DateTime, Utc};

use crate::{store::WatermarkStore, Backlog, ConflictUpdate, Watermark};

/// Manager for reading and advancing per-collection watermarks.
///
/// The manager is storage-agnostic: any [`WatermarkStore`] backend works.
/// It guarantees that the stored `last_synced_at` of a collection never
/// moves backwards, whatever timestamps callers hand in.
///
/// # Example
///
/// ```rust,ignore
/// use checkpoint::{FilesystemStore, WatermarkManager};
///
/// let manager = WatermarkManager::new(FilesystemStore::new("/tmp/watermarks"));
///
/// let previous = manager.read("services").await?;
/// // ... sync records updated after `previous` ...
/// manager.advance("services", chrono::Utc::now(), None).await?;
/// ```
pub struct WatermarkManager<S: WatermarkStore> {
    store: S,
}

impl<S: WatermarkStore> WatermarkManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Get a reference to the storage backend.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Read the current watermark of a collection.
    pub async fn read(&self, collection: &str) -> anyhow::Result<Option<Watermark>> {
        self.store.read_watermark(collection).await
    }

    /// Advance the watermark of a collection to `synced_at`.
    ///
    /// If the stored watermark is already later than `synced_at` (clock
    /// skew, or a concurrent pass finished first) the stored instant is
    /// kept. The backlog is always replaced by `backlog`. Unresolved
    /// conflicts are carried over.
    ///
    /// Returns the watermark that was written.
    pub async fn advance(
        &self,
        collection: &str,
        synced_at: DateTime<Utc>,
        backlog: Option<Backlog>,
    ) -> anyhow::Result<Watermark> {
        self.advance_with_conflicts(collection, synced_at, backlog, &ConflictUpdate::default())
            .await
    }

    /// [`Self::advance`], also applying `conflicts` to the collection's
    /// unresolved conflicts.
    pub async fn advance_with_conflicts(
        &self,
        collection: &str,
        synced_at: DateTime<Utc>,
        backlog: Option<Backlog>,
        conflicts: &ConflictUpdate,
    ) -> anyhow::Result<Watermark> {
        let current = self.store.read_watermark(collection).await?;

        let last_synced_at = match &current {
            Some(existing) if existing.last_synced_at > synced_at => {
                tracing::warn!(
                    "Watermark for '{}' is ahead of {} ({}), keeping the stored value",
                    collection,
                    synced_at.to_rfc3339(),
                    existing.last_synced_at.to_rfc3339()
                );
                existing.last_synced_at
            }
            _ => synced_at,
        };

        let carried = current.map(|w| w.conflicts).unwrap_or_default();
        let watermark = Watermark::new(collection, last_synced_at)
            .with_backlog(backlog)
            .with_conflicts(conflicts.apply(carried));
        self.store.store_watermark(&watermark).await?;

        tracing::info!("Advanced watermark: {}", watermark.to_cli_string());
        Ok(watermark)
    }

    /// Forget the watermark so the next pass syncs the whole collection.
    pub async fn reset(&self, collection: &str) -> anyhow::Result<()> {
        self.store.clear_watermark(collection).await?;
        tracing::info!("Reset watermark for '{}'", collection);
        Ok(())
    }
}
