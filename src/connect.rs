use anyhow::Context;
use checkpoint::{FilesystemStore, WatermarkStore};
use std::sync::Arc;
use store_sync_content_store::{MongoContentStore, MongoOpts};
use store_sync_relational_store::{PostgresOpts, PostgresRelationalStore, PostgresWatermarkStore};

use crate::{StoreOpts, SyncConfig, SyncOrchestrator};

/// Orchestrator over the production stores.
pub type StoreOrchestrator =
    SyncOrchestrator<MongoContentStore, PostgresRelationalStore, Arc<dyn WatermarkStore>>;

// Connect to both stores and build an orchestrator over them
pub async fn connect_orchestrator(
    stores: &StoreOpts,
    config: SyncConfig,
) -> anyhow::Result<Arc<StoreOrchestrator>> {
    let mut mongo_opts = MongoOpts::from(stores);
    mongo_opts.connect_timeout = config.store_timeout;
    let content = MongoContentStore::connect(&mongo_opts)
        .await
        .context("Failed to connect to the content store")?;

    let mut pg_opts = PostgresOpts::from(stores);
    pg_opts.poll_interval = config.realtime_poll_interval;
    let relational = PostgresRelationalStore::connect(&pg_opts)
        .await
        .context("Failed to connect to the relational store")?;

    let watermarks: Arc<dyn WatermarkStore> = match &stores.watermark_dir {
        Some(dir) => {
            tracing::info!("Storing watermarks in {}", dir.display());
            Arc::new(FilesystemStore::new(dir))
        }
        None => Arc::new(PostgresWatermarkStore::new(relational.client())),
    };

    Ok(Arc::new(SyncOrchestrator::new(
        config,
        Arc::new(content),
        Arc::new(relational),
        watermarks,
    )))
}
