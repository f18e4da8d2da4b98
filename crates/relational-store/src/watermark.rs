//! Watermarks kept in the relational store itself.

use anyhow::{Context, Result};
use async_trait::async_trait;
use checkpoint::{Backlog, Watermark, WatermarkStore};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use sync_core::RecordId;
use tokio::sync::{Mutex, OnceCell};
use tokio_postgres::Client;

const METADATA_TABLE: &str = "sync_metadata";

/// [`WatermarkStore`] backed by a `sync_metadata` table.
///
/// The stored `last_sync` is combined with `GREATEST`, so a late writer with
/// an older instant cannot move a collection's watermark backwards.
pub struct PostgresWatermarkStore {
    client: Arc<Mutex<Client>>,
    ready: OnceCell<()>,
}

impl PostgresWatermarkStore {
    pub fn new(client: Arc<Mutex<Client>>) -> Self {
        Self {
            client,
            ready: OnceCell::new(),
        }
    }

    async fn ensure_table(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                let client = self.client.lock().await;
                client
                    .simple_query(&format!(
                        "CREATE TABLE IF NOT EXISTS {METADATA_TABLE} (
                            collection TEXT PRIMARY KEY,
                            last_sync TIMESTAMPTZ NOT NULL,
                            backlog JSONB,
                            conflicts JSONB,
                            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                        );
                        ALTER TABLE {METADATA_TABLE} ADD COLUMN IF NOT EXISTS conflicts JSONB"
                    ))
                    .await
                    .context("Failed to create sync metadata table")?;
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for PostgresWatermarkStore {
    async fn store_watermark(&self, watermark: &Watermark) -> Result<()> {
        self.ensure_table().await?;

        let backlog: Option<Value> = watermark
            .backlog
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let conflicts: Option<Value> = if watermark.conflicts.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&watermark.conflicts)?)
        };

        let client = self.client.lock().await;
        client
            .execute(
                &format!(
                    "INSERT INTO {METADATA_TABLE} (collection, last_sync, backlog, conflicts, updated_at)
                    VALUES ($1, $2, $3, $4, NOW())
                    ON CONFLICT (collection) DO UPDATE SET
                        last_sync = GREATEST({METADATA_TABLE}.last_sync, EXCLUDED.last_sync),
                        backlog = EXCLUDED.backlog,
                        conflicts = EXCLUDED.conflicts,
                        updated_at = NOW()"
                ),
                &[&watermark.collection, &watermark.last_synced_at, &backlog, &conflicts],
            )
            .await
            .with_context(|| format!("Failed to store watermark for '{}'", watermark.collection))?;

        tracing::debug!("Stored watermark for '{}' in {}", watermark.collection, METADATA_TABLE);
        Ok(())
    }

    async fn read_watermark(&self, collection: &str) -> Result<Option<Watermark>> {
        self.ensure_table().await?;

        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!("SELECT last_sync, backlog, conflicts FROM {METADATA_TABLE} WHERE collection = $1"),
                &[&collection],
            )
            .await
            .with_context(|| format!("Failed to read watermark for '{collection}'"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let last_sync: DateTime<Utc> = row.get(0);
        let backlog: Option<Value> = row.get(1);
        let backlog: Option<Backlog> = backlog
            .map(serde_json::from_value)
            .transpose()
            .with_context(|| format!("Invalid backlog stored for '{collection}'"))?;
        let conflicts: Option<Value> = row.get(2);
        let conflicts: BTreeSet<RecordId> = conflicts
            .map(serde_json::from_value)
            .transpose()
            .with_context(|| format!("Invalid conflicts stored for '{collection}'"))?
            .unwrap_or_default();

        Ok(Some(
            Watermark::new(collection, last_sync)
                .with_backlog(backlog)
                .with_conflicts(conflicts),
        ))
    }

    async fn clear_watermark(&self, collection: &str) -> Result<()> {
        self.ensure_table().await?;

        let client = self.client.lock().await;
        client
            .execute(
                &format!("DELETE FROM {METADATA_TABLE} WHERE collection = $1"),
                &[&collection],
            )
            .await
            .with_context(|| format!("Failed to clear watermark for '{collection}'"))?;
        Ok(())
    }
}
