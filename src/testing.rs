//! Test fixtures
//!
//! Builds orchestrators over the in-memory stores so the engine can be
//! exercised without MongoDB or PostgreSQL.

use checkpoint::MemoryStore;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use store_sync_content_store::MemoryContentStore;
use store_sync_relational_store::MemoryRelationalStore;
use sync_core::Record;

use crate::{SyncConfig, SyncOrchestrator};

pub type MemoryOrchestrator =
    SyncOrchestrator<MemoryContentStore, MemoryRelationalStore, Arc<MemoryStore>>;

/// An orchestrator together with handles on the stores behind it.
pub struct Harness {
    pub content: Arc<MemoryContentStore>,
    pub relational: Arc<MemoryRelationalStore>,
    pub watermarks: Arc<MemoryStore>,
    pub orchestrator: Arc<MemoryOrchestrator>,
}

impl Harness {
    pub fn new(config: SyncConfig) -> Self {
        let content = Arc::new(MemoryContentStore::new());
        let relational = Arc::new(MemoryRelationalStore::new());
        let watermarks = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            config,
            content.clone(),
            relational.clone(),
            watermarks.clone(),
        ));
        Self {
            content,
            relational,
            watermarks,
            orchestrator,
        }
    }

    /// Seed the content store with `count` records named after their index,
    /// updated one second apart starting at `first_update`.
    pub fn seed_content(&self, collection: &str, count: usize, first_update: DateTime<Utc>) {
        for i in 0..count {
            let updated_at = first_update + chrono::Duration::seconds(i as i64);
            let record = content_record(&format!("{collection}-{i}"), &format!("item {i}"), updated_at);
            if let Err(e) = self.content.insert(collection, record) {
                panic!("Invalid seed record: {e}");
            }
        }
    }
}

/// Configuration suited to tests: no timer, real-time off, fast retries.
pub fn test_config(collections: &[&str]) -> SyncConfig {
    SyncConfig {
        enabled_collections: collections.iter().map(|c| c.to_string()).collect(),
        sync_interval: Duration::ZERO,
        realtime_enabled: false,
        store_timeout: Duration::from_secs(5),
        retry_base_delay: Duration::from_millis(10),
        realtime_poll_interval: Duration::from_millis(10),
        ..SyncConfig::default()
    }
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A content-store shaped record.
pub fn content_record(id: &str, name: &str, updated_at: DateTime<Utc>) -> Record {
    record(json!({
        "id": id,
        "_id": id,
        "name": name,
        "createdAt": timestamp(updated_at),
        "updatedAt": timestamp(updated_at),
    }))
}

/// A relational-store shaped row.
pub fn relational_row(id: &str, name: &str, updated_at: DateTime<Utc>) -> Record {
    record(json!({
        "id": id,
        "name": name,
        "created_at": timestamp(updated_at),
        "updated_at": timestamp(updated_at),
    }))
}

fn record(value: serde_json::Value) -> Record {
    match Record::try_from(value) {
        Ok(record) => record,
        Err(e) => panic!("Invalid fixture record: {e}"),
    }
}
