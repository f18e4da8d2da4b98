//! In-process watermark storage.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::store::WatermarkStore;
use crate::Watermark;

/// Keeps watermarks in memory. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    watermarks: Mutex<HashMap<String, Watermark>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `store_watermark` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Watermark>> {
        self.watermarks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn store_watermark(&self, watermark: &Watermark) -> Result<()> {
        self.lock()
            .insert(watermark.collection.clone(), watermark.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_watermark(&self, collection: &str) -> Result<Option<Watermark>> {
        Ok(self.lock().get(collection).cloned())
    }

    async fn clear_watermark(&self, collection: &str) -> Result<()> {
        self.lock().remove(collection);
        Ok(())
    }
}
