//! Filesystem-based watermark storage implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

use crate::store::WatermarkStore;
use crate::Watermark;

/// Filesystem implementation of WatermarkStore trait.
///
/// Stores one `watermark_{collection}.json` file per collection. Files are
/// written to a temporary name and renamed into place.
pub struct FilesystemStore {
    dir: PathBuf,
}

impl FilesystemStore {
    /// Create a new FilesystemStore with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Get the directory path.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        let name: String = collection
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("watermark_{name}.json"))
    }
}

#[async_trait]
impl WatermarkStore for FilesystemStore {
    async fn store_watermark(&self, watermark: &Watermark) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create watermark dir {}", self.dir.display()))?;

        let path = self.path_for(&watermark.collection);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(watermark)?)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!("Stored watermark to {}", path.display());
        Ok(())
    }

    async fn read_watermark(&self, collection: &str) -> Result<Option<Watermark>> {
        let path = self.path_for(collection);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read watermark file {}", path.display()))?;
        let watermark: Watermark = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse watermark file {}", path.display()))?;

        if watermark.collection != collection {
            anyhow::bail!(
                "Watermark file {} belongs to collection '{}', expected '{collection}'",
                path.display(),
                watermark.collection
            );
        }
        Ok(Some(watermark))
    }

    async fn clear_watermark(&self, collection: &str) -> Result<()> {
        let path = self.path_for(collection);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
