//! Read-only snapshots of engine state.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time view of an orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub queue_length: usize,
    pub pending_retries: usize,
    pub enabled_collections: Vec<String>,
    pub realtime_enabled: bool,
    pub subscriptions: usize,
    /// Completion time of the last full sync
    pub last_sync: Option<DateTime<Utc>>,
    pub last_full_sync: Option<FullSyncReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionFailure {
    pub collection: String,
    pub error: String,
}

/// Result of one full sync across the enabled collections.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: Vec<String>,
    pub failed: Vec<CollectionFailure>,
    pub records_written: usize,
}

impl FullSyncReport {
    pub(crate) fn empty(at: DateTime<Utc>) -> Self {
        Self {
            started_at: at,
            finished_at: at,
            succeeded: Vec::new(),
            failed: Vec::new(),
            records_written: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_collections(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.collection.as_str()).collect()
    }
}

/// Record counts of one collection in both stores.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountComparison {
    pub collection: String,
    pub content: Option<u64>,
    pub relational: Option<u64>,
    /// Why a count is missing
    pub error: Option<String>,
}

impl CountComparison {
    pub fn matches(&self) -> bool {
        self.error.is_none() && self.content.is_some() && self.content == self.relational
    }
}

impl std::fmt::Display for CountComparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |count: Option<u64>| count.map_or_else(|| "?".to_string(), |c| c.to_string());
        write!(
            f,
            "{}: content={} relational={}",
            self.collection,
            show(self.content),
            show(self.relational)
        )?;
        if let Some(error) = &self.error {
            write!(f, " ({error})")?;
        } else if !self.matches() {
            write!(f, " MISMATCH")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_comparison_display() {
        let ok = CountComparison {
            collection: "services".into(),
            content: Some(3),
            relational: Some(3),
            error: None,
        };
        assert!(ok.matches());
        assert_eq!(ok.to_string(), "services: content=3 relational=3");

        let behind = CountComparison {
            relational: Some(2),
            ..ok.clone()
        };
        assert!(!behind.matches());
        assert_eq!(behind.to_string(), "services: content=3 relational=2 MISMATCH");

        let broken = CountComparison {
            relational: None,
            error: Some("connection refused".into()),
            ..ok
        };
        assert_eq!(
            broken.to_string(),
            "services: content=3 relational=? (connection refused)"
        );
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = SyncStatus {
            is_syncing: false,
            queue_length: 1,
            pending_retries: 0,
            enabled_collections: vec!["pages".into()],
            realtime_enabled: true,
            subscriptions: 1,
            last_sync: None,
            last_full_sync: None,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["queueLength"], 1);
        assert_eq!(value["realtimeEnabled"], true);
        assert!(value["lastSync"].is_null());
    }
}
