//! Per-collection watermark type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use sync_core::RecordId;

/// Boundary of already-synchronized records for one collection.
///
/// `last_synced_at` only ever moves forward; it is advanced after a batch
/// has been confirmed written to the target store.
///
/// # File Format
///
/// ```json
/// {
///     "collection": "services",
///     "last_synced_at": "2024-01-01T00:00:00Z",
///     "backlog": {
///         "after": null,
///         "until": "2023-12-31T10:00:00Z",
///         "until_id": "svc-118"
///     },
///     "conflicts": ["svc-7"]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    /// Collection this watermark belongs to
    pub collection: String,
    /// Records updated after this instant have not been synced yet
    pub last_synced_at: DateTime<Utc>,
    /// Older records that a full batch left unsynced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog: Option<Backlog>,
    /// Records held back as unresolved conflicts
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub conflicts: BTreeSet<RecordId>,
}

/// Window of records still to be synced behind the watermark.
///
/// Covers records with `after < updated_at` that sort before the key
/// `(until, until_id)` in `(updated_at, id)` order. Without `until_id` every
/// record at `until` is included. `after == None` means the window is open
/// towards the past (the collection has never been fully synced).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backlog {
    pub after: Option<DateTime<Utc>>,
    pub until: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until_id: Option<RecordId>,
}

impl Watermark {
    pub fn new(collection: impl Into<String>, last_synced_at: DateTime<Utc>) -> Self {
        Self {
            collection: collection.into(),
            last_synced_at,
            backlog: None,
            conflicts: BTreeSet::new(),
        }
    }

    pub fn with_backlog(mut self, backlog: Option<Backlog>) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_conflicts(mut self, conflicts: BTreeSet<RecordId>) -> Self {
        self.conflicts = conflicts;
        self
    }

    /// CLI-friendly form: `collection:rfc3339`, followed by
    /// ` backlog:(after,until]` (or ` backlog:(after,until/id)` below a record
    /// key) when a backlog is pending and ` conflicts:id,id` when conflicts
    /// are unresolved.
    pub fn to_cli_string(&self) -> String {
        let mut out = format!("{}:{}", self.collection, self.last_synced_at.to_rfc3339());
        if let Some(backlog) = &self.backlog {
            let after = backlog
                .after
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-inf".to_string());
            let until = backlog.until.to_rfc3339();
            match &backlog.until_id {
                None => out.push_str(&format!(" backlog:({after},{until}]")),
                Some(id) => out.push_str(&format!(" backlog:({after},{until}/{id})")),
            }
        }
        if !self.conflicts.is_empty() {
            let ids: Vec<&str> = self.conflicts.iter().map(RecordId::as_str).collect();
            out.push_str(&format!(" conflicts:{}", ids.join(",")));
        }
        out
    }

    /// Parse the `collection:rfc3339` form produced by [`Self::to_cli_string`].
    ///
    /// Backlog windows are not accepted on input.
    pub fn from_cli_string(s: &str) -> anyhow::Result<Self> {
        let (collection, timestamp) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("Invalid watermark format: expected 'collection:timestamp', got '{s}'"))?;
        if collection.is_empty() {
            anyhow::bail!("Invalid watermark format: empty collection name");
        }
        let last_synced_at = DateTime::parse_from_rfc3339(timestamp)?.with_timezone(&Utc);
        Ok(Self::new(collection, last_synced_at))
    }
}

/// Changes one pass makes to a collection's unresolved conflicts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictUpdate {
    /// Records found in conflict
    pub found: Vec<RecordId>,
    /// Records written, which settles any earlier conflict on them
    pub settled: Vec<RecordId>,
}

impl ConflictUpdate {
    /// Apply to the conflicts carried by a previous watermark.
    pub fn apply(&self, mut conflicts: BTreeSet<RecordId>) -> BTreeSet<RecordId> {
        for id in &self.settled {
            conflicts.remove(id);
        }
        conflicts.extend(self.found.iter().cloned());
        conflicts
    }
}
