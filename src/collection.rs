//! One incremental pass over one collection, content store to relational
//! store.

use checkpoint::{Backlog, ConflictUpdate, Watermark, WatermarkManager, WatermarkStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use store_sync_content_store::{ContentStore, FindQuery};
use store_sync_relational_store::{RelationalStore, RowFilter};
use sync_core::{Record, RecordId};

use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, Existing, Target, Verdict};
use crate::error::{bounded, Result, SyncError};
use crate::transform::{RecordTransformer, CONTENT_UPDATED_FIELD, RELATIONAL_UPDATED_FIELD};

/// What a single collection pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassOutcome {
    pub collection: String,
    /// Records read from the content store
    pub read: usize,
    /// Records upserted into the relational store
    pub written: usize,
    /// Records the conflict policy kept out
    pub skipped: usize,
    /// Records left for manual resolution, kept in the watermark until a
    /// later pass writes them
    pub conflicts: usize,
    /// Records that could not be transformed
    pub invalid: usize,
    /// The watermark after the pass, if one was written
    pub watermark: Option<Watermark>,
}

impl PassOutcome {
    fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            ..Self::default()
        }
    }

    /// Whether older records are still waiting behind the watermark.
    pub fn backlog_pending(&self) -> bool {
        self.watermark
            .as_ref()
            .is_some_and(|w| w.backlog.is_some())
    }
}

/// Synchronizes one named collection per call.
///
/// A pass reads the records changed since the collection's watermark
/// (newest first, at most `batch_size`), upserts them into the relational
/// store, and only then advances the watermark to the instant the pass
/// started. A failed upsert leaves the watermark untouched, so the same
/// window is read again by the next pass.
///
/// When a pass fills its batch, the older part of the window is recorded
/// as the watermark's backlog and drained by the following passes before
/// newer records are read again. The backlog is keyed on the last record
/// read in `(updatedAt, id)` order, so records sharing one timestamp are
/// paged through rather than skipped.
pub struct CollectionSyncer<C, R, W>
where
    C: ContentStore,
    R: RelationalStore,
    W: WatermarkStore,
{
    content: Arc<C>,
    relational: Arc<R>,
    watermarks: Arc<WatermarkManager<W>>,
    transformer: RecordTransformer,
    resolver: ConflictResolver,
    config: Arc<SyncConfig>,
}

impl<C, R, W> CollectionSyncer<C, R, W>
where
    C: ContentStore,
    R: RelationalStore,
    W: WatermarkStore,
{
    pub fn new(
        config: Arc<SyncConfig>,
        content: Arc<C>,
        relational: Arc<R>,
        watermarks: Arc<WatermarkManager<W>>,
        transformer: RecordTransformer,
    ) -> Self {
        Self {
            content,
            relational,
            watermarks,
            transformer,
            resolver: ConflictResolver::new(config.conflict_resolution),
            config,
        }
    }

    pub fn watermarks(&self) -> &WatermarkManager<W> {
        &self.watermarks
    }

    /// Run one pass for `collection`.
    pub async fn sync_collection(&self, collection: &str) -> Result<PassOutcome> {
        if !self.config.is_enabled(collection) {
            return Err(SyncError::UnknownCollection(collection.to_string()));
        }
        if !self.config.sync_direction.writes_relational() {
            return Err(SyncError::DirectionDisabled {
                operation: "Collection sync",
            });
        }

        let started_at = Utc::now();
        let timeout = self.config.store_timeout;
        let batch_size = self.config.batch_size;
        let mut outcome = PassOutcome::new(collection);

        tracing::info!("Syncing collection: {}", collection);

        let current = bounded(
            format!("Reading watermark of '{collection}'"),
            timeout,
            self.watermarks.read(collection),
        )
        .await?;
        let draining = current.as_ref().and_then(|w| w.backlog.clone());
        let last_synced_at = current.as_ref().map(|w| w.last_synced_at);

        let query = match &draining {
            Some(backlog) => backlog_query(backlog, batch_size),
            None => FindQuery::new(batch_size).updated_after(last_synced_at),
        };
        if let Some(backlog) = &draining {
            tracing::debug!(
                "Draining backlog of '{}' up to {}",
                collection,
                backlog.until.to_rfc3339()
            );
        }

        let records = bounded(
            format!("Reading changes of '{collection}'"),
            timeout,
            self.content.find(collection, &query),
        )
        .await?;
        outcome.read = records.len();

        if records.is_empty() {
            if draining.is_some() {
                // backlog exhausted
                let kept = last_synced_at.unwrap_or(started_at);
                outcome.watermark = Some(
                    self.advance(collection, kept, None, &ConflictUpdate::default())
                        .await?,
                );
            } else {
                tracing::info!("No new data for {}", collection);
            }
            return Ok(outcome);
        }

        // newest first, so the last record is the cursor for what is left
        let cursor = records
            .last()
            .and_then(|r| Some((r.timestamp(CONTENT_UPDATED_FIELD)?, r.id().ok()?)));
        let filled = records.len() >= batch_size;

        let mut rows = Vec::with_capacity(records.len());
        for record in &records {
            match self.transformer.to_relational(collection, record) {
                Ok(row) => rows.push((record.timestamp(CONTENT_UPDATED_FIELD), row)),
                Err(e) => {
                    outcome.invalid += 1;
                    tracing::warn!("Skipping record of '{}' that cannot be transformed: {e}", collection);
                }
            }
        }

        let mut conflicts = ConflictUpdate::default();
        let rows = self.resolve(collection, rows, &mut outcome, &mut conflicts).await?;
        if !rows.is_empty() {
            bounded(
                format!("Upserting into '{collection}'"),
                timeout,
                self.relational.upsert(collection, &rows, Record::ID_FIELD),
            )
            .await?;
        }
        outcome.written = rows.len();
        conflicts.settled = rows.iter().filter_map(|row| row.id().ok()).collect();

        let backlog = if filled {
            next_backlog(collection, &draining, last_synced_at, cursor)
        } else {
            None
        };
        let synced_at = match &draining {
            Some(_) => last_synced_at.unwrap_or(started_at),
            None => started_at,
        };
        outcome.watermark = Some(self.advance(collection, synced_at, backlog, &conflicts).await?);

        tracing::info!(
            "Synced {} records for {} ({} skipped, {} conflicts, {} invalid)",
            outcome.written,
            collection,
            outcome.skipped,
            outcome.conflicts,
            outcome.invalid
        );
        Ok(outcome)
    }

    async fn advance(
        &self,
        collection: &str,
        synced_at: DateTime<Utc>,
        backlog: Option<Backlog>,
        conflicts: &ConflictUpdate,
    ) -> Result<Watermark> {
        bounded(
            format!("Writing watermark of '{collection}'"),
            self.config.store_timeout,
            self.watermarks.advance_with_conflicts(collection, synced_at, backlog, conflicts),
        )
        .await
    }

    /// Apply the conflict policy, returning the rows to write.
    async fn resolve(
        &self,
        collection: &str,
        rows: Vec<(Option<DateTime<Utc>>, Record)>,
        outcome: &mut PassOutcome,
        conflicts: &mut ConflictUpdate,
    ) -> Result<Vec<Record>> {
        if rows.is_empty() || !self.resolver.needs_existing(Target::Relational) {
            return Ok(rows.into_iter().map(|(_, row)| row).collect());
        }

        let ids: Vec<RecordId> = rows.iter().filter_map(|(_, row)| row.id().ok()).collect();
        let existing = bounded(
            format!("Reading existing rows of '{collection}'"),
            self.config.store_timeout,
            self.relational.select(
                collection,
                &[Record::ID_FIELD, RELATIONAL_UPDATED_FIELD],
                &RowFilter::Ids(ids),
            ),
        )
        .await?;
        let existing: HashMap<RecordId, Option<DateTime<Utc>>> = existing
            .iter()
            .filter_map(|row| {
                row.id()
                    .ok()
                    .map(|id| (id, row.timestamp(RELATIONAL_UPDATED_FIELD)))
            })
            .collect();

        let mut accepted = Vec::with_capacity(rows.len());
        for (incoming, row) in rows {
            let Ok(id) = row.id() else { continue };
            let current = existing
                .get(&id)
                .map_or(Existing::Absent, |at| Existing::Present(*at));
            match self.resolver.resolve(Target::Relational, incoming, current) {
                Verdict::Write => accepted.push(row),
                Verdict::Skip => {
                    outcome.skipped += 1;
                    tracing::debug!("Keeping relational copy of {}/{}", collection, id);
                }
                Verdict::Conflict => {
                    outcome.conflicts += 1;
                    tracing::warn!(
                        "Conflict on {}/{}: both stores changed, leaving it for manual resolution",
                        collection,
                        id
                    );
                    conflicts.found.push(id);
                }
            }
        }
        Ok(accepted)
    }
}

fn backlog_query(backlog: &Backlog, batch_size: usize) -> FindQuery {
    let query = FindQuery::new(batch_size).updated_after(backlog.after);
    match &backlog.until_id {
        Some(id) => query.before(backlog.until, id.clone()),
        None => query.updated_until(Some(backlog.until)),
    }
}

/// Backlog left by a pass that filled its batch.
///
/// The remaining window is everything in the window just read that sorts
/// before `cursor`, the last record of the batch.
fn next_backlog(
    collection: &str,
    draining: &Option<Backlog>,
    last_synced_at: Option<DateTime<Utc>>,
    cursor: Option<(DateTime<Utc>, RecordId)>,
) -> Option<Backlog> {
    let Some((until, until_id)) = cursor else {
        tracing::warn!(
            "Last record of a '{}' batch has no readable '{}' or id; older records may be left behind",
            collection,
            CONTENT_UPDATED_FIELD
        );
        return None;
    };

    let after = match draining {
        Some(backlog) => backlog.after,
        None => last_synced_at,
    };
    match after {
        Some(after) if until <= after => None,
        _ => Some(Backlog {
            after,
            until,
            until_id: Some(until_id),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()
    }

    fn key(minute: u32, id: &str) -> Option<(DateTime<Utc>, RecordId)> {
        Some((at(minute), RecordId::from(id)))
    }

    #[test]
    fn test_next_backlog_from_normal_window() {
        let backlog = next_backlog("services", &None, Some(at(0)), key(5, "svc-2"));
        assert_eq!(
            backlog,
            Some(Backlog {
                after: Some(at(0)),
                until: at(5),
                until_id: Some(RecordId::from("svc-2")),
            })
        );

        let first_ever = next_backlog("services", &None, None, key(5, "svc-2")).unwrap();
        assert_eq!(first_ever.after, None);
    }

    #[test]
    fn test_next_backlog_shrinks_while_draining() {
        let draining = Some(Backlog {
            after: Some(at(0)),
            until: at(5),
            until_id: Some(RecordId::from("svc-9")),
        });
        assert_eq!(
            next_backlog("services", &draining, Some(at(30)), key(3, "svc-4")),
            Some(Backlog {
                after: Some(at(0)),
                until: at(3),
                until_id: Some(RecordId::from("svc-4")),
            })
        );
    }

    #[test]
    fn test_next_backlog_stays_on_shared_timestamp() {
        let draining = Some(Backlog {
            after: None,
            until: at(5),
            until_id: Some(RecordId::from("svc-9")),
        });
        let next = next_backlog("services", &draining, Some(at(30)), key(5, "svc-4")).unwrap();
        assert_eq!(next.until, at(5));
        assert_eq!(next.until_id, Some(RecordId::from("svc-4")));
    }

    #[test]
    fn test_next_backlog_empty_window() {
        let draining = Some(Backlog {
            after: Some(at(5)),
            until: at(6),
            until_id: None,
        });
        assert_eq!(next_backlog("services", &draining, Some(at(30)), key(5, "svc-1")), None);
        assert_eq!(next_backlog("services", &None, Some(at(0)), None), None);
    }

    #[test]
    fn test_backlog_query_uses_record_key() {
        let keyed = Backlog {
            after: Some(at(0)),
            until: at(5),
            until_id: Some(RecordId::from("svc-2")),
        };
        let query = backlog_query(&keyed, 50);
        assert_eq!(query.updated_after, Some(at(0)));
        assert_eq!(query.updated_until, Some(at(5)));
        assert_eq!(query.before_id, Some(RecordId::from("svc-2")));
        assert_eq!(query.limit, 50);

        let open = backlog_query(&Backlog { until_id: None, ..keyed }, 50);
        assert_eq!(open.before_id, None);
    }
}
