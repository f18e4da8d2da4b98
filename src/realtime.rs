//! Live mirroring of relational-store changes into the content store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use store_sync_content_store::{ContentStore, ContentStoreError};
use store_sync_relational_store::{ChangeFeed, RelationalStore};
use sync_core::{ChangeKind, Record, RecordChange, RecordId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, Existing, Target, Verdict};
use crate::error::{within, Result, SyncError};
use crate::transform::{RecordTransformer, CONTENT_UPDATED_FIELD};

/// What applying one change event did to the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Created,
    Updated,
    Deleted,
    /// Delete of a record the content store does not hold
    AlreadyAbsent,
    /// The content store's copy won under the conflict policy
    Skipped,
    /// Left for manual resolution
    Conflict,
}

struct Subscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Subscribes to every enabled collection's change feed and applies each
/// event to the content store.
///
/// Events are applied with create-or-update and tolerant-delete semantics,
/// so redelivery is harmless. The listener never reads or writes
/// watermarks.
pub struct RealtimeListener<C, R>
where
    C: ContentStore + 'static,
    R: RelationalStore + 'static,
{
    config: Arc<SyncConfig>,
    content: Arc<C>,
    relational: Arc<R>,
    transformer: RecordTransformer,
    resolver: ConflictResolver,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl<C, R> RealtimeListener<C, R>
where
    C: ContentStore + 'static,
    R: RelationalStore + 'static,
{
    pub fn new(
        config: Arc<SyncConfig>,
        content: Arc<C>,
        relational: Arc<R>,
        transformer: RecordTransformer,
    ) -> Self {
        Self {
            resolver: ConflictResolver::new(config.conflict_resolution),
            config,
            content,
            relational,
            transformer,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to every enabled collection not subscribed yet.
    ///
    /// A collection whose subscription fails is logged and skipped. Returns
    /// the number of live subscriptions afterwards.
    pub async fn setup(self: &Arc<Self>) -> usize {
        if !self.config.realtime_active() {
            tracing::info!("Real-time sync is disabled");
            return 0;
        }

        tracing::info!("Setting up real-time synchronization...");
        for collection in &self.config.enabled_collections {
            let subscribed = self.lock().contains_key(collection);
            if subscribed {
                continue;
            }

            let feed = within(
                format!("Subscribing to '{collection}'"),
                self.config.store_timeout,
                self.relational.subscribe(collection, &ChangeKind::ALL),
            )
            .await
            .and_then(|result| result.map_err(SyncError::from));

            match feed {
                Ok(feed) => {
                    let cancel = CancellationToken::new();
                    let task = tokio::spawn(self.clone().listen(feed, cancel.clone()));
                    self.lock()
                        .insert(collection.clone(), Subscription { cancel, task });
                    tracing::info!("Real-time sync enabled for {}", collection);
                }
                Err(e) => {
                    tracing::error!("Failed to set up real-time sync for {}: {e}", collection);
                }
            }
        }
        self.subscription_count()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().len()
    }

    /// Collections with a live subscription, sorted.
    pub fn subscribed_collections(&self) -> Vec<String> {
        let mut collections: Vec<String> = self.lock().keys().cloned().collect();
        collections.sort();
        collections
    }

    /// Unsubscribe from every feed and wait for the listeners to stop.
    ///
    /// Safe to call repeatedly; returns how many subscriptions were removed.
    pub async fn cleanup(&self) -> usize {
        let subscriptions: Vec<(String, Subscription)> = self.lock().drain().collect();
        let removed = subscriptions.len();

        for (collection, subscription) in subscriptions {
            subscription.cancel.cancel();
            if let Err(e) = subscription.task.await {
                tracing::warn!("Real-time listener for {} ended abnormally: {e}", collection);
            }
            tracing::info!("Cleaned up real-time subscription for {}", collection);
        }
        removed
    }

    async fn listen(self: Arc<Self>, mut feed: ChangeFeed, cancel: CancellationToken) {
        let collection = feed.collection().to_string();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = feed.recv() => match change {
                    Some(change) => self.handle_change(&collection, change).await,
                    None => {
                        tracing::warn!("Change feed of {} closed", collection);
                        break;
                    }
                },
            }
        }
        feed.close();
    }

    /// Apply one event, logging and swallowing any failure.
    pub async fn handle_change(&self, collection: &str, change: RecordChange) {
        let kind = change.kind();
        match self.apply_change(collection, change).await {
            Ok(outcome) => {
                tracing::info!("Real-time sync: {} on {} ({:?})", kind, collection, outcome);
            }
            Err(e) => {
                tracing::error!("Real-time sync failed for {}: {e}", collection);
            }
        }
    }

    /// Apply one event to the content store.
    pub async fn apply_change(&self, collection: &str, change: RecordChange) -> Result<ChangeOutcome> {
        if !self.config.is_enabled(collection) {
            return Err(SyncError::UnknownCollection(collection.to_string()));
        }

        match change {
            RecordChange::Insert { record } => self.mirror(collection, &record, true).await,
            RecordChange::Update { record } => self.mirror(collection, &record, false).await,
            RecordChange::Delete { id } => self.delete(collection, &id).await,
        }
    }

    async fn mirror(&self, collection: &str, row: &Record, inserted: bool) -> Result<ChangeOutcome> {
        let record = self.transformer.to_content(collection, row)?;
        let id = record.id()?;

        if !self.resolver.needs_existing(Target::Content) {
            return self.create_or_update(collection, &id, record, inserted).await;
        }

        let existing = within(
            format!("Looking up {collection}/{id}"),
            self.config.store_timeout,
            self.content.find_by_id(collection, &id),
        )
        .await??;
        let current = existing.as_ref().map_or(Existing::Absent, |doc| {
            Existing::Present(doc.timestamp(CONTENT_UPDATED_FIELD))
        });

        match self
            .resolver
            .resolve(Target::Content, record.timestamp(CONTENT_UPDATED_FIELD), current)
        {
            Verdict::Write => {
                self.create_or_update(collection, &id, record, existing.is_none())
                    .await
            }
            Verdict::Skip => Ok(ChangeOutcome::Skipped),
            Verdict::Conflict => {
                tracing::warn!(
                    "Conflict on {}/{}: both stores changed, leaving it for manual resolution",
                    collection,
                    id
                );
                Ok(ChangeOutcome::Conflict)
            }
        }
    }

    /// Write `record`, falling back to the other operation when the
    /// preferred one finds the record in an unexpected state.
    async fn create_or_update(
        &self,
        collection: &str,
        id: &RecordId,
        record: Record,
        prefer_create: bool,
    ) -> Result<ChangeOutcome> {
        let timeout = self.config.store_timeout;

        if prefer_create {
            let created = within(
                format!("Creating {collection}/{id}"),
                timeout,
                self.content.create(collection, record.clone()),
            )
            .await?;
            return match created {
                Ok(_) => Ok(ChangeOutcome::Created),
                Err(ContentStoreError::AlreadyExists { .. }) => {
                    within(
                        format!("Updating {collection}/{id}"),
                        timeout,
                        self.content.update(collection, id, record),
                    )
                    .await??;
                    Ok(ChangeOutcome::Updated)
                }
                Err(e) => Err(e.into()),
            };
        }

        let updated = within(
            format!("Updating {collection}/{id}"),
            timeout,
            self.content.update(collection, id, record.clone()),
        )
        .await?;
        match updated {
            Ok(_) => Ok(ChangeOutcome::Updated),
            Err(ContentStoreError::NotFound { .. }) => {
                within(
                    format!("Creating {collection}/{id}"),
                    timeout,
                    self.content.create(collection, record),
                )
                .await??;
                Ok(ChangeOutcome::Created)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, collection: &str, id: &RecordId) -> Result<ChangeOutcome> {
        let deleted = within(
            format!("Deleting {collection}/{id}"),
            self.config.store_timeout,
            self.content.delete(collection, id),
        )
        .await?;

        match deleted {
            Ok(true) => Ok(ChangeOutcome::Deleted),
            Ok(false) | Err(ContentStoreError::NotFound { .. }) => {
                tracing::debug!("{}/{} was already absent from the content store", collection, id);
                Ok(ChangeOutcome::AlreadyAbsent)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
