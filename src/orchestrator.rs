//! Top-level coordination of the sync engine.

use async_trait::async_trait;
use checkpoint::{Watermark, WatermarkManager, WatermarkStore};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use store_sync_content_store::ContentStore;
use store_sync_relational_store::RelationalStore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::collection::{CollectionSyncer, PassOutcome};
use crate::config::SyncConfig;
use crate::error::{bounded, Result, SyncError};
use crate::queue::{BusyGuard, DrainReport, Priority, RetryQueue, SyncTarget};
use crate::realtime::RealtimeListener;
use crate::status::{CollectionFailure, CountComparison, FullSyncReport, SyncStatus};
use crate::transform::RecordTransformer;

#[async_trait]
impl<C, R, W> SyncTarget for CollectionSyncer<C, R, W>
where
    C: ContentStore,
    R: RelationalStore,
    W: WatermarkStore,
{
    async fn sync(&self, collection: &str) -> Result<()> {
        self.sync_collection(collection).await.map(|_| ())
    }
}

#[derive(Default)]
struct History {
    last_sync: Option<chrono::DateTime<Utc>>,
    last_full_sync: Option<FullSyncReport>,
}

struct Background {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the engine's components and drives them.
///
/// Construct one per pair of stores and share it behind an `Arc`.
/// [`initialize`](Self::initialize) starts the real-time listener, the
/// periodic full sync and the retry-queue processor;
/// [`shutdown`](Self::shutdown) stops them again.
pub struct SyncOrchestrator<C, R, W>
where
    C: ContentStore + 'static,
    R: RelationalStore + 'static,
    W: WatermarkStore + 'static,
{
    config: Arc<SyncConfig>,
    content: Arc<C>,
    relational: Arc<R>,
    syncer: Arc<CollectionSyncer<C, R, W>>,
    listener: Arc<RealtimeListener<C, R>>,
    queue: Arc<RetryQueue>,
    syncing: AtomicBool,
    initialized: AtomicBool,
    history: Mutex<History>,
    background: Mutex<Option<Background>>,
}

impl<C, R, W> SyncOrchestrator<C, R, W>
where
    C: ContentStore + 'static,
    R: RelationalStore + 'static,
    W: WatermarkStore + 'static,
{
    pub fn new(config: SyncConfig, content: Arc<C>, relational: Arc<R>, watermarks: W) -> Self {
        Self::with_transformer(config, content, relational, watermarks, RecordTransformer::new())
    }

    pub fn with_transformer(
        config: SyncConfig,
        content: Arc<C>,
        relational: Arc<R>,
        watermarks: W,
        transformer: RecordTransformer,
    ) -> Self {
        let config = Arc::new(config);
        let syncer = CollectionSyncer::new(
            config.clone(),
            content.clone(),
            relational.clone(),
            Arc::new(WatermarkManager::new(watermarks)),
            transformer.clone(),
        );
        let listener = RealtimeListener::new(
            config.clone(),
            content.clone(),
            relational.clone(),
            transformer,
        );
        Self {
            queue: Arc::new(RetryQueue::new(
                config.max_retry_attempts,
                config.retry_base_delay,
            )),
            config,
            content,
            relational,
            syncer: Arc::new(syncer),
            listener: Arc::new(listener),
            syncing: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            history: Mutex::new(History::default()),
            background: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    pub fn listener(&self) -> &Arc<RealtimeListener<C, R>> {
        &self.listener
    }

    /// Start real-time mirroring and the background tasks, then run one
    /// full sync.
    ///
    /// Returns `None` if the orchestrator was already initialized.
    pub async fn initialize(self: &Arc<Self>) -> Option<FullSyncReport> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            tracing::warn!("Sync orchestrator is already initialized");
            return None;
        }

        tracing::info!("Initializing sync orchestrator...");
        self.listener.setup().await;

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let period = self.config.sync_interval;
        if !period.is_zero() && self.config.sync_direction.writes_relational() {
            let orchestrator = Arc::clone(self);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // the first tick completes immediately
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            orchestrator.perform_full_sync().await;
                        }
                    }
                }
                tracing::debug!("Periodic sync stopped");
            }));
            tracing::info!("Periodic sync every {:?}", period);
        }

        tasks.push(tokio::spawn(
            Arc::clone(&self.queue).process(Arc::clone(&self.syncer), cancel.clone()),
        ));
        *lock(&self.background) = Some(Background { cancel, tasks });

        let report = self.perform_full_sync().await;
        tracing::info!("Sync orchestrator initialized");
        report
    }

    /// Sync every enabled collection concurrently.
    ///
    /// Returns `None` without doing anything if a full sync is already
    /// running. Collections that fail are queued for retry.
    pub async fn perform_full_sync(&self) -> Option<FullSyncReport> {
        if !self.config.sync_direction.writes_relational() {
            tracing::info!("Full sync is disabled by the sync direction");
            return Some(FullSyncReport::empty(Utc::now()));
        }
        let Some(_busy) = BusyGuard::acquire(&self.syncing) else {
            tracing::info!("Sync already in progress, skipping...");
            return None;
        };

        let started_at = Utc::now();
        tracing::info!("Starting full sync...");

        let passes = futures::future::join_all(self.config.enabled_collections.iter().map(
            |collection| async move { (collection, self.syncer.sync_collection(collection).await) },
        ))
        .await;

        let mut report = FullSyncReport::empty(started_at);
        for (collection, result) in passes {
            match result {
                Ok(PassOutcome { written, .. }) => {
                    report.records_written += written;
                    report.succeeded.push(collection.clone());
                }
                Err(e) => {
                    tracing::error!("Failed to sync {}: {e}", collection);
                    report.failed.push(CollectionFailure {
                        collection: collection.clone(),
                        error: e.to_string(),
                    });
                    self.queue.enqueue(collection, Priority::Normal);
                }
            }
        }
        report.finished_at = Utc::now();

        tracing::info!(
            "Full sync completed: {} succeeded, {} failed",
            report.succeeded.len(),
            report.failed.len()
        );

        let mut history = lock(&self.history);
        history.last_sync = Some(report.finished_at);
        history.last_full_sync = Some(report.clone());
        Some(report)
    }

    /// Run one pass for a single collection.
    pub async fn sync_collection(&self, collection: &str) -> Result<PassOutcome> {
        self.syncer.sync_collection(collection).await
    }

    /// Queue a sync of `collection` for the queue processor.
    pub fn enqueue(&self, collection: &str, priority: Priority) -> Result<()> {
        if !self.config.is_enabled(collection) {
            return Err(SyncError::UnknownCollection(collection.to_string()));
        }
        self.queue.enqueue(collection, priority);
        Ok(())
    }

    /// Drain the retry queue now. `None` if a drain is already running.
    pub async fn process_queue(&self) -> Option<DrainReport> {
        self.queue.drain(self.syncer.as_ref()).await
    }

    pub fn get_sync_status(&self) -> SyncStatus {
        let history = lock(&self.history);
        SyncStatus {
            is_syncing: self.syncing.load(Ordering::Acquire),
            queue_length: self.queue.len(),
            pending_retries: self.queue.pending_retries(),
            enabled_collections: self.config.enabled_collections.clone(),
            realtime_enabled: self.config.realtime_active(),
            subscriptions: self.listener.subscription_count(),
            last_sync: history.last_sync,
            last_full_sync: history.last_full_sync.clone(),
        }
    }

    /// Compare record counts of every enabled collection across both
    /// stores.
    pub async fn verify(&self) -> Vec<CountComparison> {
        let timeout = self.config.store_timeout;
        futures::future::join_all(self.config.enabled_collections.iter().map(
            |collection| async move {
                let (content, relational) = tokio::join!(
                    bounded(
                        format!("Counting '{collection}' in the content store"),
                        timeout,
                        self.content.count(collection),
                    ),
                    bounded(
                        format!("Counting '{collection}' in the relational store"),
                        timeout,
                        self.relational.count(collection),
                    ),
                );
                let error = match (&content, &relational) {
                    (Err(e), _) | (_, Err(e)) => Some(e.to_string()),
                    _ => None,
                };
                CountComparison {
                    collection: collection.clone(),
                    content: content.ok(),
                    relational: relational.ok(),
                    error,
                }
            },
        ))
        .await
    }

    pub async fn watermark(&self, collection: &str) -> Result<Option<Watermark>> {
        self.check_enabled(collection)?;
        bounded(
            format!("Reading watermark of '{collection}'"),
            self.config.store_timeout,
            self.syncer.watermarks().read(collection),
        )
        .await
    }

    /// Forget a collection's watermark so its next pass syncs everything.
    pub async fn reset_watermark(&self, collection: &str) -> Result<()> {
        self.check_enabled(collection)?;
        bounded(
            format!("Resetting watermark of '{collection}'"),
            self.config.store_timeout,
            self.syncer.watermarks().reset(collection),
        )
        .await
    }

    /// Tear down every real-time subscription. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let removed = self.listener.cleanup().await;
        tracing::info!("Sync orchestrator cleaned up ({} subscriptions removed)", removed);
    }

    /// Stop the background tasks, wait for in-flight work, then clean up.
    ///
    /// Jobs still queued stay queued, but retries waiting out their backoff
    /// are abandoned.
    pub async fn shutdown(&self) {
        let background = lock(&self.background).take();
        if let Some(Background { cancel, tasks }) = background {
            tracing::info!("Stopping background sync tasks...");
            cancel.cancel();
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::warn!("Background sync task ended abnormally: {e}");
                }
            }
        }
        self.queue.cancel_retries().await;
        self.cleanup().await;
        self.initialized.store(false, Ordering::Release);
    }

    fn check_enabled(&self, collection: &str) -> Result<()> {
        if self.config.is_enabled(collection) {
            Ok(())
        } else {
            Err(SyncError::UnknownCollection(collection.to_string()))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
