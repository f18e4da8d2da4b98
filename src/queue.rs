//! Priority-aware queue of deferred collection syncs with exponential
//! backoff.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// A deferred sync of one collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncJob {
    pub collection: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    /// Failed attempts so far
    pub attempts: u32,
}

/// Whatever the queue runs its jobs against.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    async fn sync(&self, collection: &str) -> crate::Result<()>;
}

#[async_trait]
impl<T: SyncTarget + ?Sized> SyncTarget for Arc<T> {
    async fn sync(&self, collection: &str) -> crate::Result<()> {
        (**self).sync(collection).await
    }
}

/// What one drain did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// Jobs scheduled for another attempt
    pub retried: usize,
    /// Collections whose job ran out of attempts
    pub dropped: Vec<String>,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.dropped.extend(other.dropped);
    }
}

/// Resets a busy flag when dropped.
pub(crate) struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    /// Set `flag`, or return `None` if it was already set.
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Jobs run in priority order, insertion order within a priority.
///
/// A failed job is put back at the front of the queue after
/// `base_delay * 2^attempts` plus up to half of `base_delay` of jitter,
/// until it has been attempted `max_attempts` times. Only one drain runs at
/// a time.
///
/// Backoff waits run as tasks owned by the queue; [`RetryQueue::cancel_retries`]
/// stops them.
pub struct RetryQueue {
    jobs: Mutex<VecDeque<SyncJob>>,
    draining: AtomicBool,
    pending_retries: AtomicUsize,
    max_attempts: u32,
    base_delay: Duration,
    wakeup: Notify,
    retries: Mutex<Retries>,
}

struct Retries {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RetryQueue {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            pending_retries: AtomicUsize::new(0),
            max_attempts: max_attempts.max(1),
            base_delay,
            wakeup: Notify::new(),
            retries: Mutex::new(Retries {
                cancel: CancellationToken::new(),
                tasks: Vec::new(),
            }),
        }
    }

    pub fn enqueue(&self, collection: &str, priority: Priority) {
        let job = SyncJob {
            collection: collection.to_string(),
            priority,
            enqueued_at: Utc::now(),
            attempts: 0,
        };
        {
            let mut jobs = self.lock();
            let position = jobs
                .iter()
                .position(|queued| queued.priority > priority)
                .unwrap_or(jobs.len());
            jobs.insert(position, job);
        }
        tracing::debug!("Queued {} sync of {}", priority, collection);
        self.wakeup.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Failed jobs waiting out their backoff delay.
    pub fn pending_retries(&self) -> usize {
        self.pending_retries.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Snapshot of the queued jobs in run order.
    pub fn jobs(&self) -> Vec<SyncJob> {
        self.lock().iter().cloned().collect()
    }

    /// Delay before the next attempt of a job that has failed `attempts`
    /// times.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        let half_base = (self.base_delay.as_millis() / 2) as u64;
        let jitter = if half_base == 0 {
            0
        } else {
            rand::rng().random_range(0..=half_base)
        };
        self.base_delay.saturating_mul(factor) + Duration::from_millis(jitter)
    }

    /// Run queued jobs until the queue is empty.
    ///
    /// Returns `None` without doing anything when another drain is running.
    pub async fn drain<T>(self: &Arc<Self>, target: &T) -> Option<DrainReport>
    where
        T: SyncTarget + ?Sized,
    {
        let Some(_busy) = BusyGuard::acquire(&self.draining) else {
            tracing::debug!("Sync queue is already being drained");
            return None;
        };

        let mut report = DrainReport::default();
        while let Some(mut job) = self.pop() {
            report.attempted += 1;
            match target.sync(&job.collection).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    job.attempts += 1;
                    if job.attempts < self.max_attempts {
                        let delay = self.backoff_delay(job.attempts);
                        tracing::warn!(
                            "Sync of {} failed (attempt {}/{}), retrying in {:?}: {e}",
                            job.collection,
                            job.attempts,
                            self.max_attempts,
                            delay
                        );
                        report.retried += 1;
                        self.schedule_retry(job, delay);
                    } else {
                        tracing::error!(
                            "Sync job permanently failed for {} after {} attempts: {e}",
                            job.collection,
                            job.attempts
                        );
                        report.dropped.push(job.collection);
                    }
                }
            }
        }
        Some(report)
    }

    /// Drain repeatedly until no job is queued or waiting for a retry.
    pub async fn drain_until_idle<T>(self: &Arc<Self>, target: &T) -> DrainReport
    where
        T: SyncTarget + ?Sized,
    {
        let mut total = DrainReport::default();
        loop {
            if let Some(report) = self.drain(target).await {
                total.absorb(report);
            }
            if self.is_empty() && self.pending_retries() == 0 {
                return total;
            }
            self.wakeup.notified().await;
        }
    }

    /// Drain whenever jobs arrive, until `cancel` fires.
    pub async fn process<T>(self: Arc<Self>, target: Arc<T>, cancel: CancellationToken)
    where
        T: SyncTarget + ?Sized,
    {
        loop {
            if !self.is_empty() {
                self.drain(target.as_ref()).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wakeup.notified() => {}
            }
        }
        tracing::debug!("Sync queue processor stopped");
    }

    /// Abandon every job waiting out its backoff and wait for the waits to
    /// end. Returns how many jobs were abandoned.
    ///
    /// Retries scheduled afterwards run normally.
    pub async fn cancel_retries(&self) -> usize {
        let (cancel, tasks) = {
            let mut retries = lock(&self.retries);
            let cancel = std::mem::replace(&mut retries.cancel, CancellationToken::new());
            (cancel, std::mem::take(&mut retries.tasks))
        };
        let abandoned = self.pending_retries();
        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Retry task ended abnormally: {e}");
            }
        }
        if abandoned > 0 {
            tracing::info!("Abandoned {} pending sync retries", abandoned);
        }
        abandoned
    }

    fn schedule_retry(self: &Arc<Self>, job: SyncJob, delay: Duration) {
        self.pending_retries.fetch_add(1, Ordering::AcqRel);
        let queue = Arc::clone(self);
        let mut retries = lock(&self.retries);
        let cancel = retries.cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Dropping pending retry of {}", job.collection);
                }
                _ = tokio::time::sleep(delay) => {
                    queue.lock().push_front(job);
                    queue.wakeup.notify_one();
                }
            }
            queue.pending_retries.fetch_sub(1, Ordering::AcqRel);
        });
        retries.tasks.retain(|t| !t.is_finished());
        retries.tasks.push(task);
    }

    fn pop(&self) -> Option<SyncJob> {
        self.lock().pop_front()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SyncJob>> {
        lock(&self.jobs)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncError;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        /// collection -> number of failures before succeeding
        failures: Mutex<HashMap<String, u32>>,
    }

    impl Recorder {
        fn failing(collection: &str, times: u32) -> Self {
            let recorder = Self::default();
            recorder
                .failures
                .lock()
                .unwrap()
                .insert(collection.to_string(), times);
            recorder
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncTarget for Recorder {
        async fn sync(&self, collection: &str) -> crate::Result<()> {
            self.calls.lock().unwrap().push(collection.to_string());
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(collection) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(SyncError::Store(anyhow::anyhow!("{collection} unavailable")))
                }
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_drain_in_priority_order() {
        let queue = Arc::new(RetryQueue::new(3, Duration::from_secs(1)));
        queue.enqueue("a-low", Priority::Low);
        queue.enqueue("b-high", Priority::High);
        queue.enqueue("c-normal", Priority::Normal);
        queue.enqueue("d-high", Priority::High);

        let recorder = Recorder::default();
        let report = queue.drain(&recorder).await.unwrap();

        assert_eq!(recorder.calls(), vec!["b-high", "d-high", "c-normal", "a-low"]);
        assert_eq!(report.succeeded, 4);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_is_dropped_after_max_attempts() {
        let queue = Arc::new(RetryQueue::new(3, Duration::from_secs(1)));
        queue.enqueue("services", Priority::Normal);

        let recorder = Recorder::failing("services", u32::MAX);
        let report = queue.drain_until_idle(&recorder).await;

        assert_eq!(recorder.calls().len(), 3);
        assert_eq!(report.retried, 2);
        assert_eq!(report.dropped, vec!["services"]);
        assert_eq!(queue.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_job_waits_for_backoff() {
        let queue = Arc::new(RetryQueue::new(3, Duration::from_secs(1)));
        queue.enqueue("services", Priority::Normal);
        let recorder = Recorder::failing("services", 1);

        let started = tokio::time::Instant::now();
        let report = queue.drain_until_idle(&recorder).await;

        // first retry waits 2^1 seconds plus up to half a second of jitter
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(2500), "waited {waited:?}");
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.retried, 1);
        assert!(report.dropped.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_goes_to_the_front() {
        let queue = Arc::new(RetryQueue::new(2, Duration::from_millis(10)));
        queue.enqueue("flaky", Priority::Low);
        let recorder = Recorder::failing("flaky", 1);
        queue.drain(&recorder).await.unwrap();
        assert_eq!(queue.pending_retries(), 1);

        queue.enqueue("fresh", Priority::High);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let order: Vec<String> = queue.jobs().into_iter().map(|j| j.collection).collect();
        assert_eq!(order, vec!["flaky", "fresh"]);
        assert_eq!(queue.jobs()[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_retry_never_returns() {
        let queue = Arc::new(RetryQueue::new(3, Duration::from_secs(1)));
        queue.enqueue("flaky", Priority::Normal);
        let recorder = Recorder::failing("flaky", 1);
        queue.drain(&recorder).await.unwrap();
        assert_eq!(queue.pending_retries(), 1);

        assert_eq!(queue.cancel_retries().await, 1);
        assert_eq!(queue.pending_retries(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(queue.is_empty());
        assert_eq!(recorder.calls().len(), 1);

        // later failures are retried again
        queue.enqueue("flaky-again", Priority::Normal);
        let recorder = Recorder::failing("flaky-again", 1);
        let report = queue.drain_until_idle(&recorder).await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(queue.cancel_retries().await, 0);
    }

    #[tokio::test]
    async fn test_drain_is_single_flight() {
        let queue = Arc::new(RetryQueue::new(3, Duration::from_secs(1)));
        let _busy = BusyGuard::acquire(&queue.draining).unwrap();
        queue.enqueue("services", Priority::Normal);

        let recorder = Recorder::default();
        assert!(queue.drain(&recorder).await.is_none());
        assert!(recorder.calls().is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_backoff_delay_grows_exponentially() {
        let queue = RetryQueue::new(5, Duration::from_secs(1));
        for attempts in 1..4u32 {
            let delay = queue.backoff_delay(attempts);
            let floor = Duration::from_secs(1 << attempts);
            assert!(delay >= floor);
            assert!(delay <= floor + Duration::from_millis(500));
        }
        // no overflow on absurd attempt counts
        let _ = queue.backoff_delay(200);
    }
}
