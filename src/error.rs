//! Engine error type.

use std::time::Duration;
use store_sync_content_store::ContentStoreError;
use sync_core::RecordError;

/// Errors surfaced by the sync engine's operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Collection '{0}' is not enabled for sync")]
    UnknownCollection(String),

    #[error("{operation} is disabled by the configured sync direction")]
    DirectionDisabled { operation: &'static str },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    #[error("Failed to transform record: {0}")]
    Transform(#[from] RecordError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<ContentStoreError> for SyncError {
    fn from(err: ContentStoreError) -> Self {
        match err {
            ContentStoreError::Backend(e) => SyncError::Store(e),
            other => SyncError::Store(anyhow::Error::new(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Run a store call under `timeout`, mapping elapsed time to
/// [`SyncError::Timeout`] and leaving the call's own result untouched.
pub(crate) async fn within<F>(operation: impl Into<String>, timeout: Duration, call: F) -> Result<F::Output>
where
    F: std::future::Future,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| SyncError::Timeout {
            operation: operation.into(),
            after: timeout,
        })
}

/// Like [`within`], also converting the call's error into a [`SyncError`].
pub(crate) async fn bounded<T, E, F>(operation: impl Into<String>, timeout: Duration, call: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, E>>,
    SyncError: From<E>,
{
    within(operation, timeout, call).await?.map_err(SyncError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let err = bounded("slow call", Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::Timeout { .. }));
        assert_eq!(err.to_string(), "slow call timed out after 1s");
    }

    #[tokio::test]
    async fn test_bounded_passes_errors_through() {
        let err = bounded("call", Duration::from_secs(1), async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
