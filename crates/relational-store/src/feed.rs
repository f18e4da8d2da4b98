//! Change feed subscription handle.

use sync_core::RecordChange;
use tokio::sync::mpsc;

/// A live subscription to one collection's change events.
///
/// Events arrive in the order the store recorded them. Dropping or closing the
/// feed ends the subscription; the producing side notices and stops.
#[derive(Debug)]
pub struct ChangeFeed {
    collection: String,
    receiver: mpsc::Receiver<RecordChange>,
}

/// Producing half of a [`ChangeFeed`].
#[derive(Debug, Clone)]
pub struct FeedSender {
    sender: mpsc::Sender<RecordChange>,
}

impl ChangeFeed {
    /// Create a feed for `collection` buffering at most `capacity` events.
    pub fn channel(collection: impl Into<String>, capacity: usize) -> (FeedSender, ChangeFeed) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            FeedSender { sender },
            ChangeFeed {
                collection: collection.into(),
                receiver,
            },
        )
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Next change, or `None` once the feed is closed and drained.
    pub async fn recv(&mut self) -> Option<RecordChange> {
        self.receiver.recv().await
    }

    /// Next change if one is already buffered.
    pub fn try_recv(&mut self) -> Option<RecordChange> {
        self.receiver.try_recv().ok()
    }

    /// Stop the subscription. Buffered events can still be received.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl FeedSender {
    /// Deliver a change. Returns `false` if the feed is gone.
    pub async fn send(&self, change: RecordChange) -> bool {
        self.sender.send(change).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves once the feed has been closed or dropped.
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}
