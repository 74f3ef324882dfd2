use std::{
    future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use convsync_core::{RawChange, SyncError};
use tokio::sync::mpsc;

const IN_MEMORY_SUBSCRIPTION_BUFFER: usize = 64;

/// Item delivered by a live change-feed subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// A row-level insert/update/delete.
    Change(RawChange),
    /// The transport failed; the subscription is dead.
    Error(SyncError),
    /// The upstream channel timed out; the subscription is dead.
    TimedOut,
}

/// Receiving side of one change-feed subscription.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct FeedSubscription {
    rx: mpsc::Receiver<FeedMessage>,
}

impl FeedSubscription {
    pub fn new(rx: mpsc::Receiver<FeedMessage>) -> Self {
        Self { rx }
    }

    /// Create a subscription together with the sender a transport feeds.
    pub fn channel(buffer: usize) -> (mpsc::Sender<FeedMessage>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(rx))
    }

    /// Next pushed item; `None` once the transport hung up.
    pub async fn next(&mut self) -> Option<FeedMessage> {
        self.rx.recv().await
    }
}

/// Server-pushed change notifications for one conversation's messages.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to insert/update/delete changes filtered by `conversation_id`.
    async fn subscribe(&self, conversation_id: &str) -> Result<FeedSubscription, SyncError>;
}

#[derive(Debug, Default)]
struct FeedState {
    subscribers: Vec<(String, mpsc::Sender<FeedMessage>)>,
    failures_remaining: usize,
    stalled: bool,
    subscribe_count: usize,
}

/// Process-local change feed for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryChangeFeed {
    state: Arc<Mutex<FeedState>>,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a change to every live subscriber of `conversation_id`.
    ///
    /// Returns how many subscribers accepted it. Full or closed subscribers
    /// miss the change, like a lossy transport would.
    pub fn push(&self, conversation_id: &str, change: RawChange) -> usize {
        self.broadcast(conversation_id, FeedMessage::Change(change))
    }

    /// Kill every live subscription of `conversation_id` with `err`.
    pub fn break_subscriptions(&self, conversation_id: &str, err: SyncError) -> usize {
        let delivered = self.broadcast(conversation_id, FeedMessage::Error(err));
        self.lock()
            .subscribers
            .retain(|(conversation, _)| conversation != conversation_id);
        delivered
    }

    /// Make the next `count` subscribe attempts fail.
    pub fn fail_next_subscriptions(&self, count: usize) {
        self.lock().failures_remaining = count;
    }

    /// While stalled, subscribe attempts never complete.
    pub fn set_stalled(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    pub fn subscribe_count(&self) -> usize {
        self.lock().subscribe_count
    }

    pub fn active_subscribers(&self, conversation_id: &str) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state
            .subscribers
            .iter()
            .filter(|(conversation, _)| conversation == conversation_id)
            .count()
    }

    fn broadcast(&self, conversation_id: &str, message: FeedMessage) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state
            .subscribers
            .iter()
            .filter(|(conversation, _)| conversation == conversation_id)
            .filter(|(_, tx)| tx.try_send(message.clone()).is_ok())
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn subscribe(&self, conversation_id: &str) -> Result<FeedSubscription, SyncError> {
        let stalled = {
            let mut state = self.lock();
            state.subscribe_count += 1;
            if state.failures_remaining > 0 {
                state.failures_remaining -= 1;
                return Err(SyncError::transport("subscription rejected by channel"));
            }
            state.stalled
        };

        if stalled {
            future::pending::<()>().await;
        }

        let (tx, subscription) = FeedSubscription::channel(IN_MEMORY_SUBSCRIPTION_BUFFER);
        self.lock().subscribers.push((conversation_id.to_owned(), tx));
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn delivers_only_to_matching_conversation() {
        let feed = InMemoryChangeFeed::new();
        let mut a = feed.subscribe("conv-a").await.expect("subscribe a");
        let _b = feed.subscribe("conv-b").await.expect("subscribe b");

        let delivered = feed.push("conv-a", RawChange::insert(json!({ "id": "1" })));
        assert_eq!(delivered, 1);
        assert_eq!(
            a.next().await,
            Some(FeedMessage::Change(RawChange::insert(json!({ "id": "1" }))))
        );
        assert_eq!(feed.subscribe_count(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let feed = InMemoryChangeFeed::new();
        feed.fail_next_subscriptions(1);

        let err = feed
            .subscribe("conv")
            .await
            .expect_err("first subscribe should fail");
        assert_eq!(err.code, "transport_error");
        feed.subscribe("conv").await.expect("second subscribe works");
    }

    #[tokio::test]
    async fn dropped_subscriptions_stop_counting() {
        let feed = InMemoryChangeFeed::new();
        let subscription = feed.subscribe("conv").await.expect("subscribe");
        assert_eq!(feed.active_subscribers("conv"), 1);

        drop(subscription);
        assert_eq!(feed.active_subscribers("conv"), 0);
        assert_eq!(feed.push("conv", RawChange::delete(json!({ "id": "1" }))), 0);
    }

    #[tokio::test]
    async fn breaking_subscriptions_delivers_error_then_detaches() {
        let feed = InMemoryChangeFeed::new();
        let mut subscription = feed.subscribe("conv").await.expect("subscribe");

        feed.break_subscriptions("conv", SyncError::transport("socket reset"));
        assert!(matches!(subscription.next().await, Some(FeedMessage::Error(_))));
        assert_eq!(subscription.next().await, None);
    }
}
