use std::{sync::Arc, time::Duration};

use convsync_core::{IngestEvent, IngestSource, StreamState, StreamStateMachine, SyncError};
use tokio::{
    sync::{Notify, mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::feed::{ChangeFeed, FeedMessage, FeedSubscription};

/// Opens change-stream subscriptions and forwards pushed rows to a session.
#[derive(Clone)]
pub struct ChangeStreamClient {
    feed: Arc<dyn ChangeFeed>,
    subscribe_timeout: Duration,
}

impl ChangeStreamClient {
    pub fn new(feed: Arc<dyn ChangeFeed>, subscribe_timeout: Duration) -> Self {
        Self {
            feed,
            subscribe_timeout,
        }
    }

    /// Subscribe to `conversation_id` and forward every pushed change to `ingest`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        &self,
        conversation_id: impl Into<String>,
        ingest: mpsc::Sender<IngestEvent>,
        stop: CancellationToken,
    ) -> ChangeStreamHandle {
        let conversation_id = conversation_id.into();
        let restart = Arc::new(Notify::new());
        let state = Arc::new(watch::Sender::new(StreamState::Init));

        let worker = StreamWorker {
            feed: Arc::clone(&self.feed),
            conversation_id: conversation_id.clone(),
            subscribe_timeout: self.subscribe_timeout,
            ingest,
            stop: stop.clone(),
            restart: Arc::clone(&restart),
            state: Arc::clone(&state),
            machine: StreamStateMachine::default(),
        };
        let task = tokio::spawn(worker.run());

        ChangeStreamHandle {
            conversation_id,
            stop,
            restart,
            state,
            task: Some(task),
        }
    }
}

/// Owner handle for one open change-stream subscription.
///
/// Dropping the handle closes the stream.
#[derive(Debug)]
pub struct ChangeStreamHandle {
    conversation_id: String,
    stop: CancellationToken,
    restart: Arc<Notify>,
    state: Arc<watch::Sender<StreamState>>,
    task: Option<JoinHandle<()>>,
}

impl ChangeStreamHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    /// Resubscribe after a transport failure. Only valid in `Error`.
    ///
    /// Acceptance moves the state to `Subscribing` in the same step, so each
    /// failure admits exactly one restart.
    pub fn restart(&self) -> Result<(), SyncError> {
        if self.stop.is_cancelled() {
            return Err(SyncError::invalid_state(self.state(), "restart"));
        }

        let mut current = StreamState::Error;
        let accepted = self.state.send_if_modified(|state| {
            current = *state;
            if *state != StreamState::Error {
                return false;
            }
            *state = StreamState::Subscribing;
            true
        });
        if !accepted {
            return Err(SyncError::invalid_state(current, "restart"));
        }

        self.restart.notify_one();
        Ok(())
    }

    /// Unsubscribe. No change is forwarded once this returns.
    pub fn close(&self) {
        self.stop.cancel();
    }

    /// Close and wait for the stream task to finish.
    pub async fn shutdown(&mut self) {
        self.close();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            error!(error = %err, "change stream task panicked");
        }
    }
}

impl Drop for ChangeStreamHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

enum PumpEnd {
    Cancelled,
    Failed(SyncError),
}

struct StreamWorker {
    feed: Arc<dyn ChangeFeed>,
    conversation_id: String,
    subscribe_timeout: Duration,
    ingest: mpsc::Sender<IngestEvent>,
    stop: CancellationToken,
    restart: Arc<Notify>,
    state: Arc<watch::Sender<StreamState>>,
    machine: StreamStateMachine,
}

impl StreamWorker {
    async fn run(mut self) {
        debug!(conversation_id = %self.conversation_id, "change stream task started");
        let mut transition = self.machine.subscribe();

        loop {
            if !self.publish(transition).await {
                break;
            }

            let failure = match self.subscribe_once().await {
                Some(Ok(subscription)) => {
                    let subscribed = self.machine.on_subscribed();
                    if !self.publish(subscribed).await {
                        break;
                    }
                    info!(conversation_id = %self.conversation_id, "change stream subscribed");
                    match self.pump(subscription).await {
                        PumpEnd::Cancelled => break,
                        PumpEnd::Failed(err) => err,
                    }
                }
                Some(Err(err)) => err,
                None => break,
            };

            warn!(
                conversation_id = %self.conversation_id,
                code = %failure.code,
                error = %failure.message,
                "change stream failed; polling covers until restart"
            );
            if !self.forward(IngestEvent::StreamFailed(failure)).await {
                break;
            }
            let errored = self.machine.on_transport_error();
            if !self.publish(errored).await {
                break;
            }

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = self.restart.notified() => {}
            }
            debug!(conversation_id = %self.conversation_id, "change stream restart requested");
            transition = self.machine.restart();
        }

        self.machine.close();
        self.state.send_replace(StreamState::Closed);
        debug!(conversation_id = %self.conversation_id, "change stream task exiting");
    }

    /// `None` when cancelled while subscribing.
    async fn subscribe_once(&self) -> Option<Result<FeedSubscription, SyncError>> {
        let attempt = tokio::time::timeout(
            self.subscribe_timeout,
            self.feed.subscribe(&self.conversation_id),
        );
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            result = attempt => Some(match result {
                Ok(subscribed) => subscribed,
                Err(_) => Err(SyncError::subscribe_timeout(self.subscribe_timeout)),
            }),
        }
    }

    async fn pump(&self, mut subscription: FeedSubscription) -> PumpEnd {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return PumpEnd::Cancelled,
                message = subscription.next() => message,
            };

            match message {
                Some(FeedMessage::Change(raw)) => {
                    let event = IngestEvent::Change {
                        source: IngestSource::Push,
                        raw,
                    };
                    if !self.forward(event).await {
                        return PumpEnd::Cancelled;
                    }
                }
                Some(FeedMessage::Error(err)) => return PumpEnd::Failed(err),
                Some(FeedMessage::TimedOut) => {
                    return PumpEnd::Failed(SyncError::transport("change feed timed out"));
                }
                None => return PumpEnd::Failed(SyncError::transport("change feed closed")),
            }
        }
    }

    /// Record a transition; `false` means the session is gone and the task should stop.
    async fn publish(&self, transition: Result<StreamState, SyncError>) -> bool {
        let state = match transition {
            Ok(state) => state,
            Err(err) => {
                error!(error = %err, "change stream lifecycle violated");
                return !self.stop.is_cancelled();
            }
        };

        self.state.send_replace(state);
        self.forward(IngestEvent::StreamState(state)).await
    }

    /// Queue `event` unless closed first, including while the queue is full.
    async fn forward(&self, event: IngestEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            sent = self.ingest.send(event) => sent.is_ok(),
        }
    }
}
