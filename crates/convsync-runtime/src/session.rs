use std::sync::Arc;

use convsync_core::{
    EventReconciler, IngestEvent, IngestSource, Message, RawChange, SenderDirectory,
    SessionChannels, SessionConfig, SessionEvent, SessionEventStream, StreamState, SyncError,
    Timestamp, normalize_send_outcome,
};
use serde_json::{Map, Value};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    feed::ChangeFeed,
    fetch::MessageFetcher,
    poller::{PollTrigger, PollingFallback, PollingHandle},
    stream::{ChangeStreamClient, ChangeStreamHandle},
    webhook::{OutboundMessage, WebhookSender},
};

/// Upstream connections a session is built from.
#[derive(Clone)]
pub struct SessionTransports {
    pub feed: Arc<dyn ChangeFeed>,
    pub fetcher: Arc<dyn MessageFetcher>,
    pub directory: Arc<dyn SenderDirectory>,
    pub webhook: Option<WebhookSender>,
    /// Sender id stamped on outbound messages.
    pub local_sender: Option<String>,
}

impl SessionTransports {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        fetcher: Arc<dyn MessageFetcher>,
        directory: Arc<dyn SenderDirectory>,
    ) -> Self {
        Self {
            feed,
            fetcher,
            directory,
            webhook: None,
            local_sender: None,
        }
    }

    pub fn with_webhook(mut self, webhook: WebhookSender) -> Self {
        self.webhook = Some(webhook);
        self
    }

    pub fn with_local_sender(mut self, sender: impl Into<String>) -> Self {
        self.local_sender = Some(sender.into());
        self
    }
}

/// Live, ordered view of one conversation.
///
/// Push and poll channels feed a single event loop that owns the message
/// store; readers only ever see published snapshots.
pub struct SyncSession {
    conversation_id: String,
    channels: SessionChannels,
    stop: CancellationToken,
    stream: ChangeStreamHandle,
    poller: PollingHandle,
    messages: watch::Receiver<Arc<Vec<Message>>>,
    event_loop: Option<JoinHandle<()>>,
    webhook: Option<WebhookSender>,
    local_sender: Option<String>,
    closed: bool,
}

impl SyncSession {
    /// Start the event loop, the change stream and the polling fallback.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        config: SessionConfig,
        conversation_id: impl Into<String>,
        transports: SessionTransports,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let (channels, ingest_rx) = SessionChannels::new(config.ingest_buffer, config.event_buffer);
        let stop = CancellationToken::new();
        let (watermark_tx, watermark_rx) = watch::channel(None);
        let (messages_tx, messages_rx) = watch::channel(Arc::new(Vec::new()));

        let poller = PollingFallback::new(Arc::clone(&transports.fetcher), config.poll_interval())
            .start(
                &conversation_id,
                watermark_rx,
                channels.ingest_sender(),
                stop.child_token(),
            );

        let event_loop = SessionLoop {
            conversation_id: conversation_id.clone(),
            initial_load_limit: config.initial_load_limit,
            burst_limit: config.ingest_buffer.max(1),
            fetcher: Arc::clone(&transports.fetcher),
            reconciler: EventReconciler::new(Arc::clone(&transports.directory)),
            channels: channels.clone(),
            ingest_rx,
            stop: stop.clone(),
            catch_up: poller.trigger(),
            watermark_tx,
            messages_tx,
        };
        let event_loop = tokio::spawn(event_loop.run());

        let stream = ChangeStreamClient::new(transports.feed, config.subscribe_timeout()).open(
            &conversation_id,
            channels.ingest_sender(),
            stop.child_token(),
        );

        info!(
            %conversation_id,
            poll_interval_ms = config.poll_interval().as_millis() as u64,
            initial_load_limit = config.initial_load_limit,
            "sync session opened"
        );

        Self {
            conversation_id,
            channels,
            stop,
            stream,
            poller,
            messages: messages_rx,
            event_loop: Some(event_loop),
            webhook: transports.webhook,
            local_sender: transports.local_sender,
            closed: false,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Latest published snapshot, newest first.
    pub fn messages(&self) -> Arc<Vec<Message>> {
        Arc::clone(&self.messages.borrow())
    }

    pub fn watch_messages(&self) -> watch::Receiver<Arc<Vec<Message>>> {
        self.messages.clone()
    }

    pub fn subscribe(&self) -> SessionEventStream {
        self.channels.subscribe()
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn watch_stream_state(&self) -> watch::Receiver<StreamState> {
        self.stream.watch_state()
    }

    /// Resubscribe the change stream after it entered `Error`.
    pub fn restart_stream(&self) -> Result<(), SyncError> {
        if self.closed {
            return Err(SyncError::invalid_state(StreamState::Closed, "restart"));
        }
        self.stream.restart()
    }

    /// Hand a message to the outbound webhook.
    ///
    /// Returns the generated message id, or `None` when no webhook is
    /// configured. Nothing is added to the view; the message appears once it
    /// comes back through an ingestion channel. Failures surface as
    /// [`SessionEvent::SendFailed`].
    pub fn send_message(
        &self,
        text: impl Into<String>,
        reply_to: Option<String>,
        metadata: Map<String, Value>,
    ) -> Option<String> {
        let Some(webhook) = self.webhook.clone() else {
            debug!(conversation_id = %self.conversation_id, "send skipped; no webhook configured");
            return None;
        };
        if self.closed {
            warn!(conversation_id = %self.conversation_id, "send on a closed session ignored");
            return None;
        }

        let message = OutboundMessage::new(&self.conversation_id, self.local_sender.clone(), text)
            .with_reply_to(reply_to)
            .with_metadata(metadata);
        let message_id = message.message_id.clone();
        let channels = self.channels.clone();
        let reported_id = message_id.clone();

        webhook.dispatch(message, move |outcome| {
            if let Some(event) = normalize_send_outcome(reported_id, outcome) {
                channels.emit(event);
            }
        });

        Some(message_id)
    }

    /// Stop both ingestion channels and discard the view. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop.cancel();

        self.stream.shutdown().await;
        self.poller.shutdown().await;
        if let Some(event_loop) = self.event_loop.take()
            && let Err(err) = event_loop.await
        {
            error!(error = %err, "session event loop panicked");
        }

        self.channels.emit(SessionEvent::StreamStateChanged {
            state: StreamState::Closed,
        });
        info!(conversation_id = %self.conversation_id, "sync session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Sole owner of the message store for one session.
struct SessionLoop {
    conversation_id: String,
    initial_load_limit: u16,
    burst_limit: usize,
    fetcher: Arc<dyn MessageFetcher>,
    reconciler: EventReconciler,
    channels: SessionChannels,
    ingest_rx: mpsc::Receiver<IngestEvent>,
    stop: CancellationToken,
    catch_up: PollTrigger,
    watermark_tx: watch::Sender<Option<Timestamp>>,
    messages_tx: watch::Sender<Arc<Vec<Message>>>,
}

impl SessionLoop {
    async fn run(mut self) {
        debug!(conversation_id = %self.conversation_id, "session event loop started");

        if self.initial_load_limit > 0 {
            self.initial_load().await;
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                event = self.ingest_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let mut changed = self.handle(event);
            let mut drained = 1;
            while drained < self.burst_limit && !self.stop.is_cancelled() {
                let Ok(event) = self.ingest_rx.try_recv() else {
                    break;
                };
                changed |= self.handle(event);
                drained += 1;
            }

            if self.stop.is_cancelled() {
                break;
            }
            if changed {
                self.publish();
            }
        }

        self.watermark_tx.send_replace(None);
        self.messages_tx.send_replace(Arc::new(Vec::new()));
        debug!(conversation_id = %self.conversation_id, "session event loop exiting");
    }

    async fn initial_load(&mut self) {
        let load = self
            .fetcher
            .fetch_latest(&self.conversation_id, self.initial_load_limit);
        let fetched = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return,
            fetched = load => fetched,
        };

        match fetched {
            Ok(rows) => {
                debug!(
                    conversation_id = %self.conversation_id,
                    rows = rows.len(),
                    "initial load fetched"
                );
                // Newest first on the wire; apply oldest first.
                let mut changed = false;
                for row in rows.into_iter().rev() {
                    changed |= self.apply(IngestSource::InitialLoad, &RawChange::insert(row));
                }
                if changed {
                    self.publish();
                }
            }
            Err(err) => warn!(
                conversation_id = %self.conversation_id,
                code = %err.code,
                error = %err.message,
                "initial load failed; polling will catch up"
            ),
        }
    }

    /// Returns whether the view changed.
    fn handle(&mut self, event: IngestEvent) -> bool {
        match event {
            IngestEvent::Change { source, raw } => self.apply(source, &raw),
            IngestEvent::StreamState(state) => {
                debug!(conversation_id = %self.conversation_id, ?state, "change stream state");
                if state == StreamState::Subscribed {
                    self.catch_up.poll_now();
                }
                self.channels.emit(SessionEvent::StreamStateChanged { state });
                false
            }
            IngestEvent::StreamFailed(error) => {
                self.channels.emit(SessionEvent::StreamFailed { error });
                false
            }
            IngestEvent::PollFailed(err) => {
                self.channels.emit(SessionEvent::PollFailed {
                    code: err.code,
                    message: err.message,
                });
                false
            }
        }
    }

    fn apply(&mut self, source: IngestSource, raw: &RawChange) -> bool {
        match self.reconciler.apply_raw(raw) {
            Ok(outcome) => {
                trace!(?source, ?outcome, "change applied");
                outcome.changed()
            }
            Err(err) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    ?source,
                    code = %err.code,
                    error = %err.message,
                    "dropping row that does not fit the message schema"
                );
                self.channels.emit(SessionEvent::RowRejected {
                    source,
                    code: err.code,
                    message: err.message,
                });
                false
            }
        }
    }

    fn publish(&self) {
        let store = self.reconciler.store();
        self.watermark_tx.send_replace(store.latest_timestamp());

        let snapshot = Arc::new(store.all());
        let count = snapshot.len();
        self.messages_tx.send_replace(snapshot);
        self.channels.emit(SessionEvent::MessagesChanged { count });
    }
}
