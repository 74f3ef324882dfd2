use tokio::sync::{broadcast, mpsc};

use crate::types::{IngestEvent, SessionEvent};

/// Broadcast stream handed to session observers.
pub type SessionEventStream = broadcast::Receiver<SessionEvent>;

/// Ingest queue and event fan-out shared by one session's tasks.
///
/// Every ingestion channel writes into the single ingest queue, which is what
/// serializes store mutations onto one event loop.
#[derive(Clone, Debug)]
pub struct SessionChannels {
    ingest_tx: mpsc::Sender<IngestEvent>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionChannels {
    /// Create a new channel set and return it with the ingest receiver.
    pub fn new(
        ingest_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<IngestEvent>) {
        let (ingest_tx, ingest_rx) = mpsc::channel(ingest_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                ingest_tx,
                event_tx,
            },
            ingest_rx,
        )
    }

    /// Clone the ingest sender for a producer task.
    pub fn ingest_sender(&self) -> mpsc::Sender<IngestEvent> {
        self.ingest_tx.clone()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> SessionEventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}
