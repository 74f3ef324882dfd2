use crate::{error::SyncError, types::StreamState};

/// Change-stream subscription lifecycle.
///
/// `Error` is only left through an explicit [`restart`](Self::restart) or
/// [`close`](Self::close); nothing here retries on its own.
#[derive(Debug, Clone)]
pub struct StreamStateMachine {
    state: StreamState,
}

impl Default for StreamStateMachine {
    fn default() -> Self {
        Self {
            state: StreamState::Init,
        }
    }
}

impl StreamStateMachine {
    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    pub fn subscribe(&mut self) -> Result<StreamState, SyncError> {
        self.transition_from_state(StreamState::Init, StreamState::Subscribing, "subscribe")
    }

    pub fn on_subscribed(&mut self) -> Result<StreamState, SyncError> {
        self.transition_from_state(
            StreamState::Subscribing,
            StreamState::Subscribed,
            "on_subscribed",
        )
    }

    pub fn on_transport_error(&mut self) -> Result<StreamState, SyncError> {
        self.transition_from_any_of(
            &[StreamState::Subscribing, StreamState::Subscribed],
            StreamState::Error,
            "on_transport_error",
        )
    }

    pub fn restart(&mut self) -> Result<StreamState, SyncError> {
        self.transition_from_state(StreamState::Error, StreamState::Subscribing, "restart")
    }

    /// Move to `Closed`. Returns `None` when already closed.
    pub fn close(&mut self) -> Option<StreamState> {
        if self.is_closed() {
            return None;
        }
        self.state = StreamState::Closed;
        Some(self.state)
    }

    fn transition_from_state(
        &mut self,
        expected: StreamState,
        next: StreamState,
        action: &str,
    ) -> Result<StreamState, SyncError> {
        self.transition_from_any_of(&[expected], next, action)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[StreamState],
        next: StreamState,
        action: &str,
    ) -> Result<StreamState, SyncError> {
        if !expected.contains(&self.state) {
            return Err(SyncError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(next)
    }
}
