//! Synchronous core of the conversation sync engine.
//!
//! This crate defines the message model, the keyed store and its ordered
//! view, reply-thread resolution, the idempotent event reconciler, and the
//! lifecycle, error and channel primitives shared with the async runtime.

/// Ingest queue and session event fan-out.
pub mod channel;
/// Sender-name lookup used for derived message fields.
pub mod directory;
/// Stable error type and HTTP classification helpers.
pub mod error;
/// Raw payload coercion into the message schema.
pub mod normalization;
/// Change event reconciliation.
pub mod reconciler;
/// Backoff policy for caller-driven stream restarts.
pub mod retry;
/// Change-stream lifecycle state machine.
pub mod state_machine;
/// Keyed message store with a newest-first view.
pub mod store;
/// Reply-to resolution.
pub mod thread;
/// Message model, wire payloads and session protocol types.
pub mod types;

pub use channel::{SessionChannels, SessionEventStream};
pub use directory::{ConversationMember, MemberDirectory, SenderDirectory};
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use normalization::{
    SendOutcome, normalize_change, normalize_row, normalize_send_outcome, parse_timestamp,
};
pub use reconciler::{ApplyOutcome, EventReconciler};
pub use retry::RetryPolicy;
pub use state_machine::StreamStateMachine;
pub use store::MessageStore;
pub use thread::ThreadResolver;
pub use types::{
    ChangeEvent, ChangeKind, IngestEvent, IngestSource, Message, MessageRow, RawChange,
    SessionConfig, SessionEvent, StreamState, Timestamp, UNKNOWN_SENDER,
};
