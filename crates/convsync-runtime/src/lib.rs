//! Async side of the conversation sync engine.
//!
//! A [`SyncSession`] runs a change-stream subscription and a polling fallback
//! against the same conversation and folds both into one ordered view held by
//! a single event-loop task. Transports sit behind the [`ChangeFeed`] and
//! [`MessageFetcher`] traits, with realtime-websocket and REST implementations
//! plus in-memory versions for tests and offline runs.

/// Change-feed transport seam and its in-memory implementation.
pub mod feed;
/// Pull transport seam and its in-memory implementation.
pub mod fetch;
mod http;
/// Interval polling of rows newer than the watermark.
pub mod poller;
/// Realtime websocket change feed.
pub mod realtime;
/// PostgREST-style HTTP row source.
pub mod rest;
/// Session wiring and the store-owning event loop.
pub mod session;
/// Change-stream subscription lifecycle.
pub mod stream;
/// Outbound message delivery.
pub mod webhook;

pub use feed::{ChangeFeed, FeedMessage, FeedSubscription, InMemoryChangeFeed};
pub use fetch::{InMemoryFetcher, MessageFetcher};
pub use poller::{PollTrigger, PollingFallback, PollingHandle};
pub use realtime::RealtimeChangeFeed;
pub use rest::RestMessageFetcher;
pub use session::{SessionTransports, SyncSession};
pub use stream::{ChangeStreamClient, ChangeStreamHandle};
pub use webhook::{OutboundMessage, WebhookSender};
