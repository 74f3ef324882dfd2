use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{directory::SenderDirectory, error::SyncError};

/// Timestamp type used for ordering keys and watermarks.
pub type Timestamp = DateTime<Utc>;

/// Display name used when neither the directory nor the row names a sender.
pub const UNKNOWN_SENDER: &str = "Unknown";

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const MIN_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_INITIAL_LOAD_LIMIT: u16 = 100;
const DEFAULT_SUBSCRIBE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// One synchronized conversation message.
///
/// `is_from_me`, `sender_display_name` and `reply_to_message` are derived by
/// the engine and never read from upstream rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Unique identity within the conversation; never reused.
    pub id: String,
    /// Owning conversation, when the row carried it.
    pub conversation_id: Option<String>,
    /// Primary message text.
    pub text: Option<String>,
    /// Alternate body field used by some upstream platforms.
    pub content: Option<String>,
    /// Upstream sender. `None` means the local user authored the message.
    pub sender_id: Option<String>,
    /// Opaque key-value bag carried through untouched.
    pub metadata: Map<String, Value>,
    /// Identity of the message this one replies to.
    pub reply_to: Option<String>,
    /// Creation time (local receipt time when the row had none).
    pub created_at: Timestamp,
    /// Timestamp reported by the upstream platform, preferred for ordering.
    pub platform_timestamp: Option<Timestamp>,
    /// `true` iff `sender_id` is `None`.
    pub is_from_me: bool,
    /// Best-effort human name for the sender.
    pub sender_display_name: String,
    /// Resolved reply target, one level deep.
    pub reply_to_message: Option<Box<Message>>,
}

impl Message {
    /// Sort key: platform timestamp when present, else `created_at`.
    pub fn ordering_key(&self) -> Timestamp {
        self.platform_timestamp.unwrap_or(self.created_at)
    }

    /// Display body: first non-empty of `text` and `content`.
    pub fn body(&self) -> &str {
        [self.text.as_deref(), self.content.as_deref()]
            .into_iter()
            .flatten()
            .find(|body| !body.trim().is_empty())
            .unwrap_or("")
    }

    /// Recompute `is_from_me` and `sender_display_name`.
    pub fn refresh_derived(&mut self, directory: &dyn SenderDirectory) {
        self.is_from_me = self.sender_id.is_none();
        self.sender_display_name = match self.sender_id.as_deref() {
            Some(sender_id) => directory
                .display_name(sender_id)
                .unwrap_or_else(|| sender_id.to_owned()),
            None => directory
                .local_display_name()
                .unwrap_or_else(|| UNKNOWN_SENDER.to_owned()),
        };
        if self.sender_display_name.trim().is_empty() {
            self.sender_display_name = UNKNOWN_SENDER.to_owned();
        }
    }

    /// Copy without a nested reply target, used when embedding as a reply target.
    pub fn detached(&self) -> Message {
        Message {
            reply_to_message: None,
            ..self.clone()
        }
    }
}

/// Validated ingestion-boundary row. Only `id` is mandatory.
///
/// A `None` field means "not present in the payload"; on update it leaves the
/// stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: Option<String>,
    pub text: Option<String>,
    pub content: Option<String>,
    pub sender_id: Option<String>,
    pub metadata: Option<Map<String, Value>>,
    pub reply_to: Option<String>,
    pub created_at: Option<Timestamp>,
    pub platform_timestamp: Option<Timestamp>,
}

impl MessageRow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_platform_timestamp(mut self, platform_timestamp: Timestamp) -> Self {
        self.platform_timestamp = Some(platform_timestamp);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Build a fresh message; derived fields are left for the caller to compute.
    pub fn into_message(self, received_at: Timestamp) -> Message {
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            text: self.text,
            content: self.content,
            sender_id: self.sender_id,
            metadata: self.metadata.unwrap_or_default(),
            reply_to: self.reply_to,
            created_at: self.created_at.unwrap_or(received_at),
            platform_timestamp: self.platform_timestamp,
            is_from_me: false,
            sender_display_name: String::new(),
            reply_to_message: None,
        }
    }

    /// Overwrite only the fields present in this row.
    pub fn merge_into(self, message: &mut Message) {
        if let Some(conversation_id) = self.conversation_id {
            message.conversation_id = Some(conversation_id);
        }
        if let Some(text) = self.text {
            message.text = Some(text);
        }
        if let Some(content) = self.content {
            message.content = Some(content);
        }
        if let Some(sender_id) = self.sender_id {
            message.sender_id = Some(sender_id);
        }
        if let Some(metadata) = self.metadata {
            message.metadata = metadata;
        }
        if let Some(reply_to) = self.reply_to {
            message.reply_to = Some(reply_to);
        }
        if let Some(created_at) = self.created_at {
            message.created_at = created_at;
        }
        if let Some(platform_timestamp) = self.platform_timestamp {
            message.platform_timestamp = Some(platform_timestamp);
        }
    }
}

/// Row-level change kind reported by the change feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Untyped change payload as delivered on the wire.
///
/// Insert and update carry the new row in `new`; delete carries at least the
/// `id` of the removed row in `old`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawChange {
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl RawChange {
    pub fn insert(row: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
        }
    }

    pub fn update(row: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            new: Some(row),
            old: None,
        }
    }

    pub fn delete(old: Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
        }
    }
}

/// Typed change after boundary validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert(MessageRow),
    Update(MessageRow),
    Delete { id: String },
}

/// Channel a change arrived through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IngestSource {
    /// Server-pushed change stream.
    Push,
    /// Timer-driven polling fallback.
    Poll,
    /// History fetched when the session opened.
    InitialLoad,
}

/// Lifecycle state of a change-stream subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamState {
    /// Created, not yet subscribed.
    Init,
    /// Subscribe request in flight.
    Subscribing,
    /// Receiving pushed changes.
    Subscribed,
    /// Transport failed; waiting for an explicit restart.
    Error,
    /// Torn down. Terminal.
    Closed,
}

/// Work item serialized onto a session's event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    /// A raw change from either ingestion channel.
    Change {
        source: IngestSource,
        raw: RawChange,
    },
    /// The change stream moved to a new lifecycle state.
    StreamState(StreamState),
    /// The change stream lost its transport; sent right before it enters `Error`.
    StreamFailed(SyncError),
    /// A poll tick failed; the next tick retries.
    PollFailed(SyncError),
}

/// Notification fanned out to session observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    /// Change-stream lifecycle transition.
    StreamStateChanged { state: StreamState },
    /// Why the change stream is about to report `Error`.
    StreamFailed { error: SyncError },
    /// The ordered view changed; read the new snapshot from the session.
    MessagesChanged { count: usize },
    /// A poll fetch failed.
    PollFailed { code: String, message: String },
    /// A row could not be coerced into the message schema and was dropped.
    RowRejected {
        source: IngestSource,
        code: String,
        message: String,
    },
    /// An outbound send failed. The message is not retried.
    SendFailed {
        message_id: String,
        code: String,
        message: String,
    },
}

/// Tuning values for one sync session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Polling fallback interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Number of newest messages fetched when the session opens. `0` skips the load.
    pub initial_load_limit: u16,
    /// Upper bound on one subscribe attempt before it counts as timed out.
    pub subscribe_timeout_ms: u64,
    /// Capacity of the ingest queue feeding the event loop.
    pub ingest_buffer: usize,
    /// Capacity of the session event broadcast.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            initial_load_limit: DEFAULT_INITIAL_LOAD_LIMIT,
            subscribe_timeout_ms: DEFAULT_SUBSCRIBE_TIMEOUT_MS,
            ingest_buffer: DEFAULT_CHANNEL_BUFFER,
            event_buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }
}

impl SessionConfig {
    /// Poll interval, clamped so a zero value cannot busy-loop.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::directory::MemberDirectory;

    fn ts(millis: i64) -> Timestamp {
        Utc.timestamp_millis_opt(millis).single().expect("valid timestamp")
    }

    #[test]
    fn ordering_key_prefers_platform_timestamp() {
        let mut message = MessageRow::new("1")
            .with_created_at(ts(100))
            .into_message(ts(0));
        assert_eq!(message.ordering_key(), ts(100));

        message.platform_timestamp = Some(ts(40));
        assert_eq!(message.ordering_key(), ts(40));
    }

    #[test]
    fn missing_created_at_falls_back_to_receipt_time() {
        let message = MessageRow::new("1").into_message(ts(777));
        assert_eq!(message.created_at, ts(777));
    }

    #[test]
    fn body_skips_blank_text() {
        let mut message = MessageRow::new("1").with_text("  ").into_message(ts(0));
        message.content = Some("from content".into());
        assert_eq!(message.body(), "from content");
    }

    #[test]
    fn derived_sender_fields_follow_directory_then_id_then_unknown() {
        let directory = MemberDirectory::default().with_member("m1", Some("+15550001"), "Ana");

        let mut named = MessageRow::new("1").with_sender("+15550001").into_message(ts(0));
        named.refresh_derived(&directory);
        assert!(!named.is_from_me);
        assert_eq!(named.sender_display_name, "Ana");

        let mut raw_id = MessageRow::new("2").with_sender("+15559999").into_message(ts(0));
        raw_id.refresh_derived(&directory);
        assert_eq!(raw_id.sender_display_name, "+15559999");

        let mut mine = MessageRow::new("3").into_message(ts(0));
        mine.refresh_derived(&directory);
        assert!(mine.is_from_me);
        assert_eq!(mine.sender_display_name, UNKNOWN_SENDER);
    }

    #[test]
    fn merge_only_overwrites_present_fields() {
        let mut metadata = Map::new();
        metadata.insert("channel".into(), json!("whatsapp"));
        let mut message = MessageRow::new("1")
            .with_text("original")
            .with_reply_to("7")
            .with_metadata(metadata.clone())
            .with_created_at(ts(10))
            .into_message(ts(0));

        MessageRow::new("1").with_text("edited").merge_into(&mut message);

        assert_eq!(message.text.as_deref(), Some("edited"));
        assert_eq!(message.reply_to.as_deref(), Some("7"));
        assert_eq!(message.metadata, metadata);
        assert_eq!(message.created_at, ts(10));
    }

    #[test]
    fn raw_change_uses_wire_field_names() {
        let raw: RawChange = serde_json::from_value(json!({
            "eventType": "DELETE",
            "old": { "id": "42" }
        }))
        .expect("payload should decode");

        assert_eq!(raw.kind, ChangeKind::Delete);
        assert_eq!(raw.new, None);
        assert_eq!(raw.old, Some(json!({ "id": "42" })));
    }

    #[test]
    fn session_config_clamps_zero_poll_interval() {
        let config = SessionConfig {
            poll_interval_ms: 0,
            ..SessionConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(MIN_POLL_INTERVAL_MS));
        assert_eq!(
            SessionConfig::default().poll_interval(),
            Duration::from_secs(5)
        );
    }
}
