//! Scripted traffic for runs without a real data store.

use chrono::{Duration as ChronoDuration, Utc};
use convsync_core::{ConversationMember, RawChange, SyncError};
use convsync_runtime::{InMemoryChangeFeed, InMemoryFetcher};
use serde_json::{Value, json};
use tracing::debug;

const SEED_ROWS: i64 = 3;
/// Every this many steps the live subscription is dropped.
const BREAK_EVERY: u64 = 5;
const PEER_ID: &str = "demo-peer";

fn row(
    conversation_id: &str,
    id: &str,
    text: &str,
    sender_id: Option<&str>,
    age_secs: i64,
) -> Value {
    let created_at = Utc::now() - ChronoDuration::seconds(age_secs);
    json!({
        "id": id,
        "conversation_id": conversation_id,
        "text": text,
        "sender_id": sender_id,
        "created_at": created_at.to_rfc3339(),
        "metadata": { "source": "demo" },
    })
}

/// Member list backing sender names.
pub fn members() -> Vec<ConversationMember> {
    vec![ConversationMember {
        id: PEER_ID.to_owned(),
        name: Some("Demo Peer".to_owned()),
        external_id: None,
    }]
}

/// History for the initial load.
pub fn seed(fetcher: &InMemoryFetcher, conversation_id: &str) {
    for n in 0..SEED_ROWS {
        let id = format!("seed-{n}");
        let sender = (n % 2 == 0).then_some(PEER_ID);
        fetcher.insert_row(
            conversation_id,
            row(conversation_id, &id, &format!("earlier message {n}"), sender, 600 - n * 60),
        );
    }
}

/// Drives the in-memory transports the way a live upstream would.
#[derive(Debug)]
pub struct DemoTraffic {
    conversation_id: String,
    feed: InMemoryChangeFeed,
    fetcher: InMemoryFetcher,
    step: u64,
}

impl DemoTraffic {
    pub fn new(conversation_id: &str, feed: InMemoryChangeFeed, fetcher: InMemoryFetcher) -> Self {
        Self {
            conversation_id: conversation_id.to_owned(),
            feed,
            fetcher,
            step: 0,
        }
    }

    pub fn step(&mut self) {
        self.step += 1;
        let id = format!("live-{}", self.step);
        let payload = row(
            &self.conversation_id,
            &id,
            &format!("live message {}", self.step),
            Some(PEER_ID),
            0,
        );

        // The table always gets the row; the stream may miss it while broken.
        self.fetcher.insert_row(&self.conversation_id, payload.clone());
        let delivered = self.feed.push(&self.conversation_id, RawChange::insert(payload));
        debug!(%id, delivered, "demo row written");

        if self.step % 3 == 0 {
            let text = format!("live message {} (edited)", self.step);
            let edited = json!({ "id": id, "text": text });
            self.feed.push(&self.conversation_id, RawChange::update(edited));
        }
        if self.step % BREAK_EVERY == 0 {
            self.feed.break_subscriptions(
                &self.conversation_id,
                SyncError::transport("demo connection reset"),
            );
        }
    }
}
