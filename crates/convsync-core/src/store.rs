use std::collections::HashMap;

use crate::types::{Message, Timestamp};

#[derive(Debug, Clone)]
struct StoredMessage {
    message: Message,
    seq: u64,
}

/// Keyed message set for one conversation with a derived ordered view.
///
/// The ordered view is newest first: descending by ordering key, and among
/// equal keys the most recently inserted message comes first.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    entries: HashMap<String, StoredMessage>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new message or replace the stored one with the same id.
    ///
    /// Replacement keeps the original insertion position for tie-breaking.
    pub fn upsert(&mut self, message: Message) {
        if let Some(existing) = self.entries.get_mut(&message.id) {
            existing.message = message;
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(message.id.clone(), StoredMessage { message, seq });
    }

    /// Remove a message; absent ids are not an error.
    pub fn remove(&mut self, id: &str) -> Option<Message> {
        self.entries.remove(id).map(|entry| entry.message)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.entries.get(id).map(|entry| &entry.message)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ordered view, recomputed from the keyed map on every call.
    pub fn all(&self) -> Vec<Message> {
        let mut entries: Vec<&StoredMessage> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            (b.message.ordering_key(), b.seq).cmp(&(a.message.ordering_key(), a.seq))
        });
        entries.into_iter().map(|entry| entry.message.clone()).collect()
    }

    /// Watermark: the newest ordering key held, if any.
    pub fn latest_timestamp(&self) -> Option<Timestamp> {
        self.entries
            .values()
            .map(|entry| entry.message.ordering_key())
            .max()
    }

    pub(crate) fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.values().map(|entry| &entry.message)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.entries.get_mut(id).map(|entry| &mut entry.message)
    }
}
