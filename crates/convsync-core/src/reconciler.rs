use std::{fmt, sync::Arc};

use chrono::Utc;
use tracing::trace;

use crate::{
    directory::SenderDirectory,
    error::SyncError,
    normalization::normalize_change,
    store::MessageStore,
    thread::ThreadResolver,
    types::{ChangeEvent, MessageRow, RawChange, Timestamp},
};

/// What a single reconciliation step did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    Removed,
    /// Redelivery or delete of an unknown id; the store is unchanged.
    Ignored,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        self != Self::Ignored
    }
}

/// Merges change events from every ingestion channel into one store.
///
/// Every operation is idempotent under redelivery, so neither channel has to
/// deduplicate on its own. A thread relink pass runs after every mutation.
pub struct EventReconciler {
    store: MessageStore,
    directory: Arc<dyn SenderDirectory>,
    clock: fn() -> Timestamp,
}

impl fmt::Debug for EventReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventReconciler")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl EventReconciler {
    pub fn new(directory: Arc<dyn SenderDirectory>) -> Self {
        Self {
            store: MessageStore::new(),
            directory,
            clock: Utc::now,
        }
    }

    /// Override the receipt-time source used for rows without `created_at`.
    pub fn with_clock(mut self, clock: fn() -> Timestamp) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Decode a wire change and apply it.
    pub fn apply_raw(&mut self, raw: &RawChange) -> Result<ApplyOutcome, SyncError> {
        let change = normalize_change(raw)?;
        Ok(self.apply(change))
    }

    pub fn apply(&mut self, change: ChangeEvent) -> ApplyOutcome {
        match change {
            ChangeEvent::Insert(row) => self.apply_insert(row),
            ChangeEvent::Update(row) => self.apply_update(row),
            ChangeEvent::Delete { id } => self.apply_delete(&id),
        }
    }

    /// Create the message unless its id is already live.
    pub fn apply_insert(&mut self, row: MessageRow) -> ApplyOutcome {
        if self.store.contains(&row.id) {
            trace!(id = %row.id, "insert for known id ignored");
            return ApplyOutcome::Ignored;
        }

        let mut message = row.into_message((self.clock)());
        message.refresh_derived(self.directory.as_ref());
        let message = ThreadResolver::resolve(&message, &self.store);
        trace!(id = %message.id, "message inserted");
        self.store.upsert(message);
        self.relink();
        ApplyOutcome::Inserted
    }

    /// Merge present fields into the live message, or insert if it is unknown.
    pub fn apply_update(&mut self, row: MessageRow) -> ApplyOutcome {
        let Some(existing) = self.store.get(&row.id) else {
            trace!(id = %row.id, "update raced ahead of insert; inserting");
            return self.apply_insert(row);
        };

        let mut message = existing.clone();
        row.merge_into(&mut message);
        message.refresh_derived(self.directory.as_ref());
        let message = ThreadResolver::resolve(&message, &self.store);
        trace!(id = %message.id, "message updated");
        self.store.upsert(message);
        self.relink();
        ApplyOutcome::Updated
    }

    pub fn apply_delete(&mut self, id: &str) -> ApplyOutcome {
        if self.store.remove(id).is_none() {
            trace!(%id, "delete for unknown id ignored");
            return ApplyOutcome::Ignored;
        }
        trace!(%id, "message removed");
        self.relink();
        ApplyOutcome::Removed
    }

    fn relink(&mut self) {
        let relinked = ThreadResolver::relink(&mut self.store);
        if relinked > 0 {
            trace!(relinked, "reply links refreshed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::TimeZone;
    use serde_json::{Map, json};

    use super::*;
    use crate::{directory::MemberDirectory, types::Message};

    fn ts(millis: i64) -> Timestamp {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn fixed_clock() -> Timestamp {
        ts(1_000)
    }

    fn reconciler() -> EventReconciler {
        let directory = MemberDirectory::default().with_member("m1", Some("alice-phone"), "Alice");
        EventReconciler::new(Arc::new(directory)).with_clock(fixed_clock)
    }

    fn row(id: &str, millis: i64) -> MessageRow {
        MessageRow::new(id)
            .with_text(format!("text {id}"))
            .with_created_at(ts(millis))
    }

    fn view(reconciler: &EventReconciler) -> Vec<Message> {
        reconciler.store().all()
    }

    fn assert_sorted_desc(messages: &[Message]) {
        assert!(
            messages
                .windows(2)
                .all(|pair| pair[0].ordering_key() >= pair[1].ordering_key()),
            "view must be newest first"
        );
    }

    #[test]
    fn insert_is_idempotent() {
        let mut once = reconciler();
        once.apply_insert(row("1", 100));

        let mut twice = reconciler();
        assert_eq!(twice.apply_insert(row("1", 100)), ApplyOutcome::Inserted);
        assert_eq!(twice.apply_insert(row("1", 100)), ApplyOutcome::Ignored);

        assert_eq!(view(&once), view(&twice));
    }

    #[test]
    fn duplicate_insert_does_not_overwrite_edits() {
        let mut rec = reconciler();
        rec.apply_insert(row("1", 100));
        rec.apply_update(MessageRow::new("1").with_text("edited"));

        // a poll returning the stale original row must not roll back the edit
        rec.apply_insert(row("1", 100));
        assert_eq!(rec.store().get("1").unwrap().text.as_deref(), Some("edited"));
    }

    #[test]
    fn push_then_poll_of_same_row_keeps_one_message() {
        let mut rec = reconciler();
        let payload = json!({ "id": "5", "text": "hi", "created_at": "2024-01-01T00:00:00Z" });

        rec.apply_raw(&RawChange::insert(payload.clone()))
            .expect("push insert decodes");
        let outcome = rec
            .apply_raw(&RawChange::insert(payload))
            .expect("polled row decodes");

        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert_eq!(rec.store().len(), 1);
    }

    #[test]
    fn update_preserves_unset_fields() {
        let mut metadata = Map::new();
        metadata.insert("platform".into(), json!("whatsapp"));

        let mut rec = reconciler();
        rec.apply_insert(row("7", 10));
        rec.apply_insert(row("8", 20).with_reply_to("7").with_metadata(metadata.clone()));

        rec.apply_raw(&RawChange::update(json!({ "id": "8", "text": "edited" })))
            .expect("update decodes");

        let message = rec.store().get("8").unwrap();
        assert_eq!(message.text.as_deref(), Some("edited"));
        assert_eq!(message.metadata, metadata);
        assert_eq!(message.reply_to.as_deref(), Some("7"));
        assert_eq!(message.created_at, ts(20));
        assert!(message.reply_to_message.is_some());
    }

    #[test]
    fn update_for_unknown_id_inserts() {
        let mut rec = reconciler();
        assert_eq!(rec.apply_update(row("9", 10)), ApplyOutcome::Inserted);
        assert!(rec.store().contains("9"));
    }

    #[test]
    fn update_recomputes_derived_fields() {
        let mut rec = reconciler();
        rec.apply_insert(row("1", 10));
        let mine = rec.store().get("1").unwrap();
        assert!(mine.is_from_me);

        rec.apply_update(MessageRow::new("1").with_sender("alice-phone"));
        let theirs = rec.store().get("1").unwrap();
        assert!(!theirs.is_from_me);
        assert_eq!(theirs.sender_display_name, "Alice");
    }

    #[test]
    fn delete_is_idempotent_and_does_not_poison_reinsert() {
        let mut rec = reconciler();
        rec.apply_insert(row("42", 10));

        assert_eq!(rec.apply_delete("42"), ApplyOutcome::Removed);
        assert_eq!(rec.apply_delete("42"), ApplyOutcome::Ignored);

        rec.apply_insert(row("42", 30).with_text("second life"));
        let message = rec.store().get("42").expect("reinserted");
        assert_eq!(message.text.as_deref(), Some("second life"));
    }

    #[test]
    fn reply_resolves_once_target_arrives() {
        let mut rec = reconciler();
        rec.apply_insert(row("8", 20).with_reply_to("7"));
        assert_eq!(rec.store().get("8").unwrap().reply_to_message, None);

        rec.apply_insert(row("7", 10));
        let target = rec
            .store()
            .get("8")
            .unwrap()
            .reply_to_message
            .clone()
            .expect("reply should resolve after target insert");
        assert_eq!(target.id, "7");
    }

    #[test]
    fn reply_target_tracks_updates_and_deletes() {
        let mut rec = reconciler();
        rec.apply_insert(row("7", 10));
        rec.apply_insert(row("8", 20).with_reply_to("7"));

        rec.apply_update(MessageRow::new("7").with_text("reworded"));
        let target = rec.store().get("8").unwrap().reply_to_message.clone().unwrap();
        assert_eq!(target.text.as_deref(), Some("reworded"));

        rec.apply_delete("7");
        let reply = rec.store().get("8").unwrap();
        assert_eq!(reply.reply_to_message, None);
        assert_eq!(reply.reply_to.as_deref(), Some("7"));
    }

    #[test]
    fn edit_scenario_orders_descending() {
        let mut rec = reconciler();
        rec.apply(ChangeEvent::Insert(row("1", 100)));
        rec.apply(ChangeEvent::Insert(row("2", 50)));
        rec.apply(ChangeEvent::Update(MessageRow::new("1").with_text("edited")));

        let messages = view(&rec);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "1");
        assert_eq!(messages[0].text.as_deref(), Some("edited"));
        assert_eq!(messages[0].ordering_key(), ts(100));
        assert_eq!(messages[1].id, "2");
        assert_eq!(messages[1].ordering_key(), ts(50));
    }

    #[test]
    fn order_holds_after_every_step() {
        let mut rec = reconciler();
        let steps = vec![
            ChangeEvent::Insert(row("a", 300)),
            ChangeEvent::Insert(row("b", 100)),
            ChangeEvent::Update(MessageRow::new("b").with_platform_timestamp(ts(900))),
            ChangeEvent::Insert(row("c", 200)),
            ChangeEvent::Delete { id: "a".into() },
            ChangeEvent::Update(row("d", 50)),
            ChangeEvent::Update(MessageRow::new("c").with_created_at(ts(1_000))),
            ChangeEvent::Insert(row("a", 10)),
        ];

        for step in steps {
            rec.apply(step);
            assert_sorted_desc(&view(&rec));
        }

        let ids: Vec<String> = view(&rec).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["c", "b", "d", "a"]);
    }

    #[test]
    fn rows_without_created_at_use_receipt_time() {
        let mut rec = reconciler();
        rec.apply_insert(MessageRow::new("1"));
        assert_eq!(rec.store().get("1").unwrap().created_at, fixed_clock());
    }

    #[test]
    fn rejects_undecodable_changes_without_touching_store() {
        let mut rec = reconciler();
        let err = rec
            .apply_raw(&RawChange::insert(json!({ "text": "no id" })))
            .expect_err("row without id must be rejected");
        assert_eq!(err.code, "invalid_row");
        assert!(rec.store().is_empty());
    }

    #[test]
    fn accepts_plain_map_directory() {
        let mut names = HashMap::new();
        names.insert("bob".to_owned(), "Bob".to_owned());
        let mut rec = EventReconciler::new(Arc::new(names));
        rec.apply_insert(MessageRow::new("1").with_sender("bob"));
        assert_eq!(rec.store().get("1").unwrap().sender_display_name, "Bob");
    }
}
