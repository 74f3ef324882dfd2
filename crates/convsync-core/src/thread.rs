use crate::{store::MessageStore, types::Message};

/// Links `reply_to` references to the messages they name.
///
/// Resolution is best effort: a reply whose target has not arrived yet simply
/// has no `reply_to_message` until a later pass finds it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadResolver;

impl ThreadResolver {
    /// Copy of `message` with its reply target resolved against `store`.
    pub fn resolve(message: &Message, store: &MessageStore) -> Message {
        Message {
            reply_to_message: Self::target(message, store),
            ..message.clone()
        }
    }

    /// Re-resolve every reply in the store. Returns how many links changed.
    pub fn relink(store: &mut MessageStore) -> usize {
        let snapshot: &MessageStore = store;
        let updates: Vec<(String, Option<Box<Message>>)> = snapshot
            .messages()
            .filter(|message| message.reply_to.is_some() || message.reply_to_message.is_some())
            .filter_map(|message| {
                let target = Self::target(message, snapshot);
                (target != message.reply_to_message).then(|| (message.id.clone(), target))
            })
            .collect();

        let changed = updates.len();
        for (id, target) in updates {
            if let Some(message) = store.get_mut(&id) {
                message.reply_to_message = target;
            }
        }
        changed
    }

    fn target(message: &Message, store: &MessageStore) -> Option<Box<Message>> {
        let reply_to = message.reply_to.as_deref()?;
        store
            .get(reply_to)
            .map(|target| Box::new(target.detached()))
    }
}
