use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Read-only sender-name lookup supplied by the embedding application.
pub trait SenderDirectory: Send + Sync {
    /// Human name for an upstream sender id.
    fn display_name(&self, sender_id: &str) -> Option<String>;

    /// Name shown for messages authored by the local user.
    fn local_display_name(&self) -> Option<String> {
        None
    }
}

/// Conversation member as listed by the hosting data store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationMember {
    pub id: String,
    pub name: Option<String>,
    /// Platform-side identity (for example a phone number) used as `sender_id`.
    pub external_id: Option<String>,
}

/// Directory built from a conversation's member list.
///
/// Names are indexed by both `external_id` and member `id`; members without a
/// name are skipped so lookups fall through to the raw sender id.
#[derive(Debug, Clone, Default)]
pub struct MemberDirectory {
    names: HashMap<String, String>,
    local_name: Option<String>,
}

impl MemberDirectory {
    pub fn from_members<'a>(members: impl IntoIterator<Item = &'a ConversationMember>) -> Self {
        let mut directory = Self::default();
        for member in members {
            if let Some(name) = member.name.as_deref() {
                directory.insert(&member.id, member.external_id.as_deref(), name);
            }
        }
        directory
    }

    pub fn with_member(mut self, id: &str, external_id: Option<&str>, name: &str) -> Self {
        self.insert(id, external_id, name);
        self
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn insert(&mut self, id: &str, external_id: Option<&str>, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        if let Some(external_id) = external_id.filter(|value| !value.is_empty()) {
            self.names.insert(external_id.to_owned(), name.to_owned());
        }
        self.names.insert(id.to_owned(), name.to_owned());
    }
}

impl SenderDirectory for MemberDirectory {
    fn display_name(&self, sender_id: &str) -> Option<String> {
        self.names.get(sender_id).cloned()
    }

    fn local_display_name(&self) -> Option<String> {
        self.local_name.clone()
    }
}

impl SenderDirectory for HashMap<String, String> {
    fn display_name(&self, sender_id: &str) -> Option<String> {
        self.get(sender_id).cloned()
    }
}
