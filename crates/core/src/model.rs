use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One side of a 1:1 conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub display_name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// A 1:1 conversation between a renter and an owner.
///
/// The participant pair is fixed at creation; every accepted message
/// updates the preview, the timestamp, and the recipient's unread count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,

    /// Exactly two entries in the current scope.
    pub participants: Vec<Participant>,

    /// Text snapshot of the most recent message, used by the list view.
    pub last_message_preview: String,

    /// Timestamp of the most recent activity, drives list ordering.
    pub updated_at: DateTime<Utc>,

    /// Unread messages for the session user. Owner-specific, not shared
    /// across participants.
    pub unread_count: u32,

    /// Ephemeral connectivity flag, patched via push. Not persisted and
    /// never trusted from the pull payload.
    #[serde(default, skip_serializing)]
    pub is_online: bool,
}

impl Conversation {
    /// The other participant from `user_id`'s point of view.
    pub fn peer_of(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id != user_id)
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.id == user_id)
    }

    /// Apply the list-visible effects of an accepted message.
    pub fn touch(&mut self, preview: &str, at: DateTime<Utc>) {
        self.last_message_preview = preview.to_string();
        self.updated_at = at;
    }

    /// List ordering: `updated_at` descending, ties broken by id
    /// ascending so equal timestamps keep a stable order.
    pub fn list_order(a: &Conversation, b: &Conversation) -> Ordering {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// A single chat message.
///
/// `read_by` only ever grows; the only mutation paths are
/// [`Message::mark_read_by`] and [`Message::merge_read_by`], both unions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender: Participant,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    read_by: BTreeSet<String>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        chat_id: impl Into<String>,
        sender: Participant,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            sender,
            content: content.into(),
            created_at,
            read_by: BTreeSet::new(),
        }
    }

    /// Total order within a conversation: `(created_at, id)`.
    pub fn timeline_order(a: &Message, b: &Message) -> Ordering {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    }

    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender.id == user_id
    }

    pub fn read_by(&self) -> &BTreeSet<String> {
        &self.read_by
    }

    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.contains(user_id)
    }

    /// Record that `user_id` has seen this message. Returns whether the
    /// set changed.
    pub fn mark_read_by(&mut self, user_id: &str) -> bool {
        self.read_by.insert(user_id.to_string())
    }

    /// Union another reader set into this one. Duplicate or out-of-order
    /// confirmations are absorbed without regressing state.
    pub fn merge_read_by<I, S>(&mut self, readers: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let before = self.read_by.len();
        self.read_by.extend(readers.into_iter().map(Into::into));
        self.read_by.len() != before
    }
}
